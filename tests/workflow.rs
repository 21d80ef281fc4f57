use fanvault::feed::RawItem;
use fanvault::paths::AppPaths;
use fanvault::store::{self, DownloadStatus};
use fanvault::{db, reconcile, triage};
use std::path::PathBuf;

fn setup() -> (tempfile::TempDir, AppPaths) {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = AppPaths::new(dir.path().to_path_buf());
    db::ensure_schema(&paths).expect("schema");
    (dir, paths)
}

fn feed_item(id: &str, description: &str, url: &str) -> RawItem {
    RawItem {
        id: id.to_string(),
        description: description.to_string(),
        url: url.to_string(),
        ..RawItem::default()
    }
}

fn write_video(dir: &PathBuf, name: &str, bytes: usize) -> PathBuf {
    std::fs::create_dir_all(dir).expect("mkdir");
    let path = dir.join(name);
    std::fs::write(&path, vec![1u8; bytes]).expect("write");
    path
}

#[test]
fn scrape_download_reconcile_round() {
    let (dir, paths) = setup();
    let downloads = dir.path().join("downloads");

    // First scrape: three items, one access-restricted.
    let page = vec![
        feed_item("vid_a", "Morning take 0714 #bts", "https://cdn.example.com/a.m3u8"),
        feed_item("vid_b", "Evening take 0715 #bts", "https://cdn.example.com/b.m3u8"),
        feed_item("vid_locked", "Members cut 0716 #bts", ""),
    ];
    let report = triage::triage(&paths, &page).expect("triage");
    assert_eq!(report.new.len(), 3);
    assert!(report.new.iter().any(|r| r.is_paid()));

    // Simulate the media collaborator finishing vid_a out of band: the file
    // shows up on disk with the id in its name, nothing tells the store.
    write_video(&downloads, "Morning take 0714 vid_a.mp4", 100);

    let summary = reconcile::reconcile(&paths, &downloads).expect("reconcile");
    assert_eq!(summary.files_matched, 1);
    assert_eq!(summary.updated_to_completed, 1);

    let vid_a = store::get(&paths, "vid_a").expect("get").expect("row");
    assert_eq!(vid_a.status, DownloadStatus::Completed);
    assert_eq!(vid_a.file_size, Some(100));

    // Re-scraping an overlapping page classifies nothing as new.
    let report = triage::triage(&paths, &page).expect("second triage");
    assert!(report.new.is_empty());
    assert_eq!(report.duplicate.len(), 1); // vid_a completed
    assert_eq!(report.in_progress.len(), 2); // vid_b + locked still pending

    // A manually placed file gets registered; a second pass then changes
    // nothing at all.
    write_video(&downloads, "bonus footage 0717.mp4", 40);
    let summary = reconcile::reconcile(&paths, &downloads).expect("third reconcile");
    assert_eq!(summary.created_from_files, 1);
    let summary = reconcile::reconcile(&paths, &downloads).expect("fourth reconcile");
    assert_eq!(summary, reconcile::ReconcileSummary::default());

    let stats = store::statistics(&paths).expect("stats");
    assert_eq!(stats.total, 4);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.total_size_bytes, 140);
}

#[test]
fn failed_records_are_retryable_then_purgeable() {
    let (_dir, paths) = setup();

    let page = vec![feed_item(
        "vid_f",
        "Broken stream 0801",
        "https://cdn.example.com/f.m3u8",
    )];
    triage::triage(&paths, &page).expect("triage");

    // The download collaborator reports failure; the record parks as
    // Failed until a re-triage offers it again.
    store::update_status(&paths, "vid_f", DownloadStatus::Failed, None, None).expect("fail");

    let report = triage::triage(&paths, &page).expect("re-triage");
    assert_eq!(report.retryable.len(), 1);
    assert!(report.new.is_empty());

    // Fresh failures survive the retention sweep.
    let purged = store::purge_failed_older_than(&paths, 7).expect("purge");
    assert_eq!(purged, 0);
    assert!(store::get(&paths, "vid_f").expect("get").is_some());
}
