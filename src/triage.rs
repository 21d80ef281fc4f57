use crate::feed::RawItem;
use crate::paths::AppPaths;
use crate::store::{self, DownloadStatus, VideoRecord};
use crate::{extract, Result};
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of classifying one batch of feed items against the store. Every
/// successfully processed item lands in exactly one bucket.
#[derive(Debug, Default)]
pub struct TriageReport {
    pub new: Vec<VideoRecord>,
    pub duplicate: Vec<VideoRecord>,
    pub retryable: Vec<VideoRecord>,
    pub in_progress: Vec<VideoRecord>,
    /// Items whose store lookup or reservation failed; they are logged and
    /// excluded from the partition so the rest of the batch can proceed.
    pub skipped_errors: usize,
    /// Correlates this batch's history rows.
    pub batch_id: String,
}

impl TriageReport {
    pub fn classified_total(&self) -> usize {
        self.new.len() + self.duplicate.len() + self.retryable.len() + self.in_progress.len()
    }
}

/// Classify `items` in source order. New items are reserved write-through as
/// Pending skeletons so overlapping feed pages within one scrape session
/// cannot re-classify them as new. Items repeating an identity key within
/// the batch count as duplicates (first occurrence wins). The engine only
/// classifies and reserves; it never starts a download.
pub fn triage(paths: &AppPaths, items: &[RawItem]) -> Result<TriageReport> {
    let mut report = TriageReport {
        batch_id: Uuid::new_v4().to_string(),
        ..TriageReport::default()
    };
    let mut seen_keys: HashSet<String> = HashSet::new();

    for item in items {
        let skeleton = extract::skeleton_from_item(item);
        let key = skeleton.identity_key.clone();

        if !seen_keys.insert(key.clone()) {
            record_outcome(paths, &key, "duplicate_in_batch", &report.batch_id);
            report.duplicate.push(skeleton);
            continue;
        }

        let existing = match store::get(paths, &key) {
            Ok(v) => v,
            Err(e) => {
                warn!(identity_key = %key, error = %e, "triage lookup failed, skipping item");
                report.skipped_errors += 1;
                continue;
            }
        };

        match existing {
            None => {
                if let Err(e) = store::upsert(paths, &skeleton) {
                    warn!(identity_key = %key, error = %e, "failed to reserve new record, skipping item");
                    report.skipped_errors += 1;
                    continue;
                }
                record_outcome(paths, &key, "new", &report.batch_id);
                report.new.push(skeleton);
            }
            Some(record)
                if record.status == DownloadStatus::Completed
                    || record.status == DownloadStatus::Uploaded =>
            {
                record_outcome(paths, &key, "duplicate", &report.batch_id);
                report.duplicate.push(record);
            }
            Some(record) if record.status == DownloadStatus::Failed => {
                record_outcome(paths, &key, "retryable", &report.batch_id);
                report.retryable.push(record);
            }
            Some(record) => {
                // Pending or Downloading: reported but not actioned, so an
                // already-running download is not started twice.
                record_outcome(paths, &key, "in_progress", &report.batch_id);
                report.in_progress.push(record);
            }
        }
    }

    info!(
        batch_id = %report.batch_id,
        new = report.new.len(),
        duplicate = report.duplicate.len(),
        retryable = report.retryable.len(),
        in_progress = report.in_progress.len(),
        skipped = report.skipped_errors,
        "triage finished"
    );
    Ok(report)
}

fn record_outcome(paths: &AppPaths, identity_key: &str, outcome: &str, batch_id: &str) {
    store::record_history(paths, identity_key, "triage", outcome, None, Some(batch_id));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths() -> (tempfile::TempDir, AppPaths) {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        crate::db::ensure_schema(&paths).expect("schema");
        (dir, paths)
    }

    fn item(id: &str, description: &str) -> RawItem {
        RawItem {
            id: id.to_string(),
            description: description.to_string(),
            url: format!("https://cdn.example.com/{id}.m3u8"),
            ..RawItem::default()
        }
    }

    #[test]
    fn partition_is_total_and_disjoint() {
        let (_dir, paths) = test_paths();

        // Pre-seed one record per pre-existing state.
        let mut done = extract::skeleton_from_item(&item("done1", "done clip 0101"));
        done.status = DownloadStatus::Completed;
        store::upsert(&paths, &done).expect("seed done");

        let mut failed = extract::skeleton_from_item(&item("fail1", "failed clip 0102"));
        failed.status = DownloadStatus::Failed;
        store::upsert(&paths, &failed).expect("seed failed");

        let pending = extract::skeleton_from_item(&item("pend1", "pending clip 0103"));
        store::upsert(&paths, &pending).expect("seed pending");

        let batch = vec![
            item("done1", "done clip 0101"),
            item("fail1", "failed clip 0102"),
            item("pend1", "pending clip 0103"),
            item("fresh1", "fresh clip 0104"),
        ];

        let report = triage(&paths, &batch).expect("triage");
        assert_eq!(report.classified_total(), batch.len());
        assert_eq!(report.skipped_errors, 0);
        assert_eq!(report.duplicate.len(), 1);
        assert_eq!(report.retryable.len(), 1);
        assert_eq!(report.in_progress.len(), 1);
        assert_eq!(report.new.len(), 1);
        assert_eq!(report.new[0].identity_key, "fresh1");
    }

    #[test]
    fn new_items_are_reserved_write_through() {
        let (_dir, paths) = test_paths();

        let first = triage(&paths, &[item("v1", "clip 0714")]).expect("first");
        assert_eq!(first.new.len(), 1);

        let stored = store::get(&paths, "v1").expect("get").expect("reserved");
        assert_eq!(stored.status, DownloadStatus::Pending);

        // The overlapping next page must not classify it as new again.
        let second = triage(&paths, &[item("v1", "clip 0714")]).expect("second");
        assert!(second.new.is_empty());
        assert_eq!(second.in_progress.len(), 1);
    }

    #[test]
    fn duplicate_key_within_batch_keeps_first_occurrence() {
        let (_dir, paths) = test_paths();

        let batch = vec![
            item("dup1", "first sighting 0201"),
            item("other", "unrelated 0202"),
            item("dup1", "second sighting 0201"),
        ];

        let report = triage(&paths, &batch).expect("triage");
        assert_eq!(report.new.len(), 2);
        assert_eq!(report.duplicate.len(), 1);
        assert_eq!(report.duplicate[0].identity_key, "dup1");
        assert_eq!(report.classified_total(), 3);
    }

    #[test]
    fn derived_keys_share_the_batch_dedup() {
        let (_dir, paths) = test_paths();

        // No upstream ids: both items derive the same title_date key.
        let mut a = item("", "Same caption 0301 #tag");
        a.url = "https://cdn.example.com/a.m3u8".to_string();
        let mut b = item("", "Same caption 0301 #other");
        b.url = "https://cdn.example.com/b.m3u8".to_string();

        let report = triage(&paths, &[a, b]).expect("triage");
        assert_eq!(report.new.len(), 1);
        assert_eq!(report.duplicate.len(), 1);
    }
}
