use crate::extract;
use crate::paths::AppPaths;
use crate::store::{self, DownloadStatus, VideoRecord};
use crate::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "flv", "wmv", "ts"];

/// Counts report mutations and adoptions performed during the pass, not
/// passive observations: a second run over an unchanged directory reports
/// all zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Records newly bound to an on-disk file this pass.
    pub files_matched: usize,
    pub updated_to_completed: usize,
    pub updated_to_missing: usize,
    pub created_from_files: usize,
}

struct ScannedFile {
    path: PathBuf,
    file_name: String,
    name_lower: String,
    size: i64,
    claimed: bool,
}

/// Resync store state with what is actually on disk. Downloads and uploads
/// may happen out of band (manual moves, crashes mid-download), so the
/// directory tree is ground truth: present files promote records to
/// Completed, vanished files demote Completed records to Pending, and
/// unknown files become synthesized Completed records.
pub fn reconcile(paths: &AppPaths, download_dir: &Path) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();
    let mut files = scan_video_files(download_dir);

    let mut index_by_canonical: HashMap<PathBuf, usize> = HashMap::new();
    for (idx, file) in files.iter().enumerate() {
        let canonical = file.path.canonicalize().unwrap_or_else(|_| file.path.clone());
        index_by_canonical.insert(canonical, idx);
    }

    for record in store::all_records(paths)? {
        // Recorded path still valid: claim the file and make sure the
        // status reflects it.
        if let Some(file_path) = record.file_path.clone() {
            let on_disk = Path::new(&file_path);
            if on_disk.exists() {
                if let Ok(canonical) = on_disk.canonicalize() {
                    if let Some(&idx) = index_by_canonical.get(&canonical) {
                        files[idx].claimed = true;
                    }
                }

                if record.status != DownloadStatus::Completed
                    && record.status != DownloadStatus::Uploaded
                {
                    let size = std::fs::metadata(on_disk).map(|m| m.len() as i64).ok();
                    store::update_status(
                        paths,
                        &record.identity_key,
                        DownloadStatus::Completed,
                        Some(&file_path),
                        size,
                    )?;
                    summary.files_matched += 1;
                    summary.updated_to_completed += 1;
                }
                continue;
            }
        }

        // Recorded path gone or never set: best-effort filename match
        // against files nothing else has claimed yet.
        if let Some(idx) = locate_match(&files, &record) {
            files[idx].claimed = true;

            if record.status == DownloadStatus::Uploaded {
                // The local copy belongs to this record but an uploaded row
                // is never demoted; just keep the file from being
                // re-registered below.
                debug!(identity_key = %record.identity_key, "uploaded record matched a local file");
                continue;
            }

            let was_completed = record.status == DownloadStatus::Completed;
            let path_str = files[idx].path.to_string_lossy().to_string();
            store::update_status(
                paths,
                &record.identity_key,
                DownloadStatus::Completed,
                Some(&path_str),
                Some(files[idx].size),
            )?;
            summary.files_matched += 1;
            if !was_completed {
                summary.updated_to_completed += 1;
            }
            continue;
        }

        // File is gone, e.g. manually deleted.
        if record.status == DownloadStatus::Completed {
            store::update_status(paths, &record.identity_key, DownloadStatus::Pending, None, None)?;
            summary.updated_to_missing += 1;
            debug!(identity_key = %record.identity_key, "completed record lost its file, demoted to pending");
        }
    }

    // Files nobody claimed were placed manually; register them so the store
    // can see them.
    for file in files.iter().filter(|f| !f.claimed) {
        let identity_key = file_identity_key(&file.file_name);
        match store::get(paths, &identity_key)? {
            Some(_) => {
                // Same file name under another subdirectory hashes to the
                // same key; re-synthesizing would flip the record between
                // paths on every pass.
                warn!(
                    identity_key = %identity_key,
                    path = %file.path.to_string_lossy(),
                    "file name already registered under another path, skipping"
                );
            }
            None => {
                let stem = file
                    .path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(&file.file_name)
                    .to_string();
                let mut record = VideoRecord::skeleton(
                    identity_key,
                    stem.clone(),
                    extract::extract_date_token(&stem),
                    None,
                    None,
                );
                record.status = DownloadStatus::Completed;
                record.file_path = Some(file.path.to_string_lossy().to_string());
                record.file_size = Some(file.size);
                store::upsert(paths, &record)?;
                summary.created_from_files += 1;
            }
        }
    }

    info!(
        matched = summary.files_matched,
        completed = summary.updated_to_completed,
        missing = summary.updated_to_missing,
        created = summary.created_from_files,
        dir = %download_dir.to_string_lossy(),
        "reconciliation finished"
    );
    Ok(summary)
}

fn scan_video_files(download_dir: &Path) -> Vec<ScannedFile> {
    let mut files = Vec::new();
    for entry in WalkDir::new(download_dir).into_iter() {
        let entry = match entry {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let extension = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let is_video = extension
            .as_deref()
            .map(|e| VIDEO_EXTENSIONS.contains(&e))
            .unwrap_or(false);
        if !is_video {
            continue;
        }

        // A file whose size cannot be read (permissions, race with a
        // deletion) is skipped; it must not abort the pass.
        let size = match entry.metadata() {
            Ok(m) => m.len() as i64,
            Err(e) => {
                warn!(path = %entry.path().to_string_lossy(), error = %e, "skipping unreadable file");
                continue;
            }
        };

        let file_name = entry.file_name().to_string_lossy().to_string();
        files.push(ScannedFile {
            path: entry.path().to_path_buf(),
            name_lower: file_name.to_lowercase(),
            file_name,
            size,
            claimed: false,
        });
    }
    files
}

/// Narrow matching contract: identity key in the file name beats a title
/// substring, both case-insensitive, and only unclaimed files are
/// candidates. Empty needles never match.
fn locate_match(files: &[ScannedFile], record: &VideoRecord) -> Option<usize> {
    let key_needle = record.identity_key.trim().to_lowercase();
    if !key_needle.is_empty() {
        if let Some(idx) = files
            .iter()
            .position(|f| !f.claimed && f.name_lower.contains(&key_needle))
        {
            return Some(idx);
        }
    }

    let title_needle = record.title.trim().to_lowercase();
    if title_needle.len() >= 2 {
        if let Some(idx) = files
            .iter()
            .position(|f| !f.claimed && f.name_lower.contains(&title_needle))
        {
            return Some(idx);
        }
    }

    None
}

/// Identity namespace for records synthesized from on-disk files. Hashing
/// the file name keeps the key stable across moves within the tree and out
/// of the feed keyspace entirely.
pub fn file_identity_key(file_name: &str) -> String {
    let digest = Sha256::digest(file_name.as_bytes());
    format!("file_{}", &hex::encode(digest)[..16])
}
