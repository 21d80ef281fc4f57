use crate::paths::AppPaths;
use crate::{db, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Uploaded,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Uploaded => "uploaded",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DownloadStatus::Pending),
            "downloading" => Some(DownloadStatus::Downloading),
            "completed" => Some(DownloadStatus::Completed),
            "failed" => Some(DownloadStatus::Failed),
            "uploaded" => Some(DownloadStatus::Uploaded),
            _ => None,
        }
    }

    pub const ALL: [DownloadStatus; 5] = [
        DownloadStatus::Pending,
        DownloadStatus::Downloading,
        DownloadStatus::Completed,
        DownloadStatus::Failed,
        DownloadStatus::Uploaded,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub identity_key: String,
    pub title: String,
    pub date_token: String,
    pub source_url: Option<String>,
    pub cover_url: Option<String>,
    pub status: DownloadStatus,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub cloud_path: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl VideoRecord {
    pub fn skeleton(
        identity_key: String,
        title: String,
        date_token: String,
        source_url: Option<String>,
        cover_url: Option<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            identity_key,
            title,
            date_token,
            source_url,
            cover_url,
            status: DownloadStatus::Pending,
            file_path: None,
            file_size: None,
            cloud_path: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// A record without a stream URL is access-restricted upstream and can
    /// never be downloaded.
    pub fn is_paid(&self) -> bool {
        self.source_url
            .as_deref()
            .map(str::trim)
            .map_or(true, str::is_empty)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStatistics {
    pub total: i64,
    pub pending: i64,
    pub downloading: i64,
    pub completed: i64,
    pub failed: i64,
    pub uploaded: i64,
    pub total_size_bytes: i64,
}

/// Insert or fully replace the row matching `record.identity_key`.
/// Replace semantics are intended: the feed is authoritative and last write
/// wins on a re-scrape. Returns `true` when the key was not present before.
pub fn upsert(paths: &AppPaths, record: &VideoRecord) -> Result<bool> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let existed = get_conn(&conn, &record.identity_key)?.is_some();
    conn.execute(
        r#"
INSERT INTO video (
  identity_key,
  title,
  date_token,
  source_url,
  cover_url,
  status,
  file_path,
  file_size,
  cloud_path,
  created_at_ms,
  updated_at_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
ON CONFLICT(identity_key) DO UPDATE SET
  title = excluded.title,
  date_token = excluded.date_token,
  source_url = excluded.source_url,
  cover_url = excluded.cover_url,
  status = excluded.status,
  file_path = excluded.file_path,
  file_size = excluded.file_size,
  cloud_path = excluded.cloud_path,
  updated_at_ms = excluded.updated_at_ms
"#,
        params![
            &record.identity_key,
            &record.title,
            &record.date_token,
            &record.source_url,
            &record.cover_url,
            record.status.as_str(),
            &record.file_path,
            record.file_size,
            &record.cloud_path,
            record.created_at_ms,
            now_ms(),
        ],
    )?;

    Ok(!existed)
}

pub fn get(paths: &AppPaths, identity_key: &str) -> Result<Option<VideoRecord>> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    get_conn(&conn, identity_key)
}

pub fn list_by_status(paths: &AppPaths, status: DownloadStatus) -> Result<Vec<VideoRecord>> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let mut stmt = conn.prepare(&format!(
        "{SELECT_RECORD} WHERE status = ?1 ORDER BY created_at_ms DESC"
    ))?;
    let rows = stmt
        .query_map([status.as_str()], row_to_record)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn list_all(paths: &AppPaths, limit: usize, offset: usize) -> Result<Vec<VideoRecord>> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let mut stmt = conn.prepare(&format!(
        "{SELECT_RECORD} ORDER BY created_at_ms DESC LIMIT ?1 OFFSET ?2"
    ))?;
    let rows = stmt
        .query_map(params![limit as i64, offset as i64], row_to_record)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Every record, unpaged. Reconciliation and export need the full set.
pub fn all_records(paths: &AppPaths) -> Result<Vec<VideoRecord>> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let mut stmt = conn.prepare(&format!("{SELECT_RECORD} ORDER BY created_at_ms DESC"))?;
    let rows = stmt
        .query_map([], row_to_record)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn search(paths: &AppPaths, keyword: &str, limit: usize) -> Result<Vec<VideoRecord>> {
    let trimmed = keyword.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let pattern = format!("%{trimmed}%");
    let mut stmt = conn.prepare(&format!(
        "{SELECT_RECORD} WHERE title LIKE ?1 ORDER BY created_at_ms DESC LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![pattern, limit as i64], row_to_record)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Set `status`, refreshing `updated_at_ms`. File fields are only written
/// when the record transitions into Completed. Returns `false` when the key
/// is absent.
pub fn update_status(
    paths: &AppPaths,
    identity_key: &str,
    status: DownloadStatus,
    file_path: Option<&str>,
    file_size: Option<i64>,
) -> Result<bool> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let changed = if status == DownloadStatus::Completed && file_path.is_some() {
        conn.execute(
            "UPDATE video SET status = ?1, file_path = ?2, file_size = ?3, updated_at_ms = ?4
             WHERE identity_key = ?5",
            params![
                status.as_str(),
                file_path,
                file_size,
                now_ms(),
                identity_key
            ],
        )?
    } else {
        conn.execute(
            "UPDATE video SET status = ?1, updated_at_ms = ?2 WHERE identity_key = ?3",
            params![status.as_str(), now_ms(), identity_key],
        )?
    };

    Ok(changed > 0)
}

pub fn update_upload_info(paths: &AppPaths, identity_key: &str, cloud_path: &str) -> Result<bool> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let changed = conn.execute(
        "UPDATE video SET status = ?1, cloud_path = ?2, updated_at_ms = ?3
         WHERE identity_key = ?4",
        params![
            DownloadStatus::Uploaded.as_str(),
            cloud_path,
            now_ms(),
            identity_key
        ],
    )?;
    Ok(changed > 0)
}

/// Destructive retention sweep: deletes Failed rows whose last mutation is
/// older than `days`. There is no soft delete.
pub fn purge_failed_older_than(paths: &AppPaths, days: i64) -> Result<usize> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let cutoff = now_ms() - days.max(0).saturating_mul(86_400_000);
    let deleted = conn.execute(
        "DELETE FROM video WHERE status = ?1 AND updated_at_ms < ?2",
        params![DownloadStatus::Failed.as_str(), cutoff],
    )?;
    Ok(deleted)
}

pub fn statistics(paths: &AppPaths) -> Result<StoreStatistics> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*), COALESCE(SUM(file_size), 0)
         FROM video GROUP BY status",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stats = StoreStatistics::default();
    for (status, count, size) in rows {
        stats.total += count;
        stats.total_size_bytes += size;
        match DownloadStatus::from_str(&status) {
            Some(DownloadStatus::Pending) => stats.pending = count,
            Some(DownloadStatus::Downloading) => stats.downloading = count,
            Some(DownloadStatus::Completed) => stats.completed = count,
            Some(DownloadStatus::Failed) => stats.failed = count,
            Some(DownloadStatus::Uploaded) => stats.uploaded = count,
            None => warn!(%status, "unknown status value in store"),
        }
    }
    Ok(stats)
}

/// Append an audit row. Best effort: a history failure is logged and never
/// fails the operation that produced it.
pub fn record_history(
    paths: &AppPaths,
    identity_key: &str,
    action: &str,
    outcome: &str,
    error: Option<&str>,
    batch_id: Option<&str>,
) {
    let result = (|| -> Result<()> {
        let conn = db::open(paths)?;
        db::migrate(&conn)?;
        conn.execute(
            "INSERT INTO video_history (identity_key, action, outcome, error, batch_id, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![identity_key, action, outcome, error, batch_id, now_ms()],
        )?;
        Ok(())
    })();

    if let Err(e) = result {
        warn!(identity_key, action, error = %e, "failed to append history row");
    }
}

const SELECT_RECORD: &str = r#"
SELECT
  identity_key,
  title,
  date_token,
  source_url,
  cover_url,
  status,
  file_path,
  file_size,
  cloud_path,
  created_at_ms,
  updated_at_ms
FROM video
"#;

fn get_conn(conn: &rusqlite::Connection, identity_key: &str) -> Result<Option<VideoRecord>> {
    let mut stmt = conn.prepare(&format!("{SELECT_RECORD} WHERE identity_key = ?1"))?;
    let row = stmt.query_row([identity_key], row_to_record).optional()?;
    Ok(row)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<VideoRecord> {
    let status_raw: String = row.get(5)?;
    Ok(VideoRecord {
        identity_key: row.get(0)?,
        title: row.get(1)?,
        date_token: row.get(2)?,
        source_url: row.get(3)?,
        cover_url: row.get(4)?,
        status: DownloadStatus::from_str(&status_raw).unwrap_or(DownloadStatus::Pending),
        file_path: row.get(6)?,
        file_size: row.get(7)?,
        cloud_path: row.get(8)?,
        created_at_ms: row.get(9)?,
        updated_at_ms: row.get(10)?,
    })
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn test_paths() -> (tempfile::TempDir, AppPaths) {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        crate::db::ensure_schema(&paths).expect("schema");
        (dir, paths)
    }

    fn sample_record(key: &str) -> VideoRecord {
        VideoRecord::skeleton(
            key.to_string(),
            "Sample".to_string(),
            "0714".to_string(),
            Some("https://cdn.example.com/v.m3u8".to_string()),
            None,
        )
    }

    #[test]
    fn upsert_is_idempotent() {
        let (_dir, paths) = test_paths();
        let record = sample_record("A_0714");

        assert!(upsert(&paths, &record).expect("first insert"));
        assert!(!upsert(&paths, &record).expect("second insert"));

        let rows = all_records(&paths).expect("all");
        assert_eq!(rows.len(), 1);
        let stored = &rows[0];
        assert_eq!(stored.identity_key, "A_0714");
        assert_eq!(stored.title, "Sample");
        assert_eq!(stored.date_token, "0714");
        assert_eq!(stored.status, DownloadStatus::Pending);
    }

    #[test]
    fn update_status_sets_file_fields_on_completed() {
        let (_dir, paths) = test_paths();
        upsert(&paths, &sample_record("A_0714")).expect("insert");

        let changed = update_status(
            &paths,
            "A_0714",
            DownloadStatus::Completed,
            Some("/d/a.mp4"),
            Some(1000),
        )
        .expect("update");
        assert!(changed);

        let stored = get(&paths, "A_0714").expect("get").expect("present");
        assert_eq!(stored.status, DownloadStatus::Completed);
        assert_eq!(stored.file_path.as_deref(), Some("/d/a.mp4"));
        assert_eq!(stored.file_size, Some(1000));
    }

    #[test]
    fn update_status_ignores_file_fields_outside_completed() {
        let (_dir, paths) = test_paths();
        upsert(&paths, &sample_record("B_0101")).expect("insert");

        update_status(
            &paths,
            "B_0101",
            DownloadStatus::Failed,
            Some("/d/ignored.mp4"),
            Some(5),
        )
        .expect("update");

        let stored = get(&paths, "B_0101").expect("get").expect("present");
        assert_eq!(stored.status, DownloadStatus::Failed);
        assert!(stored.file_path.is_none());
        assert!(stored.file_size.is_none());
    }

    #[test]
    fn update_status_on_absent_key_is_a_noop() {
        let (_dir, paths) = test_paths();
        let changed =
            update_status(&paths, "missing", DownloadStatus::Completed, None, None).expect("update");
        assert!(!changed);
    }

    #[test]
    fn paid_flag_follows_source_url() {
        let mut record = sample_record("X_0000");
        assert!(!record.is_paid());

        record.source_url = None;
        assert!(record.is_paid());

        record.source_url = Some("   ".to_string());
        assert!(record.is_paid());
    }

    #[test]
    fn purge_failed_respects_cutoff() {
        let (_dir, paths) = test_paths();

        let mut old_failed = sample_record("old");
        old_failed.status = DownloadStatus::Failed;
        upsert(&paths, &old_failed).expect("insert old");

        let mut fresh_failed = sample_record("fresh");
        fresh_failed.status = DownloadStatus::Failed;
        upsert(&paths, &fresh_failed).expect("insert fresh");

        let mut completed = sample_record("done");
        completed.status = DownloadStatus::Completed;
        upsert(&paths, &completed).expect("insert done");

        // Age the first failed row past the retention window.
        let conn = crate::db::open(&paths).expect("open");
        conn.execute(
            "UPDATE video SET updated_at_ms = ?1 WHERE identity_key = 'old'",
            params![now_ms() - 8 * 86_400_000],
        )
        .expect("age row");
        drop(conn);

        let purged = purge_failed_older_than(&paths, 7).expect("purge");
        assert_eq!(purged, 1);
        assert!(get(&paths, "old").expect("get").is_none());
        assert!(get(&paths, "fresh").expect("get").is_some());
        assert!(get(&paths, "done").expect("get").is_some());
    }

    #[test]
    fn statistics_groups_by_status() {
        let (_dir, paths) = test_paths();

        upsert(&paths, &sample_record("p1")).expect("insert");
        upsert(&paths, &sample_record("p2")).expect("insert");
        let mut done = sample_record("c1");
        done.status = DownloadStatus::Completed;
        done.file_path = Some("/d/c1.mp4".to_string());
        done.file_size = Some(2048);
        upsert(&paths, &done).expect("insert");

        let stats = statistics(&paths).expect("stats");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total_size_bytes, 2048);
    }

    #[test]
    fn search_matches_title_substring() {
        let (_dir, paths) = test_paths();

        let mut record = sample_record("s1");
        record.title = "Backstage clip 0714".to_string();
        upsert(&paths, &record).expect("insert");

        let hits = search(&paths, "backstage", 10).expect("search");
        assert_eq!(hits.len(), 1);
        assert!(search(&paths, "", 10).expect("empty").is_empty());
        assert!(search(&paths, "nothing", 10).expect("miss").is_empty());
    }
}
