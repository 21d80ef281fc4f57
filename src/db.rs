use crate::paths::AppPaths;
use crate::{Result, VaultError};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::time::Duration;

pub fn open(paths: &AppPaths) -> Result<Connection> {
    paths.ensure_dirs()?;

    let conn = Connection::open_with_flags(
        paths.db_file_path(),
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )?;

    conn.busy_timeout(Duration::from_secs(10))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS video (
  identity_key TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  date_token TEXT NOT NULL DEFAULT '0000',
  source_url TEXT,
  cover_url TEXT,
  status TEXT NOT NULL DEFAULT 'pending',
  file_path TEXT,
  file_size INTEGER,
  cloud_path TEXT,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL,
  CONSTRAINT valid_file_size CHECK (file_size IS NULL OR file_size >= 0)
);

CREATE TABLE IF NOT EXISTS video_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  identity_key TEXT NOT NULL,
  action TEXT NOT NULL,
  outcome TEXT NOT NULL,
  error TEXT,
  batch_id TEXT,
  created_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_video_status_created ON video(status, created_at_ms);
CREATE INDEX IF NOT EXISTS idx_video_created ON video(created_at_ms);
CREATE INDEX IF NOT EXISTS idx_history_key ON video_history(identity_key);
"#,
    )?;

    let current_schema_version = 1;
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(v) if v == current_schema_version.to_string() => {}
        _ => {
            conn.execute(
                "INSERT INTO meta(key, value) VALUES('schema_version', ?)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                [current_schema_version.to_string()],
            )?;
        }
    }

    Ok(())
}

/// Startup entry point. Failure here is the one fatal error of the system:
/// the process must exit with a diagnostic rather than run without
/// persistence.
pub fn ensure_schema(paths: &AppPaths) -> Result<()> {
    let conn = open(paths).map_err(|e| VaultError::StoreInit {
        path: paths.db_file_path(),
        reason: e.to_string(),
    })?;
    migrate(&conn).map_err(|e| VaultError::StoreInit {
        path: paths.db_file_path(),
        reason: e.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());

        ensure_schema(&paths).expect("first");
        ensure_schema(&paths).expect("second");

        let conn = open(&paths).expect("open");
        let version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key='schema_version'",
                [],
                |row| row.get(0),
            )
            .expect("schema_version");
        assert_eq!(version, "1");
    }
}
