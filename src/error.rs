use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cannot open store at {path}: {reason}")]
    StoreInit { path: PathBuf, reason: String },

    #[error("tool install failed: {0}")]
    InstallFailed(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;
