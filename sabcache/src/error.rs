use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Input file missing: {0}")]
    InputMissing(PathBuf),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient disk space: need {needed} bytes, {available} available")]
    InsufficientDiskSpace { needed: u64, available: u64 },

    #[error("Media tool not found: {0}")]
    ToolMissing(String),

    #[error("Media tool failed (exit code {exit_code}): {stderr_tail}")]
    ToolFailed {
        exit_code: i32,
        stderr_tail: String,
    },

    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    #[error("No audio stream in {0}")]
    NoAudioStream(PathBuf),

    #[error("Build cancelled")]
    Cancelled,

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Database error: {0}")]
    Db(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sabstore::rusqlite::Error> for CacheError {
    fn from(e: sabstore::rusqlite::Error) -> Self {
        CacheError::Db(e.to_string())
    }
}
