//! Error types for the live-network layer.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] prolink_core::Error),

    #[error("timeout waiting for {0}")]
    Timeout(String),

    #[error("rpc call failed: {0}")]
    Rpc(String),

    #[error("no export path for slot {0}")]
    SlotNotDownloadable(prolink_core::PlayerSlot),

    #[error("file already exists: {0}")]
    FileExists(PathBuf),

    #[error("download failed: {0}")]
    DownloadFailed(String),
}

pub type Result<T> = std::result::Result<T, NetError>;

/// Failure taxonomy of the query dispatcher: temporary errors are
/// requeued with a bounded retry budget, fatal ones surface to the
/// caller (or let the next data source take over).
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    #[error("temporary: {0}")]
    Temporary(String),

    #[error("{0}")]
    Fatal(String),
}

impl QueryError {
    pub fn temporary(e: impl std::fmt::Display) -> Self {
        QueryError::Temporary(e.to_string())
    }

    pub fn fatal(e: impl std::fmt::Display) -> Self {
        QueryError::Fatal(e.to_string())
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, QueryError::Temporary(_))
    }
}

pub type QueryResult<T> = std::result::Result<T, QueryError>;
