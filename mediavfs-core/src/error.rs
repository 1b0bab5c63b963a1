use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Root unreadable: {path}: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Watch error for {path}: {message}")]
    Watch { path: PathBuf, message: String },

    #[error("Crawler stopped")]
    Stopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;
