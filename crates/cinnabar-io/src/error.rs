//! I/O error types.

use std::path::PathBuf;

/// Errors from the byte-file backend.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Underlying OS I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// File not found.
    #[error("file not found: {path}")]
    NotFound { path: PathBuf },

    /// File already exists where a new one was to be created.
    #[error("file already exists: {path}")]
    AlreadyExists { path: PathBuf },
}
