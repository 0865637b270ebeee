//! Errors raised while reading datasets and assembling batches.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    /// None of the candidate locations held the requested IDX file.
    #[error("dataset file not found: {stem} (searched under {root})")]
    NotFound { root: PathBuf, stem: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not a well-formed IDX payload.
    #[error("malformed IDX file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("image count {images} does not match label count {labels}")]
    CountMismatch { images: usize, labels: usize },

    #[error("invalid normalize transform: {0}")]
    InvalidTransform(String),

    #[error("invalid loader options: {0}")]
    InvalidOptions(String),

    /// The cursor is past its last batch.
    #[error("batch index {index} out of range for {count} batches")]
    BatchOutOfRange { index: usize, count: usize },
}

pub type Result<T> = std::result::Result<T, DataError>;
