//! Error types for media subprocesses

use std::path::PathBuf;
use thiserror::Error;

pub type MediaResult<T> = Result<T, MediaError>;

/// Media process errors
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Executable not found on PATH: {0}")]
    BinaryNotFound(String),

    #[error("Input file not found: {0:?}")]
    MissingInput(PathBuf),

    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{binary} exited with {status}")]
    Exited { binary: String, status: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
