//! Error types for the platform client

use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

/// Platform client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Edge redirect error: {0}")]
    EdgeRedirect(String),
}

impl ClientError {
    /// HTTP status of a rejected request, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Http(e) => e.status().map(|s| s.as_u16()),
            ClientError::EdgeRedirect(_) => None,
        }
    }
}
