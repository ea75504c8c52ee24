//! Error taxonomy shared by the compute client, link and project layers.

use thiserror::Error;

/// Errors surfaced by any operation that talks to a compute, or that
/// validates caller-supplied identity.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// Malformed input: a project id that is not a v4 UUID, a link with
    /// too many endpoints, etc. No mutation has taken place.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown node/link/project id, or a NIO already gone on the remote
    /// side during delete (callers in delete paths swallow this variant).
    #[error("not found: {0}")]
    NotFound(String),

    /// No mutually routable subnet between two computes, or no running
    /// device available to host a capture.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network or timeout failure talking to a compute.
    #[error("transport error: {0}")]
    Transport(String),

    /// The operation was cancelled after any required rollback completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl ComputeError {
    /// Classify an HTTP status code from a compute response into the taxonomy.
    pub fn from_status(status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        let body = body.into();
        match status.as_u16() {
            400 => ComputeError::BadRequest(body),
            404 => ComputeError::NotFound(body),
            409 => ComputeError::Conflict(body),
            _ => ComputeError::Transport(format!("compute returned {status}: {body}")),
        }
    }

    /// True if this error represents a resource that is already gone,
    /// which delete paths treat as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ComputeError::NotFound(_))
    }
}

impl From<reqwest::Error> for ComputeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ComputeError::Transport(e.to_string())
        } else if let Some(status) = e.status() {
            ComputeError::from_status(status, e.to_string())
        } else {
            ComputeError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ComputeError {
    fn from(e: serde_json::Error) -> Self {
        ComputeError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ComputeError>;
