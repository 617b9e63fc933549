//! Error types for the sync layer.

use shoutmap_backend::BackendError;
use thiserror::Error;

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The backend rejected or failed the request.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// A backend response lacked a required column.
    #[error("missing field in backend response: {0}")]
    MissingField(String),

    /// A write needs a signed-in viewer.
    #[error("not signed in")]
    NotSignedIn,

    /// The input was rejected before reaching the backend.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The store's channel was already released.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// A backend row could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether retrying the same operation might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Backend(e) => e.is_transient(),
            _ => false,
        }
    }
}
