// Error taxonomy for the sync layer.
//
// Errors are `Clone` so one fetch outcome can be broadcast to every
// coalesced caller.

use tracker_common::auth::AuthError;
use tracker_common::kind::EntityKind;

/// Failures reported by a `RemoteRepository`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote service unavailable: {0}")]
    Unavailable(String),
    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("remote has no {kind} entity `{id}`")]
    NotFound { kind: EntityKind, id: String },
    #[error("failed to decode remote payload: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether the next natural resync may succeed without user action.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound { .. } | Self::Decode(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("local store error: {0}")]
    Store(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("fetch for `{0}` ended without a result")]
    FetchAborted(String),
    #[error("partial sync: {} of {} kinds failed", .failed.len(), .failed.len() + .succeeded.len())]
    Partial { succeeded: Vec<EntityKind>, failed: Vec<(EntityKind, String)> },
    #[error("background window expired after {} of {total} kinds", .completed.len())]
    Expired { completed: Vec<EntityKind>, total: usize },
    #[error("background host error: {0}")]
    Host(String),
}

impl SyncError {
    /// Flatten a store failure, keeping its context chain.
    pub fn store(error: anyhow::Error) -> Self {
        Self::Store(format!("{error:#}"))
    }
}
