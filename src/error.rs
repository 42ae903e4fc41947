use thiserror::Error;

use crate::model::TrialState;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the sync, purchase and trial services.
///
/// `ItemFetchFailed` is never returned from a top-level call; it is how a
/// single failed question is reported inside a batch.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("user not authenticated")]
    NotAuthenticated,
    #[error("sync failed: {0}")]
    SyncFailed(String),
    #[error("failed to fetch item {id}: {reason}")]
    ItemFetchFailed { id: String, reason: String },
    #[error("local store write failed: {0}")]
    StoreWriteFailed(String),
    #[error("invalid trial state transition from {from} to {to}")]
    InvalidTransition { from: TrialState, to: TrialState },
}

impl SyncError {
    pub fn sync_failed(err: impl std::fmt::Display) -> Self {
        Self::SyncFailed(format!("{:#}", err))
    }

    pub fn store_write(err: impl std::fmt::Display) -> Self {
        Self::StoreWriteFailed(format!("{:#}", err))
    }

    pub fn item_fetch(id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::ItemFetchFailed {
            id: id.into(),
            reason: format!("{:#}", err),
        }
    }
}
