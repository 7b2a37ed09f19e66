use std::sync::Arc;

use crate::{ResourceIdentity, ResourceRecord};

/// Error taxonomy of the synchronization and mutation engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Input YAML is invalid or lacks identity fields. User-correctable.
    #[error("malformed document: {0}")]
    MalformedDocument(String),
    /// Target identity is absent. User-correctable.
    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceIdentity),
    /// Base token is stale. Carries the current state so the caller can re-diff.
    #[error("edit conflict on {}: current token is {}", .current.identity, .current.token)]
    EditConflict { current: Arc<ResourceRecord> },
    /// Transient network/API failure.
    #[error("cluster unavailable: {0}")]
    ClusterUnavailable(String),
    /// Caller cancelled or timed out before the mutation reached the cluster.
    #[error("cancelled before the mutation was issued")]
    Cancelled,
    /// Caller cancelled or timed out after the mutation was issued. The cache is
    /// reconciled from a fresh read in the background.
    #[error("outcome of mutation on {0} is indeterminate")]
    Indeterminate(ResourceIdentity),
}

impl SyncError {
    pub fn is_conflict(&self) -> bool { matches!(self, SyncError::EditConflict { .. }) }
}

pub type SyncResult<T> = Result<T, SyncError>;
