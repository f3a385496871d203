//! Boundary to the persistent attendance store.

use crate::types::{AttendanceEvent, BackendKind, GalleryEntry};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Why an attendance write did not happen.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// The store already holds this event (e.g. a race with an earlier,
    /// late-landing write). Treated as success by the deduplicator.
    #[error("attendance already logged")]
    AlreadyLogged,
    /// The store will never accept this event (unknown identity or
    /// context). Retrying cannot help, so the deduplicator advances.
    #[error("attendance rejected: {0}")]
    Rejected(String),
    /// Anything else; the event stays eligible for retry.
    #[error("transient store failure: {0}")]
    Transient(String),
}

pub trait AttendanceStore: Send + Sync {
    /// All enrolled embeddings for `backend`, in a deterministic order.
    fn load_gallery(&self, backend: BackendKind) -> Result<Vec<GalleryEntry>, StoreError>;

    fn commit_attendance(&self, event: &AttendanceEvent) -> Result<(), CommitError>;
}
