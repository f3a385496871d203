//! In-memory set of enrolled embeddings for the active backend.

use crate::types::{BackendKind, GalleryEntry};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum GalleryError {
    #[error("entry for {identity} was produced by {found}, gallery is {expected}")]
    BackendMismatch {
        identity: String,
        expected: BackendKind,
        found: BackendKind,
    },
    #[error("entry for {identity} has {found} dimensions, gallery has {expected}")]
    DimensionMismatch {
        identity: String,
        expected: usize,
        found: usize,
    },
}

/// Gallery shared between the controlling and processing threads.
///
/// Bulk replace and snapshot both go through one lock; a snapshot is an
/// `Arc` of the whole entry list, so matching never sees a half-replaced
/// gallery.
pub struct Gallery {
    entries: Mutex<Arc<[GalleryEntry]>>,
}

impl Default for Gallery {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Arc::from(Vec::new())),
        }
    }
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Arc<[GalleryEntry]>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically replace all entries. Every entry must carry `backend`'s
    /// tag and the same dimensionality. Order is preserved.
    pub fn replace(
        &self,
        backend: BackendKind,
        entries: Vec<GalleryEntry>,
    ) -> Result<usize, GalleryError> {
        let dim = entries.first().map(|e| e.embedding.dim());
        for entry in &entries {
            if entry.embedding.backend != backend {
                return Err(GalleryError::BackendMismatch {
                    identity: entry.identity.key.to_string(),
                    expected: backend,
                    found: entry.embedding.backend,
                });
            }
            if let Some(expected) = dim {
                if entry.embedding.dim() != expected {
                    return Err(GalleryError::DimensionMismatch {
                        identity: entry.identity.key.to_string(),
                        expected,
                        found: entry.embedding.dim(),
                    });
                }
            }
        }

        let count = entries.len();
        *self.lock() = entries.into();
        Ok(count)
    }

    /// Current entry list; stays valid even if the gallery is replaced.
    pub fn snapshot(&self) -> Arc<[GalleryEntry]> {
        Arc::clone(&self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
