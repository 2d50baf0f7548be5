//! Draft store
//!
//! At most one active draft per protocol, kept in the `draft.json` slot.
//! Archived drafts go to `drafts/<timestamp>.json` and are never rewritten.

use crate::storage::{slots, write_archive, StorageBackend, StorageError};
use crate::types::Draft;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Draft persistence over a [`StorageBackend`]
#[derive(Clone)]
pub struct DraftStore {
    backend: Arc<dyn StorageBackend>,
}

impl DraftStore {
    /// Create store over `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Active draft, if any
    ///
    /// # Errors
    /// Returns error if the slot cannot be read or decoded
    pub async fn get(&self, protocol_id: &str) -> Result<Option<Draft>, StorageError> {
        let Some(bytes) = self.backend.read(protocol_id, slots::DRAFT).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                slot: slots::DRAFT.to_string(),
                reason: e.to_string(),
            })
    }

    /// Replace the active draft atomically
    ///
    /// # Errors
    /// Returns error if the draft cannot be encoded or written
    pub async fn put(&self, draft: &Draft) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(draft)?;
        self.backend
            .write(&draft.protocol_id, slots::DRAFT, &bytes)
            .await
    }

    /// Delete the active draft; returns whether one existed
    ///
    /// # Errors
    /// Returns error if the slot cannot be removed
    pub async fn delete(&self, protocol_id: &str) -> Result<bool, StorageError> {
        self.backend.remove(protocol_id, slots::DRAFT).await
    }

    /// Copy `draft` to a new archive slot, returning the slot name
    ///
    /// # Errors
    /// Returns error if the archive cannot be written
    pub async fn archive(&self, draft: &Draft, at: DateTime<Utc>) -> Result<String, StorageError> {
        let bytes = serde_json::to_vec_pretty(draft)?;
        write_archive(
            self.backend.as_ref(),
            &draft.protocol_id,
            slots::DRAFTS_DIR,
            at,
            &bytes,
        )
        .await
    }

    /// Archived draft slots, oldest first
    ///
    /// # Errors
    /// Returns error if the backend cannot list
    pub async fn archived(&self, protocol_id: &str) -> Result<Vec<String>, StorageError> {
        self.backend
            .list(protocol_id, &format!("{}/", slots::DRAFTS_DIR))
            .await
    }
}

impl std::fmt::Debug for DraftStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DraftStore").finish_non_exhaustive()
    }
}
