//! Hash-chained audit trail
//!
//! Provides [`AuditTrail`], an append-only change log per protocol stored as
//! JSON Lines in the `audit.log` slot.
//!
//! ## Chain
//!
//! Each [`ChangeLogEntry`] carries the hash of its predecessor
//! (`previousHash`, [`GENESIS_HASH`] for version 1) and its own hash:
//!
//! ```text
//! hash = hex(sha256(previousHash ‖ canonical(entry without "hash")))
//! ```
//!
//! [`verify_lines`] recomputes the chain from genesis over the raw stored
//! lines, so edits to any stored byte are caught, including fields this
//! version of the code does not know about.

use crate::storage::{slots, StorageBackend, StorageError};
use crate::types::ValidationSummary;
use chrono::{DateTime, Utc};
use protocol_doc::{canonical_bytes, Revision};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// `previousHash` of the first entry
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One committed publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    /// Version number, consecutive from 1
    pub version: u64,
    /// Hash of the previous entry
    pub previous_hash: String,
    /// Hash of this entry
    pub hash: String,
    /// Revision of the published document
    pub revision: Revision,
    /// Stated reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Publisher
    pub published_by: String,
    /// Commit time
    pub published_at: DateTime<Utc>,
    /// Paths touched, not their values
    pub changed_paths: Vec<String>,
    /// Gate summary
    pub validation_summary: ValidationSummary,
    /// Published despite a failing gate
    pub forced_publish: bool,
    /// Version whose content was re-published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverted_from: Option<u64>,
}

/// Entry content before it is placed in the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Revision of the published document
    pub revision: Revision,
    /// Stated reason
    pub reason: Option<String>,
    /// Publisher
    pub published_by: String,
    /// Commit time
    pub published_at: DateTime<Utc>,
    /// Paths touched
    pub changed_paths: Vec<String>,
    /// Gate summary
    pub validation_summary: ValidationSummary,
    /// Published despite a failing gate
    pub forced_publish: bool,
    /// Version whose content was re-published
    pub reverted_from: Option<u64>,
}

impl ChangeLogEntry {
    /// Place `pending` after an entry with `previous_hash` and seal it
    ///
    /// # Errors
    /// Returns error if the entry cannot be encoded
    pub fn seal(
        version: u64,
        previous_hash: impl Into<String>,
        pending: PendingEntry,
    ) -> Result<Self, serde_json::Error> {
        let mut entry = Self {
            version,
            previous_hash: previous_hash.into(),
            hash: String::new(),
            revision: pending.revision,
            reason: pending.reason,
            published_by: pending.published_by,
            published_at: pending.published_at,
            changed_paths: pending.changed_paths,
            validation_summary: pending.validation_summary,
            forced_publish: pending.forced_publish,
            reverted_from: pending.reverted_from,
        };
        entry.hash = entry_hash(&entry.previous_hash, &serde_json::to_value(&entry)?);
        Ok(entry)
    }
}

/// Digest of a stored entry, ignoring its `hash` field
fn entry_hash(previous_hash: &str, entry: &Value) -> String {
    let mut payload = entry.clone();
    if let Some(object) = payload.as_object_mut() {
        object.remove("hash");
    }
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(canonical_bytes(&payload));
    hex::encode(hasher.finalize())
}

/// Outcome of [`verify_lines`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    /// Every entry links and hashes correctly
    pub valid: bool,
    /// Entries verified before the first break
    pub length: u64,
    /// Version expected at the first broken position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<u64>,
    /// What broke
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChainVerification {
    fn intact(length: u64) -> Self {
        Self {
            valid: true,
            length,
            broken_at: None,
            reason: None,
        }
    }

    fn broken(length: u64, at: u64, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            length,
            broken_at: Some(at),
            reason: Some(reason.into()),
        }
    }
}

/// Verify a JSON Lines change log from genesis
#[must_use]
pub fn verify_lines(text: &str) -> ChainVerification {
    let mut previous = GENESIS_HASH.to_string();
    let mut verified = 0_u64;
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        let expected = verified + 1;
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return ChainVerification::broken(verified, expected, "entry does not parse");
        };
        let version = value.get("version").and_then(Value::as_u64);
        if version != Some(expected) {
            return ChainVerification::broken(
                verified,
                expected,
                format!("expected version {expected}, found {version:?}"),
            );
        }
        if value.get("previousHash").and_then(Value::as_str) != Some(previous.as_str()) {
            return ChainVerification::broken(
                verified,
                expected,
                "previous hash does not match the preceding entry",
            );
        }
        let Some(stored) = value.get("hash").and_then(Value::as_str) else {
            return ChainVerification::broken(verified, expected, "entry has no hash");
        };
        if entry_hash(&previous, &value) != stored {
            return ChainVerification::broken(verified, expected, "entry hash mismatch");
        }
        previous = stored.to_string();
        verified = expected;
    }
    ChainVerification::intact(verified)
}

/// Append-only change log over a [`StorageBackend`]
#[derive(Clone)]
pub struct AuditTrail {
    backend: Arc<dyn StorageBackend>,
}

impl AuditTrail {
    /// Create trail over `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Every entry, oldest first
    ///
    /// # Errors
    /// Returns error if the log cannot be read or a line does not decode
    pub async fn entries(&self, protocol_id: &str) -> Result<Vec<ChangeLogEntry>, StorageError> {
        let Some(bytes) = self.backend.read(protocol_id, slots::AUDIT_LOG).await? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&bytes);
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| StorageError::Corrupt {
                    slot: format!("{}:{}", slots::AUDIT_LOG, n + 1),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Latest entry
    ///
    /// # Errors
    /// Same as [`AuditTrail::entries`]
    pub async fn last(&self, protocol_id: &str) -> Result<Option<ChangeLogEntry>, StorageError> {
        Ok(self.entries(protocol_id).await?.pop())
    }

    /// Chain `pending` after the latest entry and append it
    ///
    /// # Errors
    /// Returns error if the log cannot be read, encoded or appended
    pub async fn append(
        &self,
        protocol_id: &str,
        pending: PendingEntry,
    ) -> Result<ChangeLogEntry, StorageError> {
        let (version, previous_hash) = match self.last(protocol_id).await? {
            Some(last) => (last.version + 1, last.hash),
            None => (1, GENESIS_HASH.to_string()),
        };
        let entry = ChangeLogEntry::seal(version, previous_hash, pending)?;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        self.backend
            .append(protocol_id, slots::AUDIT_LOG, &line)
            .await?;
        debug!(protocol_id, version, hash = %entry.hash, "audit entry appended");
        Ok(entry)
    }

    /// Verify the stored chain
    ///
    /// # Errors
    /// Returns error if the log cannot be read
    pub async fn verify(&self, protocol_id: &str) -> Result<ChainVerification, StorageError> {
        let bytes = self
            .backend
            .read(protocol_id, slots::AUDIT_LOG)
            .await?
            .unwrap_or_default();
        Ok(verify_lines(&String::from_utf8_lossy(&bytes)))
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail").finish_non_exhaustive()
    }
}
