//! Protocol documents
//!
//! Provides [`ProtocolDocument`], a JSON document paired with the revision of
//! its canonical bytes.
//!
//! # Invariants
//! - `revision` is always `Revision::compute(&content)`
//! - Changes produce a new document; the old one is never touched

use crate::apply::apply;
use crate::canonical::canonical_bytes;
use crate::patch::{PatchError, PatchOperation};
use crate::revision::Revision;
use serde_json::Value;

/// A protocol document and its revision
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolDocument {
    revision: Revision,
    content: Value,
}

impl ProtocolDocument {
    /// Wrap `content`, computing its revision
    #[must_use]
    pub fn new(content: Value) -> Self {
        let revision = Revision::compute(&content);
        Self { revision, content }
    }

    /// Parse stored bytes
    ///
    /// # Errors
    /// Returns error if the bytes are not JSON
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        let content = serde_json::from_slice(bytes)?;
        Ok(Self::new(content))
    }

    /// Parse stored bytes and check them against an expected revision
    ///
    /// # Errors
    /// Returns error if the bytes are not JSON or hash differently
    pub fn from_slice_verified(bytes: &[u8], expected: Revision) -> Result<Self, DocumentError> {
        let document = Self::from_slice(bytes)?;
        if document.revision != expected {
            return Err(DocumentError::RevisionMismatch {
                expected,
                actual: document.revision,
            });
        }
        Ok(document)
    }

    /// Content revision
    #[inline]
    #[must_use]
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Reference to content
    #[inline]
    #[must_use]
    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Move content out of the document
    #[inline]
    #[must_use]
    pub fn into_content(self) -> Value {
        self.content
    }

    /// Canonical bytes, as stored and hashed
    #[must_use]
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.content)
    }

    /// Apply `operations`, producing a new document
    ///
    /// # Errors
    /// The first failing operation; `self` is unchanged either way.
    pub fn apply(&self, operations: &[PatchOperation]) -> Result<Self, PatchError> {
        apply(&self.content, operations).map(Self::new)
    }

    /// Check that the stored revision still matches the content
    #[inline]
    #[must_use]
    pub fn verify(&self) -> bool {
        self.revision == Revision::compute(&self.content)
    }
}

impl From<Value> for ProtocolDocument {
    fn from(content: Value) -> Self {
        Self::new(content)
    }
}

/// Errors loading documents
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// Stored bytes are not JSON
    #[error("document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// Stored bytes hash to an unexpected revision
    #[error("revision mismatch: expected {expected}, got {actual}")]
    RevisionMismatch { expected: Revision, actual: Revision },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::DocPath;
    use serde_json::json;

    #[test]
    fn new_computes_revision() {
        let doc = ProtocolDocument::new(json!({"name": "Study"}));
        assert_eq!(doc.revision(), Revision::compute(&json!({"name": "Study"})));
        assert!(doc.verify());
    }

    #[test]
    fn canonical_bytes_round_trip_revision() {
        let doc = ProtocolDocument::new(json!({"b": [1, 2], "a": "x"}));
        let bytes = doc.to_canonical_bytes();
        assert_eq!(bytes, br#"{"a":"x","b":[1,2]}"#.to_vec());
        let reloaded = ProtocolDocument::from_slice_verified(&bytes, doc.revision()).unwrap();
        assert_eq!(reloaded, doc);
    }

    #[test]
    fn verified_load_rejects_other_revision() {
        let result = ProtocolDocument::from_slice_verified(b"{\"a\":1}", Revision::UNKNOWN);
        assert!(matches!(result, Err(DocumentError::RevisionMismatch { .. })));
        assert!(matches!(
            ProtocolDocument::from_slice(b"{not json"),
            Err(DocumentError::Parse(_))
        ));
    }

    #[test]
    fn apply_returns_new_document() {
        let doc = ProtocolDocument::new(json!({"name": "Study"}));
        let path: DocPath = "/name".parse().unwrap();
        let next = doc
            .apply(&[PatchOperation::replace(path, json!("Renamed"))])
            .unwrap();
        assert_eq!(doc.content()["name"], json!("Study"));
        assert_eq!(next.content()["name"], json!("Renamed"));
        assert_ne!(doc.revision(), next.revision());
    }
}
