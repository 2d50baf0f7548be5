//! Publish errors
//!
//! Every variant has a stable machine code ([`PublishError::code`]) and
//! falls in one class:
//! - client errors: bad input, fix and retry
//! - conflicts: the document moved, refresh the draft
//! - override-required: a gate failed, correct the draft or force
//! - fatal: the commit window failed part-way
//! - storage/internal

use crate::state::{PublishState, TransitionError};
use crate::storage::StorageError;
use crate::types::{FailureResponse, ValidationSummary};
use protocol_doc::{DocumentError, PatchError, Revision};
use protocol_integrity::IntegrityReport;
use serde_json::{json, Value};

/// Publish pipeline error
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Blank reason on a non-forced publish
    #[error("a reason is required unless the publish is forced")]
    MissingReason,

    /// Draft with no operations
    #[error("draft has no operations")]
    EmptyDraft,

    /// No active draft
    #[error("protocol '{protocol_id}' has no draft")]
    NoDraft {
        /// Protocol id
        protocol_id: String,
    },

    /// Draft pinned to the sentinel revision
    #[error("draft is pinned to an unknown revision; recreate it before publishing")]
    UnknownRevision,

    /// Document changed since the draft was pinned
    #[error("revision mismatch: document is at {expected}, draft is based on {actual}")]
    RevisionMismatch {
        /// Current document revision
        expected: Revision,
        /// Draft's base revision
        actual: Revision,
    },

    /// Draft operations do not apply
    #[error("patch failed: {0}")]
    PatchFailed(#[from] PatchError),

    /// Candidate has integrity errors
    #[error("referential integrity check failed: {}", .report.summary())]
    ReferentialIntegrity {
        /// Full report
        report: IntegrityReport,
    },

    /// Validator rejected the candidate or was unavailable
    #[error("conformance validation failed")]
    ValidationFailed {
        /// Gate summary
        summary: Box<ValidationSummary>,
    },

    /// No canonical document yet
    #[error("protocol '{protocol_id}' is not initialized")]
    NotInitialized {
        /// Protocol id
        protocol_id: String,
    },

    /// Bootstrap over an existing document
    #[error("protocol '{protocol_id}' is already initialized")]
    AlreadyInitialized {
        /// Protocol id
        protocol_id: String,
    },

    /// Requested version does not exist
    #[error("protocol '{protocol_id}' has no version {version}")]
    VersionNotFound {
        /// Protocol id
        protocol_id: String,
        /// Version requested
        version: u64,
    },

    /// Stored canonical document does not parse
    #[error("stored document is corrupt: {0}")]
    CorruptDocument(#[from] DocumentError),

    /// Commit window failed part-way
    #[error("commit failed while {stage}: {reason}")]
    CommitFailed {
        /// Stage that failed
        stage: PublishState,
        /// What failed
        reason: String,
    },

    /// Storage failure outside the commit window
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// State machine misuse
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl PublishError {
    /// Stable machine code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingReason => "missing_reason",
            Self::EmptyDraft => "empty_draft",
            Self::NoDraft { .. } => "no_draft",
            Self::UnknownRevision => "unknown_revision",
            Self::RevisionMismatch { .. } => "revision_mismatch",
            Self::PatchFailed(_) => "patch_failed",
            Self::ReferentialIntegrity { .. } => "referential_integrity",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::NotInitialized { .. } => "not_initialized",
            Self::AlreadyInitialized { .. } => "already_initialized",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::CorruptDocument(_) => "corrupt_document",
            Self::CommitFailed { .. } => "commit_failed",
            Self::Storage(StorageError::InvalidKey { .. }) => "invalid_protocol_id",
            Self::Storage(_) => "storage",
            Self::Transition(_) => "internal",
        }
    }

    /// Caller must refresh the draft
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::RevisionMismatch { .. } | Self::UnknownRevision)
    }

    /// Bad input; retrying unchanged fails again
    #[inline]
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MissingReason
                | Self::EmptyDraft
                | Self::NoDraft { .. }
                | Self::PatchFailed(_)
                | Self::NotInitialized { .. }
                | Self::AlreadyInitialized { .. }
                | Self::VersionNotFound { .. }
                | Self::Storage(StorageError::InvalidKey { .. })
        )
    }

    /// A gate failed; `forceOverride` would publish anyway
    #[inline]
    #[must_use]
    pub fn requires_override(&self) -> bool {
        matches!(
            self,
            Self::ReferentialIntegrity { .. } | Self::ValidationFailed { .. }
        )
    }

    /// The commit window failed; operators must look
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CommitFailed { .. })
    }

    /// Structured detail for callers
    #[must_use]
    pub fn details(&self) -> Value {
        match self {
            Self::RevisionMismatch { expected, actual } => {
                json!({ "expected": expected, "actual": actual })
            }
            Self::PatchFailed(e) => json!({
                "index": e.index,
                "op": e.op,
                "path": e.path,
                "reason": e.code(),
                "message": e.reason.to_string(),
            }),
            Self::ReferentialIntegrity { report } => json!({
                "summary": report.summary(),
                "issues": report.issues,
            }),
            Self::ValidationFailed { summary } => json!({ "summary": summary }),
            Self::NoDraft { protocol_id }
            | Self::NotInitialized { protocol_id }
            | Self::AlreadyInitialized { protocol_id } => json!({ "protocolId": protocol_id }),
            Self::VersionNotFound {
                protocol_id,
                version,
            } => json!({ "protocolId": protocol_id, "version": version }),
            Self::CommitFailed { stage, reason } => json!({ "stage": stage, "reason": reason }),
            _ => Value::Null,
        }
    }

    /// Failure response for callers
    #[must_use]
    pub fn to_response(&self) -> FailureResponse {
        FailureResponse {
            error: self.code().to_string(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use protocol_doc::{OpKind, PatchFailure};

    #[test]
    fn revision_mismatch_details() {
        let expected = Revision::compute(&json!({"v": 2}));
        let actual = Revision::compute(&json!({"v": 1}));
        let err = PublishError::RevisionMismatch { expected, actual };
        assert!(err.is_conflict());
        assert!(!err.requires_override());
        let response = err.to_response();
        assert_eq!(response.error, "revision_mismatch");
        assert_eq!(response.details["expected"], json!(expected.to_string()));
        assert_eq!(response.details["actual"], json!(actual.to_string()));
    }

    #[test]
    fn patch_failure_details() {
        let err = PublishError::from(PatchError {
            index: 2,
            op: OpKind::Remove,
            path: "/a/@id:X".to_string(),
            reason: PatchFailure::PathNotFound,
        });
        assert!(err.is_client_error());
        let details = err.details();
        assert_eq!(details["index"], json!(2));
        assert_eq!(details["op"], json!("remove"));
        assert_eq!(details["reason"], json!("path_not_found"));
    }

    #[test]
    fn gate_failures_require_override() {
        let err = PublishError::ReferentialIntegrity {
            report: IntegrityReport::default(),
        };
        assert!(err.requires_override());
        assert!(!err.is_client_error());
        let err = PublishError::ValidationFailed {
            summary: Box::default(),
        };
        assert!(err.requires_override());
        assert_eq!(err.details()["summary"]["validatorAvailable"], json!(false));
    }

    #[test]
    fn commit_failure_is_fatal() {
        let err = PublishError::CommitFailed {
            stage: PublishState::Writing,
            reason: "disk full".to_string(),
        };
        assert!(err.is_fatal());
        assert_eq!(err.code(), "commit_failed");
        assert_eq!(err.details()["stage"], json!("writing"));
    }

    #[test]
    fn invalid_protocol_id_is_client_error() {
        let err = PublishError::from(StorageError::InvalidKey {
            key: "../x".to_string(),
            reason: "leading dot",
        });
        assert_eq!(err.code(), "invalid_protocol_id");
        assert!(err.is_client_error());
    }
}
