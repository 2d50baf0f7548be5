//! Publish pipeline records
//!
//! Drafts, published versions, requests and responses. All records use the
//! camelCase wire format.

use chrono::{DateTime, Utc};
use protocol_doc::{PatchOperation, Revision};
use protocol_integrity::{IntegrityReport, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Draft lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    /// Pending
    #[default]
    Draft,
    /// Consumed by a publish
    Published,
}

/// Pending edits pinned to a base revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    /// Owning protocol
    pub protocol_id: String,
    /// Revision the operations were computed against; `unknown` when the
    /// draft predates revision tracking
    #[serde(default)]
    pub base_revision: Revision,
    /// Ordered patch operations
    pub operations: Vec<PatchOperation>,
    /// Last editor
    pub author: String,
    /// First edit
    pub created_at: DateTime<Utc>,
    /// Latest edit
    pub updated_at: DateTime<Utc>,
    /// Lifecycle status
    #[serde(default)]
    pub status: DraftStatus,
}

impl Draft {
    /// Create a draft pinned to `base_revision`
    #[must_use]
    pub fn new(
        protocol_id: impl Into<String>,
        base_revision: Revision,
        operations: Vec<PatchOperation>,
        author: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            base_revision,
            operations,
            author: author.into(),
            created_at: now,
            updated_at: now,
            status: DraftStatus::Draft,
        }
    }

    /// Replace the operations, keeping the pin and creation time
    pub fn update(
        &mut self,
        operations: Vec<PatchOperation>,
        author: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.operations = operations;
        self.author = author.into();
        self.updated_at = now;
    }
}

/// Result of the external conformance validator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidatorReport {
    /// Document conforms to the schema
    pub schema_valid: bool,
    /// Schema errors, as reported
    pub schema_errors: Vec<Value>,
    /// Schema warnings, as reported
    pub schema_warnings: Vec<Value>,
    /// Document conforms to the model rules
    pub model_valid: bool,
    /// Model errors, as reported
    pub model_errors: Vec<Value>,
    /// Model warnings, as reported
    pub model_warnings: Vec<Value>,
}

impl ValidatorReport {
    /// A report with no findings
    #[must_use]
    pub fn passing() -> Self {
        Self {
            schema_valid: true,
            model_valid: true,
            ..Self::default()
        }
    }

    /// A report with one model error
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            schema_valid: true,
            model_valid: false,
            model_errors: vec![Value::String(message.into())],
            ..Self::default()
        }
    }

    /// Both schema and model passed
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.schema_valid && self.model_valid
    }
}

/// Compact record of both validation gates
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    /// Integrity report had no errors
    pub integrity_valid: bool,
    /// Integrity errors
    pub integrity_errors: usize,
    /// Integrity warnings
    pub integrity_warnings: usize,
    /// Validator answered in time
    pub validator_available: bool,
    /// Validator schema verdict; false when unavailable
    pub schema_valid: bool,
    /// Validator model verdict; false when unavailable
    pub model_valid: bool,
    /// Schema errors reported
    pub schema_errors: usize,
    /// Model errors reported
    pub model_errors: usize,
    /// Schema and model warnings reported
    pub validator_warnings: usize,
    /// Why the validator was unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_error: Option<String>,
    /// Published despite a failing gate
    pub forced_publish: bool,
}

impl ValidationSummary {
    /// Summarize both gates
    ///
    /// `validator` is the report, or why none was obtained.
    #[must_use]
    pub fn new(integrity: &IntegrityReport, validator: Result<&ValidatorReport, &str>) -> Self {
        let mut summary = Self {
            integrity_valid: integrity.valid,
            integrity_errors: integrity.count(Severity::Error),
            integrity_warnings: integrity.count(Severity::Warning),
            ..Self::default()
        };
        match validator {
            Ok(report) => {
                summary.validator_available = true;
                summary.schema_valid = report.schema_valid;
                summary.model_valid = report.model_valid;
                summary.schema_errors = report.schema_errors.len();
                summary.model_errors = report.model_errors.len();
                summary.validator_warnings =
                    report.schema_warnings.len() + report.model_warnings.len();
            }
            Err(reason) => summary.validator_error = Some(reason.to_string()),
        }
        summary
    }

    /// Validator gate passed; unavailable counts as failed
    #[inline]
    #[must_use]
    pub fn validator_passed(&self) -> bool {
        self.validator_available && self.schema_valid && self.model_valid
    }

    /// Both gates passed
    #[inline]
    #[must_use]
    pub fn passed(&self) -> bool {
        self.integrity_valid && self.validator_passed()
    }
}

/// Immutable record of one successful publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedVersion {
    /// Owning protocol
    pub protocol_id: String,
    /// Version number, starting at 1
    pub version: u64,
    /// Revision of `content`
    pub revision: Revision,
    /// Revision that was replaced
    pub previous_revision: Revision,
    /// Published document
    pub content: Value,
    /// Commit time
    pub published_at: DateTime<Utc>,
    /// Publisher
    pub published_by: String,
    /// Stated reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Paths touched
    pub changed_paths: Vec<String>,
    /// Gate summary
    pub validation_summary: ValidationSummary,
    /// Full integrity report of the candidate
    pub integrity_report: IntegrityReport,
    /// Full validator report, when one was obtained
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_report: Option<ValidatorReport>,
    /// Version whose content was re-published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverted_from: Option<u64>,
}

/// Publish request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    /// Why; required unless forced
    #[serde(default)]
    pub reason: Option<String>,
    /// Publish despite failing gates
    #[serde(default)]
    pub force_override: bool,
    /// Publisher
    pub published_by: String,
}

impl PublishRequest {
    /// Create a request from `published_by`
    #[must_use]
    pub fn new(published_by: impl Into<String>) -> Self {
        Self {
            published_by: published_by.into(),
            ..Self::default()
        }
    }

    /// Set the reason
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Override failing gates
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force_override = true;
        self
    }

    /// Trimmed reason, `None` when blank
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason
            .as_deref()
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
    }
}

/// Successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    /// Always true
    pub success: bool,
    /// Commit time
    pub published_at: DateTime<Utc>,
    /// Slot of the stored [`PublishedVersion`]
    pub published_version_ref: String,
    /// New version number
    pub version: u64,
    /// New current revision
    pub revision: Revision,
    /// Gate summary
    pub validation_summary: ValidationSummary,
}

/// Failed publish, as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureResponse {
    /// Stable machine code
    pub error: String,
    /// Human-readable message
    pub message: String,
    /// Structured detail
    pub details: Value,
}

/// Result of a side-effect-free draft check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunReport {
    /// Revision the draft is pinned to
    pub base_revision: Revision,
    /// Revision the draft would publish
    pub candidate_revision: Revision,
    /// Paths the draft touches
    pub changed_paths: Vec<String>,
    /// Integrity report of the candidate
    pub integrity: IntegrityReport,
    /// Validator report, when one was obtained
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<ValidatorReport>,
    /// Gate summary
    pub summary: ValidationSummary,
}

impl DryRunReport {
    /// A non-forced publish would pass both gates
    #[inline]
    #[must_use]
    pub fn would_publish(&self) -> bool {
        self.summary.passed()
    }
}

/// Repair of a commit window that stopped part-way
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Settlement {
    /// The version record existed without its audit entry; the entry was
    /// appended
    Recorded {
        /// Version now in the change log
        version: u64,
    },
    /// The document was swapped without a version record; its archived
    /// predecessor was written back
    #[serde(rename_all = "camelCase")]
    Restored {
        /// Revision of the restored document
        revision: Revision,
        /// History slot it was restored from
        from_slot: String,
    },
}

/// Result of startup recovery
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Leftover temporary slots that were discarded
    pub discarded: Vec<String>,
    /// Revision of the canonical document kept, if any
    pub current_revision: Option<Revision>,
    /// Interrupted commit that was settled, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled: Option<Settlement>,
}
