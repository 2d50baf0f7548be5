//! Integrity issues and reports
//!
//! Provides [`IntegrityIssue`] and [`IntegrityReport`]. A report is valid
//! when it holds no [`Severity::Error`] issue; warnings and infos are
//! advisory.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// How serious an issue is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Info,
    /// Suspicious but publishable
    Warning,
    /// Blocks publish unless overridden
    Error,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// Issue classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Id reference that resolves to nothing of the expected kind
    DanglingReference,
    /// Same id carried by two objects
    DuplicateId,
    /// Entity nothing refers to
    OrphanedEntity,
    /// Entity missing from a classification other entities use
    ClassificationGap,
}

impl IssueKind {
    /// Stable machine code
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::DanglingReference => "dangling_reference",
            Self::DuplicateId => "duplicate_id",
            Self::OrphanedEntity => "orphaned_entity",
            Self::ClassificationGap => "classification_gap",
        }
    }
}

impl Display for IssueKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One finding of the checker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityIssue {
    /// Severity
    pub severity: Severity,
    /// Classification
    pub kind: IssueKind,
    /// Pointer to the offending field or entity
    pub path: String,
    /// Entity the issue is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Id that failed to resolve, for dangling references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_id: Option<String>,
    /// Human-readable description
    pub message: String,
}

impl IntegrityIssue {
    /// Dangling reference (error)
    #[must_use]
    pub fn dangling(
        path: impl Into<String>,
        entity_id: Option<&str>,
        referenced_id: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Error,
            kind: IssueKind::DanglingReference,
            path: path.into(),
            entity_id: entity_id.map(str::to_string),
            referenced_id: Some(referenced_id.to_string()),
            message: message.into(),
        }
    }

    /// Duplicate id (error)
    #[must_use]
    pub fn duplicate(path: impl Into<String>, id: &str, first_seen: &str) -> Self {
        Self {
            severity: Severity::Error,
            kind: IssueKind::DuplicateId,
            path: path.into(),
            entity_id: Some(id.to_string()),
            referenced_id: None,
            message: format!("id '{id}' already used at {first_seen}"),
        }
    }

    /// Orphaned entity (warning)
    #[must_use]
    pub fn orphan(path: impl Into<String>, id: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind: IssueKind::OrphanedEntity,
            path: path.into(),
            entity_id: Some(id.to_string()),
            referenced_id: None,
            message: message.into(),
        }
    }

    /// Classification gap with the given severity
    #[must_use]
    pub fn gap(
        severity: Severity,
        path: impl Into<String>,
        id: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            kind: IssueKind::ClassificationGap,
            path: path.into(),
            entity_id: Some(id.to_string()),
            referenced_id: None,
            message: message.into(),
        }
    }

    /// Check if this issue blocks publish
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl Display for IntegrityIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} at {}: {}", self.severity, self.kind, self.path, self.message)
    }
}

/// Outcome of an integrity check
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// No error-severity issues
    pub valid: bool,
    /// Every finding, errors first
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    /// Build a report; issues are ordered by descending severity
    #[must_use]
    pub fn from_issues(mut issues: Vec<IntegrityIssue>) -> Self {
        // Stable sort keeps document order within a severity
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));
        let valid = !issues.iter().any(IntegrityIssue::is_error);
        Self { valid, issues }
    }

    /// Error-severity issues
    pub fn errors(&self) -> impl Iterator<Item = &IntegrityIssue> {
        self.issues.iter().filter(|i| i.is_error())
    }

    /// Issues of one kind
    pub fn of_kind(&self, kind: IssueKind) -> impl Iterator<Item = &IntegrityIssue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }

    /// Number of issues at `severity`
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    /// One-line summary such as `2 errors, 1 warning, 0 infos`
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} errors, {} warnings, {} infos",
            self.count(Severity::Error),
            self.count(Severity::Warning),
            self.count(Severity::Info)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn report_validity_ignores_warnings() {
        let report = IntegrityReport::from_issues(vec![
            IntegrityIssue::orphan("/a", "A", "unused"),
            IntegrityIssue::gap(Severity::Info, "/b", "B", "no type"),
        ]);
        assert!(report.valid);
        assert_eq!(report.count(Severity::Warning), 1);
        assert_eq!(report.summary(), "0 errors, 1 warnings, 1 infos");
    }

    #[test]
    fn errors_sort_first_and_invalidate() {
        let report = IntegrityReport::from_issues(vec![
            IntegrityIssue::orphan("/a", "A", "unused"),
            IntegrityIssue::dangling("/b/x", Some("B"), "MISSING", "no such thing"),
        ]);
        assert!(!report.valid);
        assert_eq!(report.issues[0].kind, IssueKind::DanglingReference);
        assert_eq!(report.errors().count(), 1);
    }

    #[test]
    fn wire_shape() {
        let issue = IntegrityIssue::dangling("/p", Some("E"), "R", "msg");
        assert_eq!(
            serde_json::to_value(&issue).unwrap(),
            json!({
                "severity": "error",
                "kind": "dangling_reference",
                "path": "/p",
                "entityId": "E",
                "referencedId": "R",
                "message": "msg"
            })
        );
        assert_eq!(IssueKind::DuplicateId.code(), "duplicate_id");
    }
}
