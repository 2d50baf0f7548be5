//! Patch operations
//!
//! Provides [`PatchOperation`], the ordered unit of change drafts are made
//! of, and [`PatchError`], the report of the first failing operation.

use crate::pointer::DocPath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};

/// One JSON-patch style instruction against a document path
///
/// Serialized in the usual `{"op": "add", "path": "...", "value": ...}`
/// shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    /// Insert into an array or set an object member
    Add { path: DocPath, value: Value },
    /// Remove an existing member or element
    Remove { path: DocPath },
    /// Replace an existing member or element
    Replace { path: DocPath, value: Value },
    /// Remove from `from` and add at `path`
    Move { from: DocPath, path: DocPath },
    /// Add a copy of `from` at `path`
    Copy { from: DocPath, path: DocPath },
    /// Precondition: value at `path` must equal `value`
    Test { path: DocPath, value: Value },
}

impl PatchOperation {
    /// `add` operation
    #[inline]
    #[must_use]
    pub fn add(path: DocPath, value: Value) -> Self {
        Self::Add { path, value }
    }

    /// `remove` operation
    #[inline]
    #[must_use]
    pub fn remove(path: DocPath) -> Self {
        Self::Remove { path }
    }

    /// `replace` operation
    #[inline]
    #[must_use]
    pub fn replace(path: DocPath, value: Value) -> Self {
        Self::Replace { path, value }
    }

    /// `move` operation
    #[inline]
    #[must_use]
    pub fn move_to(from: DocPath, path: DocPath) -> Self {
        Self::Move { from, path }
    }

    /// `copy` operation
    #[inline]
    #[must_use]
    pub fn copy(from: DocPath, path: DocPath) -> Self {
        Self::Copy { from, path }
    }

    /// `test` operation
    #[inline]
    #[must_use]
    pub fn test(path: DocPath, value: Value) -> Self {
        Self::Test { path, value }
    }

    /// Operation kind
    #[must_use]
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Add { .. } => OpKind::Add,
            Self::Remove { .. } => OpKind::Remove,
            Self::Replace { .. } => OpKind::Replace,
            Self::Move { .. } => OpKind::Move,
            Self::Copy { .. } => OpKind::Copy,
            Self::Test { .. } => OpKind::Test,
        }
    }

    /// Target path
    #[must_use]
    pub fn path(&self) -> &DocPath {
        match self {
            Self::Add { path, .. }
            | Self::Remove { path }
            | Self::Replace { path, .. }
            | Self::Move { path, .. }
            | Self::Copy { path, .. }
            | Self::Test { path, .. } => path,
        }
    }

    /// Source path for `move` and `copy`
    #[must_use]
    pub fn from(&self) -> Option<&DocPath> {
        match self {
            Self::Move { from, .. } | Self::Copy { from, .. } => Some(from),
            _ => None,
        }
    }

    /// Check if operation changes the document
    #[inline]
    #[must_use]
    pub fn writes_state(&self) -> bool {
        !matches!(self, Self::Test { .. })
    }
}

/// Patch operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

impl OpKind {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Replace => "replace",
            Self::Move => "move",
            Self::Copy => "copy",
            Self::Test => "test",
        }
    }
}

impl Display for OpKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Paths touched by an operation list
///
/// Target paths of every writing operation (plus `from` for moves), in
/// first-seen order without duplicates. `test` operations touch nothing.
#[must_use]
pub fn changed_paths(operations: &[PatchOperation]) -> Vec<String> {
    let mut seen = Vec::new();
    let mut push = |path: &DocPath| {
        let text = path.to_string();
        if !seen.contains(&text) {
            seen.push(text);
        }
    };

    for op in operations.iter().filter(|op| op.writes_state()) {
        if let PatchOperation::Move { from, .. } = op {
            push(from);
        }
        push(op.path());
    }
    seen
}

/// Why a single operation failed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatchFailure {
    /// Path, parent or id reference does not resolve
    #[error("path not found")]
    PathNotFound,

    /// `test` precondition did not hold
    #[error("test failed: expected {expected}, found {}", found_text(.actual))]
    TestFailed {
        expected: Value,
        actual: Option<Value>,
    },

    /// Array index malformed or out of range for insertion
    #[error("invalid array index")]
    InvalidIndex,

    /// Parent is not a container, or id segment applied to a non-array
    #[error("target is not a container")]
    InvalidTarget,

    /// `move` into one of its own descendants
    #[error("cannot move a value into itself")]
    MoveIntoSelf,

    /// `remove` of the document root
    #[error("cannot remove the document root")]
    RootRemoval,
}

fn found_text(actual: &Option<Value>) -> String {
    actual
        .as_ref()
        .map_or_else(|| "nothing".to_string(), ToString::to_string)
}

impl PatchFailure {
    /// Stable machine code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PathNotFound => "path_not_found",
            Self::TestFailed { .. } => "test_failed",
            Self::InvalidIndex => "invalid_index",
            Self::InvalidTarget => "invalid_target",
            Self::MoveIntoSelf => "move_into_self",
            Self::RootRemoval => "root_removal",
        }
    }
}

/// First failing operation of a patch
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("operation {index} ({op} {path}) failed: {reason}")]
pub struct PatchError {
    /// Zero-based position in the operation list
    pub index: usize,
    /// Kind of the failing operation
    pub op: OpKind,
    /// Target path as written
    pub path: String,
    /// Failure reason
    pub reason: PatchFailure,
}

impl PatchError {
    /// Stable machine code of the reason
    #[inline]
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.reason.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(text: &str) -> DocPath {
        text.parse().unwrap()
    }

    #[test]
    fn wire_format() {
        let op = PatchOperation::add(p("/activities/-"), json!({"id": "A"}));
        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(
            encoded,
            json!({"op": "add", "path": "/activities/-", "value": {"id": "A"}})
        );

        let decoded: PatchOperation =
            serde_json::from_value(json!({"op": "move", "from": "/a", "path": "/b"})).unwrap();
        assert_eq!(decoded, PatchOperation::move_to(p("/a"), p("/b")));
    }

    #[test]
    fn malformed_operation_is_rejected() {
        let result: Result<PatchOperation, _> =
            serde_json::from_value(json!({"op": "frobnicate", "path": "/a"}));
        assert!(result.is_err());

        let missing_value: Result<PatchOperation, _> =
            serde_json::from_value(json!({"op": "add", "path": "/a"}));
        assert!(missing_value.is_err());
    }

    #[test]
    fn accessors() {
        let op = PatchOperation::copy(p("/a"), p("/b"));
        assert_eq!(op.kind(), OpKind::Copy);
        assert_eq!(op.path(), &p("/b"));
        assert_eq!(op.from(), Some(&p("/a")));
        assert!(op.writes_state());
        assert!(!PatchOperation::test(p("/a"), json!(1)).writes_state());
    }

    #[test]
    fn changed_paths_dedup_and_skip_tests() {
        let ops = vec![
            PatchOperation::test(p("/x"), json!(1)),
            PatchOperation::replace(p("/x"), json!(2)),
            PatchOperation::replace(p("/x"), json!(3)),
            PatchOperation::move_to(p("/a/0"), p("/b/-")),
            PatchOperation::remove(p("/activities/@id:A1")),
        ];
        assert_eq!(
            changed_paths(&ops),
            vec!["/x", "/a/0", "/b/-", "/activities/@id:A1"]
        );
    }

    #[test]
    fn failure_codes_are_stable() {
        assert_eq!(PatchFailure::PathNotFound.code(), "path_not_found");
        assert_eq!(
            PatchFailure::TestFailed {
                expected: json!(1),
                actual: None
            }
            .code(),
            "test_failed"
        );
        let err = PatchError {
            index: 2,
            op: OpKind::Remove,
            path: "/a".to_string(),
            reason: PatchFailure::PathNotFound,
        };
        assert_eq!(err.code(), "path_not_found");
        assert_eq!(err.to_string(), "operation 2 (remove /a) failed: path not found");
    }
}
