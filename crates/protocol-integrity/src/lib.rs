//! Referential Integrity
//!
//! Checks that every id reference in a candidate protocol document resolves
//! to an existing entity of the expected kind.
//!
//! # Core Concepts
//!
//! - [`IntegrityChecker`]: runs the checks over every study design
//! - [`IntegrityReport`]: `{valid, issues}`, valid when no error is present
//! - [`EntityIndex`]: per-design lookup by kind and id, plus inbound references
//!
//! # Example
//!
//! ```rust
//! use protocol_integrity::validate;
//! use serde_json::json;
//!
//! let doc = json!({"studyDesigns": [{
//!     "id": "SD",
//!     "scheduleTimelines": [{"id": "T", "instances": [
//!         {"id": "I", "encounterId": "NOPE", "activityIds": []}
//!     ]}]
//! }]});
//! let report = validate(&doc);
//! assert!(!report.valid);
//! ```

#![warn(unreachable_pub)]

mod checker;
mod index;
mod issue;

pub use checker::{validate, CheckerConfig, IntegrityChecker};
pub use index::{EntityIndex, Inbound};
pub use issue::{IntegrityIssue, IntegrityReport, IssueKind, Severity};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
