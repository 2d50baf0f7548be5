//! Structural Editing
//!
//! Domain verbs that emit invariant-preserving patch operations, plus the
//! client-side undo/redo history over the resulting operation lists.
//!
//! # Core Concepts
//!
//! - [`StructuralEditor`]: `set_cell_mark`, `clear_cell`, `rename_entity`,
//!   `update_entity_field`, `add_entity`, `remove_entity`, `move_entity`
//! - [`EditHistory`]: bounded, groupable undo/redo of operation-list snapshots
//! - [`EditSession`]: base document + operation list + history
//!
//! # Example
//!
//! ```rust
//! use protocol_doc::ProtocolDocument;
//! use protocol_edit::EditSession;
//! use serde_json::json;
//!
//! let base = ProtocolDocument::new(json!({"studyDesigns": [{
//!     "id": "SD",
//!     "encounters": [{"id": "E1", "name": "Day 1"}],
//!     "activities": [{"id": "A1", "name": "Vitals"}],
//!     "scheduleTimelines": [{"id": "T1", "instances": []}]
//! }]}));
//!
//! let mut session = EditSession::new(base);
//! session.edit(|editor, doc| editor.set_cell_mark(doc, "A1", "E1")).unwrap();
//! assert_eq!(session.operations().len(), 1);
//!
//! session.undo().unwrap();
//! assert!(session.operations().is_empty());
//! ```

#![warn(unreachable_pub)]

mod generator;
mod history;
mod session;

pub use generator::{EditError, NewEntity, StructuralEditor};
pub use history::{EditHistory, HistoryObserver, HistoryState};
pub use session::{EditSession, SessionError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
