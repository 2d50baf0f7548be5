//! Protocol Document Model
//!
//! Content-addressed protocol documents with an all-or-nothing patch engine.
//!
//! # Core Concepts
//!
//! - [`ProtocolDocument`]: JSON document paired with its [`Revision`]
//! - [`Revision`]: 32-byte Blake3 digest of canonical bytes, the
//!   optimistic-lock token drafts are pinned to
//! - [`DocPath`]: JSON pointer with id-addressed segments (`@id:<value>`)
//! - [`PatchOperation`]: one add/remove/replace/move/copy/test instruction
//! - [`apply`]: runs an operation list against a working copy
//! - [`layout`]: the entity collections and references the system knows
//!
//! # Example
//!
//! ```rust
//! use protocol_doc::{apply, DocPath, PatchOperation, Revision};
//! use serde_json::json;
//!
//! let doc = json!({"activities": [{"id": "ACT_1", "name": "Consent"}]});
//! let path: DocPath = "/activities/@id:ACT_1/name".parse().unwrap();
//! let next = apply(&doc, &[PatchOperation::replace(path, json!("Informed consent"))]).unwrap();
//!
//! assert_eq!(next["activities"][0]["name"], "Informed consent");
//! assert_ne!(Revision::compute(&doc), Revision::compute(&next));
//! ```

#![warn(unreachable_pub)]

mod apply;
mod canonical;
mod document;
mod patch;
mod pointer;
mod revision;

pub mod layout;

pub use apply::{apply, apply_to};
pub use canonical::{canonical_bytes, canonical_string};
pub use document::{DocumentError, ProtocolDocument};
pub use layout::{Design, EntityKind, Located};
pub use patch::{changed_paths, OpKind, PatchError, PatchFailure, PatchOperation};
pub use pointer::{DocPath, PointerError, Segment};
pub use revision::{Revision, RevisionError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_patch_and_revision() {
        let doc = ProtocolDocument::new(json!({
            "studyDesigns": [{"id": "SD", "activities": [{"id": "A", "name": "Vitals"}]}]
        }));
        let design = Design::first(doc.content()).unwrap();
        let activity = design.find(EntityKind::Activity, "A").unwrap();

        let ops = vec![
            PatchOperation::test(activity.field("name"), json!("Vitals")),
            PatchOperation::replace(activity.field("name"), json!("Vital signs")),
        ];
        let next = doc.apply(&ops).unwrap();

        assert!(next.verify());
        assert_ne!(next.revision(), doc.revision());
        assert_eq!(
            changed_paths(&ops),
            vec!["/studyDesigns/@id:SD/activities/@id:A/name"]
        );
    }
}
