//! Protocol Publishing
//!
//! Drafts, validation gates and atomic publishing of protocol documents,
//! with a tamper-evident change log.
//!
//! # Core Concepts
//!
//! - [`Publisher`]: the draft → validate → publish pipeline, serialized per
//!   protocol
//! - [`DraftStore`]: at most one pending draft per protocol
//! - [`AuditTrail`]: SHA-256 hash-chained change log, verifiable from genesis
//! - [`StorageBackend`]: byte storage by protocol id and slot
//!   ([`FsBackend`], [`MemoryBackend`])
//! - [`ConformanceValidator`]: external schema/model validation, fail-closed
//!
//! # Example
//!
//! ```rust,no_run
//! use protocol_doc::PatchOperation;
//! use protocol_publish::{
//!     HttpValidator, MemoryBackend, PublishRequest, Publisher, PublisherConfig,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), protocol_publish::PublishError> {
//! let publisher = Publisher::new(
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(HttpValidator::new("http://localhost:8080/validate")),
//!     PublisherConfig::default(),
//! );
//! publisher.bootstrap("pilot", json!({"studyDesigns": []})).await?;
//!
//! let edit = PatchOperation::add("/title".parse().unwrap(), json!("Pilot"));
//! publisher.save_draft("pilot", vec![edit], "alice").await?;
//!
//! let response = publisher
//!     .publish("pilot", PublishRequest::new("alice").with_reason("initial title"))
//!     .await?;
//! assert_eq!(response.version, 1);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

mod audit;
mod config;
mod draft;
mod error;
mod locks;
mod orchestrator;
mod state;
mod storage;
mod telemetry;
mod types;
mod validator;

pub use audit::{
    verify_lines, AuditTrail, ChainVerification, ChangeLogEntry, PendingEntry, GENESIS_HASH,
};
pub use config::{ConfigError, PublisherConfig};
pub use draft::DraftStore;
pub use error::PublishError;
pub use locks::ProtocolLocks;
pub use orchestrator::Publisher;
pub use state::{PublishAttempt, PublishState, TransitionError};
pub use storage::{
    slots, validate_protocol_id, write_archive, FsBackend, MemoryBackend, StorageBackend,
    StorageError, TMP_SUFFIX,
};
pub use telemetry::init_tracing;
pub use types::{
    Draft, DraftStatus, DryRunReport, FailureResponse, PublishRequest, PublishResponse,
    PublishedVersion, RecoveryReport, Settlement, ValidationSummary, ValidatorReport,
};
pub use validator::{run_bounded, ConformanceValidator, HttpValidator, Unconfigured, ValidatorError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
