//! Publish orchestrator
//!
//! Provides [`Publisher`], the only writer of canonical protocol documents.
//!
//! ## Publish
//!
//! Under the protocol's lock, in order:
//!
//! 1. load the draft (`no_draft`)
//! 2. reject sentinel-pinned drafts (`unknown_revision`)
//! 3. compare the draft's pin with the current revision (`revision_mismatch`)
//! 4. apply the draft to a copy (`patch_failed`)
//! 5. integrity check the candidate (`referential_integrity` unless forced)
//! 6. external validation, bounded and fail-closed (`validation_failed`
//!    unless forced)
//! 7. archive the current document to `history/`
//! 8. atomically replace `current.json`
//! 9. archive the draft, store the version record, append the audit entry,
//!    delete the draft
//!
//! Steps 1-6 only read. Steps 7-9 are local and run in a spawned task that
//! owns the lock guard, so dropping the caller's future cannot interrupt
//! them.
//!
//! ## Settling
//!
//! A commit window that failed part-way is settled the next time the
//! protocol's lock is taken by a writer (or by [`Publisher::recover`]):
//!
//! - `published/v<N>.json` without audit entry `N`: the document was already
//!   swapped, so the entry is appended from the record (roll forward)
//! - `current.json` moved past the last audit entry with no record: the
//!   archived predecessor is written back (roll back)

use crate::audit::{AuditTrail, ChainVerification, ChangeLogEntry, PendingEntry};
use crate::config::{ConfigError, PublisherConfig};
use crate::draft::DraftStore;
use crate::error::PublishError;
use crate::locks::ProtocolLocks;
use crate::state::{PublishAttempt, PublishState};
use crate::storage::{
    slots, validate_protocol_id, write_archive, FsBackend, StorageBackend, StorageError,
};
use crate::types::{
    Draft, DraftStatus, DryRunReport, PublishRequest, PublishResponse, PublishedVersion,
    RecoveryReport, Settlement, ValidationSummary, ValidatorReport,
};
use crate::validator::{run_bounded, ConformanceValidator, HttpValidator, Unconfigured};
use chrono::{DateTime, Utc};
use protocol_doc::{changed_paths, DocPath, PatchOperation, ProtocolDocument, Revision};
use protocol_integrity::{IntegrityChecker, IntegrityReport};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Outcome of both gates
#[derive(Debug)]
struct Gated {
    integrity: IntegrityReport,
    validator: Option<ValidatorReport>,
    summary: ValidationSummary,
}

/// Everything the commit window needs, owned
#[derive(Debug)]
struct CommitPlan {
    protocol_id: String,
    previous_bytes: Vec<u8>,
    previous_revision: Revision,
    candidate: ProtocolDocument,
    draft: Option<Draft>,
    gated: Gated,
    reason: Option<String>,
    published_by: String,
    changed_paths: Vec<String>,
    reverted_from: Option<u64>,
}

/// Draft, validate and publish protocol documents
pub struct Publisher {
    backend: Arc<dyn StorageBackend>,
    drafts: DraftStore,
    audit: AuditTrail,
    validator: Arc<dyn ConformanceValidator>,
    checker: IntegrityChecker,
    locks: ProtocolLocks,
    config: PublisherConfig,
}

impl Publisher {
    /// Create publisher over `backend` and `validator`
    #[must_use]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        validator: Arc<dyn ConformanceValidator>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            drafts: DraftStore::new(Arc::clone(&backend)),
            audit: AuditTrail::new(Arc::clone(&backend)),
            backend,
            validator,
            checker: IntegrityChecker::new(),
            locks: ProtocolLocks::new(),
            config,
        }
    }

    /// Create publisher on the filesystem under `config.storage_root`,
    /// validating over HTTP when `config.validator_url` is set
    ///
    /// # Errors
    /// Returns error if the config is invalid
    pub fn from_config(config: PublisherConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let backend: Arc<dyn StorageBackend> = Arc::new(FsBackend::new(&config.storage_root));
        let validator: Arc<dyn ConformanceValidator> = match &config.validator_url {
            Some(url) => Arc::new(HttpValidator::new(url.as_str())),
            None => {
                warn!("no validator configured; every publish will need forceOverride");
                Arc::new(Unconfigured)
            }
        };
        Ok(Self::new(backend, validator, config))
    }

    /// Use a custom integrity checker
    #[must_use]
    pub fn with_checker(mut self, checker: IntegrityChecker) -> Self {
        self.checker = checker;
        self
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Write the first canonical document of a protocol
    ///
    /// # Errors
    /// `already_initialized` if a document exists, or a storage error
    pub async fn bootstrap(
        &self,
        protocol_id: &str,
        document: Value,
    ) -> Result<Revision, PublishError> {
        validate_protocol_id(protocol_id)?;
        let _guard = self.locks.acquire(protocol_id).await;
        let document = ProtocolDocument::new(document);
        match self
            .backend
            .write_new(protocol_id, slots::CURRENT, &document.to_canonical_bytes())
            .await
        {
            Ok(()) => {
                info!(protocol_id, revision = %document.revision(), "protocol initialized");
                Ok(document.revision())
            }
            Err(StorageError::AlreadyExists { .. }) => Err(PublishError::AlreadyInitialized {
                protocol_id: protocol_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Current canonical document
    ///
    /// # Errors
    /// `not_initialized`, `corrupt_document` or a storage error
    pub async fn current(&self, protocol_id: &str) -> Result<ProtocolDocument, PublishError> {
        self.load_current(protocol_id)
            .await
            .map(|(_, document)| document)
    }

    async fn load_current(
        &self,
        protocol_id: &str,
    ) -> Result<(Vec<u8>, ProtocolDocument), PublishError> {
        let bytes = self
            .backend
            .read(protocol_id, slots::CURRENT)
            .await?
            .ok_or_else(|| PublishError::NotInitialized {
                protocol_id: protocol_id.to_string(),
            })?;
        let document = ProtocolDocument::from_slice(&bytes)?;
        Ok((bytes, document))
    }

    /// Active draft
    ///
    /// # Errors
    /// Storage error
    pub async fn draft(&self, protocol_id: &str) -> Result<Option<Draft>, PublishError> {
        Ok(self.drafts.get(protocol_id).await?)
    }

    /// Create or update the active draft
    ///
    /// A new draft is pinned to the current revision; later saves replace
    /// the operations and keep the pin.
    ///
    /// # Errors
    /// `empty_draft`, `not_initialized` or a storage error
    pub async fn save_draft(
        &self,
        protocol_id: &str,
        operations: Vec<PatchOperation>,
        author: &str,
    ) -> Result<Draft, PublishError> {
        if operations.is_empty() {
            return Err(PublishError::EmptyDraft);
        }
        validate_protocol_id(protocol_id)?;
        let _guard = self.locks.acquire(protocol_id).await;
        self.settle(protocol_id).await?;
        let now = Utc::now();
        let draft = match self.drafts.get(protocol_id).await? {
            Some(mut draft) => {
                draft.update(operations, author, now);
                draft
            }
            None => {
                let current = self.current(protocol_id).await?;
                Draft::new(protocol_id, current.revision(), operations, author, now)
            }
        };
        self.drafts.put(&draft).await?;
        debug!(
            protocol_id,
            operations = draft.operations.len(),
            base = %draft.base_revision.short(),
            "draft saved"
        );
        Ok(draft)
    }

    /// Archive and delete the active draft, returning the archive slot
    ///
    /// # Errors
    /// `no_draft` or a storage error
    pub async fn discard_draft(&self, protocol_id: &str) -> Result<String, PublishError> {
        validate_protocol_id(protocol_id)?;
        let _guard = self.locks.acquire(protocol_id).await;
        let draft = self.require_draft(protocol_id).await?;
        let archived = self.drafts.archive(&draft, Utc::now()).await?;
        self.drafts.delete(protocol_id).await?;
        info!(protocol_id, archived = %archived, "draft discarded");
        Ok(archived)
    }

    /// Replace the draft with one restoring `version`'s content
    ///
    /// Any active draft is archived first. The new draft is pinned to the
    /// current revision.
    ///
    /// # Errors
    /// `version_not_found`, `not_initialized` or a storage error
    pub async fn revert_draft(
        &self,
        protocol_id: &str,
        version: u64,
        author: &str,
    ) -> Result<Draft, PublishError> {
        validate_protocol_id(protocol_id)?;
        let _guard = self.locks.acquire(protocol_id).await;
        self.settle(protocol_id).await?;
        let record = self.published_version(protocol_id, version).await?;
        let current = self.current(protocol_id).await?;
        let now = Utc::now();
        if let Some(previous) = self.drafts.get(protocol_id).await? {
            self.drafts.archive(&previous, now).await?;
        }
        let draft = Draft::new(
            protocol_id,
            current.revision(),
            vec![PatchOperation::replace(DocPath::root(), record.content)],
            author,
            now,
        );
        self.drafts.put(&draft).await?;
        info!(protocol_id, version, "draft reverted to published version");
        Ok(draft)
    }

    /// Check the active draft without publishing
    ///
    /// Runs the revision check, the patch and both gates. Gate failures are
    /// reported in the result, not as errors.
    ///
    /// # Errors
    /// `no_draft`, `unknown_revision`, `revision_mismatch`, `patch_failed`
    /// or a storage error
    pub async fn validate_draft(&self, protocol_id: &str) -> Result<DryRunReport, PublishError> {
        validate_protocol_id(protocol_id)?;
        let draft = self.require_draft(protocol_id).await?;
        let (_, current) = self.load_current(protocol_id).await?;
        check_pin(&draft, &current)?;
        let candidate = current.apply(&draft.operations)?;
        let integrity = self.checker.check(candidate.content());
        let (validator, summary) = self.external_validation(&candidate, &integrity).await;
        Ok(DryRunReport {
            base_revision: draft.base_revision,
            candidate_revision: candidate.revision(),
            changed_paths: changed_paths(&draft.operations),
            integrity,
            validator,
            summary,
        })
    }

    /// Publish the active draft
    ///
    /// # Errors
    /// Any [`PublishError`]; only `commit_failed` leaves partial state
    pub async fn publish(
        &self,
        protocol_id: &str,
        request: PublishRequest,
    ) -> Result<PublishResponse, PublishError> {
        let span = info_span!("publish", protocol_id = %protocol_id);
        async {
            self.check_request(&request)?;
            validate_protocol_id(protocol_id)?;
            let guard = self.locks.acquire(protocol_id).await;
            let mut attempt = PublishAttempt::new();
            match self.prepare_publish(protocol_id, &request, &mut attempt).await {
                Ok(plan) => self.commit(plan, attempt, guard).await,
                Err(e) => Err(rejected(&mut attempt, e)),
            }
        }
        .instrument(span)
        .await
    }

    async fn prepare_publish(
        &self,
        protocol_id: &str,
        request: &PublishRequest,
        attempt: &mut PublishAttempt,
    ) -> Result<CommitPlan, PublishError> {
        self.settle(protocol_id).await?;
        attempt.advance(PublishState::CheckingRevision)?;
        let draft = self.require_draft(protocol_id).await?;
        let (previous_bytes, current) = self.load_current(protocol_id).await?;
        check_pin(&draft, &current)?;

        attempt.advance(PublishState::ApplyingPatch)?;
        let candidate = current.apply(&draft.operations)?;

        let gated = self
            .run_gates(&candidate, request.force_override, attempt)
            .await?;
        Ok(CommitPlan {
            protocol_id: protocol_id.to_string(),
            previous_bytes,
            previous_revision: current.revision(),
            candidate,
            changed_paths: changed_paths(&draft.operations),
            draft: Some(draft),
            gated,
            reason: request.reason().map(str::to_string),
            published_by: request.published_by.clone(),
            reverted_from: None,
        })
    }

    /// Re-publish a prior version's content as a new version
    ///
    /// Goes through both gates and the same commit path as
    /// [`Publisher::publish`]; history is only ever appended to. An active
    /// draft is left alone and will no longer match the current revision.
    ///
    /// # Errors
    /// Any [`PublishError`] except the draft-related ones
    pub async fn revert_to_version(
        &self,
        protocol_id: &str,
        version: u64,
        request: PublishRequest,
    ) -> Result<PublishResponse, PublishError> {
        let span = info_span!("revert", protocol_id = %protocol_id, version);
        async {
            self.check_request(&request)?;
            validate_protocol_id(protocol_id)?;
            let guard = self.locks.acquire(protocol_id).await;
            let mut attempt = PublishAttempt::new();
            match self
                .prepare_revert(protocol_id, version, &request, &mut attempt)
                .await
            {
                Ok(plan) => self.commit(plan, attempt, guard).await,
                Err(e) => Err(rejected(&mut attempt, e)),
            }
        }
        .instrument(span)
        .await
    }

    async fn prepare_revert(
        &self,
        protocol_id: &str,
        version: u64,
        request: &PublishRequest,
        attempt: &mut PublishAttempt,
    ) -> Result<CommitPlan, PublishError> {
        self.settle(protocol_id).await?;
        attempt.advance(PublishState::CheckingRevision)?;
        let (previous_bytes, current) = self.load_current(protocol_id).await?;
        let record = self.published_version(protocol_id, version).await?;

        attempt.advance(PublishState::ApplyingPatch)?;
        let candidate = ProtocolDocument::new(record.content);
        let changed = top_level_changes(current.content(), candidate.content());

        let gated = self
            .run_gates(&candidate, request.force_override, attempt)
            .await?;
        Ok(CommitPlan {
            protocol_id: protocol_id.to_string(),
            previous_bytes,
            previous_revision: current.revision(),
            candidate,
            draft: None,
            gated,
            reason: request.reason().map(str::to_string),
            published_by: request.published_by.clone(),
            changed_paths: changed,
            reverted_from: Some(version),
        })
    }

    /// Discard leftovers of interrupted writes and settle an interrupted
    /// commit
    ///
    /// Keeps the last complete canonical document; never guesses at the
    /// content of a partial one.
    ///
    /// # Errors
    /// `corrupt_document` or a storage error
    pub async fn recover(&self, protocol_id: &str) -> Result<RecoveryReport, PublishError> {
        validate_protocol_id(protocol_id)?;
        let _guard = self.locks.acquire(protocol_id).await;
        let discarded = self.backend.recover(protocol_id).await?;
        let settled = self.settle(protocol_id).await?;
        let current_revision = match self.backend.read(protocol_id, slots::CURRENT).await? {
            Some(bytes) => Some(ProtocolDocument::from_slice(&bytes)?.revision()),
            None => None,
        };
        if !discarded.is_empty() {
            warn!(protocol_id, discarded = ?discarded, "recovered from interrupted writes");
        }
        Ok(RecoveryReport {
            discarded,
            current_revision,
            settled,
        })
    }

    /// Bring the change log and the canonical document back in step
    ///
    /// Caller holds the protocol's lock.
    async fn settle(&self, protocol_id: &str) -> Result<Option<Settlement>, PublishError> {
        let Some(bytes) = self.backend.read(protocol_id, slots::CURRENT).await? else {
            return Ok(None);
        };
        let current = ProtocolDocument::from_slice(&bytes)?.revision();
        let last = self.audit.last(protocol_id).await?;
        let next = last.as_ref().map_or(1, |entry| entry.version + 1);

        let slot = slots::published(next);
        if self.backend.read(protocol_id, &slot).await?.is_some() {
            let record = self.published_version(protocol_id, next).await?;
            if record.revision != current {
                return Err(StorageError::Corrupt {
                    slot,
                    reason: format!(
                        "records revision {} but the document is at {current}",
                        record.revision
                    ),
                }
                .into());
            }
            self.roll_forward(protocol_id, &record).await?;
            warn!(protocol_id, version = next, "interrupted commit rolled forward");
            return Ok(Some(Settlement::Recorded { version: next }));
        }

        let archives = self
            .backend
            .list(protocol_id, &format!("{}/", slots::HISTORY_DIR))
            .await?;
        let expected = match &last {
            Some(entry) => entry.revision,
            // Nothing published yet: the oldest archive is the bootstrap document
            None => match archives.first() {
                Some(oldest) => self.archived_revision(protocol_id, oldest).await?,
                None => return Ok(None),
            },
        };
        if current == expected {
            return Ok(None);
        }

        for archive in archives.iter().rev() {
            let Some(archived) = self.backend.read(protocol_id, archive).await? else {
                continue;
            };
            if ProtocolDocument::from_slice(&archived)?.revision() == expected {
                self.backend
                    .write(protocol_id, slots::CURRENT, &archived)
                    .await?;
                warn!(
                    protocol_id,
                    restored = %expected,
                    from = %archive,
                    "interrupted commit rolled back"
                );
                return Ok(Some(Settlement::Restored {
                    revision: expected,
                    from_slot: archive.clone(),
                }));
            }
        }
        Err(StorageError::Corrupt {
            slot: slots::CURRENT.to_string(),
            reason: format!("no archived document at the last recorded revision {expected}"),
        }
        .into())
    }

    async fn archived_revision(
        &self,
        protocol_id: &str,
        slot: &str,
    ) -> Result<Revision, PublishError> {
        let bytes = self
            .backend
            .read(protocol_id, slot)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                protocol_id: protocol_id.to_string(),
                slot: slot.to_string(),
            })?;
        Ok(ProtocolDocument::from_slice(&bytes)?.revision())
    }

    async fn roll_forward(
        &self,
        protocol_id: &str,
        record: &PublishedVersion,
    ) -> Result<(), PublishError> {
        self.audit.append(protocol_id, pending_entry(record)).await?;
        if record.reverted_from.is_some() {
            return Ok(());
        }
        // The consumed draft was archived before the record was written
        if let Some(draft) = self.drafts.get(protocol_id).await? {
            if draft.base_revision == record.previous_revision
                && draft.updated_at <= record.published_at
            {
                self.drafts.delete(protocol_id).await?;
            }
        }
        Ok(())
    }

    /// Change log, oldest first
    ///
    /// # Errors
    /// Storage error
    pub async fn history(&self, protocol_id: &str) -> Result<Vec<ChangeLogEntry>, PublishError> {
        validate_protocol_id(protocol_id)?;
        Ok(self.audit.entries(protocol_id).await?)
    }

    /// Load one published version
    ///
    /// # Errors
    /// `version_not_found` or a storage error
    pub async fn published_version(
        &self,
        protocol_id: &str,
        version: u64,
    ) -> Result<PublishedVersion, PublishError> {
        let slot = slots::published(version);
        let bytes = self
            .backend
            .read(protocol_id, &slot)
            .await?
            .ok_or_else(|| PublishError::VersionNotFound {
                protocol_id: protocol_id.to_string(),
                version,
            })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StorageError::Corrupt {
                slot,
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Recompute the audit chain
    ///
    /// # Errors
    /// Storage error
    pub async fn verify_audit(&self, protocol_id: &str) -> Result<ChainVerification, PublishError> {
        validate_protocol_id(protocol_id)?;
        Ok(self.audit.verify(protocol_id).await?)
    }

    fn check_request(&self, request: &PublishRequest) -> Result<(), PublishError> {
        if self.config.require_reason && !request.force_override && request.reason().is_none() {
            return Err(PublishError::MissingReason);
        }
        Ok(())
    }

    async fn require_draft(&self, protocol_id: &str) -> Result<Draft, PublishError> {
        self.drafts
            .get(protocol_id)
            .await?
            .ok_or_else(|| PublishError::NoDraft {
                protocol_id: protocol_id.to_string(),
            })
    }

    async fn external_validation(
        &self,
        candidate: &ProtocolDocument,
        integrity: &IntegrityReport,
    ) -> (Option<ValidatorReport>, ValidationSummary) {
        let bytes = candidate.to_canonical_bytes();
        match run_bounded(
            self.validator.as_ref(),
            &bytes,
            self.config.validation_timeout(),
        )
        .await
        {
            Ok(report) => {
                let summary = ValidationSummary::new(integrity, Ok(&report));
                (Some(report), summary)
            }
            Err(e) => {
                let reason = e.to_string();
                (None, ValidationSummary::new(integrity, Err(reason.as_str())))
            }
        }
    }

    async fn run_gates(
        &self,
        candidate: &ProtocolDocument,
        force: bool,
        attempt: &mut PublishAttempt,
    ) -> Result<Gated, PublishError> {
        attempt.advance(PublishState::CheckingIntegrity)?;
        let integrity = self.checker.check(candidate.content());
        if !integrity.valid && !force {
            return Err(PublishError::ReferentialIntegrity { report: integrity });
        }

        attempt.advance(PublishState::RunningExternalValidation)?;
        let (validator, mut summary) = self.external_validation(candidate, &integrity).await;
        if !summary.validator_passed() && !force {
            return Err(PublishError::ValidationFailed {
                summary: Box::new(summary),
            });
        }

        summary.forced_publish = !summary.passed();
        if summary.forced_publish {
            warn!(
                integrity = %integrity.summary(),
                validator_available = summary.validator_available,
                "gates overridden, forcing publish"
            );
        }
        Ok(Gated {
            integrity,
            validator,
            summary,
        })
    }

    async fn commit(
        &self,
        plan: CommitPlan,
        attempt: PublishAttempt,
        guard: OwnedMutexGuard<()>,
    ) -> Result<PublishResponse, PublishError> {
        let committer = Committer {
            backend: Arc::clone(&self.backend),
            drafts: self.drafts.clone(),
            audit: self.audit.clone(),
        };
        let task = tokio::spawn(
            async move {
                let _guard = guard;
                committer.run(plan, attempt).await
            }
            .in_current_span(),
        );
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(fatal = true, error = %e, "publish commit task aborted");
                Err(PublishError::CommitFailed {
                    stage: PublishState::Failed,
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("config", &self.config)
            .field("checker", &self.checker)
            .finish_non_exhaustive()
    }
}

/// Commit window: archive, swap, record
struct Committer {
    backend: Arc<dyn StorageBackend>,
    drafts: DraftStore,
    audit: AuditTrail,
}

impl Committer {
    async fn run(
        self,
        plan: CommitPlan,
        mut attempt: PublishAttempt,
    ) -> Result<PublishResponse, PublishError> {
        let protocol_id = plan.protocol_id.as_str();
        let published_at = Utc::now();

        attempt.advance(PublishState::Archiving)?;
        let archived = write_archive(
            self.backend.as_ref(),
            protocol_id,
            slots::HISTORY_DIR,
            published_at,
            &plan.previous_bytes,
        )
        .await
        .map_err(|e| fatal(&mut attempt, &e))?;

        attempt.advance(PublishState::Writing)?;
        self.backend
            .write(
                protocol_id,
                slots::CURRENT,
                &plan.candidate.to_canonical_bytes(),
            )
            .await
            .map_err(|e| fatal(&mut attempt, &e))?;

        attempt.advance(PublishState::RecordingAudit)?;
        let entry = self
            .record(&plan, published_at)
            .await
            .map_err(|e| fatal(&mut attempt, &e))?;
        attempt.advance(PublishState::Done)?;

        info!(
            version = entry.version,
            revision = %entry.revision,
            forced = entry.forced_publish,
            archived = %archived,
            "protocol published"
        );
        Ok(PublishResponse {
            success: true,
            published_at,
            published_version_ref: slots::published(entry.version),
            version: entry.version,
            revision: entry.revision,
            validation_summary: entry.validation_summary,
        })
    }

    async fn record(
        &self,
        plan: &CommitPlan,
        published_at: DateTime<Utc>,
    ) -> Result<ChangeLogEntry, StorageError> {
        let protocol_id = plan.protocol_id.as_str();
        if let Some(draft) = &plan.draft {
            let mut consumed = draft.clone();
            consumed.status = DraftStatus::Published;
            self.drafts.archive(&consumed, published_at).await?;
        }

        let version = self
            .audit
            .last(protocol_id)
            .await?
            .map_or(1, |last| last.version + 1);
        let record = PublishedVersion {
            protocol_id: plan.protocol_id.clone(),
            version,
            revision: plan.candidate.revision(),
            previous_revision: plan.previous_revision,
            content: plan.candidate.content().clone(),
            published_at,
            published_by: plan.published_by.clone(),
            reason: plan.reason.clone(),
            changed_paths: plan.changed_paths.clone(),
            validation_summary: plan.gated.summary.clone(),
            integrity_report: plan.gated.integrity.clone(),
            validator_report: plan.gated.validator.clone(),
            reverted_from: plan.reverted_from,
        };
        self.backend
            .write_new(
                protocol_id,
                &slots::published(version),
                &serde_json::to_vec_pretty(&record)?,
            )
            .await?;

        let entry = self.audit.append(protocol_id, pending_entry(&record)).await?;

        if plan.draft.is_some() {
            self.drafts.delete(protocol_id).await?;
        }
        Ok(entry)
    }
}

fn pending_entry(record: &PublishedVersion) -> PendingEntry {
    PendingEntry {
        revision: record.revision,
        reason: record.reason.clone(),
        published_by: record.published_by.clone(),
        published_at: record.published_at,
        changed_paths: record.changed_paths.clone(),
        validation_summary: record.validation_summary.clone(),
        forced_publish: record.validation_summary.forced_publish,
        reverted_from: record.reverted_from,
    }
}

fn check_pin(draft: &Draft, current: &ProtocolDocument) -> Result<(), PublishError> {
    if draft.base_revision.is_unknown() {
        return Err(PublishError::UnknownRevision);
    }
    if draft.base_revision != current.revision() {
        return Err(PublishError::RevisionMismatch {
            expected: current.revision(),
            actual: draft.base_revision,
        });
    }
    Ok(())
}

fn rejected(attempt: &mut PublishAttempt, error: PublishError) -> PublishError {
    warn!(
        code = error.code(),
        stage = %attempt.state(),
        error = %error,
        "publish rejected"
    );
    attempt.abandon();
    error
}

fn fatal(attempt: &mut PublishAttempt, error: &StorageError) -> PublishError {
    let stage = attempt.state();
    if let Err(transition) = attempt.advance(PublishState::Failed) {
        warn!(error = %transition, "attempt not marked failed");
    }
    error!(fatal = true, stage = %stage, error = %error, "publish commit failed");
    PublishError::CommitFailed {
        stage,
        reason: error.to_string(),
    }
}

/// Top-level pointer paths whose values differ
fn top_level_changes(before: &Value, after: &Value) -> Vec<String> {
    match (before.as_object(), after.as_object()) {
        (Some(old), Some(new)) => old
            .keys()
            .chain(new.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|key| old.get(*key) != new.get(*key))
            .map(|key| DocPath::root().key(key.as_str()).to_string())
            .collect(),
        _ if before == after => Vec::new(),
        _ => vec![DocPath::root().to_string()],
    }
}
