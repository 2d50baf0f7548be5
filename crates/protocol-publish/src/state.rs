//! Publish state machine
//!
//! ```text
//! idle → checking-revision → applying-patch → checking-integrity
//!      → running-external-validation → archiving → writing
//!      → recording-audit → done
//! ```
//!
//! Every pre-commit state may fall back to `idle`, which means the attempt
//! left nothing behind. From `archiving` on the only way out besides
//! progress is `failed`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Stage of one publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishState {
    /// No attempt in progress
    Idle,
    /// Loading the draft and comparing revisions
    CheckingRevision,
    /// Building the candidate
    ApplyingPatch,
    /// Checking referential integrity of the candidate
    CheckingIntegrity,
    /// Waiting on the conformance validator
    RunningExternalValidation,
    /// Archiving the current document
    Archiving,
    /// Swapping in the candidate
    Writing,
    /// Recording the version and audit entry
    RecordingAudit,
    /// Committed
    Done,
    /// Commit aborted part-way
    Failed,
}

impl PublishState {
    /// States reachable from `self`
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [PublishState] {
        use PublishState::{
            ApplyingPatch, Archiving, CheckingIntegrity, CheckingRevision, Done, Failed, Idle,
            RecordingAudit, RunningExternalValidation, Writing,
        };
        match self {
            Idle => &[CheckingRevision],
            CheckingRevision => &[ApplyingPatch, Idle],
            ApplyingPatch => &[CheckingIntegrity, Idle],
            CheckingIntegrity => &[RunningExternalValidation, Idle],
            RunningExternalValidation => &[Archiving, Idle],
            Archiving => &[Writing, Failed],
            Writing => &[RecordingAudit, Failed],
            RecordingAudit => &[Done, Failed],
            Done | Failed => &[Idle],
        }
    }

    /// `self → to` is allowed
    #[inline]
    #[must_use]
    pub fn can_transition_to(self, to: PublishState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Inside the commit window, where failures are fatal
    #[inline]
    #[must_use]
    pub fn is_commit_phase(self) -> bool {
        matches!(self, Self::Archiving | Self::Writing | Self::RecordingAudit)
    }

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CheckingRevision => "checking-revision",
            Self::ApplyingPatch => "applying-patch",
            Self::CheckingIntegrity => "checking-integrity",
            Self::RunningExternalValidation => "running-external-validation",
            Self::Archiving => "archiving",
            Self::Writing => "writing",
            Self::RecordingAudit => "recording-audit",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PublishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Illegal state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal publish transition {from} -> {to}")]
pub struct TransitionError {
    /// Current state
    pub from: PublishState,
    /// Requested state
    pub to: PublishState,
}

/// Tracks the state of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAttempt {
    state: PublishState,
}

impl PublishAttempt {
    /// Start in [`PublishState::Idle`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: PublishState::Idle,
        }
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> PublishState {
        self.state
    }

    /// Move to `to`
    ///
    /// # Errors
    /// Returns error if the transition table forbids it; state is unchanged
    pub fn advance(&mut self, to: PublishState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        debug!(from = %self.state, to = %to, "publish transition");
        self.state = to;
        Ok(())
    }

    /// Drop back to idle after a pre-commit rejection
    ///
    /// Has no effect inside the commit window.
    pub fn abandon(&mut self) {
        if self.state.can_transition_to(PublishState::Idle) {
            debug!(from = %self.state, "publish abandoned");
            self.state = PublishState::Idle;
        }
    }
}

impl Default for PublishAttempt {
    fn default() -> Self {
        Self::new()
    }
}
