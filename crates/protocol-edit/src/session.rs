//! Editing session
//!
//! Provides [`EditSession`]: a base document, the operation list being built
//! on top of it, and the undo/redo history of that list. The list is what
//! gets saved as a draft; the base revision is what the draft is pinned to.

use crate::generator::{EditError, NewEntity, StructuralEditor};
use crate::history::{EditHistory, HistoryObserver, HistoryState};
use protocol_doc::{apply, PatchError, PatchOperation, ProtocolDocument, Revision};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Errors from session edits
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// Verb rejected the edit
    #[error(transparent)]
    Edit(#[from] EditError),

    /// Generated or restored operations did not apply
    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// Single-user editing state over one base document
#[derive(Debug)]
pub struct EditSession {
    base: ProtocolDocument,
    operations: Vec<PatchOperation>,
    working: Value,
    history: EditHistory,
    editor: StructuralEditor,
}

impl EditSession {
    /// Start an empty session over `base`
    #[must_use]
    pub fn new(base: ProtocolDocument) -> Self {
        let working = base.content().clone();
        Self {
            base,
            operations: Vec::new(),
            working,
            history: EditHistory::new(),
            editor: StructuralEditor::new(),
        }
    }

    /// Resume a session from a saved operation list
    ///
    /// # Errors
    /// The saved operations no longer apply to `base`
    pub fn resume(
        base: ProtocolDocument,
        operations: Vec<PatchOperation>,
    ) -> Result<Self, SessionError> {
        let working = apply(base.content(), &operations)?;
        Ok(Self {
            base,
            operations,
            working,
            history: EditHistory::new(),
            editor: StructuralEditor::new(),
        })
    }

    /// Use a specific editor (e.g. for a non-default design)
    #[must_use]
    pub fn with_editor(mut self, editor: StructuralEditor) -> Self {
        self.editor = editor;
        self
    }

    /// Use a specific history (e.g. a different capacity)
    #[must_use]
    pub fn with_history(mut self, history: EditHistory) -> Self {
        self.history = history;
        self
    }

    /// Revision the operations are computed against
    #[inline]
    #[must_use]
    pub fn base_revision(&self) -> Revision {
        self.base.revision()
    }

    /// Base document
    #[inline]
    #[must_use]
    pub fn base(&self) -> &ProtocolDocument {
        &self.base
    }

    /// Accumulated operations
    #[inline]
    #[must_use]
    pub fn operations(&self) -> &[PatchOperation] {
        &self.operations
    }

    /// Base document with the operations applied
    #[inline]
    #[must_use]
    pub fn working(&self) -> &Value {
        &self.working
    }

    /// History state
    #[must_use]
    pub fn history_state(&self) -> HistoryState {
        self.history.state()
    }

    /// Register a history observer
    pub fn subscribe(&mut self, observer: Arc<dyn HistoryObserver>) {
        self.history.subscribe(observer);
    }

    /// Run one verb against the working document and record it
    ///
    /// Verbs that emit nothing leave the history untouched.
    ///
    /// # Errors
    /// The verb fails or its operations do not apply; nothing changes.
    pub fn edit<F>(&mut self, verb: F) -> Result<HistoryState, SessionError>
    where
        F: FnOnce(&StructuralEditor, &Value) -> Result<Vec<PatchOperation>, EditError>,
    {
        let operations = verb(&self.editor, &self.working)?;
        self.push(operations)
    }

    /// Run a creation verb, returning the new id
    ///
    /// # Errors
    /// Same as [`EditSession::edit`]
    pub fn create<F>(&mut self, verb: F) -> Result<(String, HistoryState), SessionError>
    where
        F: FnOnce(&StructuralEditor, &Value) -> Result<NewEntity, EditError>,
    {
        let NewEntity { id, operations } = verb(&self.editor, &self.working)?;
        let state = self.push(operations)?;
        Ok((id, state))
    }

    /// Run several edits as one undo unit
    ///
    /// The group is closed even when an edit fails; edits before the
    /// failure stay applied.
    ///
    /// # Errors
    /// The first failing edit
    pub fn group<F>(&mut self, edits: F) -> Result<HistoryState, SessionError>
    where
        F: FnOnce(&mut Self) -> Result<(), SessionError>,
    {
        self.history.begin_group();
        let result = edits(self);
        let state = self.history.end_group();
        result.map(|()| state)
    }

    /// Undo the last unit; `None` when there is nothing to undo
    ///
    /// # Errors
    /// The restored list no longer applies to the base document; the
    /// session and its history are left as they were.
    pub fn undo(&mut self) -> Result<Option<HistoryState>, SessionError> {
        let Some(previous) = self.history.peek_undo() else {
            return Ok(None);
        };
        let working = apply(self.base.content(), previous)?;
        Ok(self
            .history
            .undo(self.operations.clone())
            .map(|(operations, state)| self.restore(operations, working, state)))
    }

    /// Redo the last undone unit; `None` when there is nothing to redo
    ///
    /// # Errors
    /// Same as [`EditSession::undo`]
    pub fn redo(&mut self) -> Result<Option<HistoryState>, SessionError> {
        let Some(next) = self.history.peek_redo() else {
            return Ok(None);
        };
        let working = apply(self.base.content(), next)?;
        Ok(self
            .history
            .redo(self.operations.clone())
            .map(|(operations, state)| self.restore(operations, working, state)))
    }

    /// Give up the session, keeping the operation list
    #[must_use]
    pub fn into_operations(self) -> Vec<PatchOperation> {
        self.operations
    }

    fn push(&mut self, operations: Vec<PatchOperation>) -> Result<HistoryState, SessionError> {
        if operations.is_empty() {
            return Ok(self.history.state());
        }
        let next = apply(&self.working, &operations)?;
        debug!(
            added = operations.len(),
            total = self.operations.len() + operations.len(),
            "edit recorded"
        );
        let previous = self.operations.clone();
        self.operations.extend(operations);
        self.working = next;
        Ok(self.history.record(previous))
    }

    fn restore(
        &mut self,
        operations: Vec<PatchOperation>,
        working: Value,
        state: HistoryState,
    ) -> HistoryState {
        self.operations = operations;
        self.working = working;
        state
    }
}
