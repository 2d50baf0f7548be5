//! Undo/redo history
//!
//! Provides [`EditHistory`], bounded stacks of operation-list snapshots.
//!
//! ## Design
//!
//! - `record` pushes the list as it was *before* an edit
//! - Undo hands back the previous list and keeps the current one for redo
//! - A new edit after an undo clears redo (linear history)
//! - `begin_group`/`end_group` make any number of edits one undo unit

use protocol_doc::PatchOperation;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Snapshot of what undo/redo can do, returned by every mutating call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryState {
    /// An undo unit is available
    pub can_undo: bool,
    /// A redo unit is available
    pub can_redo: bool,
    /// Undo units held
    pub undo_depth: usize,
    /// Redo units held
    pub redo_depth: usize,
    /// A group is open
    pub grouping: bool,
}

/// Push notification of history changes
pub trait HistoryObserver: Send + Sync {
    /// Called after every state-changing call
    fn on_change(&self, state: &HistoryState);
}

/// Bounded undo/redo stacks of operation lists
pub struct EditHistory {
    undo: VecDeque<Vec<PatchOperation>>,
    redo: Vec<Vec<PatchOperation>>,
    capacity: usize,
    group_depth: usize,
    group_recorded: bool,
    observers: Vec<Arc<dyn HistoryObserver>>,
}

impl EditHistory {
    /// Default number of undo units kept
    pub const DEFAULT_CAPACITY: usize = 50;

    /// Create history holding [`Self::DEFAULT_CAPACITY`] undo units
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create history holding at most `capacity` undo units (minimum 1)
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            capacity: capacity.max(1),
            group_depth: 0,
            group_recorded: false,
            observers: Vec::new(),
        }
    }

    /// Register an observer
    pub fn subscribe(&mut self, observer: Arc<dyn HistoryObserver>) {
        self.observers.push(observer);
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> HistoryState {
        HistoryState {
            can_undo: !self.undo.is_empty(),
            can_redo: !self.redo.is_empty(),
            undo_depth: self.undo.len(),
            redo_depth: self.redo.len(),
            grouping: self.group_depth > 0,
        }
    }

    /// Record `previous`, the operation list before an edit
    ///
    /// Inside a group only the first record pushes an undo unit. Any record
    /// clears redo.
    pub fn record(&mut self, previous: Vec<PatchOperation>) -> HistoryState {
        self.redo.clear();
        if self.group_depth > 0 {
            if self.group_recorded {
                return self.notify();
            }
            self.group_recorded = true;
        }
        self.undo.push_back(previous);
        while self.undo.len() > self.capacity {
            self.undo.pop_front();
        }
        self.notify()
    }

    /// Open a group; groups nest
    pub fn begin_group(&mut self) -> HistoryState {
        if self.group_depth == 0 {
            self.group_recorded = false;
        }
        self.group_depth += 1;
        self.notify()
    }

    /// Close the innermost group
    pub fn end_group(&mut self) -> HistoryState {
        self.group_depth = self.group_depth.saturating_sub(1);
        if self.group_depth == 0 {
            self.group_recorded = false;
        }
        self.notify()
    }

    /// List the next undo would restore, without taking it
    #[inline]
    #[must_use]
    pub fn peek_undo(&self) -> Option<&[PatchOperation]> {
        self.undo.back().map(Vec::as_slice)
    }

    /// List the next redo would restore, without taking it
    #[inline]
    #[must_use]
    pub fn peek_redo(&self) -> Option<&[PatchOperation]> {
        self.redo.last().map(Vec::as_slice)
    }

    /// Step back: returns the list to restore, keeping `current` for redo
    ///
    /// Closes any open group. `None` when there is nothing to undo.
    pub fn undo(
        &mut self,
        current: Vec<PatchOperation>,
    ) -> Option<(Vec<PatchOperation>, HistoryState)> {
        self.group_depth = 0;
        self.group_recorded = false;
        let previous = self.undo.pop_back()?;
        self.redo.push(current);
        Some((previous, self.notify()))
    }

    /// Step forward: returns the list to restore, keeping `current` for undo
    pub fn redo(
        &mut self,
        current: Vec<PatchOperation>,
    ) -> Option<(Vec<PatchOperation>, HistoryState)> {
        let next = self.redo.pop()?;
        self.undo.push_back(current);
        while self.undo.len() > self.capacity {
            self.undo.pop_front();
        }
        Some((next, self.notify()))
    }

    /// Drop every undo and redo unit
    pub fn clear(&mut self) -> HistoryState {
        self.undo.clear();
        self.redo.clear();
        self.group_depth = 0;
        self.group_recorded = false;
        self.notify()
    }

    fn notify(&self) -> HistoryState {
        let state = self.state();
        for observer in &self.observers {
            observer.on_change(&state);
        }
        state
    }
}

impl Default for EditHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EditHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditHistory")
            .field("undo_depth", &self.undo.len())
            .field("redo_depth", &self.redo.len())
            .field("capacity", &self.capacity)
            .field("group_depth", &self.group_depth)
            .field("observers", &self.observers.len())
            .finish()
    }
}
