//! Local undo/redo over whole materialized-list snapshots.
//!
//! History is per client and never replicated. Restoring a snapshot replaces
//! the shared document's content, so peer edits made since the snapshot was
//! taken are overwritten.

use crate::shapes::ShapeRecord;

/// Maximum number of undo states to keep.
pub const MAX_UNDO_HISTORY: usize = 50;

/// A materialized shape list captured at one point in time.
pub type Snapshot = Vec<ShapeRecord>;

/// Bounded linear history with an implicit cursor between two stacks.
#[derive(Debug, Clone)]
pub struct History {
    undo_stack: Vec<Snapshot>,
    redo_stack: Vec<Snapshot>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Record the state as it was before a mutation.
    ///
    /// Discards anything that could have been redone.
    pub fn checkpoint(&mut self, before: Snapshot) {
        self.undo_stack.push(before);
        self.redo_stack.clear();

        while self.undo_stack.len() > self.limit {
            self.undo_stack.remove(0);
        }
    }

    /// Step back. Returns the state to restore, keeping `current` for redo.
    pub fn undo(&mut self, current: &[ShapeRecord]) -> Option<Snapshot> {
        let previous = self.undo_stack.pop()?;
        self.redo_stack.push(current.to_vec());
        Some(previous)
    }

    /// Step forward. Returns the state to restore, keeping `current` for undo.
    pub fn redo(&mut self, current: &[ShapeRecord]) -> Option<Snapshot> {
        let next = self.redo_stack.pop()?;
        self.undo_stack.push(current.to_vec());
        Some(next)
    }

    /// Put a state back on the stack it came from after a failed restore.
    pub(crate) fn revert_undo(&mut self, snapshot: Snapshot) {
        self.redo_stack.pop();
        self.undo_stack.push(snapshot);
    }

    pub(crate) fn revert_redo(&mut self, snapshot: Snapshot) {
        self.undo_stack.pop();
        self.redo_stack.push(snapshot);
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Forget all history, e.g. after adopting a room's state on join.
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(MAX_UNDO_HISTORY)
    }
}
