//! Per-entity dirty-state bookkeeping for selective persistence.

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use crate::model::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    Unchanged,
    Added,
    Modified,
    Removed,
}

impl ChangeState {
    fn is_dirty(self) -> bool {
        self != Self::Unchanged
    }
}

/// Entities to write and delete in a selective save
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub upserted: Vec<EntityId>,
    pub removed: Vec<EntityId>,
    pub header_modified: bool,
}

impl ChangeSet {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty() && !self.header_modified
    }
}

/// Entities never touched since the last accept are implicitly `Unchanged`
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    states: HashMap<EntityId, ChangeState>,
    dirty: usize,
    header_modified: bool,
}

impl ChangeTracker {
    #[inline]
    pub fn state(&self, id: &EntityId) -> ChangeState {
        self.states
            .get(id)
            .copied()
            .unwrap_or(ChangeState::Unchanged)
    }

    #[inline]
    pub fn mark_added(&mut self, id: EntityId) {
        let next = match self.state(&id) {
            ChangeState::Removed | ChangeState::Modified => ChangeState::Modified,
            ChangeState::Unchanged | ChangeState::Added => ChangeState::Added,
        };
        self.transition(id, next);
    }

    #[inline]
    pub fn mark_modified(&mut self, id: EntityId) {
        let next = match self.state(&id) {
            ChangeState::Added => ChangeState::Added,
            ChangeState::Removed => ChangeState::Removed,
            ChangeState::Unchanged | ChangeState::Modified => ChangeState::Modified,
        };
        self.transition(id, next);
    }

    #[inline]
    pub fn mark_removed(&mut self, id: EntityId) {
        let next = match self.state(&id) {
            // Added and removed before any save: nothing to persist
            ChangeState::Added => ChangeState::Unchanged,
            ChangeState::Unchanged | ChangeState::Modified | ChangeState::Removed => {
                ChangeState::Removed
            }
        };
        self.transition(id, next);
    }

    #[inline]
    pub fn mark_header_modified(&mut self) {
        self.header_modified = true;
    }

    #[inline]
    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty > 0 || self.header_modified
    }

    #[inline]
    pub fn dirty_count(&self) -> usize {
        self.dirty
    }

    #[inline]
    pub fn changes(&self) -> ChangeSet {
        let mut set = ChangeSet {
            header_modified: self.header_modified,
            ..ChangeSet::default()
        };

        for (id, state) in &self.states {
            match state {
                ChangeState::Added | ChangeState::Modified => set.upserted.push(id.clone()),
                ChangeState::Removed => set.removed.push(id.clone()),
                ChangeState::Unchanged => {}
            }
        }

        set.upserted.sort();
        set.removed.sort();
        set
    }

    /// Resets every entity to `Unchanged` after a successful save
    #[inline]
    pub fn accept_all_changes(&mut self) {
        self.states.clear();
        self.dirty = 0;
        self.header_modified = false;
    }

    fn transition(&mut self, id: EntityId, next: ChangeState) {
        let was_dirty = self.state(&id).is_dirty();

        if next == ChangeState::Unchanged {
            self.states.remove(&id);
        } else {
            self.states.insert(id, next);
        }

        match (was_dirty, next.is_dirty()) {
            (false, true) => self.dirty += 1,
            (true, false) => self.dirty -= 1,
            _ => {}
        }
    }
}
