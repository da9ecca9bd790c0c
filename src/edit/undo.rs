use std::collections::{HashSet, VecDeque};
use tracing::debug;

use super::{Action, ActionId};
use crate::config::KeepUndoPolicy;
use crate::segment::{Detacher, SegmentId};
use crate::store::SpaceProbe;

/// Undo/redo history with a save checkpoint
#[derive(Debug)]
pub struct EditLog {
    /// Most recent first
    undo: VecDeque<Action>,
    /// Most recently undone first
    redo: VecDeque<Action>,
    /// Maximum number of undo levels; `None` is unbounded
    max_size: Option<usize>,
    /// Head of `undo` at the last successful save
    checkpoint: Option<ActionId>,
    /// History was evicted, so the saved state can no longer be reached by undo
    changed_beyond_undo: bool,
    next_id: u64,
}

impl EditLog {
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            max_size,
            checkpoint: None,
            changed_beyond_undo: false,
            next_id: 1,
        }
    }

    pub fn next_id(&mut self) -> ActionId {
        let id = ActionId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Push onto the undo history, evicting the oldest entries past the limit.
    /// Returns true when something was evicted.
    pub fn push(&mut self, action: Action) -> bool {
        self.undo.push_front(action);
        self.enforce_limit()
    }

    /// Drop the redo history. Returns true if it held anything.
    pub fn clear_redo(&mut self) -> bool {
        let had_any = !self.redo.is_empty();
        self.redo.clear();
        had_any
    }

    pub fn pop_undo(&mut self) -> Option<Action> {
        self.undo.pop_front()
    }

    pub fn push_redo(&mut self, action: Action) {
        self.redo.push_front(action);
    }

    pub fn pop_redo(&mut self) -> Option<Action> {
        self.redo.pop_front()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo.len()
    }

    pub fn undo_actions(&self) -> impl Iterator<Item = &Action> {
        self.undo.iter()
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Change the limit, evicting immediately if history is now too long
    pub fn set_max_size(&mut self, max_size: Option<usize>) -> bool {
        self.max_size = max_size;
        self.enforce_limit()
    }

    pub fn changed_beyond_undo(&self) -> bool {
        self.changed_beyond_undo
    }

    /// True when the content differs from what was last saved (or loaded)
    pub fn has_changed(&self) -> bool {
        self.changed_beyond_undo || self.checkpoint != self.undo.front().map(Action::id)
    }

    /// The current state is now what's on disk
    pub fn mark_saved(&mut self) {
        self.checkpoint = self.undo.front().map(Action::id);
        self.changed_beyond_undo = false;
    }

    /// Forget everything, as after a fresh load
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.checkpoint = None;
        self.changed_beyond_undo = false;
    }

    /// Segments that undo or redo may still need
    pub fn referenced_segments(&self) -> HashSet<SegmentId> {
        self.undo
            .iter()
            .chain(self.redo.iter())
            .flat_map(Action::segment_ids)
            .collect()
    }

    /// Drop both stacks. The saved state can no longer be reached by undo.
    pub fn drop_history(&mut self) {
        let changed = self.has_changed();
        self.undo.clear();
        self.redo.clear();
        self.checkpoint = None;
        self.changed_beyond_undo = changed;
    }

    /// Decide which history survives the backing file being replaced, and plan
    /// the copies that make it independent of that file
    pub fn retain_after_save(&mut self, policy: KeepUndoPolicy, detacher: &mut Detacher<'_>, probe: &dyn SpaceProbe) {
        match policy {
            KeepUndoPolicy::Never => {
                debug!("dropping undo history on save");
                self.drop_history();
            }
            KeepUndoPolicy::Always => {
                for action in self.undo.iter().chain(self.redo.iter()) {
                    let planned = detacher.plan(action.segment_ids());
                    detacher.commit(planned);
                }
            }
            KeepUndoPolicy::WhileMemoryAvailable => {
                let mut budget = probe.available_memory();
                Self::retain_fitting(&mut self.undo, detacher, &mut budget);
                Self::retain_fitting(&mut self.redo, detacher, &mut budget);
            }
        }
    }

    /// Keep actions from most recent onward while their copies fit in
    /// `budget`; the first that doesn't and everything older is dropped.
    fn retain_fitting(actions: &mut VecDeque<Action>, detacher: &mut Detacher<'_>, budget: &mut Option<u64>) {
        let mut keep = actions.len();

        for (i, action) in actions.iter().enumerate() {
            let planned = detacher.plan(action.segment_ids());
            let needed = planned.cost();
            match budget {
                Some(free) if *free < needed => {
                    debug!(kept = i, needed, free = *free, "undo data does not fit in memory, truncating history");
                    keep = i;
                    break;
                }
                Some(free) => *free -= needed,
                None => {}
            }
            detacher.commit(planned);
        }

        actions.truncate(keep);
    }

    fn enforce_limit(&mut self) -> bool {
        let Some(max) = self.max_size else {
            return false;
        };
        if self.undo.len() <= max {
            return false;
        }

        debug!(evicted = self.undo.len() - max, "undo history over limit");
        self.undo.truncate(max);
        // the oldest states are gone for good
        self.changed_beyond_undo = true;
        true
    }
}

impl Default for EditLog {
    fn default() -> Self {
        Self::new(None)
    }
}
