use std::collections::HashSet;
use std::ops::Index;

use super::Segment;

/// Stable handle to a segment stored in a [`SegmentArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(usize);

impl SegmentId {
    fn slot(self) -> usize {
        self.0
    }
}

/// Owns every segment referenced by the live collection or by history.
///
/// Handles stay valid until [`SegmentArena::retain`] releases them, so an undo
/// record can keep pointing at segments the live collection has spliced out.
#[derive(Debug, Default)]
pub struct SegmentArena {
    slots: Vec<Option<Segment>>,
    free: Vec<usize>,
}

impl SegmentArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, segment: Segment) -> SegmentId {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(segment);
                SegmentId(slot)
            }
            None => {
                self.slots.push(Some(segment));
                SegmentId(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, id: SegmentId) -> Option<&Segment> {
        self.slots.get(id.slot()).and_then(Option::as_ref)
    }

    /// Swap the segment behind `id` for one with identical bytes
    pub(crate) fn replace(&mut self, id: SegmentId, segment: Segment) {
        debug_assert_eq!(self[id].len(), segment.len());
        self.slots[id.slot()] = Some(segment);
    }

    /// Number of live segments
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every segment not in `live`
    pub fn retain(&mut self, live: &HashSet<SegmentId>) {
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_some() && !live.contains(&SegmentId(slot)) {
                *entry = None;
                self.free.push(slot);
            }
        }
    }
}

impl Index<SegmentId> for SegmentArena {
    type Output = Segment;

    fn index(&self, id: SegmentId) -> &Segment {
        match self.get(id) {
            Some(segment) => segment,
            None => panic!("segment {id:?} was released while still referenced"),
        }
    }
}
