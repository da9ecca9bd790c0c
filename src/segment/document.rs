use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use super::{Coverage, Segment, SegmentArena, SegmentCollection, SegmentId, Snapshot, Splice};
use crate::error::Result;
use crate::store::BackingStore;

/// The live content of a buffer: the arena plus the collection ordering it
#[derive(Debug, Default)]
pub struct Document {
    arena: SegmentArena,
    segments: SegmentCollection,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single segment covering the whole store
    pub fn from_store(store: &Arc<BackingStore>) -> Self {
        let mut doc = Self::new();
        doc.segments
            .append(&mut doc.arena, Segment::from_store(Arc::clone(store), 0, store.size()));
        doc
    }

    pub fn len(&self) -> u64 {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn arena(&self) -> &SegmentArena {
        &self.arena
    }

    pub fn segments(&self) -> &SegmentCollection {
        &self.segments
    }

    pub fn byte_at(&self, index: u64) -> Result<u8> {
        let (id, local) = self.segments.find_segment(index)?;
        let mut byte = [0u8; 1];
        match self.arena[id].read(local, &mut byte)? {
            1 => Ok(byte[0]),
            _ => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "segment source ended early").into()),
        }
    }

    pub fn get_range(&self, start: u64, end: u64) -> Result<Snapshot> {
        self.segments.get_range(&self.arena, start, end)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.segments.snapshot(&self.arena)
    }

    pub fn segment_lengths(&self) -> Vec<u64> {
        self.segments.ids().iter().map(|&id| self.arena[id].len()).collect()
    }

    pub fn append(&mut self, segment: Segment) -> Splice {
        self.segments.append(&mut self.arena, segment)
    }

    pub fn insert(&mut self, pos: u64, segments: Vec<Segment>) -> Result<Splice> {
        self.segments.insert(&mut self.arena, pos, segments)
    }

    pub fn delete(&mut self, start: u64, end: u64) -> Result<Splice> {
        self.segments.delete(&mut self.arena, start, end)
    }

    pub fn replace(&mut self, start: u64, end: u64, segments: Vec<Segment>) -> Result<Splice> {
        self.segments.replace(&mut self.arena, start, end, segments)
    }

    pub fn apply(&mut self, splice: &Splice) {
        self.segments.apply(&self.arena, splice);
    }

    pub fn revert(&mut self, splice: &Splice) {
        self.segments.revert(&self.arena, splice);
    }

    /// Swap in segments made by [`DetachPlan::materialize`](super::DetachPlan::materialize).
    /// Handles released since planning are skipped.
    pub fn install(&mut self, copies: impl IntoIterator<Item = (SegmentId, Segment)>) {
        for (id, segment) in copies {
            if self.arena.get(id).is_some_and(|current| current.len() == segment.len()) {
                self.arena.replace(id, segment);
            }
        }
    }

    /// Point the content at `store`, which must hold exactly the current bytes.
    /// `previous` is the store the content read from until now.
    ///
    /// When history still refers to segments in `keep`, every live segment is
    /// rebound in place to its own offset in `store`, and history's file runs
    /// follow the live bytes they matched in `previous`. Recorded splices stay
    /// valid. Otherwise, or when history reads file bytes that the live content
    /// doesn't show, the content restarts as a single segment; false means
    /// history must then be discarded.
    pub fn reload(
        &mut self,
        store: &Arc<BackingStore>,
        previous: Option<&Arc<BackingStore>>,
        keep: HashSet<SegmentId>,
    ) -> bool {
        if keep.is_empty() || store.size() != self.len() {
            self.restart(store);
            return keep.is_empty();
        }

        // history maps through the live layout, so it moves first
        let coverage = previous.map_or_else(Coverage::default, |previous| Coverage::of(self, previous, false));
        let live: HashSet<SegmentId> = self.segments.ids().iter().copied().collect();
        let mut rebound = Vec::new();
        for &id in keep.iter().filter(|id| !live.contains(*id)) {
            let Some(segment) = self.arena.get(id) else {
                continue;
            };
            if !segment.is_file_backed() {
                continue;
            }
            match previous.and_then(|previous| coverage.rebind(segment, previous, store)) {
                Some(segment) => rebound.push((id, segment)),
                None => {
                    self.restart(store);
                    return false;
                }
            }
        }
        self.install(rebound);

        for i in 0..self.segments.segment_count() {
            let id = self.segments.ids()[i];
            let start = self.segments.start_of(i);
            let end = start + self.arena[id].len();
            self.arena.replace(id, Segment::from_store(Arc::clone(store), start, end));
        }
        self.collect_garbage(keep);
        true
    }

    fn restart(&mut self, store: &Arc<BackingStore>) {
        self.segments = SegmentCollection::new();
        self.arena.retain(&HashSet::new());
        self.segments
            .append(&mut self.arena, Segment::from_store(Arc::clone(store), 0, store.size()));
    }

    /// Release every segment that is neither live nor in `keep`
    pub fn collect_garbage(&mut self, mut keep: HashSet<SegmentId>) {
        keep.extend(self.segments.ids().iter().copied());
        self.arena.retain(&keep);
    }
}
