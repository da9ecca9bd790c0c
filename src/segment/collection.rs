use super::{Segment, SegmentArena, SegmentId, Snapshot};
use crate::error::{BufferError, Result};

/// Record of one structural edit: at `index`, `removed` was replaced by `inserted`.
///
/// Applying and reverting a splice swaps exactly these handles, so the segment
/// boundaries before and after an edit are reproduced exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Splice {
    index: usize,
    removed: Vec<SegmentId>,
    inserted: Vec<SegmentId>,
}

impl Splice {
    pub fn removed(&self) -> &[SegmentId] {
        &self.removed
    }

    pub fn inserted(&self) -> &[SegmentId] {
        &self.inserted
    }

    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.inserted.is_empty()
    }
}

/// Ordered handles whose segments, laid end to end, form the logical content.
///
/// Offsets are never stored per segment; `ends` is a prefix-sum cache patched
/// by every splice. The entries after the touched window shift by the size
/// change, so like the `Vec::splice` of the handles themselves an edit is
/// linear in the number of segments after it.
#[derive(Debug, Clone, Default)]
pub struct SegmentCollection {
    ids: Vec<SegmentId>,
    ends: Vec<u64>,
}

impl SegmentCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical size in bytes
    pub fn len(&self) -> u64 {
        self.ends.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_count(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> &[SegmentId] {
        &self.ids
    }

    /// Logical offset where the `i`-th segment starts
    pub fn start_of(&self, i: usize) -> u64 {
        if i == 0 {
            0
        } else {
            self.ends[i - 1]
        }
    }

    /// Segment holding logical `index`, with the offset inside that segment
    pub fn find_segment(&self, index: u64) -> Result<(SegmentId, u64)> {
        let (i, local) = self.locate(index)?;
        Ok((self.ids[i], local))
    }

    fn locate(&self, index: u64) -> Result<(usize, u64)> {
        if index >= self.len() {
            return Err(BufferError::OutOfRange {
                index,
                size: self.len(),
            });
        }
        let i = self.ends.partition_point(|&end| end <= index);
        Ok((i, index - self.start_of(i)))
    }

    /// Add a segment at the end, merging with the trailing one when it continues it
    pub fn append(&mut self, arena: &mut SegmentArena, segment: Segment) -> Splice {
        if segment.is_empty() {
            return self.noop_at(self.ids.len());
        }

        let merged = self
            .ids
            .last()
            .and_then(|&last| arena[last].try_merge(&segment));

        let splice = match merged {
            Some(merged) => {
                let index = self.ids.len() - 1;
                Splice {
                    index,
                    removed: vec![self.ids[index]],
                    inserted: vec![arena.alloc(merged)],
                }
            }
            None => Splice {
                index: self.ids.len(),
                removed: Vec::new(),
                inserted: vec![arena.alloc(segment)],
            },
        };
        self.apply(arena, &splice);
        splice
    }

    /// Insert `segments` before logical `pos`; inserting at the end appends
    pub fn insert(&mut self, arena: &mut SegmentArena, pos: u64, segments: Vec<Segment>) -> Result<Splice> {
        if pos > self.len() {
            return Err(BufferError::OutOfRange {
                index: pos,
                size: self.len(),
            });
        }
        let splice = self.plan(arena, pos, pos, segments)?;
        self.apply(arena, &splice);
        Ok(splice)
    }

    /// Remove logical bytes `start..=end`
    pub fn delete(&mut self, arena: &mut SegmentArena, start: u64, end: u64) -> Result<Splice> {
        self.replace(arena, start, end, Vec::new())
    }

    /// Replace logical bytes `start..=end` with `segments`
    pub fn replace(
        &mut self,
        arena: &mut SegmentArena,
        start: u64,
        end: u64,
        segments: Vec<Segment>,
    ) -> Result<Splice> {
        self.check_range(start, end)?;
        let splice = self.plan(arena, start, end + 1, segments)?;
        self.apply(arena, &splice);
        Ok(splice)
    }

    /// The logical bytes `start..=end` as a detached run of segments
    pub fn get_range(&self, arena: &SegmentArena, start: u64, end: u64) -> Result<Snapshot> {
        self.check_range(start, end)?;

        let (first, first_off) = self.locate(start)?;
        let (last, last_off) = self.locate(end)?;
        let mut snapshot = Snapshot::new();

        for i in first..=last {
            let segment = &arena[self.ids[i]];
            let from = if i == first { first_off } else { 0 };
            let to = if i == last { last_off + 1 } else { segment.len() };
            snapshot.push(segment.slice(from, to));
        }

        Ok(snapshot)
    }

    /// The whole content as a detached run of segments
    pub fn snapshot(&self, arena: &SegmentArena) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for &id in &self.ids {
            snapshot.push(arena[id].clone());
        }
        snapshot
    }

    /// Redo a splice recorded against this collection
    pub fn apply(&mut self, arena: &SegmentArena, splice: &Splice) {
        let range = splice.index..splice.index + splice.removed.len();
        debug_assert_eq!(&self.ids[range], &splice.removed[..]);
        self.splice_ids(arena, splice.index, splice.removed.len(), &splice.inserted);
    }

    /// Undo a splice, restoring the exact previous segment boundaries
    pub fn revert(&mut self, arena: &SegmentArena, splice: &Splice) {
        let range = splice.index..splice.index + splice.inserted.len();
        debug_assert_eq!(&self.ids[range], &splice.inserted[..]);
        self.splice_ids(arena, splice.index, splice.inserted.len(), &splice.removed);
    }

    fn check_range(&self, start: u64, end: u64) -> Result<()> {
        let size = self.len();
        if end >= size {
            return Err(BufferError::OutOfRange { index: end, size });
        }
        if start > end {
            return Err(BufferError::OutOfRange { index: start, size });
        }
        Ok(())
    }

    /// Build the splice replacing logical `[start, end)` with `segments`.
    /// Boundary segments are split and their outer parts re-inserted.
    fn plan(
        &self,
        arena: &mut SegmentArena,
        start: u64,
        end: u64,
        segments: Vec<Segment>,
    ) -> Result<Splice> {
        let mut prefix = None;
        let mut suffix = None;

        let (index, removed) = if start == end {
            if start == self.len() {
                (self.ids.len(), Vec::new())
            } else {
                let (i, local) = self.locate(start)?;
                if local == 0 {
                    (i, Vec::new())
                } else {
                    let segment = &arena[self.ids[i]];
                    prefix = Some(segment.slice(0, local));
                    suffix = Some(segment.slice(local, segment.len()));
                    (i, vec![self.ids[i]])
                }
            }
        } else {
            let (first, first_off) = self.locate(start)?;
            let (last, last_off) = self.locate(end - 1)?;
            if first_off > 0 {
                prefix = Some(arena[self.ids[first]].slice(0, first_off));
            }
            let tail = &arena[self.ids[last]];
            if last_off + 1 < tail.len() {
                suffix = Some(tail.slice(last_off + 1, tail.len()));
            }
            (first, self.ids[first..=last].to_vec())
        };

        let inserted = prefix
            .into_iter()
            .chain(segments.into_iter().filter(|s| !s.is_empty()))
            .chain(suffix)
            .map(|segment| arena.alloc(segment))
            .collect();

        Ok(Splice {
            index,
            removed,
            inserted,
        })
    }

    fn noop_at(&self, index: usize) -> Splice {
        Splice {
            index,
            removed: Vec::new(),
            inserted: Vec::new(),
        }
    }

    /// Replace `count` handles at `index` with `ids`, keeping `ends` in step
    fn splice_ids(&mut self, arena: &SegmentArena, index: usize, count: usize, ids: &[SegmentId]) {
        let base = self.start_of(index);
        let old_end = if count == 0 { base } else { self.ends[index + count - 1] };

        let mut end = base;
        let window: Vec<u64> = ids
            .iter()
            .map(|&id| {
                end += arena[id].len();
                end
            })
            .collect();
        self.ids.splice(index..index + count, ids.iter().copied());
        self.ends.splice(index..index + count, window);

        if end != old_end {
            for tail in &mut self.ends[index + ids.len()..] {
                *tail = *tail - old_end + end;
            }
        }
    }
}
