//! Letting go of a backing file that a save is about to replace.
//!
//! History may refer to file bytes the live content no longer shows. Before
//! the file goes away those bytes are copied into memory; bytes the live
//! content still shows stay file ranges, and the reload after the save points
//! them at the same bytes in the new file.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use tracing::warn;

use super::{Document, Segment, SegmentId};
use crate::store::BackingStore;

/// Which bytes of a store the live content reads, and at what logical offset
#[derive(Debug, Default)]
pub struct Coverage {
    /// Sorted by `start`; live content never shows a file byte twice
    runs: Vec<Run>,
}

#[derive(Debug, Clone, Copy)]
struct Run {
    start: u64,
    end: u64,
    logical: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Covered { start: u64, end: u64, logical: u64 },
    Uncovered { start: u64, end: u64 },
}

impl Coverage {
    /// With `aligned_only`, only bytes sitting at their own offset count: the
    /// ones an in-place save leaves alone.
    pub fn of(doc: &Document, store: &Arc<BackingStore>, aligned_only: bool) -> Self {
        let mut runs: Vec<Run> = doc
            .snapshot()
            .iter_with_offsets()
            .filter(|(offset, leaf)| leaf.is_backed_by(store) && (!aligned_only || leaf.start() == *offset))
            .map(|(offset, leaf)| Run {
                start: leaf.start(),
                end: leaf.end(),
                logical: offset,
            })
            .collect();
        runs.sort_unstable_by_key(|run| run.start);
        Self { runs }
    }

    /// Split store bytes `[start, end)` into covered and uncovered parts
    fn split(&self, start: u64, end: u64) -> Vec<Part> {
        let mut parts = Vec::new();
        let mut i = self.runs.partition_point(|run| run.end <= start);
        let mut pos = start;

        while pos < end {
            match self.runs.get(i) {
                Some(run) if run.start <= pos => {
                    let to = run.end.min(end);
                    if to > pos {
                        parts.push(Part::Covered {
                            start: pos,
                            end: to,
                            logical: run.logical + (pos - run.start),
                        });
                        pos = to;
                    }
                    i += 1;
                }
                next => {
                    let to = next.map_or(end, |run| run.start.min(end));
                    parts.push(Part::Uncovered { start: pos, end: to });
                    pos = to;
                }
            }
        }
        parts
    }

    /// `segment` re-expressed over `target`, a file holding exactly the live
    /// content. None if `segment` reads a file byte the live content does not
    /// show.
    pub fn rebind(
        &self,
        segment: &Segment,
        store: &Arc<BackingStore>,
        target: &Arc<BackingStore>,
    ) -> Option<Segment> {
        let mut parts = Vec::new();
        for leaf in segment.leaves() {
            if leaf.is_backed_by(store) {
                for part in self.split(leaf.start(), leaf.end()) {
                    let Part::Covered { start, end, logical } = part else {
                        return None;
                    };
                    parts.push(Segment::from_store(Arc::clone(target), logical, logical + end - start));
                }
            } else if leaf.is_file_backed() {
                return None;
            } else {
                parts.push(leaf);
            }
        }
        Some(Segment::stitch(parts))
    }
}

/// Sorted, disjoint store ranges
#[derive(Debug, Clone, Default)]
struct Ranges(Vec<(u64, u64)>);

impl Ranges {
    fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let i = self.0.partition_point(|&(_, e)| e < start);
        let (mut from, mut to) = (start, end);
        let mut j = i;
        while j < self.0.len() && self.0[j].0 <= to {
            from = from.min(self.0[j].0);
            to = to.max(self.0[j].1);
            j += 1;
        }
        self.0.splice(i..j, [(from, to)]);
    }

    /// Bytes of `[start, end)` not in the set
    fn missing(&self, start: u64, end: u64) -> u64 {
        let i = self.0.partition_point(|&(_, e)| e <= start);
        let present: u64 = self.0[i..]
            .iter()
            .take_while(|&&(s, _)| s < end)
            .map(|&(s, e)| e.min(end) - s.max(start))
            .sum();
        (end - start) - present
    }

    /// Index of the range holding `[start, end)`
    fn find(&self, start: u64, end: u64) -> Option<usize> {
        let i = self.0.partition_point(|&(_, e)| e <= start);
        self.0
            .get(i)
            .filter(|&&(s, e)| s <= start && end <= e)
            .map(|_| i)
    }

    fn len(&self) -> u64 {
        self.0.iter().map(|&(s, e)| e - s).sum()
    }
}

#[derive(Debug)]
enum Piece {
    Keep(Segment),
    /// Store bytes `[start, end)`, read once into a shared copy
    Copy { start: u64, end: u64 },
    /// A run of some other file, copied on its own
    Private(Segment),
}

/// How one segment stops depending on the store
#[derive(Debug)]
pub struct Rebase {
    id: SegmentId,
    pieces: Vec<Piece>,
}

impl Rebase {
    pub fn id(&self) -> SegmentId {
        self.id
    }

    fn materialize(self, copies: &Copies) -> io::Result<(SegmentId, Segment)> {
        let mut parts = Vec::with_capacity(self.pieces.len());
        for piece in self.pieces {
            parts.push(match piece {
                Piece::Keep(segment) => segment,
                Piece::Copy { start, end } => copies.slice(start, end)?,
                Piece::Private(segment) => segment.to_private()?,
            });
        }
        Ok((self.id, Segment::stitch(parts)))
    }
}

/// Rebases for a group of segments, with the memory they add
#[derive(Debug, Default)]
pub struct Planned {
    rebases: Vec<Rebase>,
    ranges: Ranges,
    cost: u64,
}

impl Planned {
    /// Bytes these rebases add in memory beyond what is already committed
    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn is_empty(&self) -> bool {
        self.rebases.is_empty()
    }
}

/// Plans the copies that free history (and, for in-place saves, moved live
/// data) from a store. Planning reads no bytes.
#[derive(Debug)]
pub struct Detacher<'a> {
    doc: &'a Document,
    store: Option<Arc<BackingStore>>,
    coverage: Coverage,
    live: HashSet<SegmentId>,
    planned: HashSet<SegmentId>,
    /// Store bytes committed for copying
    copied: Ranges,
    private: u64,
    moved: Vec<Rebase>,
    history: Vec<Rebase>,
}

impl<'a> Detacher<'a> {
    /// `in_place` means the store itself is about to be overwritten: live
    /// segments read away from their own offset are copied too, and only
    /// aligned bytes count as surviving the save.
    pub fn new(doc: &'a Document, store: Option<&Arc<BackingStore>>, in_place: bool) -> Self {
        let coverage = store.map_or_else(Coverage::default, |store| Coverage::of(doc, store, in_place));
        let mut detacher = Self {
            doc,
            store: store.cloned(),
            coverage,
            live: doc.segments().ids().iter().copied().collect(),
            planned: HashSet::new(),
            copied: Ranges::default(),
            private: 0,
            moved: Vec::new(),
            history: Vec::new(),
        };
        if in_place {
            detacher.plan_moved();
        }
        detacher
    }

    /// Rebases `ids` need on top of those already committed. Live segments
    /// need none since the reload after the save rebinds them.
    pub fn plan(&self, ids: impl IntoIterator<Item = SegmentId>) -> Planned {
        let mut planned = Planned::default();
        let mut seen = HashSet::new();

        for id in ids {
            if self.live.contains(&id) || self.planned.contains(&id) || !seen.insert(id) {
                continue;
            }
            let Some(rebase) = self.rebase(id) else {
                continue;
            };
            for piece in &rebase.pieces {
                match piece {
                    Piece::Copy { start, end } => planned.ranges.insert(*start, *end),
                    Piece::Private(segment) => planned.cost += segment.len(),
                    Piece::Keep(_) => {}
                }
            }
            planned.rebases.push(rebase);
        }

        planned.cost += planned
            .ranges
            .0
            .iter()
            .map(|&(start, end)| self.copied.missing(start, end))
            .sum::<u64>();
        planned
    }

    pub fn commit(&mut self, planned: Planned) {
        for &(start, end) in &planned.ranges.0 {
            self.copied.insert(start, end);
        }
        self.private += planned
            .rebases
            .iter()
            .flat_map(|rebase| &rebase.pieces)
            .map(|piece| match piece {
                Piece::Private(segment) => segment.len(),
                _ => 0,
            })
            .sum::<u64>();
        self.planned.extend(planned.rebases.iter().map(Rebase::id));
        self.history.extend(planned.rebases);
    }

    pub fn finish(self) -> DetachPlan {
        DetachPlan {
            store: self.store,
            copied: self.copied,
            private: self.private,
            moved: self.moved,
            history: self.history,
        }
    }

    fn rebase(&self, id: SegmentId) -> Option<Rebase> {
        let segment = self.doc.arena().get(id)?;
        let mut pieces = Vec::new();
        let mut copies = false;

        for leaf in segment.leaves() {
            match &self.store {
                Some(store) if leaf.is_backed_by(store) => {
                    for part in self.coverage.split(leaf.start(), leaf.end()) {
                        pieces.push(match part {
                            Part::Covered { start, end, .. } => {
                                Piece::Keep(Segment::from_store(Arc::clone(store), start, end))
                            }
                            Part::Uncovered { start, end } => {
                                copies = true;
                                Piece::Copy { start, end }
                            }
                        });
                    }
                }
                _ if leaf.is_file_backed() => {
                    copies = true;
                    pieces.push(Piece::Private(leaf));
                }
                _ => pieces.push(Piece::Keep(leaf)),
            }
        }

        copies.then_some(Rebase { id, pieces })
    }

    fn plan_moved(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        let segments = self.doc.segments();

        for (i, &id) in segments.ids().iter().enumerate() {
            let mut offset = segments.start_of(i);
            let mut pieces = Vec::new();
            let mut copies = false;

            for leaf in self.doc.arena()[id].leaves() {
                let len = leaf.len();
                if leaf.is_backed_by(store) && leaf.start() != offset {
                    copies = true;
                    self.copied.insert(leaf.start(), leaf.end());
                    pieces.push(Piece::Copy {
                        start: leaf.start(),
                        end: leaf.end(),
                    });
                } else {
                    pieces.push(Piece::Keep(leaf));
                }
                offset += len;
            }
            if copies {
                self.moved.push(Rebase { id, pieces });
            }
        }
    }
}

/// Copies to make before a store goes away
#[derive(Debug, Default)]
pub struct DetachPlan {
    store: Option<Arc<BackingStore>>,
    copied: Ranges,
    private: u64,
    moved: Vec<Rebase>,
    history: Vec<Rebase>,
}

/// Segments produced by [`DetachPlan::materialize`], for [`Document::install`]
#[derive(Debug, Default)]
pub struct Detached {
    pub moved: Vec<(SegmentId, Segment)>,
    /// None when history could not be copied and has to go
    pub history: Option<Vec<(SegmentId, Segment)>>,
}

/// Store ranges read into memory, each once
struct Copies {
    ranges: Ranges,
    data: Vec<Segment>,
}

impl Copies {
    fn slice(&self, start: u64, end: u64) -> io::Result<Segment> {
        let i = self
            .ranges
            .find(start, end)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "store range was not copied"))?;
        let from = self.ranges.0[i].0;
        Ok(self.data[i].slice(start - from, end - from))
    }
}

impl DetachPlan {
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty() && self.history.is_empty()
    }

    /// Bytes the copies take in memory
    pub fn cost(&self) -> u64 {
        self.copied.len() + self.private
    }

    /// Do the reads. Only the descriptors captured while planning are used, so
    /// the document may be read concurrently. Failing to copy moved live data
    /// is an error; failing to copy history only loses the history.
    pub fn materialize(self) -> io::Result<Detached> {
        let copies = match self.read_copies() {
            Ok(copies) => copies,
            Err(e) if self.moved.is_empty() => {
                warn!(error = %e, "could not copy undo data into memory");
                return Ok(Detached::default());
            }
            Err(e) => return Err(e),
        };

        let moved = self
            .moved
            .into_iter()
            .map(|rebase| rebase.materialize(&copies))
            .collect::<io::Result<Vec<_>>>()?;

        let history = match self
            .history
            .into_iter()
            .map(|rebase| rebase.materialize(&copies))
            .collect::<io::Result<Vec<_>>>()
        {
            Ok(segments) => Some(segments),
            Err(e) => {
                warn!(error = %e, "could not copy undo data into memory");
                None
            }
        };

        Ok(Detached { moved, history })
    }

    fn read_copies(&self) -> io::Result<Copies> {
        let mut data = Vec::with_capacity(self.copied.0.len());
        if let Some(store) = &self.store {
            for &(start, end) in &self.copied.0 {
                data.push(Segment::from_store(Arc::clone(store), start, end).to_private()?);
            }
        }
        Ok(Copies {
            ranges: self.copied.clone(),
            data,
        })
    }
}
