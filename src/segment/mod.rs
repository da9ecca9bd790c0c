//! Segments describe the edited file as runs of bytes borrowed from the
//! original file or from in-memory edit data.

mod arena;
mod collection;
mod detach;
mod document;
mod snapshot;

#[cfg(test)]
mod tests;

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::store::BackingStore;

pub use arena::{SegmentArena, SegmentId};
pub use collection::{SegmentCollection, Splice};
pub use detach::{Coverage, DetachPlan, Detached, Detacher, Planned, Rebase};
pub use document::Document;
pub use snapshot::Snapshot;

/// Where the bytes of a segment live
#[derive(Clone)]
pub enum Source {
    File(Arc<BackingStore>),
    Memory(Arc<[u8]>),
    /// Other segments laid end to end; history that outlived its file
    Pieces(Arc<Pieces>),
}

impl Source {
    /// Same underlying storage, not just equal bytes
    pub fn same_as(&self, other: &Source) -> bool {
        match (self, other) {
            (Source::File(a), Source::File(b)) => Arc::ptr_eq(a, b),
            (Source::Memory(a), Source::Memory(b)) => Arc::ptr_eq(a, b),
            (Source::Pieces(a), Source::Pieces(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::File(store) => write!(f, "File({})", store.path().display()),
            Source::Memory(data) => write!(f, "Memory({} bytes)", data.len()),
            Source::Pieces(pieces) => write!(f, "Pieces({})", pieces.segments.len()),
        }
    }
}

/// Leaf segments read one after another as a single source
#[derive(Debug)]
pub struct Pieces {
    segments: Vec<Segment>,
    ends: Vec<u64>,
}

impl Pieces {
    fn len(&self) -> u64 {
        self.ends.last().copied().unwrap_or(0)
    }
}

/// An immutable run of bytes `[start, end)` within a [`Source`]
#[derive(Debug, Clone)]
pub struct Segment {
    source: Source,
    start: u64,
    end: u64,
}

impl Segment {
    pub fn new(source: Source, start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { source, start, end }
    }

    pub fn from_store(store: Arc<BackingStore>, start: u64, end: u64) -> Self {
        Self::new(Source::File(store), start, end)
    }

    /// Copies `data` into a fresh in-memory source
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::new(Source::Memory(Arc::from(data)), 0, data.len() as u64)
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True when any byte of this segment is read from a file
    pub fn is_file_backed(&self) -> bool {
        match &self.source {
            Source::File(_) => true,
            Source::Memory(_) => false,
            Source::Pieces(_) => self.leaves().iter().any(Segment::is_file_backed),
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.source, Source::Pieces(_))
    }

    /// True when this segment reads from `store`
    pub fn is_backed_by(&self, store: &Arc<BackingStore>) -> bool {
        matches!(&self.source, Source::File(s) if Arc::ptr_eq(s, store))
    }

    /// Sub-segment covering local offsets `[from, to)`
    pub fn slice(&self, from: u64, to: u64) -> Segment {
        debug_assert!(from <= to && to <= self.len());
        Segment::new(self.source.clone(), self.start + from, self.start + to)
    }

    /// The file and memory runs this segment reads, in order
    pub fn leaves(&self) -> Vec<Segment> {
        let Source::Pieces(pieces) = &self.source else {
            return vec![self.clone()];
        };

        let mut leaves = Vec::new();
        let mut piece_start = 0;
        for piece in &pieces.segments {
            let piece_end = piece_start + piece.len();
            let from = self.start.max(piece_start);
            let to = self.end.min(piece_end);
            if from < to {
                leaves.extend(piece.slice(from - piece_start, to - piece_start).leaves());
            }
            if piece_end >= self.end {
                break;
            }
            piece_start = piece_end;
        }
        leaves
    }

    /// One segment reading `parts` in order. Contiguous parts are merged and a
    /// lone part is returned as it is.
    pub fn stitch(parts: impl IntoIterator<Item = Segment>) -> Segment {
        let mut segments: Vec<Segment> = Vec::new();
        for part in parts.into_iter().flat_map(|part| part.leaves()) {
            if part.is_empty() {
                continue;
            }
            if let Some(last) = segments.last_mut() {
                if let Some(merged) = last.try_merge(&part) {
                    *last = merged;
                    continue;
                }
            }
            segments.push(part);
        }

        if segments.len() <= 1 {
            return segments.pop().unwrap_or_else(|| Segment::from_bytes(&[]));
        }
        let ends = segments
            .iter()
            .scan(0, |end, segment| {
                *end += segment.len();
                Some(*end)
            })
            .collect();
        let pieces = Pieces { segments, ends };
        let len = pieces.len();
        Segment::new(Source::Pieces(Arc::new(pieces)), 0, len)
    }

    /// Merge with a segment that continues this one in the same source
    pub fn try_merge(&self, next: &Segment) -> Option<Segment> {
        if self.end == next.start && self.source.same_as(&next.source) {
            Some(Segment::new(self.source.clone(), self.start, next.end))
        } else {
            None
        }
    }

    /// Copy bytes starting at local `offset` into `buf`
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.len() {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(self.len() - offset) as usize;
        let from = self.start + offset;

        match &self.source {
            Source::File(store) => store.read_at(from, &mut buf[..n]),
            Source::Memory(data) => {
                let from = from as usize;
                buf[..n].copy_from_slice(&data[from..from + n]);
                Ok(n)
            }
            Source::Pieces(pieces) => {
                let i = pieces.ends.partition_point(|&end| end <= from);
                let Some(piece) = pieces.segments.get(i) else {
                    return Ok(0);
                };
                let piece_start = pieces.ends[i] - piece.len();
                piece.read(from - piece_start, &mut buf[..n])
            }
        }
    }

    /// An equivalent segment whose bytes live in memory
    pub fn to_private(&self) -> io::Result<Segment> {
        if !self.is_file_backed() {
            return Ok(self.clone());
        }

        let too_large = || io::Error::new(io::ErrorKind::OutOfMemory, "segment too large for memory");
        let len = usize::try_from(self.len()).map_err(|_| too_large())?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| too_large())?;
        data.resize(len, 0);
        let mut filled = 0;
        while filled < len {
            let n = self.read(filled as u64, &mut data[filled..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "backing store ended before segment end",
                ));
            }
            filled += n;
        }

        Ok(Segment::new(Source::Memory(Arc::from(data)), 0, len as u64))
    }
}
