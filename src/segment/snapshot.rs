use std::io::{self, Write};

use super::Segment;

/// A detached run of segments, independent of any buffer's arena.
///
/// Cloning is cheap: segments share their sources. This is what saves stream
/// from and what range extraction hands out.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    segments: Vec<Segment>,
    ends: Vec<u64>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u64 {
        self.ends.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segments paired with the logical offset each one starts at
    pub fn iter_with_offsets(&self) -> impl Iterator<Item = (u64, &Segment)> {
        self.segments
            .iter()
            .zip(self.ends.iter())
            .map(|(segment, &end)| (end - segment.len(), segment))
    }

    /// Append a segment, merging it into the last one when they are contiguous.
    /// Stitched segments are split back into their leaves.
    pub fn push(&mut self, segment: Segment) {
        if segment.is_composite() {
            for leaf in segment.leaves() {
                self.push_leaf(leaf);
            }
        } else {
            self.push_leaf(segment);
        }
    }

    fn push_leaf(&mut self, segment: Segment) {
        if segment.is_empty() {
            return;
        }
        let end = self.len() + segment.len();

        if let Some(last) = self.segments.last_mut() {
            if let Some(merged) = last.try_merge(&segment) {
                *last = merged;
                if let Some(last_end) = self.ends.last_mut() {
                    *last_end = end;
                }
                return;
            }
        }

        self.segments.push(segment);
        self.ends.push(end);
    }

    /// Copy bytes starting at logical `offset` into `buf`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut i = self.ends.partition_point(|&end| end <= offset);
        let mut pos = offset;
        let mut done = 0;

        while done < buf.len() && i < self.segments.len() {
            let segment = &self.segments[i];
            let local = pos - (self.ends[i] - segment.len());
            let n = segment.read(local, &mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
            pos += n as u64;
            if pos >= self.ends[i] {
                i += 1;
            }
        }

        Ok(done)
    }

    /// Stream every byte into `out` through a `block_size` buffer
    pub fn write_to<W: Write>(&self, out: &mut W, block_size: usize) -> io::Result<u64> {
        let mut block = vec![0u8; block_size.max(1)];
        let mut written = 0;

        for segment in &self.segments {
            let mut local = 0;
            while local < segment.len() {
                let n = segment.read(local, &mut block)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "segment source ended early",
                    ));
                }
                out.write_all(&block[..n])?;
                local += n as u64;
                written += n as u64;
            }
        }

        Ok(written)
    }

    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len() as usize);
        self.write_to(&mut out, 64 * 1024)?;
        Ok(out)
    }
}
