//! Read-only, block-windowed access to the file a buffer was loaded from.
//!
//! Only one window of the file is mapped at a time, so a multi-gigabyte file
//! costs one window of address space regardless of its size.

pub mod space;

use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub use space::{FixedProbe, SpaceProbe, SystemProbe};

#[derive(Debug)]
struct Window {
    offset: u64,
    map: Mmap,
}

impl Window {
    fn contains(&self, pos: u64) -> bool {
        pos >= self.offset && pos < self.offset + self.map.len() as u64
    }
}

/// A read-only view over an on-disk file
#[derive(Debug)]
pub struct BackingStore {
    path: PathBuf,
    file: File,
    size: u64,
    resizable: bool,
    window_size: u64,
    window: Mutex<Option<Window>>,
}

impl BackingStore {
    /// Open `path` for reading. Device files are never resizable; `fixed_size`
    /// makes regular files behave the same way.
    pub fn open(path: impl AsRef<Path>, window_size: usize, fixed_size: bool) -> io::Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let metadata = file.metadata()?;
        // metadata reports 0 for block devices, seeking doesn't
        let size = file.seek(SeekFrom::End(0))?;
        let resizable = metadata.file_type().is_file() && !fixed_size;

        debug!(path = %path.display(), size, resizable, "opened backing store");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            resizable,
            window_size: window_size.max(1) as u64,
            window: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_resizable(&self) -> bool {
        self.resizable
    }

    /// Copy bytes starting at `offset` into `buf`. Returns the number of bytes
    /// copied, which is short only when the end of the store is reached.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }

        let wanted = (buf.len() as u64).min(self.size - offset) as usize;
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let mut done = 0;

        while done < wanted {
            let pos = offset + done as u64;
            self.ensure_window(&mut window, pos)?;
            let Some(win) = window.as_ref() else {
                break;
            };

            let local = (pos - win.offset) as usize;
            let n = (wanted - done).min(win.map.len() - local);
            buf[done..done + n].copy_from_slice(&win.map[local..local + n]);
            done += n;
        }

        Ok(done)
    }

    pub fn byte_at(&self, offset: u64) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        match self.read_at(offset, &mut byte)? {
            1 => Ok(byte[0]),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("offset {offset} is past the end of {}", self.path.display()),
            )),
        }
    }

    /// Map the block containing `pos` unless the current window already covers it.
    fn ensure_window(&self, slot: &mut Option<Window>, pos: u64) -> io::Result<()> {
        if slot.as_ref().is_some_and(|w| w.contains(pos)) {
            return Ok(());
        }

        let start = pos - pos % self.window_size;
        let len = self.window_size.min(self.size - start) as usize;
        // SAFETY: the map is read-only and private to this store. Edits never
        // write through it, and saves only overwrite regions whose logical
        // content is unchanged or has already been staged elsewhere.
        let map = unsafe { MmapOptions::new().offset(start).len(len).map(&self.file)? };
        *slot = Some(Window { offset: start, map });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store_with(bytes: &[u8], window: usize) -> (tempfile::NamedTempFile, BackingStore) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        let store = BackingStore::open(file.path(), window, false).unwrap();
        (file, store)
    }

    #[test]
    fn test_reads_across_windows() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let (_file, store) = store_with(&data, 64);

        let mut buf = vec![0u8; 300];
        assert_eq!(store.read_at(50, &mut buf).unwrap(), 300);
        assert_eq!(&buf[..], &data[50..350]);
        assert_eq!(store.byte_at(999).unwrap(), data[999]);
    }

    #[test]
    fn test_reads_stop_at_size() {
        let (_file, store) = store_with(b"hello", 4096);

        let mut buf = [0u8; 16];
        assert_eq!(store.read_at(3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(store.read_at(5, &mut buf).unwrap(), 0);
        assert!(store.byte_at(5).is_err());
    }

    #[test]
    fn test_empty_file() {
        let (_file, store) = store_with(b"", 4096);

        assert_eq!(store.size(), 0);
        assert!(store.is_resizable());
        assert_eq!(store.read_at(0, &mut [0u8; 4]).unwrap(), 0);
    }

    #[test]
    fn test_fixed_size_flag() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        let store = BackingStore::open(file.path(), 4096, true).unwrap();

        assert!(!store.is_resizable());
    }
}
