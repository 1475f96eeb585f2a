//! Memory-mapped backing store for bus signals.
//!
//! A segment is a 64-byte header of atomic words followed by the payload.
//! Anonymous segments live only in this process; file-backed segments are
//! created under a directory (typically on tmpfs such as `/dev/shm`) so other
//! processes can map the same bytes.

use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;

/// Bytes reserved in front of the payload
pub const HEADER_LEN: usize = 64;

/// Header word holding the generation (snapshot) or write position (stream)
pub const WORD_GENERATION: usize = 0;
/// Header word holding the last accepted counter of a stream
pub const WORD_COUNTER: usize = 1;
/// Header word holding the snapshot generation published at the last tick boundary
pub const WORD_PUBLISHED: usize = 2;

pub struct Segment {
    // Keeps the mapping alive; all access goes through `base`.
    _map: MmapMut,
    base: *mut u8,
    len: usize,
    path: Option<PathBuf>,
}

// The mapping is never remapped or resized after construction. Concurrent
// access is coordinated by the header atomics (see bus.rs / circular.rs).
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Anonymous, zero-filled segment with `payload` bytes after the header
    pub fn anonymous(payload: usize) -> std::io::Result<Self> {
        let len = HEADER_LEN + payload;
        let mut map = MmapMut::map_anon(len)?;
        let base = map.as_mut_ptr();
        Ok(Self {
            _map: map,
            base,
            len,
            path: None,
        })
    }

    /// File-backed segment `<dir>/<name>.sig`, truncated and zero-filled
    pub fn file_backed(dir: &Path, name: &str, payload: usize) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.sig", name));
        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let len = HEADER_LEN + payload;
        file.set_len(len as u64)?;
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let base = map.as_mut_ptr();
        log::debug!("Mapped {} bytes for signal '{}' at {}", len, name, path.display());
        Ok(Self {
            _map: map,
            base,
            len,
            path: Some(path),
        })
    }

    /// Header word `index` (0..8)
    pub fn word(&self, index: usize) -> &AtomicU64 {
        assert!(index < HEADER_LEN / 8, "header word {} out of range", index);
        // Page-aligned base, 8-byte aligned offset, and the header is only
        // ever accessed atomically.
        unsafe { &*(self.base.add(index * 8) as *const AtomicU64) }
    }

    /// Pointer to payload byte `offset`
    pub fn payload_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(HEADER_LEN + offset <= self.len);
        unsafe { self.base.add(HEADER_LEN + offset) }
    }

    pub fn payload_len(&self) -> usize {
        self.len - HEADER_LEN
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if let Err(e) = std::fs::remove_file(path) {
                log::warn!("Failed to remove segment file {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_anonymous_segment_is_zeroed() {
        let seg = Segment::anonymous(128).unwrap();
        assert_eq!(seg.payload_len(), 128);
        assert_eq!(seg.word(WORD_GENERATION).load(Ordering::Acquire), 0);
        let first = unsafe { *seg.payload_ptr(0) };
        assert_eq!(first, 0);
    }

    #[test]
    fn test_file_backed_segment_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let seg = Segment::file_backed(dir.path(), "state", 64).unwrap();
            seg.word(WORD_COUNTER).store(42, Ordering::Release);
            let path = seg.path().unwrap().to_path_buf();
            assert!(path.exists());
            assert_eq!(std::fs::metadata(&path).unwrap().len(), (HEADER_LEN + 64) as u64);
            path
        };
        assert!(!path.exists());
    }
}
