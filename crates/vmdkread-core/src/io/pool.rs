//! Pool of opened segment files.
//!
//! A [`FileIoPool`] holds one entry per input file. Entries are addressed by
//! their index ("pool entry") and read with positional reads, so no seek
//! state is shared between callers. File-backed entries are memory-mapped,
//! letting the operating system manage caching and paging.

use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A readable, fixed-size byte source.
pub trait IoSource: Send + Sync {
    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Reads up to `buf.len()` bytes at `offset`, returning the count read.
    ///
    /// Reading at or past the end returns 0.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// A memory-mapped, read-only file.
pub struct MappedFile {
    /// `None` for empty files, which cannot be mapped on every platform.
    mmap: Option<Mmap>,
    path: PathBuf,
}

impl MappedFile {
    /// Opens and maps a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let size = file.metadata().map_err(|e| Error::io(e, path))?.len();

        let mmap = if size == 0 {
            None
        } else {
            // Safety: the mapping is read-only and owned by this value. The
            // image files are not expected to be modified while open.
            Some(unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? })
        };

        Ok(Self {
            mmap,
            path: path.to_path_buf(),
        })
    }

    /// Path this file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw mapped bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

impl IoSource for MappedFile {
    fn size(&self) -> u64 {
        self.data().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.data().read_at(offset, buf)
    }
}

/// An in-memory byte source.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

impl IoSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.data.as_slice().read_at(offset, buf)
    }
}

impl IoSource for &[u8] {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let len = self.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let count = std::cmp::min(buf.len(), self.len() - start);
        buf[..count].copy_from_slice(&self[start..start + count]);
        Ok(count)
    }
}

struct PoolEntry {
    name: String,
    /// `None` once the pool has been closed.
    source: Option<Box<dyn IoSource>>,
}

/// Ordered set of opened segment files.
#[derive(Default)]
pub struct FileIoPool {
    entries: Vec<PoolEntry>,
    maximum_open_handles: Option<usize>,
}

impl FileIoPool {
    /// Creates an empty pool without an entry limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty pool accepting at most `limit` entries.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            maximum_open_handles: limit,
        }
    }

    /// Opens `path` and appends it, returning the new pool entry.
    pub fn add_file(&mut self, path: &Path) -> Result<usize> {
        let file = MappedFile::open(path)?;
        self.add_source(path.to_string_lossy(), Box::new(file))
    }

    /// Appends an already opened source, returning the new pool entry.
    pub fn add_source(&mut self, name: impl Into<String>, source: Box<dyn IoSource>) -> Result<usize> {
        if let Some(limit) = self.maximum_open_handles {
            if self.entries.len() >= limit {
                return Err(Error::capacity_exceeded(format!(
                    "pool already holds the maximum of {} handles",
                    limit
                )));
            }
        }
        self.entries.try_reserve(1)?;
        self.entries.push(PoolEntry {
            name: name.into(),
            source: Some(source),
        });
        Ok(self.entries.len() - 1)
    }

    /// Number of entries, open or closed.
    pub fn number_of_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name the entry was added under.
    pub fn name(&self, entry: usize) -> Result<&str> {
        Ok(&self.entry(entry)?.name)
    }

    /// Returns true while the entry's source is still held.
    pub fn is_open(&self, entry: usize) -> bool {
        self.entries
            .get(entry)
            .map_or(false, |e| e.source.is_some())
    }

    /// Size of the entry's source in bytes.
    pub fn size(&self, entry: usize) -> Result<u64> {
        Ok(self.source(entry)?.size())
    }

    /// Reads up to `buf.len()` bytes at `offset` from `entry`.
    pub fn read_at(&self, entry: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let source = self.source(entry)?;
        if offset > source.size() {
            return Err(Error::seek(format!(
                "offset: {} beyond end of pool entry: {} ({} bytes)",
                offset,
                entry,
                source.size()
            )));
        }
        source.read_at(offset, buf)
    }

    /// Reads exactly `buf.len()` bytes at `offset` from `entry`.
    pub fn read_exact_at(&self, entry: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let count = self.read_at(entry, offset, buf)?;
        if count != buf.len() {
            return Err(Error::read(format!(
                "short read of pool entry: {} at offset: {} ({} of {} bytes)",
                entry,
                offset,
                count,
                buf.len()
            )));
        }
        Ok(())
    }

    /// Releases every entry's source. Entries keep their names.
    pub fn close_all(&mut self) {
        for entry in &mut self.entries {
            entry.source = None;
        }
    }

    fn entry(&self, entry: usize) -> Result<&PoolEntry> {
        self.entries.get(entry).ok_or_else(|| {
            Error::out_of_range(format!(
                "pool entry: {} out of range [0,{})",
                entry,
                self.entries.len()
            ))
        })
    }

    fn source(&self, entry: usize) -> Result<&dyn IoSource> {
        self.entry(entry)?
            .source
            .as_deref()
            .ok_or_else(|| Error::read(format!("pool entry: {} is closed", entry)))
    }
}

impl std::fmt::Debug for FileIoPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIoPool")
            .field(
                "entries",
                &self.entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            )
            .field("maximum_open_handles", &self.maximum_open_handles)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_file(size: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        let pattern: Vec<u8> = (0u8..=255).cycle().take(size).collect();
        file.write_all(&pattern).expect("Failed to write test data");
        file.flush().expect("Failed to flush");
        file
    }

    #[test]
    fn test_mapped_file_open_and_size() {
        let file = create_test_file(1024);
        let mapped = MappedFile::open(file.path()).unwrap();
        assert_eq!(mapped.size(), 1024);
        for (i, &byte) in mapped.data().iter().enumerate() {
            assert_eq!(byte, i as u8);
        }
    }

    #[test]
    fn test_mapped_empty_file() {
        let file = create_test_file(0);
        let mapped = MappedFile::open(file.path()).unwrap();
        assert_eq!(mapped.size(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(mapped.read_at(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_pool_read_at() {
        let file = create_test_file(512);
        let mut pool = FileIoPool::new();
        let entry = pool.add_file(file.path()).unwrap();
        assert_eq!(entry, 0);

        let mut buf = [0u8; 4];
        pool.read_exact_at(entry, 256, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);

        // Partial read at the tail
        let mut buf = [0u8; 8];
        assert_eq!(pool.read_at(entry, 508, &mut buf).unwrap(), 4);
    }

    #[test]
    fn test_pool_short_read_is_read_error() {
        let mut pool = FileIoPool::new();
        let entry = pool
            .add_source("short.vmdk", Box::new(MemorySource::new(vec![1u8; 10])))
            .unwrap();
        let mut buf = [0u8; 32];
        let err = pool.read_exact_at(entry, 0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Read);
    }

    #[test]
    fn test_pool_offset_beyond_end_is_seek_error() {
        let mut pool = FileIoPool::new();
        let entry = pool
            .add_source("tiny.vmdk", Box::new(MemorySource::new(vec![0u8; 16])))
            .unwrap();
        let mut buf = [0u8; 1];
        let err = pool.read_at(entry, 17, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Seek);
    }

    #[test]
    fn test_pool_close_all() {
        let mut pool = FileIoPool::new();
        let entry = pool
            .add_source("disk.vmdk", Box::new(MemorySource::new(vec![0u8; 16])))
            .unwrap();
        assert!(pool.is_open(entry));
        pool.close_all();
        assert!(!pool.is_open(entry));
        assert_eq!(pool.name(entry).unwrap(), "disk.vmdk");
        let mut buf = [0u8; 1];
        assert_eq!(pool.read_at(entry, 0, &mut buf).unwrap_err().kind(), ErrorKind::Read);
    }

    #[test]
    fn test_pool_limit() {
        let mut pool = FileIoPool::with_limit(Some(1));
        pool.add_source("a.vmdk", Box::new(MemorySource::default()))
            .unwrap();
        let err = pool
            .add_source("b.vmdk", Box::new(MemorySource::default()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    }

    #[test]
    fn test_pool_entry_out_of_range() {
        let pool = FileIoPool::new();
        assert_eq!(pool.size(3).unwrap_err().kind(), ErrorKind::OutOfRange);
    }
}
