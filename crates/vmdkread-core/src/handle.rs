//! Disk handle.
//!
//! A [`Handle`] opens the segment files of one disk, classifies each by its
//! signature, parses sparse extent headers, and then reads every extent's
//! grain directories into a single [`OffsetTable`]. The result is one
//! logical address space that [`Handle::read_at`] and [`Handle::map_offset`]
//! translate to segment files.
//!
//! Opening is all-or-nothing: everything built during a failed `open` is
//! dropped before the error is returned and the handle keeps its previous
//! state. A pool supplied by the caller is never closed by the handle.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{AccessFlags, HandleOptions};
use crate::error::{Error, Result};
use crate::io::FileIoPool;
use crate::notify::{Event, EventSink, TracingSink};
use crate::vmdk::{
    read_signature, Descriptor, ExtentFile, FileType, GrainDirectoryKind, GrainOffset,
    OffsetTable, Segment, SegmentTable,
};

/// Minimum filename length: anything shorter cannot hold more than an extension.
const MINIMUM_FILENAME_LENGTH: usize = 5;

/// Lifecycle of a [`Handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Opening,
    Opened,
    Closed,
}

/// Cloneable token that requests a running `open` to stop.
///
/// The flag is checked before each segment's grain directories are read.
/// It is never cleared by the handle.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_signalled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where the file pool came from.
enum PoolOwnership {
    /// Created by [`Handle::open`]; closed on [`Handle::close`].
    Owned(FileIoPool),
    /// Supplied by the caller; left untouched.
    Borrowed(Arc<FileIoPool>),
}

impl PoolOwnership {
    fn pool(&self) -> &FileIoPool {
        match self {
            PoolOwnership::Owned(pool) => pool,
            PoolOwnership::Borrowed(pool) => pool,
        }
    }
}

/// Physical location of a logical offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Segment index holding the offset.
    pub segment: usize,
    pub pool_entry: usize,
    /// Byte offset within the segment file, `None` for an unallocated grain.
    pub physical_offset: Option<u64>,
    /// Bytes from the offset that map contiguously.
    pub length: u64,
    /// Global grain number for sparse extents.
    pub grain: Option<u64>,
    /// The grain's corrupted flag.
    pub corrupted: bool,
}

#[derive(Debug, Clone, Copy)]
enum RangeKind {
    Sparse {
        first_grain: usize,
        number_of_grains: usize,
        grain_size: u64,
    },
    Raw { file_offset: u64 },
}

/// One data segment's share of the logical address space.
#[derive(Debug, Clone, Copy)]
struct LogicalRange {
    segment: usize,
    pool_entry: usize,
    start: u64,
    size: u64,
    kind: RangeKind,
}

impl LogicalRange {
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Everything built by a successful open.
struct OpenedDisk {
    pool: PoolOwnership,
    segments: SegmentTable,
    offset_table: OffsetTable,
    descriptor: Option<Descriptor>,
    layout: Vec<LogicalRange>,
    media_size: u64,
    mismatched_grains: usize,
}

/// Read-only handle on a multi-segment VMDK disk.
pub struct Handle {
    options: HandleOptions,
    sink: Arc<dyn EventSink>,
    abort: AbortHandle,
    state: HandleState,
    access_flags: AccessFlags,
    disk: Option<OpenedDisk>,
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl Handle {
    /// Creates a handle with default options reporting through `tracing`.
    pub fn new() -> Self {
        Self::with_options(HandleOptions::default())
    }

    pub fn with_options(options: HandleOptions) -> Self {
        Self::with_sink(options, Arc::new(TracingSink))
    }

    /// Creates a handle reporting events to `sink`.
    pub fn with_sink(options: HandleOptions, sink: Arc<dyn EventSink>) -> Self {
        Self {
            options,
            sink,
            abort: AbortHandle::default(),
            state: HandleState::Created,
            access_flags: AccessFlags::empty(),
            disk: None,
        }
    }

    /// Opens the segment files named by `filenames`.
    ///
    /// # Errors
    ///
    /// * `Unsupported` if `flags` request write access or no read access.
    /// * `InvalidArgument` if `filenames` is empty.
    /// * `TooSmall` if a filename has fewer than 5 characters.
    /// * `AlreadyInitialized` if the handle is open.
    /// * Any error from reading and validating the segment files, or
    ///   `Aborted` if abort was signalled.
    pub fn open<P: AsRef<Path>>(&mut self, filenames: &[P], flags: AccessFlags) -> Result<()> {
        self.check_can_open(flags)?;
        if filenames.is_empty() {
            return Err(Error::invalid_argument("missing filenames"));
        }
        for filename in filenames {
            let filename = filename.as_ref();
            if filename.to_string_lossy().chars().count() < MINIMUM_FILENAME_LENGTH {
                return Err(Error::too_small(filename.to_string_lossy()));
            }
        }

        let mut pool = FileIoPool::with_limit(self.options.maximum_open_handles);
        for filename in filenames {
            let filename = filename.as_ref();
            let entry = pool.add_file(filename)?;
            self.sink.event(&Event::PoolEntryAdded {
                entry,
                name: filename.to_string_lossy().into_owned(),
            });
        }

        self.open_pool(PoolOwnership::Owned(pool), flags)
    }

    /// Opens a disk from a caller-supplied pool, one entry per segment file.
    ///
    /// The pool is shared, not owned: [`Handle::close`] leaves it open.
    pub fn open_with_pool(&mut self, pool: Arc<FileIoPool>, flags: AccessFlags) -> Result<()> {
        self.check_can_open(flags)?;
        if pool.is_empty() {
            return Err(Error::invalid_argument("file IO pool has no entries"));
        }
        self.open_pool(PoolOwnership::Borrowed(pool), flags)
    }

    /// Releases the disk. Only a pool created by [`Handle::open`] is closed.
    ///
    /// Closing a handle that is not open does nothing.
    pub fn close(&mut self) -> Result<()> {
        let Some(disk) = self.disk.take() else {
            return Ok(());
        };
        if let PoolOwnership::Owned(mut pool) = disk.pool {
            pool.close_all();
        }
        self.state = HandleState::Closed;
        self.access_flags = AccessFlags::empty();
        Ok(())
    }

    /// Requests a running or future `open` to stop before its next segment.
    pub fn signal_abort(&self) {
        self.abort.signal();
    }

    /// Token for signalling abort from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn access_flags(&self) -> AccessFlags {
        self.access_flags
    }

    /// Returns true if the pool was created by the handle.
    pub fn owns_pool(&self) -> bool {
        matches!(
            self.disk.as_ref().map(|d| &d.pool),
            Some(PoolOwnership::Owned(_))
        )
    }

    /// Pool the disk is read from.
    pub fn pool(&self) -> Result<&FileIoPool> {
        Ok(self.disk()?.pool.pool())
    }

    /// Logical size of the disk in bytes.
    pub fn media_size(&self) -> Result<u64> {
        Ok(self.disk()?.media_size)
    }

    /// Number of segments, descriptor files included.
    pub fn number_of_segments(&self) -> Result<usize> {
        Ok(self.disk()?.segments.number_of_entries())
    }

    pub fn segment(&self, index: usize) -> Result<&Segment> {
        self.disk()?.segments.get_entry(index)
    }

    /// Number of entries in the offset table.
    pub fn number_of_grains(&self) -> Result<usize> {
        Ok(self.disk()?.offset_table.number_of_grain_offsets())
    }

    /// Physical offset of a global grain.
    pub fn grain_offset(&self, grain: usize) -> Result<u64> {
        self.disk()?.offset_table.seek_grain_offset(grain)
    }

    pub fn grain(&self, grain: usize) -> Result<GrainOffset> {
        Ok(*self.disk()?.offset_table.grain(grain)?)
    }

    pub fn offset_table(&self) -> Result<&OffsetTable> {
        Ok(&self.disk()?.offset_table)
    }

    /// Grains whose secondary grain directory entry disagreed with the primary.
    pub fn number_of_mismatched_grains(&self) -> Result<usize> {
        Ok(self.disk()?.mismatched_grains)
    }

    /// Descriptor file or embedded descriptor, if one was found.
    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.disk.as_ref().and_then(|d| d.descriptor.as_ref())
    }

    /// Translates a logical offset to its segment file location.
    ///
    /// # Errors
    ///
    /// * `MissingData` if the handle is not open.
    /// * `OutOfRange` if `offset` is not below the media size.
    pub fn map_offset(&self, offset: u64) -> Result<Mapping> {
        let disk = self.disk()?;
        if offset >= disk.media_size {
            return Err(Error::out_of_range(format!(
                "offset: {} beyond media size: {}",
                offset, disk.media_size
            )));
        }
        let index = disk.layout.partition_point(|range| range.end() <= offset);
        let range = disk.layout.get(index).ok_or_else(|| {
            Error::missing_data(format!("missing logical range for offset: {}", offset))
        })?;
        let relative = offset - range.start;

        match range.kind {
            RangeKind::Sparse {
                first_grain,
                number_of_grains,
                grain_size,
            } => {
                let within = relative % grain_size;
                let local_grain = usize::try_from(relative / grain_size)
                    .ok()
                    .filter(|&g| g < number_of_grains)
                    .ok_or_else(|| {
                        Error::invalid_format(format!(
                            "offset: {} beyond the grains of segment: {}",
                            offset, range.segment
                        ))
                    })?;
                let grain = first_grain + local_grain;
                let entry = disk.offset_table.grain(grain)?;
                let physical_offset = if entry.is_sparse() {
                    None
                } else {
                    Some(entry.physical_offset.checked_add(within).ok_or_else(|| {
                        Error::capacity_exceeded("physical offset exceeds maximum")
                    })?)
                };
                Ok(Mapping {
                    segment: range.segment,
                    pool_entry: range.pool_entry,
                    physical_offset,
                    length: (grain_size - within).min(range.size - relative),
                    grain: Some(grain as u64),
                    corrupted: entry.is_corrupted(),
                })
            }
            RangeKind::Raw { file_offset } => Ok(Mapping {
                segment: range.segment,
                pool_entry: range.pool_entry,
                physical_offset: Some(file_offset.checked_add(relative).ok_or_else(|| {
                    Error::capacity_exceeded("physical offset exceeds maximum")
                })?),
                length: range.size - relative,
                grain: None,
                corrupted: false,
            }),
        }
    }

    /// Reads logical disk data at `offset` into `buf`.
    ///
    /// Unallocated grains read as zeros. Returns the number of bytes read,
    /// which is short only at the end of the media.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let disk = self.disk()?;
        let mut position = offset;
        let mut done = 0usize;

        while done < buf.len() && position < disk.media_size {
            let mapping = self.map_offset(position)?;
            let count = mapping.length.min((buf.len() - done) as u64) as usize;
            let chunk = &mut buf[done..done + count];
            match mapping.physical_offset {
                Some(physical) => disk.pool.pool().read_exact_at(mapping.pool_entry, physical, chunk)?,
                None => chunk.fill(0),
            }
            done += count;
            position += count as u64;
        }
        Ok(done)
    }

    fn disk(&self) -> Result<&OpenedDisk> {
        self.disk
            .as_ref()
            .ok_or_else(|| Error::missing_data("handle is not open"))
    }

    fn check_can_open(&self, flags: AccessFlags) -> Result<()> {
        if flags.is_write() {
            return Err(Error::unsupported("write access currently not supported"));
        }
        if !flags.is_read() {
            return Err(Error::unsupported("unsupported access flags"));
        }
        if self.disk.is_some() {
            return Err(Error::already_initialized("handle is already open"));
        }
        Ok(())
    }

    fn open_pool(&mut self, pool: PoolOwnership, flags: AccessFlags) -> Result<()> {
        let previous = self.state;
        self.state = HandleState::Opening;

        match self.build_disk(pool) {
            Ok(disk) => {
                self.disk = Some(disk);
                self.access_flags = flags;
                self.state = HandleState::Opened;
                Ok(())
            }
            Err(e) => {
                self.state = previous;
                Err(e)
            }
        }
    }

    fn build_disk(&self, ownership: PoolOwnership) -> Result<OpenedDisk> {
        let pool = ownership.pool();
        let maximum_metadata_size = self.options.maximum_metadata_size;

        let mut file_types = Vec::with_capacity(pool.number_of_entries());
        let mut descriptor = None;
        for entry in 0..pool.number_of_entries() {
            self.sink.event(&Event::ProcessingPoolEntry { entry });
            let file_type = read_signature(pool, entry)?;
            self.sink.event(&Event::Classified { entry, file_type });

            if file_type == Some(FileType::Descriptor) {
                if descriptor.is_some() {
                    return Err(Error::already_initialized(format!(
                        "second descriptor file in pool entry: {}",
                        entry
                    )));
                }
                descriptor = Some(Descriptor::read_from_pool(pool, entry, maximum_metadata_size)?);
            }
            file_types.push((entry, file_type));
        }

        if let Some(descriptor) = &descriptor {
            classify_raw_data(pool, descriptor, &mut file_types, self.sink.as_ref());
            order_by_descriptor(pool, descriptor, &mut file_types);
        }

        let mut segments = SegmentTable::new();
        for &(entry, file_type) in &file_types {
            let segment = match file_type {
                Some(FileType::Descriptor) => Segment::Descriptor { pool_entry: entry },
                Some(FileType::CowdSparse) | Some(FileType::VmdkSparse) => {
                    let mut extent = ExtentFile::new(entry);
                    extent.read_header(pool)?;
                    Segment::Extent(extent)
                }
                Some(FileType::RawData) => raw_data_segment(pool, descriptor.as_ref(), entry)?,
                None => {
                    return Err(Error::unsupported(format!(
                        "unsupported segment file type in pool entry: {}",
                        entry
                    )))
                }
            };
            segments.append(segment)?;
        }

        if descriptor.is_none() {
            descriptor = read_embedded_descriptor(pool, &segments, maximum_metadata_size)?;
        }

        let mut offset_table = OffsetTable::new();
        let mut layout = Vec::new();
        let mut media_size = 0u64;
        let mut mismatched_grains = 0usize;

        for (index, segment) in segments.iter() {
            if self.abort.is_signalled() {
                self.sink.event(&Event::Aborted { segment: index });
                return Err(Error::aborted(format!(
                    "abort signalled before segment: {}",
                    index
                )));
            }

            let (size, kind) = match segment {
                Segment::Descriptor { .. } => continue,
                Segment::Extent(extent) => {
                    self.sink.event(&Event::ReadingSegment { segment: index });
                    let first_grain = offset_table.last_filled_index();
                    let number_of_grains = extent.number_of_grain_offsets()?;
                    mismatched_grains += self.read_grain_directories(pool, extent, &mut offset_table)?;
                    let kind = RangeKind::Sparse {
                        first_grain,
                        number_of_grains,
                        grain_size: extent.grain_size_bytes()?,
                    };
                    (extent.capacity_bytes()?, kind)
                }
                Segment::RawData { offset, size, .. } => (*size, RangeKind::Raw { file_offset: *offset }),
            };

            if size > 0 {
                layout.push(LogicalRange {
                    segment: index,
                    pool_entry: segment.pool_entry(),
                    start: media_size,
                    size,
                    kind,
                });
            }
            media_size = media_size
                .checked_add(size)
                .ok_or_else(|| Error::capacity_exceeded("media size exceeds maximum"))?;
        }

        if !segments.iter().any(|(_, s)| s.is_data()) {
            return Err(Error::missing_data("no extent data files"));
        }

        Ok(OpenedDisk {
            pool: ownership,
            segments,
            offset_table,
            descriptor,
            layout,
            media_size,
            mismatched_grains,
        })
    }

    /// Fills the offset table from one extent and verifies it against the
    /// secondary grain directory. Returns the number of mismatched grains.
    fn read_grain_directories(
        &self,
        pool: &FileIoPool,
        extent: &ExtentFile,
        offset_table: &mut OffsetTable,
    ) -> Result<usize> {
        let maximum_metadata_size = self.options.maximum_metadata_size;
        let header = extent.header()?;
        let entries = header.number_of_grain_table_entries as usize;
        let grain_size = extent.grain_size_bytes()?;

        let primary = extent.grain_directory_offset(GrainDirectoryKind::Primary)?;
        let secondary = extent.grain_directory_offset(GrainDirectoryKind::Secondary)?;
        let fill_from = if primary.is_some() {
            GrainDirectoryKind::Primary
        } else {
            GrainDirectoryKind::Secondary
        };

        let directory = extent.read_grain_directory(pool, fill_from, maximum_metadata_size)?;
        let filled_size = directory
            .len()
            .checked_mul(entries)
            .and_then(|count| count.checked_add(offset_table.last_filled_index()))
            .ok_or_else(|| Error::capacity_exceeded("number of grains exceeds maximum"))?;
        offset_table.resize(filled_size)?;

        for sector in directory {
            let grain_table = extent.read_grain_table(pool, sector, maximum_metadata_size)?;
            let filled = offset_table.fill(&grain_table, entries, grain_size)?;
            for grain in filled {
                let entry = offset_table.grain(grain)?;
                self.sink.event(&Event::GrainRead {
                    grain: grain as u64,
                    offset: entry.physical_offset,
                    size: entry.size,
                });
            }
        }

        if !(self.options.compare_secondary_grain_directory && primary.is_some() && secondary.is_some()) {
            offset_table.skip_compare();
            return Ok(0);
        }

        let mut mismatches = 0;
        for sector in extent.read_grain_directory(pool, GrainDirectoryKind::Secondary, maximum_metadata_size)? {
            let grain_table = extent.read_grain_table(pool, sector, maximum_metadata_size)?;
            let outcome = offset_table.compare(&grain_table, entries, grain_size)?;
            for (grain, secondary_offset) in outcome.mismatches {
                self.sink.event(&Event::GrainMismatch {
                    grain: grain as u64,
                    stored_offset: offset_table.seek_grain_offset(grain)?,
                    secondary_offset,
                });
                mismatches += 1;
            }
        }
        Ok(mismatches)
    }
}

/// Marks files without a known signature as raw data when the descriptor
/// lists them as a FLAT or VMFS extent.
fn classify_raw_data(
    pool: &FileIoPool,
    descriptor: &Descriptor,
    file_types: &mut [(usize, Option<FileType>)],
    sink: &dyn EventSink,
) {
    for (entry, file_type) in file_types.iter_mut().filter(|(_, t)| t.is_none()) {
        let listed = pool
            .name(*entry)
            .ok()
            .and_then(|name| descriptor.find_extent(name))
            .is_some_and(|e| e.extent_type.is_raw_data());
        if listed {
            *file_type = Some(FileType::RawData);
            sink.event(&Event::Classified {
                entry: *entry,
                file_type: *file_type,
            });
        }
    }
}

/// Builds a raw data segment from the descriptor extent naming the file.
///
/// The extent must lie within the file.
fn raw_data_segment(
    pool: &FileIoPool,
    descriptor: Option<&Descriptor>,
    entry: usize,
) -> Result<Segment> {
    let name = pool.name(entry)?;
    let extent = descriptor
        .and_then(|d| d.find_extent(name))
        .filter(|e| e.extent_type.is_raw_data())
        .ok_or_else(|| {
            Error::missing_data(format!("missing raw data extent for pool entry: {}", entry))
        })?;
    let offset = extent.offset_bytes()?;
    let size = extent.size_bytes()?;
    let file_size = pool.size(entry)?;
    let end = offset
        .checked_add(size)
        .ok_or_else(|| Error::capacity_exceeded("raw data extent end exceeds maximum"))?;
    if end > file_size {
        return Err(Error::invalid_format(format!(
            "raw data extent: {}..{} beyond size: {} of pool entry: {}",
            offset, end, file_size, entry
        )));
    }
    Ok(Segment::RawData {
        pool_entry: entry,
        offset,
        size,
    })
}

/// Reorders data files to follow the descriptor's extent order when every
/// one of them is listed there.
fn order_by_descriptor(
    pool: &FileIoPool,
    descriptor: &Descriptor,
    file_types: &mut [(usize, Option<FileType>)],
) {
    let position = |entry: usize| -> Option<usize> {
        let name = pool.name(entry).ok()?;
        descriptor.extents.iter().position(|e| e.matches_file(name))
    };
    let all_listed = file_types
        .iter()
        .filter(|(_, t)| *t != Some(FileType::Descriptor))
        .all(|&(entry, _)| position(entry).is_some());
    if !all_listed {
        return;
    }
    file_types.sort_by_key(|&(entry, file_type)| match file_type {
        Some(FileType::Descriptor) => (0, 0),
        _ => (1, position(entry).unwrap_or(usize::MAX)),
    });
}

fn read_embedded_descriptor(
    pool: &FileIoPool,
    segments: &SegmentTable,
    maximum_size: u64,
) -> Result<Option<Descriptor>> {
    for (_, segment) in segments.iter() {
        if let Some(extent) = segment.as_extent() {
            if let Some(text) = extent.read_embedded_descriptor(pool, maximum_size)? {
                return Descriptor::parse(&text).map(Some);
            }
        }
    }
    Ok(None)
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("state", &self.state)
            .field("access_flags", &self.access_flags)
            .field("options", &self.options)
            .field("owns_pool", &self.owns_pool())
            .finish()
    }
}
