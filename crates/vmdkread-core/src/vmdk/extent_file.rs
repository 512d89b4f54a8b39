//! Sparse extent data files.
//!
//! An [`ExtentFile`] parses the header of one sparse extent (COWD or VMDK
//! sparse) and reads its grain directories and grain tables on request. It
//! does not touch the shared offset table; the handle feeds the raw tables
//! it returns into [`OffsetTable`](super::OffsetTable).

use std::fmt;

use crate::error::{Error, Result};
use crate::io::FileIoPool;

use super::offset_table::GRAIN_TABLE_ENTRY_SIZE;
use super::signature::{COWD_SPARSE_SIGNATURE, VMDK_SPARSE_SIGNATURE};
use super::SECTOR_SIZE;

/// Size of a VMDK sparse extent header.
pub const VMDK_SPARSE_HEADER_SIZE: usize = 512;

/// Size of a COWD sparse extent header.
pub const COWD_SPARSE_HEADER_SIZE: usize = 2048;

/// Grain table entries per grain table in COWD extents.
pub const COWD_GRAIN_TABLE_ENTRIES: u32 = 4096;

/// Highest supported VMDK sparse format version.
const MAX_VMDK_VERSION: u32 = 3;

/// Flags in VMDK sparse header.
const FLAG_COMPRESSED: u32 = 1 << 16;
const FLAG_MARKERS: u32 = 1 << 17;

/// Grain directory offset value indicating the directory is in the footer.
const GD_AT_END: u64 = u64::MAX;

/// On-disk sparse format of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseFormat {
    Cowd,
    Vmdk,
}

impl fmt::Display for SparseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SparseFormat::Cowd => write!(f, "COWD"),
            SparseFormat::Vmdk => write!(f, "VMDK"),
        }
    }
}

/// Which copy of the grain directory to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrainDirectoryKind {
    Primary,
    Secondary,
}

/// Parsing progress of an extent file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentFileState {
    Uninitialized,
    HeaderRead,
}

/// Parsed sparse extent header. Offsets and sizes are in sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentHeader {
    pub format: SparseFormat,
    pub version: u32,
    pub flags: u32,
    /// Extent capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    /// Embedded descriptor start sector, 0 if absent.
    pub descriptor_offset: u64,
    /// Embedded descriptor size in sectors.
    pub descriptor_size: u64,
    /// Entries per grain table.
    pub number_of_grain_table_entries: u32,
    /// Entries in each grain directory.
    pub number_of_grain_directory_entries: u32,
    /// Primary grain directory sector, 0 if absent.
    pub grain_directory_offset: u64,
    /// Secondary (redundant) grain directory sector, 0 if absent.
    pub secondary_grain_directory_offset: u64,
}

impl ExtentHeader {
    /// Parses a header of either sparse format from its leading bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.starts_with(VMDK_SPARSE_SIGNATURE) {
            Self::from_vmdk_bytes(data)
        } else if data.starts_with(COWD_SPARSE_SIGNATURE) {
            Self::from_cowd_bytes(data)
        } else {
            Err(Error::invalid_format("unsupported extent file signature"))
        }
    }

    fn from_vmdk_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < VMDK_SPARSE_HEADER_SIZE {
            return Err(Error::read("VMDK sparse header too short"));
        }

        let version = le_u32(data, 4);
        let flags = le_u32(data, 8);
        let capacity = le_u64(data, 12);
        let grain_size = le_u64(data, 20);
        let descriptor_offset = le_u64(data, 28);
        let descriptor_size = le_u64(data, 36);
        let number_of_grain_table_entries = le_u32(data, 44);
        let secondary_grain_directory_offset = le_u64(data, 48);
        let grain_directory_offset = le_u64(data, 56);

        if version > MAX_VMDK_VERSION {
            return Err(Error::unsupported(format!(
                "unsupported VMDK sparse version: {}",
                version
            )));
        }
        if (flags & (FLAG_COMPRESSED | FLAG_MARKERS)) != 0 || grain_directory_offset == GD_AT_END {
            return Err(Error::unsupported(
                "compressed or stream-optimized extents are not supported",
            ));
        }
        if grain_size == 0 {
            return Err(Error::invalid_argument("invalid grain size value zero"));
        }
        if number_of_grain_table_entries == 0 {
            return Err(Error::invalid_format(
                "invalid number of grain table entries value zero",
            ));
        }
        if descriptor_offset > 0 && descriptor_size == 0 {
            return Err(Error::invalid_format(
                "invalid descriptor size value is out of range",
            ));
        }
        validate_directories(grain_directory_offset, secondary_grain_directory_offset)?;

        let number_of_grain_directory_entries =
            grain_directory_entries(capacity, grain_size, number_of_grain_table_entries)?;

        Ok(Self {
            format: SparseFormat::Vmdk,
            version,
            flags,
            capacity,
            grain_size,
            descriptor_offset,
            descriptor_size,
            number_of_grain_table_entries,
            number_of_grain_directory_entries,
            grain_directory_offset,
            secondary_grain_directory_offset,
        })
    }

    fn from_cowd_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < COWD_SPARSE_HEADER_SIZE {
            return Err(Error::read("COWD sparse header too short"));
        }

        let version = le_u32(data, 4);
        let flags = le_u32(data, 8);
        let capacity = u64::from(le_u32(data, 12));
        let grain_size = u64::from(le_u32(data, 16));
        let grain_directory_offset = u64::from(le_u32(data, 20));
        let number_of_grain_directory_entries = le_u32(data, 24);

        if grain_size == 0 {
            return Err(Error::invalid_argument("invalid grain size value zero"));
        }
        validate_directories(grain_directory_offset, 0)?;

        let covered_sectors = u64::from(number_of_grain_directory_entries)
            .checked_mul(u64::from(COWD_GRAIN_TABLE_ENTRIES))
            .and_then(|grains| grains.checked_mul(grain_size));
        if !matches!(covered_sectors, Some(sectors) if sectors >= capacity) {
            return Err(Error::invalid_format(format!(
                "number of grain directory entries: {} does not cover capacity: {} sectors",
                number_of_grain_directory_entries, capacity
            )));
        }

        Ok(Self {
            format: SparseFormat::Cowd,
            version,
            flags,
            capacity,
            grain_size,
            descriptor_offset: 0,
            descriptor_size: 0,
            number_of_grain_table_entries: COWD_GRAIN_TABLE_ENTRIES,
            number_of_grain_directory_entries,
            grain_directory_offset,
            secondary_grain_directory_offset: 0,
        })
    }

    /// Size of the header for this format.
    pub fn header_size(&self) -> usize {
        match self.format {
            SparseFormat::Cowd => COWD_SPARSE_HEADER_SIZE,
            SparseFormat::Vmdk => VMDK_SPARSE_HEADER_SIZE,
        }
    }
}

fn validate_directories(primary: u64, secondary: u64) -> Result<()> {
    if primary == 0 && secondary == 0 {
        return Err(Error::invalid_argument(
            "invalid primary and secondary grain directory offset value out of range",
        ));
    }
    Ok(())
}

/// Number of grain directory entries needed to cover `capacity` sectors.
fn grain_directory_entries(capacity: u64, grain_size: u64, entries_per_table: u32) -> Result<u32> {
    let sectors_per_table = grain_size
        .checked_mul(u64::from(entries_per_table))
        .ok_or_else(|| Error::capacity_exceeded("grain table span exceeds maximum"))?;
    let entries = capacity.div_ceil(sectors_per_table);
    u32::try_from(entries).map_err(|_| {
        Error::capacity_exceeded(format!(
            "number of grain directory entries: {} exceeds maximum",
            entries
        ))
    })
}

/// One sparse extent data file within the pool.
#[derive(Debug, Clone)]
pub struct ExtentFile {
    pool_entry: usize,
    state: ExtentFileState,
    header: Option<ExtentHeader>,
}

impl ExtentFile {
    /// Creates an extent file reading from `pool_entry`.
    pub fn new(pool_entry: usize) -> Self {
        Self {
            pool_entry,
            state: ExtentFileState::Uninitialized,
            header: None,
        }
    }

    #[inline]
    pub fn pool_entry(&self) -> usize {
        self.pool_entry
    }

    #[inline]
    pub fn state(&self) -> ExtentFileState {
        self.state
    }

    /// Reads and validates the extent header.
    ///
    /// # Errors
    ///
    /// * `AlreadyInitialized` if the header was read before.
    /// * `Read` on short reads.
    /// * `InvalidFormat` on an unrecognized signature or malformed fields.
    /// * `InvalidArgument` if the grain size is zero or both grain directory
    ///   offsets are absent.
    /// * `Unsupported` for compressed extents or unknown versions.
    pub fn read_header(&mut self, pool: &FileIoPool) -> Result<()> {
        if self.state != ExtentFileState::Uninitialized {
            return Err(Error::already_initialized(format!(
                "header of pool entry: {} already read",
                self.pool_entry
            )));
        }

        let mut magic = [0u8; 4];
        pool.read_exact_at(self.pool_entry, 0, &mut magic)?;
        let header_size = if &magic == VMDK_SPARSE_SIGNATURE {
            VMDK_SPARSE_HEADER_SIZE
        } else if &magic == COWD_SPARSE_SIGNATURE {
            COWD_SPARSE_HEADER_SIZE
        } else {
            return Err(Error::invalid_format(format!(
                "unsupported extent file signature in pool entry: {}",
                self.pool_entry
            )));
        };

        let mut data = vec![0u8; header_size];
        pool.read_exact_at(self.pool_entry, 0, &mut data)?;

        self.header = Some(ExtentHeader::from_bytes(&data)?);
        self.state = ExtentFileState::HeaderRead;
        Ok(())
    }

    /// Parsed header.
    ///
    /// # Errors
    ///
    /// Returns `MissingData` before [`ExtentFile::read_header`] succeeded.
    pub fn header(&self) -> Result<&ExtentHeader> {
        self.header.as_ref().ok_or_else(|| {
            Error::missing_data(format!(
                "header of pool entry: {} not read",
                self.pool_entry
            ))
        })
    }

    pub fn format(&self) -> Result<SparseFormat> {
        Ok(self.header()?.format)
    }

    /// Extent capacity in bytes.
    pub fn capacity_bytes(&self) -> Result<u64> {
        sectors_to_bytes(self.header()?.capacity)
    }

    /// Grain size in bytes.
    pub fn grain_size_bytes(&self) -> Result<u64> {
        sectors_to_bytes(self.header()?.grain_size)
    }

    /// Number of grains needed to hold the capacity.
    pub fn number_of_grains(&self) -> Result<u64> {
        let header = self.header()?;
        Ok(header.capacity.div_ceil(header.grain_size))
    }

    /// Number of grain offsets the fill pass produces for this extent.
    pub fn number_of_grain_offsets(&self) -> Result<usize> {
        let header = self.header()?;
        (header.number_of_grain_directory_entries as usize)
            .checked_mul(header.number_of_grain_table_entries as usize)
            .ok_or_else(|| Error::capacity_exceeded("number of grain offsets exceeds maximum"))
    }

    /// Size in bytes of one raw grain table.
    pub fn grain_table_size(&self) -> Result<usize> {
        Ok(self.header()?.number_of_grain_table_entries as usize * GRAIN_TABLE_ENTRY_SIZE)
    }

    /// Sector of the requested grain directory, `None` if absent.
    pub fn grain_directory_offset(&self, kind: GrainDirectoryKind) -> Result<Option<u64>> {
        let header = self.header()?;
        let offset = match kind {
            GrainDirectoryKind::Primary => header.grain_directory_offset,
            GrainDirectoryKind::Secondary => header.secondary_grain_directory_offset,
        };
        Ok((offset != 0).then_some(offset))
    }

    /// Reads a grain directory, returning its grain table sector numbers.
    ///
    /// # Errors
    ///
    /// * `MissingData` if the requested directory is absent.
    /// * `CapacityExceeded` if the directory is larger than `maximum_size`.
    /// * `InvalidFormat` if the directory extends beyond the file.
    pub fn read_grain_directory(
        &self,
        pool: &FileIoPool,
        kind: GrainDirectoryKind,
        maximum_size: u64,
    ) -> Result<Vec<u32>> {
        let header = self.header()?;
        let sector = self.grain_directory_offset(kind)?.ok_or_else(|| {
            Error::missing_data(format!(
                "pool entry: {} has no {:?} grain directory",
                self.pool_entry, kind
            ))
        })?;
        let size = header.number_of_grain_directory_entries as usize * GRAIN_TABLE_ENTRY_SIZE;
        let data = self.read_region(pool, sector, size, maximum_size, "grain directory")?;

        Ok(data
            .chunks_exact(GRAIN_TABLE_ENTRY_SIZE)
            .map(|entry| u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]))
            .collect())
    }

    /// Reads the raw grain table at `sector`.
    ///
    /// Sector 0 denotes an unallocated grain table and yields an all-zero
    /// table, so every grain it covers reads as sparse.
    pub fn read_grain_table(&self, pool: &FileIoPool, sector: u32, maximum_size: u64) -> Result<Vec<u8>> {
        let size = self.grain_table_size()?;
        if sector == 0 {
            if size as u64 > maximum_size {
                return Err(Error::capacity_exceeded(format!(
                    "grain table size: {} exceeds maximum: {}",
                    size, maximum_size
                )));
            }
            let mut table = Vec::new();
            table.try_reserve_exact(size)?;
            table.resize(size, 0);
            return Ok(table);
        }
        self.read_region(pool, u64::from(sector), size, maximum_size, "grain table")
    }

    /// Reads the descriptor embedded in a VMDK sparse extent, if any.
    pub fn read_embedded_descriptor(&self, pool: &FileIoPool, maximum_size: u64) -> Result<Option<String>> {
        let header = self.header()?;
        if header.descriptor_offset == 0 {
            return Ok(None);
        }
        let size = usize::try_from(sectors_to_bytes(header.descriptor_size)?)
            .map_err(|_| Error::capacity_exceeded("descriptor size exceeds maximum"))?;
        let data = self.read_region(pool, header.descriptor_offset, size, maximum_size, "descriptor")?;

        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Ok(Some(String::from_utf8_lossy(&data[..end]).into_owned()))
    }

    fn read_region(
        &self,
        pool: &FileIoPool,
        sector: u64,
        size: usize,
        maximum_size: u64,
        what: &str,
    ) -> Result<Vec<u8>> {
        if size as u64 > maximum_size {
            return Err(Error::capacity_exceeded(format!(
                "{} size: {} exceeds maximum: {}",
                what, size, maximum_size
            )));
        }
        let offset = sectors_to_bytes(sector)?;
        let end = offset
            .checked_add(size as u64)
            .ok_or_else(|| Error::invalid_format(format!("{} offset out of range", what)))?;
        if end > pool.size(self.pool_entry)? {
            return Err(Error::invalid_format(format!(
                "{} at offset: {} extends beyond file",
                what, offset
            )));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(size)?;
        data.resize(size, 0);
        pool.read_exact_at(self.pool_entry, offset, &mut data)?;
        Ok(data)
    }
}

fn sectors_to_bytes(sectors: u64) -> Result<u64> {
    sectors
        .checked_mul(SECTOR_SIZE)
        .ok_or_else(|| Error::capacity_exceeded(format!("sector value: {} exceeds maximum", sectors)))
}

fn le_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn le_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ])
}
