//! Grain offset entries.

use super::SECTOR_SIZE;

bitflags::bitflags! {
    /// Per-grain state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GrainFlags: u8 {
        /// The secondary grain directory disagreed with the primary one.
        const CORRUPTED = 0x01;
    }
}

/// Location of one fixed-size grain within its segment file.
///
/// A zero `physical_offset` marks an unallocated grain, which reads as
/// zeros; its `size` is zero as well.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GrainOffset {
    /// Byte offset within the owning segment file, 0 if unallocated.
    pub physical_offset: u64,
    /// Grain size in bytes, 0 if unallocated.
    pub size: u64,
    pub flags: GrainFlags,
}

impl GrainOffset {
    /// Decodes a grain table sector number.
    pub fn from_sector(sector_number: u32, grain_size: u64) -> Self {
        let physical_offset = u64::from(sector_number) * SECTOR_SIZE;
        let size = if physical_offset == 0 { 0 } else { grain_size };
        Self {
            physical_offset,
            size,
            flags: GrainFlags::empty(),
        }
    }

    #[inline]
    pub fn is_sparse(&self) -> bool {
        self.physical_offset == 0
    }

    #[inline]
    pub fn is_corrupted(&self) -> bool {
        self.flags.contains(GrainFlags::CORRUPTED)
    }
}
