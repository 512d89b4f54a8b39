//! Global grain offset table.
//!
//! The table holds one [`GrainOffset`] per grain across every sparse extent
//! of a disk, numbered in segment order. It is filled incrementally from raw
//! grain table buffers: the primary grain directory's tables are appended by
//! [`OffsetTable::fill`], the secondary directory's tables are checked
//! against them by [`OffsetTable::compare`]. Each pass keeps its own
//! high-water mark so extents can be processed one after another without
//! rescanning earlier entries.

use std::mem::size_of;
use std::ops::Range;

use crate::error::{Error, Result};

use super::grain::{GrainFlags, GrainOffset};

/// Size in bytes of one encoded grain table entry.
pub const GRAIN_TABLE_ENTRY_SIZE: usize = 4;

/// Result of one [`OffsetTable::compare`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareOutcome {
    /// Indices visited by this call.
    pub range: Range<usize>,
    /// Visited indices whose secondary offset differed from the stored one,
    /// with the secondary offset found.
    pub mismatches: Vec<(usize, u64)>,
}

/// Growable table of grain offsets.
#[derive(Debug, Clone, Default)]
pub struct OffsetTable {
    grain_offsets: Vec<GrainOffset>,
    last_filled: usize,
    last_compared: usize,
}

impl OffsetTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table with `count` zeroed entries.
    pub fn with_entries(count: usize) -> Result<Self> {
        let mut table = Self::new();
        table.resize(count)?;
        Ok(table)
    }

    /// Number of entries, including zeroed entries not yet filled.
    #[inline]
    pub fn number_of_grain_offsets(&self) -> usize {
        self.grain_offsets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.grain_offsets.is_empty()
    }

    /// Index of the next entry the fill pass will write.
    #[inline]
    pub fn last_filled_index(&self) -> usize {
        self.last_filled
    }

    /// Index of the next entry the compare pass will check.
    #[inline]
    pub fn last_compared_index(&self) -> usize {
        self.last_compared
    }

    /// Grows the table to at least `count` entries; new entries are zeroed.
    ///
    /// Requests smaller than the current size leave the table unchanged.
    ///
    /// # Errors
    ///
    /// * `CapacityExceeded` if `count` entries would not fit in the address space.
    /// * `AllocationFailure` if the memory cannot be reserved.
    pub fn resize(&mut self, count: usize) -> Result<()> {
        let current = self.grain_offsets.len();
        if count <= current {
            return Ok(());
        }
        let byte_size = count
            .checked_mul(size_of::<GrainOffset>())
            .filter(|&size| size <= isize::MAX as usize)
            .ok_or_else(|| {
                Error::capacity_exceeded(format!(
                    "grain offset table of {} entries exceeds maximum size",
                    count
                ))
            })?;
        self.grain_offsets
            .try_reserve(count - current)
            .map_err(|e| {
                Error::allocation_failure(format!(
                    "unable to resize grain offsets to {} bytes: {}",
                    byte_size, e
                ))
            })?;
        self.grain_offsets.resize(count, GrainOffset::default());
        Ok(())
    }

    /// Appends the entries of a raw grain table at the fill high-water mark.
    ///
    /// `grain_table` holds `number_of_entries` little-endian u32 sector
    /// numbers. Returns the range of indices written.
    ///
    /// # Errors
    ///
    /// * `InvalidFormat` if the buffer length is not a multiple of 4 or does
    ///   not match `number_of_entries`.
    /// * `InvalidArgument` if `grain_size` is 0.
    /// * `CapacityExceeded` / `AllocationFailure` if the table cannot grow.
    pub fn fill(
        &mut self,
        grain_table: &[u8],
        number_of_entries: usize,
        grain_size: u64,
    ) -> Result<Range<usize>> {
        validate_grain_table(grain_table, number_of_entries, grain_size)?;

        let start = self.last_filled;
        let end = end_index(start, number_of_entries)?;
        self.resize(end)?;

        for (slot, sector_number) in self.grain_offsets[start..end]
            .iter_mut()
            .zip(decode_sectors(grain_table))
        {
            *slot = GrainOffset::from_sector(sector_number, grain_size);
        }
        self.last_filled = end;
        Ok(start..end)
    }

    /// Checks the entries of a redundant grain table against the stored ones,
    /// starting at the compare high-water mark.
    ///
    /// A mismatch is reported in the outcome and clears the entry's
    /// corrupted flag; the stored offsets are never replaced.
    ///
    /// # Errors
    ///
    /// Same as [`OffsetTable::fill`].
    pub fn compare(
        &mut self,
        grain_table: &[u8],
        number_of_entries: usize,
        grain_size: u64,
    ) -> Result<CompareOutcome> {
        validate_grain_table(grain_table, number_of_entries, grain_size)?;

        let start = self.last_compared;
        let end = end_index(start, number_of_entries)?;
        self.resize(end)?;

        let mut mismatches = Vec::new();
        for (index, sector_number) in (start..end).zip(decode_sectors(grain_table)) {
            let secondary = GrainOffset::from_sector(sector_number, grain_size);
            let stored = &mut self.grain_offsets[index];
            if stored.physical_offset != secondary.physical_offset {
                // TODO: confirm whether a mismatch should set the flag instead.
                stored.flags.remove(GrainFlags::CORRUPTED);
                mismatches.push((index, secondary.physical_offset));
            }
        }
        self.last_compared = end;
        Ok(CompareOutcome {
            range: start..end,
            mismatches,
        })
    }

    /// Moves the compare high-water mark up to the fill one.
    ///
    /// Used for extents whose grain tables have no redundant copy.
    pub(crate) fn skip_compare(&mut self) {
        self.last_compared = self.last_compared.max(self.last_filled);
    }

    /// Returns the physical offset of `grain`.
    ///
    /// # Errors
    ///
    /// * `MissingData` if the table has no entries.
    /// * `OutOfRange` if `grain` is not below the number of entries.
    pub fn seek_grain_offset(&self, grain: usize) -> Result<u64> {
        Ok(self.grain(grain)?.physical_offset)
    }

    /// Returns the entry for `grain`, with the same errors as
    /// [`OffsetTable::seek_grain_offset`].
    pub fn grain(&self, grain: usize) -> Result<&GrainOffset> {
        if self.grain_offsets.is_empty() {
            return Err(Error::missing_data(
                "invalid offset table - missing grain offsets",
            ));
        }
        self.grain_offsets.get(grain).ok_or_else(|| {
            Error::out_of_range(format!(
                "grain: {} out of range [0,{}]",
                grain,
                self.grain_offsets.len() - 1
            ))
        })
    }

    /// All entries in grain order.
    pub fn grain_offsets(&self) -> &[GrainOffset] {
        &self.grain_offsets
    }
}

fn validate_grain_table(grain_table: &[u8], number_of_entries: usize, grain_size: u64) -> Result<()> {
    if grain_table.len() % GRAIN_TABLE_ENTRY_SIZE != 0 {
        return Err(Error::invalid_format(format!(
            "invalid grain table size: {} not a multiple of 4",
            grain_table.len()
        )));
    }
    if number_of_entries != grain_table.len() / GRAIN_TABLE_ENTRY_SIZE {
        return Err(Error::invalid_format(format!(
            "number of grain table entries: {} mismatch with calculated number: {}",
            number_of_entries,
            grain_table.len() / GRAIN_TABLE_ENTRY_SIZE
        )));
    }
    if grain_size == 0 {
        return Err(Error::invalid_argument("invalid grain size value zero"));
    }
    Ok(())
}

fn end_index(start: usize, number_of_entries: usize) -> Result<usize> {
    start.checked_add(number_of_entries).ok_or_else(|| {
        Error::capacity_exceeded("number of grain offsets exceeds maximum")
    })
}

fn decode_sectors(grain_table: &[u8]) -> impl Iterator<Item = u32> + '_ {
    grain_table
        .chunks_exact(GRAIN_TABLE_ENTRY_SIZE)
        .map(|entry| u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn encode(sectors: &[u32]) -> Vec<u8> {
        sectors.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_new_table_is_empty() {
        let table = OffsetTable::new();
        assert_eq!(table.number_of_grain_offsets(), 0);
        assert_eq!(table.last_filled_index(), 0);
        assert_eq!(table.last_compared_index(), 0);
    }

    #[test]
    fn test_resize_grows_zeroed() {
        let mut table = OffsetTable::new();
        table.resize(8).unwrap();
        assert_eq!(table.number_of_grain_offsets(), 8);
        assert!(table.grain_offsets().iter().all(|g| *g == GrainOffset::default()));
    }

    #[test]
    fn test_resize_never_shrinks() {
        let mut table = OffsetTable::with_entries(10).unwrap();
        table.resize(4).unwrap();
        assert_eq!(table.number_of_grain_offsets(), 10);
        table.resize(0).unwrap();
        assert_eq!(table.number_of_grain_offsets(), 10);
    }

    #[test]
    fn test_resize_overflow_is_capacity_exceeded() {
        let mut table = OffsetTable::new();
        let err = table.resize(usize::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        assert_eq!(table.number_of_grain_offsets(), 0);
    }

    #[test]
    fn test_fill_decodes_sectors() {
        let mut table = OffsetTable::new();
        let range = table.fill(&encode(&[0, 2, 7]), 3, 65536).unwrap();
        assert_eq!(range, 0..3);

        let grains = table.grain_offsets();
        assert_eq!(grains[0].physical_offset, 0);
        assert_eq!(grains[0].size, 0);
        assert_eq!(grains[1].physical_offset, 1024);
        assert_eq!(grains[1].size, 65536);
        assert_eq!(grains[2].physical_offset, 7 * 512);
        assert_eq!(grains[2].size, 65536);
    }

    #[test]
    fn test_fill_size_zero_iff_offset_zero() {
        let sectors: Vec<u32> = (0..64).map(|i| if i % 3 == 0 { 0 } else { i * 128 }).collect();
        let mut table = OffsetTable::new();
        table.fill(&encode(&sectors), sectors.len(), 4096).unwrap();
        for (grain, &sector) in table.grain_offsets().iter().zip(&sectors) {
            assert_eq!(grain.physical_offset, u64::from(sector) * 512);
            assert_eq!(grain.size == 0, grain.physical_offset == 0);
        }
    }

    #[test]
    fn test_consecutive_fills_append() {
        let mut table = OffsetTable::new();
        table.fill(&encode(&[1, 2]), 2, 512).unwrap();
        let second = table.fill(&encode(&[3, 4, 5]), 3, 512).unwrap();
        assert_eq!(second, 2..5);
        assert_eq!(table.number_of_grain_offsets(), 5);
        assert_eq!(table.seek_grain_offset(2).unwrap(), 3 * 512);
        assert_eq!(table.last_filled_index(), 5);
    }

    #[test]
    fn test_fill_rejects_unaligned_length() {
        let mut table = OffsetTable::new();
        for len in [1usize, 2, 3, 5, 7, 13] {
            let buf = vec![0xffu8; len];
            let err = table.fill(&buf, len / 4, 512).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidFormat, "length {}", len);
        }
        assert_eq!(table.number_of_grain_offsets(), 0);
    }

    #[test]
    fn test_fill_rejects_count_mismatch() {
        let mut table = OffsetTable::new();
        let err = table.fill(&encode(&[1, 2]), 3, 512).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_fill_rejects_zero_grain_size() {
        let mut table = OffsetTable::new();
        let err = table.fill(&encode(&[1]), 1, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_consecutive_fills_grow_amortized() {
        let table_bytes = encode(&[1u32; 512]);
        let mut table = OffsetTable::new();
        let mut reallocations = 0;
        let mut capacity = table.grain_offsets.capacity();
        for _ in 0..2000 {
            table.fill(&table_bytes, 512, 512).unwrap();
            if table.grain_offsets.capacity() != capacity {
                capacity = table.grain_offsets.capacity();
                reallocations += 1;
            }
        }
        assert_eq!(table.number_of_grain_offsets(), 2000 * 512);
        assert!(reallocations < 40, "{} reallocations", reallocations);
    }

    #[test]
    fn test_fill_into_presized_table() {
        let mut table = OffsetTable::with_entries(16).unwrap();
        table.fill(&encode(&[9]), 1, 512).unwrap();
        assert_eq!(table.number_of_grain_offsets(), 16);
        assert_eq!(table.seek_grain_offset(0).unwrap(), 9 * 512);
    }

    #[test]
    fn test_seek_empty_table_is_missing_data() {
        let table = OffsetTable::new();
        for grain in [0usize, 1, 1000] {
            let err = table.seek_grain_offset(grain).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MissingData);
        }
    }

    #[test]
    fn test_seek_out_of_range() {
        let mut table = OffsetTable::new();
        table.fill(&encode(&[1, 2]), 2, 512).unwrap();
        assert_eq!(table.seek_grain_offset(2).unwrap_err().kind(), ErrorKind::OutOfRange);
        assert_eq!(table.seek_grain_offset(usize::MAX).unwrap_err().kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn test_compare_matching_tables() {
        let mut table = OffsetTable::new();
        let gt = encode(&[0, 4, 8]);
        table.fill(&gt, 3, 512).unwrap();
        let outcome = table.compare(&gt, 3, 512).unwrap();
        assert_eq!(outcome.range, 0..3);
        assert!(outcome.mismatches.is_empty());
        assert_eq!(table.last_compared_index(), 3);
    }

    #[test]
    fn test_compare_mismatch_clears_corrupted_flag() {
        // A mismatch currently clears the corrupted bit rather than setting it.
        let mut table = OffsetTable::new();
        table.fill(&encode(&[0, 4, 8]), 3, 512).unwrap();
        table.grain_offsets[1].flags = GrainFlags::CORRUPTED;
        table.grain_offsets[2].flags = GrainFlags::CORRUPTED;

        let outcome = table.compare(&encode(&[0, 5, 8]), 3, 512).unwrap();
        assert_eq!(outcome.mismatches, vec![(1, 5 * 512)]);

        let grains = table.grain_offsets();
        assert!(!grains[1].is_corrupted());
        assert_eq!(grains[1].physical_offset, 4 * 512);
        // Matching entries keep their flags.
        assert!(grains[2].is_corrupted());
        assert!(!grains[0].is_corrupted());
    }

    #[test]
    fn test_compare_beyond_filled_grows_table() {
        let mut table = OffsetTable::new();
        let outcome = table.compare(&encode(&[0, 3]), 2, 512).unwrap();
        assert_eq!(outcome.mismatches, vec![(1, 3 * 512)]);
        assert_eq!(table.number_of_grain_offsets(), 2);
        assert_eq!(table.last_filled_index(), 0);
    }

    #[test]
    fn test_compare_validates_input() {
        let mut table = OffsetTable::new();
        assert_eq!(
            table.compare(&[0u8; 6], 1, 512).unwrap_err().kind(),
            ErrorKind::InvalidFormat
        );
        assert_eq!(
            table.compare(&[0u8; 4], 1, 0).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_skip_compare() {
        let mut table = OffsetTable::new();
        table.fill(&encode(&[1, 2, 3]), 3, 512).unwrap();
        table.skip_compare();
        assert_eq!(table.last_compared_index(), 3);
        let outcome = table.compare(&encode(&[7]), 1, 512).unwrap();
        assert_eq!(outcome.range, 3..4);
    }
}
