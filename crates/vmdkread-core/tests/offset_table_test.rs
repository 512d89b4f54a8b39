//! Integration tests for the grain offset table.

use vmdkread_core::vmdk::{GrainFlags, OffsetTable};
use vmdkread_core::ErrorKind;

const GRAIN_SIZE: u64 = 65536;

fn grain_table(sectors: &[u32]) -> Vec<u8> {
    sectors.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[test]
fn test_fill_decodes_sector_numbers() {
    let sectors = [0u32, 2, 0, 0x0010_0000, 1];
    let mut table = OffsetTable::new();
    let range = table
        .fill(&grain_table(&sectors), sectors.len(), GRAIN_SIZE)
        .expect("fill should succeed");

    assert_eq!(range, 0..5);
    for (grain, &sector) in sectors.iter().enumerate() {
        let entry = table.grain(grain).unwrap();
        assert_eq!(entry.physical_offset, u64::from(sector) * 512);
        assert_eq!(entry.size == 0, entry.physical_offset == 0);
    }
}

#[test]
fn test_fill_rejects_misaligned_buffer() {
    for len in [1usize, 2, 3, 5, 7, 9] {
        let mut table = OffsetTable::new();
        let err = table.fill(&vec![0xffu8; len], len / 4, GRAIN_SIZE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat, "length {}", len);
        assert!(table.is_empty());
    }
}

#[test]
fn test_fill_rejects_count_mismatch() {
    let mut table = OffsetTable::new();
    let err = table.fill(&grain_table(&[1, 2]), 3, GRAIN_SIZE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFormat);
}

#[test]
fn test_fill_rejects_zero_grain_size() {
    let mut table = OffsetTable::new();
    let err = table.fill(&grain_table(&[1]), 1, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_consecutive_fills_append() {
    let mut table = OffsetTable::new();
    table.fill(&grain_table(&[1, 2, 3]), 3, GRAIN_SIZE).unwrap();
    let second = table.fill(&grain_table(&[7, 0]), 2, GRAIN_SIZE).unwrap();

    assert_eq!(second, 3..5);
    assert_eq!(table.number_of_grain_offsets(), 5);
    assert_eq!(table.seek_grain_offset(3).unwrap(), 7 * 512);
    assert_eq!(table.last_filled_index(), 5);
}

#[test]
fn test_resize_never_shrinks() {
    let mut table = OffsetTable::with_entries(8).unwrap();
    table.resize(3).unwrap();
    assert_eq!(table.number_of_grain_offsets(), 8);
    table.resize(10).unwrap();
    assert_eq!(table.number_of_grain_offsets(), 10);
    assert!(table.grain(9).unwrap().is_sparse());
}

#[test]
fn test_seek_out_of_range() {
    let mut table = OffsetTable::new();
    assert_eq!(table.seek_grain_offset(0).unwrap_err().kind(), ErrorKind::MissingData);

    table.fill(&grain_table(&[1, 2]), 2, GRAIN_SIZE).unwrap();
    assert_eq!(table.seek_grain_offset(2).unwrap_err().kind(), ErrorKind::OutOfRange);
    assert_eq!(table.seek_grain_offset(usize::MAX).unwrap_err().kind(), ErrorKind::OutOfRange);
}

#[test]
fn test_compare_reports_mismatches_and_clears_flag() {
    let mut table = OffsetTable::new();
    table.fill(&grain_table(&[4, 0, 6]), 3, GRAIN_SIZE).unwrap();

    let outcome = table.compare(&grain_table(&[4, 5, 6]), 3, GRAIN_SIZE).unwrap();
    assert_eq!(outcome.range, 0..3);
    assert_eq!(outcome.mismatches, vec![(1, 5 * 512)]);

    // Stored offsets keep the primary value; the mismatch leaves the flag clear.
    let entry = table.grain(1).unwrap();
    assert_eq!(entry.physical_offset, 0);
    assert!(!entry.flags.contains(GrainFlags::CORRUPTED));
    assert!(!entry.is_corrupted());
    assert_eq!(table.last_compared_index(), 3);
}
