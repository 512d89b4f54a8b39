//! Segment table.
//!
//! Maps 1-based segment indices to the resource parsed for each input file.
//! Slot 0 is reserved and never holds a segment.

use crate::error::{Error, Result};

use super::extent_file::ExtentFile;

/// Parsed role of one segment file.
#[derive(Debug, Clone)]
pub enum Segment {
    /// Sparse extent with a parsed header.
    Extent(ExtentFile),
    /// Text descriptor file.
    Descriptor { pool_entry: usize },
    /// Flat extent data read without translation.
    RawData {
        pool_entry: usize,
        /// Byte offset of the extent data within the file.
        offset: u64,
        /// Size of the extent data in bytes.
        size: u64,
    },
}

impl Segment {
    pub fn pool_entry(&self) -> usize {
        match self {
            Segment::Extent(extent) => extent.pool_entry(),
            Segment::Descriptor { pool_entry } | Segment::RawData { pool_entry, .. } => *pool_entry,
        }
    }

    /// Returns true for segments that contribute to the logical disk.
    pub fn is_data(&self) -> bool {
        !matches!(self, Segment::Descriptor { .. })
    }

    pub fn as_extent(&self) -> Option<&ExtentFile> {
        match self {
            Segment::Extent(extent) => Some(extent),
            _ => None,
        }
    }
}

/// Ordered segments keyed by index starting at [`SegmentTable::BASE_INDEX`].
#[derive(Debug, Clone, Default)]
pub struct SegmentTable {
    segments: Vec<Segment>,
}

impl SegmentTable {
    /// First valid segment index.
    pub const BASE_INDEX: usize = 1;

    pub fn new() -> Self {
        Self::default()
    }

    /// Number of segments set.
    #[inline]
    pub fn number_of_entries(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Index the next [`SegmentTable::append`] will use.
    pub fn next_index(&self) -> usize {
        self.segments.len() + Self::BASE_INDEX
    }

    /// Associates `segment` with `index`.
    ///
    /// The table grows by one when `index` is the next free slot.
    ///
    /// # Errors
    ///
    /// * `OutOfRange` if `index` is below the base index or would leave a gap.
    /// * `AlreadyInitialized` if `index` is already set.
    pub fn set_entry(&mut self, index: usize, segment: Segment) -> Result<()> {
        let next = self.next_index();
        if index < Self::BASE_INDEX || index > next {
            return Err(Error::out_of_range(format!(
                "segment index: {} out of range [{},{}]",
                index,
                Self::BASE_INDEX,
                next
            )));
        }
        if index < next {
            return Err(Error::already_initialized(format!(
                "segment: {} already set",
                index
            )));
        }
        self.segments.try_reserve(1)?;
        self.segments.push(segment);
        Ok(())
    }

    /// Sets the next free index, returning it.
    pub fn append(&mut self, segment: Segment) -> Result<usize> {
        let index = self.next_index();
        self.set_entry(index, segment)?;
        Ok(index)
    }

    /// Returns the segment at `index`.
    ///
    /// # Errors
    ///
    /// Returns `MissingData` if `index` is not set.
    pub fn get_entry(&self, index: usize) -> Result<&Segment> {
        index
            .checked_sub(Self::BASE_INDEX)
            .and_then(|i| self.segments.get(i))
            .ok_or_else(|| Error::missing_data(format!("missing segment: {}", index)))
    }

    /// Segments with their indices, in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Segment)> {
        self.segments
            .iter()
            .enumerate()
            .map(|(i, segment)| (i + Self::BASE_INDEX, segment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn descriptor(pool_entry: usize) -> Segment {
        Segment::Descriptor { pool_entry }
    }

    #[test]
    fn test_append_starts_at_base() {
        let mut table = SegmentTable::new();
        assert_eq!(table.append(descriptor(0)).unwrap(), 1);
        assert_eq!(table.append(Segment::Extent(ExtentFile::new(1))).unwrap(), 2);
        assert_eq!(table.number_of_entries(), 2);
        assert_eq!(table.get_entry(2).unwrap().pool_entry(), 1);
    }

    #[test]
    fn test_set_entry_slot_zero() {
        let mut table = SegmentTable::new();
        let err = table.set_entry(0, descriptor(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn test_set_entry_gap() {
        let mut table = SegmentTable::new();
        let err = table.set_entry(3, descriptor(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert!(table.is_empty());
    }

    #[test]
    fn test_set_entry_twice() {
        let mut table = SegmentTable::new();
        table.set_entry(1, descriptor(0)).unwrap();
        let err = table.set_entry(1, descriptor(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyInitialized);
        assert_eq!(table.get_entry(1).unwrap().pool_entry(), 0);
    }

    #[test]
    fn test_get_entry_unset() {
        let table = SegmentTable::new();
        assert_eq!(table.get_entry(0).unwrap_err().kind(), ErrorKind::MissingData);
        assert_eq!(table.get_entry(1).unwrap_err().kind(), ErrorKind::MissingData);
    }

    #[test]
    fn test_iter_indices() {
        let mut table = SegmentTable::new();
        table.append(descriptor(0)).unwrap();
        table
            .append(Segment::RawData {
                pool_entry: 1,
                offset: 0,
                size: 512,
            })
            .unwrap();
        let indices: Vec<usize> = table.iter().map(|(i, _)| i).collect();
        assert_eq!(indices, vec![1, 2]);
        assert!(!table.get_entry(1).unwrap().is_data());
        assert!(table.get_entry(2).unwrap().is_data());
    }
}
