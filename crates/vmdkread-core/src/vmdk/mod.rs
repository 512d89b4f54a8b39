//! VMDK on-disk structures.
//!
//! Leaf-first: grain offset entries, the global offset table, sparse extent
//! files, the segment table, signature classification and the descriptor.

pub mod descriptor;
pub mod extent_file;
pub mod grain;
pub mod offset_table;
pub mod segment_table;
pub mod signature;

pub use descriptor::{Descriptor, ExtentDescriptor, ExtentType};
pub use extent_file::{
    ExtentFile, ExtentFileState, ExtentHeader, GrainDirectoryKind, SparseFormat,
    COWD_GRAIN_TABLE_ENTRIES, COWD_SPARSE_HEADER_SIZE, VMDK_SPARSE_HEADER_SIZE,
};
pub use grain::{GrainFlags, GrainOffset};
pub use offset_table::{CompareOutcome, OffsetTable, GRAIN_TABLE_ENTRY_SIZE};
pub use segment_table::{Segment, SegmentTable};
pub use signature::{classify, read_signature, FileType, SIGNATURE_SIZE};

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: u64 = 512;
