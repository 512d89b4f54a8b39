//! Byte-range I/O against the segment files of a disk.

pub mod pool;

pub use pool::{FileIoPool, IoSource, MappedFile, MemorySource};
