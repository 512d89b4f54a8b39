//! Segment file classification by signature.

use std::fmt;

use crate::error::Result;
use crate::io::FileIoPool;

/// Number of leading bytes read for classification.
pub const SIGNATURE_SIZE: usize = 32;

/// COWD sparse extent magic.
pub const COWD_SPARSE_SIGNATURE: &[u8; 4] = b"COWD";

/// VMDK sparse extent magic ("VMDK" as a little-endian u32).
pub const VMDK_SPARSE_SIGNATURE: &[u8; 4] = b"KDMV";

/// Text descriptor file magic; must be followed by a newline.
pub const DESCRIPTOR_SIGNATURE: &[u8; 21] = b"# Disk DescriptorFile";

/// Role of a segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Text descriptor listing the extents.
    Descriptor,
    /// COWD sparse extent data file.
    CowdSparse,
    /// VMDK sparse extent data file.
    VmdkSparse,
    /// Raw (flat) extent data without a header.
    RawData,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileType::Descriptor => write!(f, "descriptor file"),
            FileType::CowdSparse => write!(f, "COWD sparse data file"),
            FileType::VmdkSparse => write!(f, "VMDK sparse data file"),
            FileType::RawData => write!(f, "raw data file"),
        }
    }
}

/// Classifies a file from its leading bytes.
///
/// Returns `None` when no known signature matches. Raw data files carry no
/// signature; the handle marks them [`FileType::RawData`] once the descriptor
/// lists them.
pub fn classify(signature: &[u8]) -> Option<FileType> {
    if signature.starts_with(COWD_SPARSE_SIGNATURE) {
        Some(FileType::CowdSparse)
    } else if signature.starts_with(VMDK_SPARSE_SIGNATURE) {
        Some(FileType::VmdkSparse)
    } else if signature.starts_with(DESCRIPTOR_SIGNATURE)
        && signature.get(DESCRIPTOR_SIGNATURE.len()) == Some(&b'\n')
    {
        Some(FileType::Descriptor)
    } else {
        None
    }
}

/// Reads the first [`SIGNATURE_SIZE`] bytes of a pool entry and classifies it.
///
/// # Errors
///
/// Returns a `Read` error if fewer than [`SIGNATURE_SIZE`] bytes are available.
pub fn read_signature(pool: &FileIoPool, entry: usize) -> Result<Option<FileType>> {
    let mut signature = [0u8; SIGNATURE_SIZE];
    pool.read_exact_at(entry, 0, &mut signature)?;
    Ok(classify(&signature))
}
