//! Access flags and handle options.

/// Default cap on a single metadata read (grain directory, grain table,
/// descriptor) from an untrusted image (128 MiB).
pub const DEFAULT_MAXIMUM_METADATA_SIZE: u64 = 128 * 1024 * 1024;

bitflags::bitflags! {
    /// Access flags requested when opening a handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessFlags: u8 {
        /// Read access.
        const READ = 0x01;
        /// Write access. Always rejected.
        const WRITE = 0x02;
    }
}

impl AccessFlags {
    pub fn is_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}

/// Options for a [`Handle`](crate::Handle).
#[derive(Debug, Clone)]
pub struct HandleOptions {
    /// Limit on simultaneously open pool entries (`None` = unlimited).
    pub maximum_open_handles: Option<usize>,
    /// Verify the secondary (redundant) grain directory against the primary.
    pub compare_secondary_grain_directory: bool,
    /// Largest metadata region read from a segment file, in bytes.
    pub maximum_metadata_size: u64,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            maximum_open_handles: None,
            compare_secondary_grain_directory: true,
            maximum_metadata_size: DEFAULT_MAXIMUM_METADATA_SIZE,
        }
    }
}

impl HandleOptions {
    /// Create options with the given limits.
    pub fn new(maximum_open_handles: Option<usize>, compare_secondary_grain_directory: bool) -> Self {
        Self {
            maximum_open_handles,
            compare_secondary_grain_directory,
            ..Self::default()
        }
    }

    /// Options that trust the primary grain directory and skip the compare pass.
    pub fn primary_only() -> Self {
        Self {
            compare_secondary_grain_directory: false,
            ..Self::default()
        }
    }

    /// Set the metadata read cap (in bytes).
    pub fn with_maximum_metadata_size(mut self, size: u64) -> Self {
        self.maximum_metadata_size = size;
        self
    }
}
