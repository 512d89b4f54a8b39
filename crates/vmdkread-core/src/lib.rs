//! vmdkread Core Library
//!
//! Read-only access to VMware virtual disks made of one or more segment
//! files: a text descriptor plus sparse (COWD or VMDK) or flat extent files.
//!
//! # Overview
//!
//! A [`Handle`] opens the segment files, classifies each by signature,
//! parses the sparse extent headers and reads their grain directories into
//! one offset table. Logical disk offsets are then translated to segment
//! file offsets by [`Handle::map_offset`] and read by [`Handle::read_at`].
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`config`] - Access flags and handle options
//! - [`io`] - File pool and byte sources
//! - [`notify`] - Event reporting
//! - [`vmdk`] - On-disk structures (grain tables, extent headers, descriptor)
//! - [`handle`] - Disk handle
//!
//! # Quick Start
//!
//! ```no_run
//! use vmdkread_core::{AccessFlags, Handle};
//!
//! let mut handle = Handle::new();
//! handle
//!     .open(&["/path/to/disk.vmdk", "/path/to/disk-s001.vmdk"], AccessFlags::READ)
//!     .unwrap();
//!
//! let mut sector = [0u8; 512];
//! handle.read_at(0, &mut sector).unwrap();
//! handle.close().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod handle;
pub mod io;
pub mod notify;
pub mod vmdk;

pub use config::{AccessFlags, HandleOptions, DEFAULT_MAXIMUM_METADATA_SIZE};
pub use error::{Error, ErrorKind, Result};
pub use handle::{AbortHandle, Handle, HandleState, Mapping};
pub use io::{FileIoPool, IoSource, MappedFile, MemorySource};
pub use notify::{Event, EventSink, NullSink, TracingSink};
pub use vmdk::{FileType, GrainOffset, OffsetTable, Segment, SECTOR_SIZE};
