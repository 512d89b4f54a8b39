//! Structured event reporting.
//!
//! The handle reports what it is doing through an [`EventSink`] supplied at
//! construction instead of writing to a process-wide verbose stream. The
//! default sink forwards events to `tracing`.

use std::fmt;

use crate::vmdk::signature::FileType;

/// An observable step taken while opening or reading a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A file was added to a library-created pool.
    PoolEntryAdded { entry: usize, name: String },
    /// Signature classification started for a pool entry.
    ProcessingPoolEntry { entry: usize },
    /// Classification finished; `None` means no signature matched.
    Classified {
        entry: usize,
        file_type: Option<FileType>,
    },
    /// Grain directory processing started for a segment.
    ReadingSegment { segment: usize },
    /// A grain table entry was stored in the offset table.
    GrainRead { grain: u64, offset: u64, size: u64 },
    /// The secondary grain directory disagrees with the primary one.
    GrainMismatch {
        grain: u64,
        stored_offset: u64,
        secondary_offset: u64,
    },
    /// Abort was observed before processing a segment.
    Aborted { segment: usize },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::PoolEntryAdded { entry, name } => {
                write!(f, "added pool entry: {} with filename: {}", entry, name)
            }
            Event::ProcessingPoolEntry { entry } => write!(f, "processing pool entry: {}", entry),
            Event::Classified { entry, file_type } => match file_type {
                Some(t) => write!(f, "pool entry: {} classified as {}", entry, t),
                None => write!(f, "pool entry: {} has no known signature", entry),
            },
            Event::ReadingSegment { segment } => {
                write!(f, "reading grain directories for segment: {}", segment)
            }
            Event::GrainRead {
                grain,
                offset,
                size,
            } => write!(
                f,
                "grain {} read with offset 0x{:08x} ({}) and size {}",
                grain, offset, offset, size
            ),
            Event::GrainMismatch {
                grain,
                stored_offset,
                secondary_offset,
            } => write!(
                f,
                "file offset mismatch for grain {}: primary 0x{:08x}, secondary 0x{:08x}",
                grain, stored_offset, secondary_offset
            ),
            Event::Aborted { segment } => write!(f, "abort signalled before segment: {}", segment),
        }
    }
}

/// Receiver of [`Event`]s.
pub trait EventSink: Send + Sync {
    fn event(&self, event: &Event);
}

/// Forwards events to the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn event(&self, event: &Event) {
        match event {
            Event::GrainRead { .. } => tracing::trace!(target: "vmdkread", "{}", event),
            Event::GrainMismatch { .. } | Event::Aborted { .. } => {
                tracing::warn!(target: "vmdkread", "{}", event)
            }
            _ => tracing::debug!(target: "vmdkread", "{}", event),
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn event(&self, _event: &Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grain_read_display() {
        let event = Event::GrainRead {
            grain: 1,
            offset: 1024,
            size: 65536,
        };
        assert_eq!(
            event.to_string(),
            "grain 1 read with offset 0x00000400 (1024) and size 65536"
        );
    }

    #[test]
    fn test_classified_display() {
        let event = Event::Classified {
            entry: 0,
            file_type: None,
        };
        assert!(event.to_string().contains("no known signature"));
    }
}
