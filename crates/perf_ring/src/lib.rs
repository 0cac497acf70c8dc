//! # perf_ring
//!
//! Consumer side of Linux perf ring buffers. This crate provides the
//! barrier-correct cursor protocol shared with the kernel, a constant-memory
//! tracker of record start offsets for flight-recorder (overwrite) mode, and
//! the storages that back a ring: an mmap'd perf event or plain memory.
//!

#[cfg(target_os = "linux")]
mod helpers;
mod memory_storage;
#[cfg(target_os = "linux")]
mod mmap_storage;
mod offsets;
mod producer;
mod ring;
mod walk;

#[cfg(target_os = "linux")]
pub use helpers::*;
pub use memory_storage::*;
#[cfg(target_os = "linux")]
pub use mmap_storage::*;
pub use offsets::*;
pub use producer::*;
pub use ring::*;
pub use walk::*;

use std::os::unix::io::RawFd;
use thiserror::Error;

/// Errors that can occur when using perf ring storage
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("OS error: {0}")]
    OsError(#[from] std::io::Error),

    #[error("ring needs a power of two number of data pages, got {0}")]
    InvalidPageCount(u32),
}

/// Perf ring buffer storage trait
pub trait Storage {
    /// Return the raw buffer containing the metadata page and data pages
    fn data(&self) -> &[u8];

    /// Return the raw buffer for a ring that is about to be attached to it
    fn data_mut(&mut self) -> &mut [u8];

    /// Return the number of data pages in the ring buffer
    fn num_data_pages(&self) -> u32;

    /// Return the system page size
    fn page_size(&self) -> u64;

    /// Return the file descriptor if this is a perf event storage, or -1 otherwise
    fn file_descriptor(&self) -> RawFd;
}
