use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use crate::{PerfEventHeader, PerfEventMmapPage, PerfRing, PerfRingError, PERF_EVENT_HEADER_SIZE};

/// Producer side of a ring, writing records the way the kernel does.
///
/// Used to feed in-memory rings for simulation and tests. In overwrite mode
/// the producer never looks at the consumer cursor and tramples old records,
/// like a perf event mapped read-only.
pub struct RingProducer {
    meta: NonNull<PerfEventMmapPage>,
    data: NonNull<u8>,
    size: u64,
    mask: u64,
    // Next write position
    head: u64,
    // Consumer position observed at the start of the batch
    tail: u64,
    overwrite: bool,
}

impl PerfRing {
    /// Creates a producer writing into the same memory as this ring.
    ///
    /// # Safety
    ///
    /// The producer holds raw pointers into the ring's storage and must not
    /// outlive it.
    pub unsafe fn producer(&self, overwrite: bool) -> RingProducer {
        let head = self.meta_ptr().as_ref().data_head.load(Ordering::Relaxed);
        RingProducer {
            meta: self.meta_ptr(),
            data: self.data_ptr(),
            size: self.size(),
            mask: self.size() - 1,
            head,
            tail: head,
            overwrite,
        }
    }
}

impl RingProducer {
    /// Starts a write batch operation
    pub fn start_write_batch(&mut self) {
        unsafe {
            self.tail = self.meta.as_ref().data_tail.load(Ordering::Acquire);
        }
    }

    /// Writes one record and returns the cursor it starts at
    pub fn write(&mut self, type_: u32, misc: u16, payload: &[u8]) -> Result<u64, PerfRingError> {
        if payload.is_empty() {
            return Err(PerfRingError::EmptyWrite);
        }

        // Calculate total size including header, aligned to 8 bytes
        let aligned_len = (PERF_EVENT_HEADER_SIZE + payload.len() + 7) & !7;
        if aligned_len as u64 >= self.size || aligned_len > usize::from(u16::MAX) {
            return Err(PerfRingError::CannotFit);
        }
        self.check_space(aligned_len as u64)?;

        let header = PerfEventHeader {
            type_,
            misc,
            size: aligned_len as u16,
        };
        let start = self.head;

        // Safety: the header is plain data
        let header_bytes = unsafe { plain::as_bytes(&header) };
        self.copy_in(start, header_bytes);
        self.copy_in(start + PERF_EVENT_HEADER_SIZE as u64, payload);

        self.head += aligned_len as u64;
        Ok(start)
    }

    /// Appends raw bytes, for producing malformed records
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<u64, PerfRingError> {
        if bytes.is_empty() {
            return Err(PerfRingError::EmptyWrite);
        }
        if bytes.len() % 8 != 0 {
            return Err(PerfRingError::Unaligned(bytes.len()));
        }
        if bytes.len() as u64 >= self.size {
            return Err(PerfRingError::CannotFit);
        }
        self.check_space(bytes.len() as u64)?;

        let start = self.head;
        self.copy_in(start, bytes);
        self.head += bytes.len() as u64;
        Ok(start)
    }

    /// Finishes a write batch, publishing everything written so far
    pub fn finish_write_batch(&mut self) {
        // Ensure all writes are visible before updating head
        unsafe {
            self.meta
                .as_ref()
                .data_head
                .store(self.head, Ordering::Release);
        }
    }

    /// Cursor the next record will be written at
    pub fn head(&self) -> u64 {
        self.head
    }

    fn check_space(&self, len: u64) -> Result<(), PerfRingError> {
        if !self.overwrite && self.head + len - self.tail > self.size {
            return Err(PerfRingError::NoSpace);
        }
        Ok(())
    }

    fn copy_in(&mut self, pos: u64, bytes: &[u8]) {
        let start = (pos & self.mask) as usize;
        let size = self.size as usize;

        unsafe {
            if start + bytes.len() <= size {
                ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.as_ptr().add(start), bytes.len());
            } else {
                let first_part = size - start;
                ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.as_ptr().add(start), first_part);
                ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first_part),
                    self.data.as_ptr(),
                    bytes.len() - first_part,
                );
            }
        }
    }
}
