use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use thiserror::Error;

/// Errors that can occur when using the perf ring buffer
#[derive(Error, Debug)]
pub enum PerfRingError {
    #[error("buffer length must be a power of 2 and at least 8 bytes")]
    InvalidBufferLength,

    #[error("data buffer cannot be nil")]
    NilBuffer,

    #[error("buffer full")]
    NoSpace,

    #[error("data too large for buffer")]
    CannotFit,

    #[error("cannot write empty data")]
    EmptyWrite,

    #[error("raw writes must be a multiple of 8 bytes, got {0}")]
    Unaligned(usize),
}

/// PerfEventHeader represents the header of every perf record
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

// Safety: plain-old-data, every bit pattern is valid
unsafe impl plain::Plain for PerfEventHeader {}

/// Size in bytes of [`PerfEventHeader`]
pub const PERF_EVENT_HEADER_SIZE: usize = size_of::<PerfEventHeader>();

/// Shared metadata page for perf ring buffer
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pad1: [u8; 1024 - 8],
    pub data_head: AtomicU64,
    pub data_tail: AtomicU64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// Type constants for perf records
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// Bytes between `tail` and `head` in a ring of `size` (a power of two).
///
/// Both cursors are free-running, so the subtraction wraps.
pub fn taken(head: u64, tail: u64, size: u64) -> u64 {
    head.wrapping_sub(tail) & (size - 1)
}

/// Bytes the producer may still write before reaching `tail`.
///
/// A completely full ring also reports `taken == 0`, so this cannot tell an
/// empty ring from a full one; fullness has to be tracked separately.
pub fn free(head: u64, tail: u64, size: u64) -> u64 {
    size - taken(head, tail, size)
}

/// PerfRing is the consumer view of a ring: the shared metadata page plus the
/// power-of-two data area the kernel writes records into.
pub struct PerfRing {
    // Shared metadata page
    meta: NonNull<PerfEventMmapPage>,
    // Start of the data area
    data: NonNull<u8>,
    // Data area length, a power of two
    size: u64,
    // Mask for quick modulo operations (buffer size - 1)
    mask: u64,
}

impl PerfRing {
    /// Initializes a PerfRing using contiguous memory: one metadata page
    /// followed by `n_pages` data pages.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it works with raw pointers and assumes the
    /// provided slice will outlive the PerfRing. The slice must be 8-byte aligned.
    pub unsafe fn init_contiguous(
        data: &mut [u8],
        n_pages: u32,
        page_size: u64,
    ) -> Result<Self, PerfRingError> {
        if data.is_empty() {
            return Err(PerfRingError::NilBuffer);
        }

        let buf_len = u64::from(n_pages) * page_size;
        if buf_len < 8 || !buf_len.is_power_of_two() {
            return Err(PerfRingError::InvalidBufferLength);
        }
        if data.len() < size_of::<PerfEventMmapPage>() {
            return Err(PerfRingError::InvalidBufferLength);
        }

        // First page is metadata, rest is data
        let meta_ptr = data.as_mut_ptr() as *mut PerfEventMmapPage;
        let meta = NonNull::new(meta_ptr).ok_or(PerfRingError::NilBuffer)?;

        // If data_offset is not given (older kernels), we need to skip a full page,
        // otherwise we skip data_offset bytes
        let data_start = if (*meta_ptr).data_offset == 0 {
            page_size
        } else {
            (*meta_ptr).data_offset
        };
        if (data.len() as u64) < data_start + buf_len {
            return Err(PerfRingError::InvalidBufferLength);
        }

        let data_ptr = NonNull::new(data.as_mut_ptr().add(data_start as usize))
            .ok_or(PerfRingError::NilBuffer)?;

        Ok(PerfRing {
            meta,
            data: data_ptr,
            size: buf_len,
            mask: buf_len - 1,
        })
    }

    /// Size of the data area in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reduces a free-running cursor to an offset in the data area
    pub fn offset_of(&self, pos: u64) -> u64 {
        pos & self.mask
    }

    /// Loads the producer cursor.
    ///
    /// The acquire load pairs with the kernel's release of `data_head`: every
    /// record byte below the returned cursor is visible once this returns.
    pub fn read_head(&self) -> u64 {
        unsafe { self.meta.as_ref().data_head.load(Ordering::Acquire) }
    }

    /// Loads the consumer cursor. Only this side writes it.
    pub fn read_tail(&self) -> u64 {
        unsafe { self.meta.as_ref().data_tail.load(Ordering::Relaxed) }
    }

    /// Publishes the consumer cursor.
    ///
    /// Must only be called once every byte below `pos` has been read; the
    /// full fence keeps those reads from sinking below the store.
    pub fn commit_tail(&self, pos: u64) {
        fence(Ordering::SeqCst);
        unsafe {
            self.meta.as_ref().data_tail.store(pos, Ordering::Release);
        }
    }

    /// Bytes currently between the consumer and producer cursors
    pub fn bytes_taken(&self) -> u64 {
        taken(self.read_head(), self.read_tail(), self.size)
    }

    /// Returns true if the producer has published data past the consumer cursor
    pub fn has_data(&self) -> bool {
        self.bytes_taken() != 0
    }

    /// Copies the record header starting at cursor `pos`
    pub fn header_at(&self, pos: u64) -> PerfEventHeader {
        let mut raw = [0u8; PERF_EVENT_HEADER_SIZE];
        self.copy_out(pos, &mut raw);

        let mut header = PerfEventHeader::default();
        // The source is exactly the size of the header, this cannot fail
        let _ = plain::copy_from_bytes(&mut header, &raw);
        header
    }

    /// Copies `buf.len()` bytes starting at cursor `pos`, following the wrap
    /// at the end of the data area.
    pub fn copy_out(&self, pos: u64, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        debug_assert!(buf.len() as u64 <= self.size);

        let start = (pos & self.mask) as usize;
        let size = self.size as usize;

        unsafe {
            if start + buf.len() <= size {
                // Data is contiguous
                ptr::copy_nonoverlapping(
                    self.data.as_ptr().add(start),
                    buf.as_mut_ptr(),
                    buf.len(),
                );
            } else {
                // Data wraps around buffer end
                let first_len = size - start;
                ptr::copy_nonoverlapping(self.data.as_ptr().add(start), buf.as_mut_ptr(), first_len);
                ptr::copy_nonoverlapping(
                    self.data.as_ptr(),
                    buf.as_mut_ptr().add(first_len),
                    buf.len() - first_len,
                );
            }
        }
    }

    pub(crate) fn meta_ptr(&self) -> NonNull<PerfEventMmapPage> {
        self.meta
    }

    pub(crate) fn data_ptr(&self) -> NonNull<u8> {
        self.data
    }
}
