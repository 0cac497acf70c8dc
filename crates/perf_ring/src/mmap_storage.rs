use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr;
use std::slice;

use libc::{c_void, mmap, munmap, MAP_SHARED, PROT_READ, PROT_WRITE};

use crate::{Storage, StorageError};

/// Memory-mapped ring storage for a perf event file descriptor
///
/// The mapping is read/write, so the kernel stops writing (and reports lost
/// records) when the consumer falls behind instead of overwriting.
///
/// This implementation is only available on Linux platforms.
pub struct MmapStorage {
    data: *mut u8,
    data_len: usize,
    n_data_pages: u32,
    page_size: u64,
    fd: OwnedFd,
}

impl MmapStorage {
    /// Maps the ring of an already opened perf event
    ///
    /// # Arguments
    ///
    /// * `fd` - The perf event; the storage takes ownership and closes it on drop
    /// * `n_pages` - Number of data pages in the ring buffer, a power of two
    pub fn map(fd: OwnedFd, n_pages: u32) -> Result<Self, StorageError> {
        if n_pages == 0 || !n_pages.is_power_of_two() {
            return Err(StorageError::InvalidPageCount(n_pages));
        }
        let page_size = page_size::get() as u64;

        // 1 metadata page + data pages
        let total_size = (page_size * (1 + u64::from(n_pages))) as usize;
        let data_ptr = unsafe {
            mmap(
                ptr::null_mut(),
                total_size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if data_ptr == libc::MAP_FAILED {
            // fd is closed when dropped here
            return Err(StorageError::OsError(io::Error::last_os_error()));
        }

        Ok(MmapStorage {
            data: data_ptr as *mut u8,
            data_len: total_size,
            n_data_pages: n_pages,
            page_size,
            fd,
        })
    }
}

impl Storage for MmapStorage {
    fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.data, self.data_len) }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.data, self.data_len) }
    }

    fn num_data_pages(&self) -> u32 {
        self.n_data_pages
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn file_descriptor(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for MmapStorage {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe {
                let _ = munmap(self.data as *mut c_void, self.data_len);
            }
            self.data = ptr::null_mut();
        }

        // The fd will be closed when the OwnedFd is dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{open_perf_event, PerfEventAttrBuilder};

    #[test]
    fn test_mmap_storage() {
        let n_pages = 2;
        let mut attr = PerfEventAttrBuilder::software_clock().build();
        let fd = match open_perf_event(&mut attr, 0, -1) {
            Ok(fd) => fd,
            Err(e) => {
                // If test is run on a platform that doesn't support perf_event_open,
                // skip the test instead of failing
                println!("Skipping test due to error: {}", e);
                return;
            }
        };
        let storage = match MmapStorage::map(fd, n_pages) {
            Ok(s) => s,
            Err(e) => {
                println!("Skipping test due to error: {}", e);
                return;
            }
        };

        // Check basic properties
        assert_eq!(storage.num_data_pages(), n_pages);
        assert_eq!(storage.page_size(), page_size::get() as u64);

        let expected_size = storage.page_size() * (1 + u64::from(n_pages));
        assert_eq!(storage.data().len() as u64, expected_size);

        assert!(storage.file_descriptor() > 0);
    }
}
