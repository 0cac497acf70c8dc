use std::os::fd::RawFd;
use std::slice;

use crate::Storage;
use crate::StorageError;

/// Memory-based ring storage implementation
///
/// Backs simulated streams and tests. The buffer is allocated as `u64`
/// words so the metadata page's atomics are properly aligned.
pub struct MemoryStorage {
    words: Vec<u64>,
    n_data_pages: u32,
    page_size: u64,
}

impl MemoryStorage {
    /// Create a new memory-based ring storage using the system page size
    pub fn new(n_pages: u32) -> Result<Self, StorageError> {
        Self::with_page_size(n_pages, page_size::get() as u64)
    }

    /// Create a new memory-based ring storage with an explicit page size.
    ///
    /// The page size must be at least as large as the metadata page
    /// structure when the storage is handed to a ring.
    pub fn with_page_size(n_pages: u32, page_size: u64) -> Result<Self, StorageError> {
        if n_pages == 0 || !n_pages.is_power_of_two() {
            return Err(StorageError::InvalidPageCount(n_pages));
        }

        // The metadata page is always a full 4KiB-compatible page in memory so
        // the cursors are addressable even with tiny test pages.
        let meta_len = page_size.max(std::mem::size_of::<crate::PerfEventMmapPage>() as u64);
        let total_size = meta_len + page_size * u64::from(n_pages);
        let words = vec![0u64; total_size.div_ceil(8) as usize];

        let mut storage = MemoryStorage {
            words,
            n_data_pages: n_pages,
            page_size,
        };

        // Point data_offset past the (possibly enlarged) metadata page
        if meta_len != page_size {
            let meta = storage.data_mut().as_mut_ptr() as *mut crate::PerfEventMmapPage;
            unsafe {
                (*meta).data_offset = meta_len;
                (*meta).data_size = page_size * u64::from(n_pages);
            }
        }

        Ok(storage)
    }
}

impl Storage for MemoryStorage {
    fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.words.as_ptr() as *const u8, self.words.len() * 8) }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.words.len() * 8) }
    }

    fn num_data_pages(&self) -> u32 {
        self.n_data_pages
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn file_descriptor(&self) -> RawFd {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PerfRing;

    #[test]
    fn test_memory_storage() {
        let n_pages = 2;
        let storage = MemoryStorage::new(n_pages).unwrap();

        // Check basic properties
        assert_eq!(storage.num_data_pages(), n_pages);
        assert_eq!(storage.page_size(), page_size::get() as u64);

        let expected_size = storage.page_size() * (1 + u64::from(n_pages));
        assert_eq!(storage.data().len() as u64, expected_size);
        assert_eq!(storage.data().as_ptr() as usize % 8, 0);

        assert_eq!(storage.file_descriptor(), -1);
    }

    #[test]
    fn test_small_pages_keep_metadata_intact() {
        let mut storage = MemoryStorage::with_page_size(1, 64).unwrap();
        let pages = storage.num_data_pages();
        let page_size = storage.page_size();
        let ring = unsafe { PerfRing::init_contiguous(storage.data_mut(), pages, page_size).unwrap() };
        assert_eq!(ring.size(), 64);
    }

    #[test]
    fn test_rejects_non_power_of_two_pages() {
        assert!(matches!(
            MemoryStorage::with_page_size(3, 4096),
            Err(StorageError::InvalidPageCount(3))
        ));
    }
}
