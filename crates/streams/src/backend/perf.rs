use std::os::fd::RawFd;

use log::warn;
use perf_ring::{
    walk_records, HeaderOffsetTracker, PerfRing, Storage, WalkSummary, PERF_RECORD_LOST,
};

use crate::StreamError;

/// Receives every record of a perf ring: type, misc flags and payload
pub type RecordHook = Box<dyn FnMut(u32, u16, &[u8])>;

/// Consumes the ring of a perf event (tracepoint or generic counter)
pub struct PerfBackend {
    ring: PerfRing,
    // Memory behind `ring`
    storage: Box<dyn Storage>,
    tracker: Option<HeaderOffsetTracker>,
    hook: Option<RecordHook>,
    payload: Vec<u8>,
    records: u64,
    lost: u64,
}

impl PerfBackend {
    /// Attaches to the ring held by `storage`.
    ///
    /// Record offsets are tracked only when a `tracker` is given, which is
    /// the case for streams opened in flight-recorder mode.
    pub fn new(
        mut storage: Box<dyn Storage>,
        tracker: Option<HeaderOffsetTracker>,
        hook: Option<RecordHook>,
    ) -> Result<Self, StreamError> {
        let n_pages = storage.num_data_pages();
        let page_size = storage.page_size();
        // Safety: the storage is boxed and owned by the backend, so the
        // memory stays put for as long as the ring
        let ring = unsafe { PerfRing::init_contiguous(storage.data_mut(), n_pages, page_size)? };

        Ok(Self {
            ring,
            storage,
            tracker,
            hook,
            payload: Vec::new(),
            records: 0,
            lost: 0,
        })
    }

    /// Consumes everything the kernel published since the last drain
    pub fn drain(&mut self) -> WalkSummary {
        let Self {
            ring,
            tracker,
            hook,
            payload,
            lost,
            ..
        } = self;

        let summary = walk_records(ring, tracker.as_mut(), |record| {
            let header = record.header();
            if header.type_ == PERF_RECORD_LOST {
                record.copy_payload(payload);
                // id, then the number of lost records
                let count = payload
                    .get(8..16)
                    .and_then(|bytes| bytes.try_into().ok())
                    .map_or(0, u64::from_ne_bytes);
                warn!("perf: {} records lost", count);
                *lost += count;
            }

            if let Some(hook) = hook.as_mut() {
                record.copy_payload(payload);
                hook(header.type_, header.misc, &payload[..]);
            }
        });

        self.records += summary.records as u64;
        summary
    }

    pub fn has_pending_data(&self) -> bool {
        self.ring.has_data()
    }

    pub fn fd(&self) -> Option<RawFd> {
        let fd = self.storage.file_descriptor();
        (fd >= 0).then_some(fd)
    }

    pub fn ring(&self) -> &PerfRing {
        &self.ring
    }

    pub fn tracker(&self) -> Option<&HeaderOffsetTracker> {
        self.tracker.as_ref()
    }

    /// Records consumed over the stream's lifetime
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Records the kernel reported as lost
    pub fn lost(&self) -> u64 {
        self.lost
    }
}
