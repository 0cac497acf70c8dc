use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use log::{debug, error, warn};
use oa::{records, RawReport, Record, SimulatedOa, RECORD_HEADER_SIZE};

/// Where an OA stream's records come from
pub trait OaSource {
    /// Reads whole records into `buf`. Ok(0) or `WouldBlock` mean nothing is
    /// available right now.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn has_pending_data(&self) -> bool;

    /// Descriptor to watch for readiness, if any
    fn fd(&self) -> Option<RawFd>;
}

/// An i915 perf stream file descriptor
pub struct OaFile {
    file: File,
}

impl OaFile {
    pub fn new(fd: OwnedFd) -> Self {
        Self { file: File::from(fd) }
    }
}

impl OaSource for OaFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn has_pending_data(&self) -> bool {
        poll_readable(self.file.as_raw_fd())
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }
}

/// Checks without blocking whether `fd` has data to read
pub(crate) fn poll_readable(fd: RawFd) -> bool {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pollfd, 1, 0) };
        if ret < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return ret > 0 && pollfd.revents & libc::POLLIN != 0;
    }
}

/// Generated records, for running without hardware
pub struct SimulatedSource {
    oa: SimulatedOa,
}

impl SimulatedSource {
    pub fn new(oa: SimulatedOa) -> Self {
        Self { oa }
    }

    pub fn generated(&self) -> u64 {
        self.oa.generated()
    }
}

impl OaSource for SimulatedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.oa.fill(buf))
    }

    fn has_pending_data(&self) -> bool {
        self.oa.pending_records() > 0
    }

    fn fd(&self) -> Option<RawFd> {
        None
    }
}

/// Consumes consecutive report pairs of an OA stream
pub trait ReportHandler {
    /// Called for every sample with the sample before it
    fn handle_pair(&mut self, prev: &RawReport<'_>, next: &RawReport<'_>);

    /// The kernel dropped every buffered report
    fn buffer_lost(&mut self) {}
}

impl<F> ReportHandler for F
where
    F: FnMut(&RawReport<'_>, &RawReport<'_>),
{
    fn handle_pair(&mut self, prev: &RawReport<'_>, next: &RawReport<'_>) {
        self(prev, next)
    }
}

/// Counts of what an OA stream has read
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OaStats {
    pub reads: u64,
    pub samples: u64,
    pub buffer_lost: u64,
    pub report_lost: u64,
    pub unknown_records: u64,
    pub corrupt_chunks: u64,
}

/// Reads OA records and hands each sample to a handler together with the
/// sample before it, even when the two arrived in different reads.
///
/// Reads alternate between two buffers so the last report of one read stays
/// valid while the next read fills the other buffer.
pub struct OaBackend {
    source: Box<dyn OaSource>,
    bufs: [Vec<u8>; 2],
    // Buffer, offset and length of the most recent report
    last: Option<(usize, usize, usize)>,
    handler: Box<dyn ReportHandler>,
    stats: OaStats,
}

impl OaBackend {
    pub fn new(source: Box<dyn OaSource>, buffer_size: usize, handler: Box<dyn ReportHandler>) -> Self {
        Self {
            source,
            bufs: [vec![0; buffer_size], vec![0; buffer_size]],
            last: None,
            handler,
            stats: OaStats::default(),
        }
    }

    /// Reads until the source has nothing more to give
    pub fn drain(&mut self) {
        loop {
            let buf_idx = match self.last {
                Some((idx, ..)) => idx ^ 1,
                None => 0,
            };

            let count = match self.source.read(&mut self.bufs[buf_idx]) {
                Ok(0) => break,
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Error reading i915 OA event stream: {}", e);
                    break;
                }
            };

            self.stats.reads += 1;
            self.process_chunk(buf_idx, count);
        }
    }

    fn process_chunk(&mut self, buf_idx: usize, count: usize) {
        let Self {
            bufs,
            last,
            handler,
            stats,
            ..
        } = self;

        for record in records(&bufs[buf_idx][..count]) {
            let (offset, record) = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!("i915 perf: {}, dropping rest of chunk", e);
                    stats.corrupt_chunks += 1;
                    break;
                }
            };

            match record {
                Record::BufferLost => {
                    warn!("i915 perf: OA buffer error - all records lost");
                    stats.buffer_lost += 1;
                    handler.buffer_lost();
                }
                Record::ReportLost => {
                    debug!("i915 perf: OA report lost");
                    stats.report_lost += 1;
                }
                Record::Sample(body) => {
                    let next = match RawReport::new(body) {
                        Ok(report) => report,
                        Err(e) => {
                            warn!("i915 perf: {}", e);
                            continue;
                        }
                    };

                    if let Some((idx, off, len)) = *last {
                        if let Ok(prev) = RawReport::new(&bufs[idx][off..off + len]) {
                            handler.handle_pair(&prev, &next);
                        }
                    }

                    *last = Some((buf_idx, offset + RECORD_HEADER_SIZE, body.len()));
                    stats.samples += 1;
                }
                Record::Unknown(type_) => {
                    warn!("i915 perf: Spurious header type = {}", type_);
                    stats.unknown_records += 1;
                }
            }
        }
    }

    pub fn has_pending_data(&self) -> bool {
        self.source.has_pending_data()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.source.fd()
    }

    pub fn stats(&self) -> OaStats {
        self.stats
    }
}
