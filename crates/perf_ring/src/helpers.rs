//! Perf event opening utilities.
//!
//! This module provides functions for building perf event attributes and
//! opening the events whose rings are consumed by this crate.

use perf_event_open_sys as sys;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

/// Error type for perf event operations
#[derive(Debug, thiserror::Error)]
pub enum PerfEventError {
    /// Error opening perf event
    #[error("failed to open perf event (pid {pid}, cpu {cpu}): {source}")]
    OpenError {
        /// Process being monitored (-1 for all)
        pid: i32,
        /// CPU where the error occurred
        cpu: i32,
        /// Source error
        source: io::Error,
    },
}

/// Builder for the perf event attributes used by ring-backed streams
pub struct PerfEventAttrBuilder {
    attr: sys::bindings::perf_event_attr,
}

impl PerfEventAttrBuilder {
    fn base(type_: u32, config: u64) -> Self {
        let mut attr = sys::bindings::perf_event_attr::default();
        attr.size = std::mem::size_of::<sys::bindings::perf_event_attr>() as u32;
        attr.type_ = type_;
        attr.config = config;
        attr.__bindgen_anon_1.sample_period = 1;
        Self { attr }
    }

    /// A tracepoint identified by its id from tracefs, sampling raw data and time
    pub fn tracepoint(id: u64) -> Self {
        let mut builder = Self::base(sys::bindings::PERF_TYPE_TRACEPOINT, id);
        builder.attr.sample_type =
            (sys::bindings::PERF_SAMPLE_RAW | sys::bindings::PERF_SAMPLE_TIME) as u64;
        builder
    }

    /// A generic counter of the given perf type and config, sampling its value and time
    pub fn counter(type_: u32, config: u64) -> Self {
        let mut builder = Self::base(type_, config);
        builder.attr.sample_type =
            (sys::bindings::PERF_SAMPLE_READ | sys::bindings::PERF_SAMPLE_TIME) as u64;
        builder
    }

    /// The software cpu-clock event, available without special privileges
    pub fn software_clock() -> Self {
        Self::counter(
            sys::bindings::PERF_TYPE_SOFTWARE,
            sys::bindings::PERF_COUNT_SW_CPU_CLOCK as u64,
        )
    }

    /// Wake up the consumer after `bytes` bytes instead of on every event
    pub fn wakeup_watermark(mut self, bytes: u32) -> Self {
        if bytes > 0 {
            self.attr.set_watermark(1);
            self.attr.__bindgen_anon_2.wakeup_watermark = bytes;
        } else {
            self.attr.set_watermark(0);
            self.attr.__bindgen_anon_2.wakeup_events = 1; // Wake up on every event
        }
        self
    }

    pub fn build(self) -> sys::bindings::perf_event_attr {
        self.attr
    }
}

/// Opens a perf event and returns the owned file descriptor.
///
/// # Arguments
///
/// * `attr` - Perf event attributes
/// * `pid` - Process to monitor, -1 for all processes
/// * `cpu` - CPU to monitor, -1 for any CPU
pub fn open_perf_event(
    attr: &mut sys::bindings::perf_event_attr,
    pid: i32,
    cpu: i32,
) -> Result<OwnedFd, PerfEventError> {
    let fd = unsafe {
        sys::perf_event_open(
            attr,
            pid,
            cpu,
            -1, // group_fd
            sys::bindings::PERF_FLAG_FD_CLOEXEC as u64,
        )
    };

    if fd < 0 {
        return Err(PerfEventError::OpenError {
            pid,
            cpu,
            source: io::Error::last_os_error(),
        });
    }

    // Take ownership of the file descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracepoint_attr() {
        let attr = PerfEventAttrBuilder::tracepoint(42).wakeup_watermark(4096).build();
        assert_eq!(attr.type_, sys::bindings::PERF_TYPE_TRACEPOINT);
        assert_eq!(attr.config, 42);
        assert_eq!(attr.watermark(), 1);
        assert_eq!(
            attr.sample_type,
            (sys::bindings::PERF_SAMPLE_RAW | sys::bindings::PERF_SAMPLE_TIME) as u64
        );
    }

    #[test]
    fn test_counter_attr() {
        let attr = PerfEventAttrBuilder::counter(sys::bindings::PERF_TYPE_HARDWARE, 0)
            .wakeup_watermark(0)
            .build();
        assert_eq!(attr.type_, sys::bindings::PERF_TYPE_HARDWARE);
        assert_eq!(attr.watermark(), 0);
        assert_eq!(
            attr.sample_type,
            (sys::bindings::PERF_SAMPLE_READ | sys::bindings::PERF_SAMPLE_TIME) as u64
        );
    }
}
