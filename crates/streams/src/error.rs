use std::io;

use thiserror::Error;

/// Errors reported by a reactor
#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("cannot watch invalid file descriptor {0}")]
    InvalidFd(i32),
}

/// Errors reported when opening or driving a stream
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("ring storage error: {0}")]
    Storage(#[from] perf_ring::StorageError),

    #[error("ring error: {0}")]
    Ring(#[from] perf_ring::PerfRingError),

    #[error("{0}")]
    PerfEvent(#[from] perf_ring::PerfEventError),

    #[error("OA error: {0}")]
    Oa(#[from] oa::OaError),

    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),

    #[error("error opening i915 perf OA stream: {0}")]
    OaOpen(#[source] io::Error),

    #[error("permission denied to open tracepoint {system}:{event} (tracepoints require root privileges)")]
    TracepointPermission { system: String, event: String },

    #[error("failed to open tracepoint {system}:{event}: {source}")]
    Tracepoint {
        system: String,
        event: String,
        #[source]
        source: io::Error,
    },

    #[error("unknown metric set {0}")]
    UnknownMetricSet(String),

    #[error("metric set {0} is not supported by this device")]
    UnsupportedMetricSet(String),

    #[error("no GPU context handle {0}")]
    UnknownContext(u32),

    #[error("unable to find a GPU context")]
    NoContext,

    #[error("flight-recorder (overwrite) mode is not supported for OA streams")]
    FlightRecorderUnsupported,

    #[error("perf buffer size {0} is not a power of two number of pages")]
    InvalidBufferSize(usize),

    #[error("no i915 render node found")]
    NoRenderNode,

    #[error("malformed value in {path}: {value:?}")]
    Parse { path: String, value: String },
}
