//! Stream openers. Each either returns a stream registered with the reactor
//! or an error, with nothing left behind.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use oa::SimulatedOa;
use perf_ring::{
    open_perf_event, HeaderOffsetTracker, MmapStorage, PerfEventAttrBuilder, PERF_EVENT_HEADER_SIZE,
};

use crate::i915::{self, OaOpenRequest};
use crate::{
    Backend, CpuBackend, CpuStatSource, EngineContext, OaBackend, OaFile, OaSource, PerfBackend,
    ProcStat, ReadySource, RecordHook, ReportHandler, SimulatedSource, Stream, StreamError,
};

/// Where tracefs lists the tracepoints
pub const TRACEFS_EVENTS: &str = "/sys/kernel/debug/tracing/events";

// Sample payload of a tracepoint: time, raw size, raw data
const TRACEPOINT_SAMPLE_OVERHEAD: usize = 8 + 8;
// Sample payload of a counter: time and value
const COUNTER_SAMPLE_SIZE: usize = 16;

/// Reads the id of tracepoint `system:event` under a tracefs events directory
pub fn read_tracepoint_id(events_dir: &Path, system: &str, event: &str) -> Result<u64, StreamError> {
    let path = events_dir.join(system).join(event).join("id");
    let text = fs::read_to_string(&path).map_err(|source| {
        if source.kind() == io::ErrorKind::PermissionDenied {
            StreamError::TracepointPermission {
                system: system.to_string(),
                event: event.to_string(),
            }
        } else {
            StreamError::Tracepoint {
                system: system.to_string(),
                event: event.to_string(),
                source,
            }
        }
    })?;

    text.trim().parse().map_err(|_| StreamError::Parse {
        path: path.display().to_string(),
        value: text.trim().to_string(),
    })
}

impl EngineContext {
    /// Opens a stream of OA reports for metric set `guid`, sampling every
    /// `2^(period_exponent + 1)` timestamp ticks. Report pairs go to
    /// `handler`. With `ctx`, only that GPU context is sampled.
    pub fn open_oa_stream(
        &self,
        guid: &str,
        period_exponent: u32,
        ctx: Option<u32>,
        handler: Box<dyn ReportHandler>,
        overwrite: bool,
    ) -> Result<Stream, StreamError> {
        if overwrite {
            return Err(StreamError::FlightRecorderUnsupported);
        }

        let metric_set = self.metric_set(guid)?;
        let metrics_set_id = self
            .metrics
            .kernel_metrics_set_id(guid)
            .ok_or_else(|| StreamError::UnsupportedMetricSet(guid.to_string()))?;
        let ctx = ctx
            .map(|id| self.lookup_ctx_handle(id).ok_or(StreamError::UnknownContext(id)))
            .transpose()?;

        let (source, ready): (Box<dyn OaSource>, ReadySource) = match &self.drm {
            Some(drm) if !self.config.simulated => {
                let request = OaOpenRequest {
                    metrics_set_id,
                    format: metric_set.format,
                    period_exponent,
                    ctx,
                };
                let fd = i915::open_oa_stream(drm.fd(), &request)?;
                let file = OaFile::new(fd);
                let ready = ReadySource::Readable(file.fd().ok_or(StreamError::NoRenderNode)?);
                (Box::new(file), ready)
            }
            _ => {
                let oa = SimulatedOa::new(period_exponent, self.device.n_eus, self.time.clone())?;
                debug!("simulated OA stream, period {} ns", oa.period_ns());
                (
                    Box::new(SimulatedSource::new(oa)),
                    ReadySource::Timer(self.config.simulated_poll_interval),
                )
            }
        };

        info!(
            "opening OA stream for {} ({}), exponent {}",
            metric_set.name, guid, period_exponent
        );
        let backend = OaBackend::new(source, self.config.oa_buffer_size, handler);
        Stream::open(
            self.reactor.clone(),
            Backend::Oa(backend),
            ready,
            ctx.is_some(),
        )
    }

    /// Opens tracepoint `system:event` whose raw data is
    /// `trace_struct_size` bytes
    #[allow(clippy::too_many_arguments)]
    pub fn open_tracepoint(
        &self,
        pid: i32,
        cpu: i32,
        system: &str,
        event: &str,
        trace_struct_size: usize,
        hook: Option<RecordHook>,
        overwrite: bool,
    ) -> Result<Stream, StreamError> {
        let id = read_tracepoint_id(Path::new(TRACEFS_EVENTS), system, event)?;
        debug!("tracepoint {}:{} has id {}", system, event, id);

        let watermark = u32::try_from(self.config.perf_buffer_size / 4).unwrap_or(u32::MAX);
        let attr = PerfEventAttrBuilder::tracepoint(id)
            .wakeup_watermark(watermark)
            .build();
        let sample_size = PERF_EVENT_HEADER_SIZE + TRACEPOINT_SAMPLE_OVERHEAD + trace_struct_size;
        self.open_perf_ring(attr, pid, cpu, sample_size, hook, overwrite)
    }

    /// Opens a generic perf counter of `type_` and `config`
    pub fn open_generic_counter(
        &self,
        pid: i32,
        cpu: i32,
        type_: u32,
        config: u64,
        hook: Option<RecordHook>,
        overwrite: bool,
    ) -> Result<Stream, StreamError> {
        let attr = PerfEventAttrBuilder::counter(type_, config).build();
        let sample_size = PERF_EVENT_HEADER_SIZE + COUNTER_SAMPLE_SIZE;
        self.open_perf_ring(attr, pid, cpu, sample_size, hook, overwrite)
    }

    fn open_perf_ring(
        &self,
        mut attr: perf_event_open_sys::bindings::perf_event_attr,
        pid: i32,
        cpu: i32,
        sample_size: usize,
        hook: Option<RecordHook>,
        overwrite: bool,
    ) -> Result<Stream, StreamError> {
        let n_pages = self.config.perf_pages(page_size::get())?;
        let fd = open_perf_event(&mut attr, pid, cpu)?;
        let storage = MmapStorage::map(fd, n_pages)?;
        let ready = ReadySource::Readable(perf_ring::Storage::file_descriptor(&storage));

        let tracker = overwrite.then(|| {
            HeaderOffsetTracker::for_ring(self.config.perf_buffer_size as u64, sample_size)
        });
        let backend = PerfBackend::new(Box::new(storage), tracker, hook)?;
        Stream::open(self.reactor.clone(), Backend::Perf(backend), ready, false)
    }

    /// Samples `/proc/stat` every `period_ms` milliseconds
    pub fn open_cpu_stats(&self, overwrite: bool, period_ms: u64) -> Result<Stream, StreamError> {
        let source = ProcStat::new()?;
        self.open_cpu_stats_with(Box::new(source), overwrite, period_ms)
    }

    /// Samples `source` every `period_ms` milliseconds
    pub fn open_cpu_stats_with(
        &self,
        source: Box<dyn CpuStatSource>,
        overwrite: bool,
        period_ms: u64,
    ) -> Result<Stream, StreamError> {
        let period_ms = period_ms.max(1);
        let backend = CpuBackend::new(source, period_ms, overwrite);
        debug!(
            "CPU stats stream: {} CPUs, {} rows",
            backend.n_cpus(),
            backend.n_rows()
        );
        Stream::open(
            self.reactor.clone(),
            Backend::Cpu(backend),
            ReadySource::Timer(Duration::from_millis(period_ms)),
            false,
        )
    }
}
