use std::fs;
use std::path::Path;
use std::rc::Rc;

use log::{debug, info, warn};
use oa::{DeviceInfo, MetricRegistry, MetricSet, MonotonicTime, TimeSource};

use crate::i915::{read_sysfs_u64, CtxHandle, DrmDevice};
use crate::{Reactor, StreamConfig, StreamError};

/// Everything streams share: the reactor they register with, the device,
/// the metric sets it supports and the GPU contexts streams can target.
pub struct EngineContext {
    pub(crate) reactor: Rc<dyn Reactor>,
    pub(crate) config: StreamConfig,
    pub(crate) device: Rc<DeviceInfo>,
    pub(crate) metrics: MetricRegistry,
    // Most recently added last
    ctx_handles: Vec<CtxHandle>,
    pub(crate) drm: Option<DrmDevice>,
    pub(crate) time: Rc<dyn TimeSource>,
}

impl EngineContext {
    /// Opens the GPU, or sets up a simulated one when configured to
    pub fn new(reactor: Rc<dyn Reactor>, config: StreamConfig) -> Result<Self, StreamError> {
        if config.simulated {
            return Ok(Self::simulated(reactor, config));
        }

        let drm = DrmDevice::open()?;
        let device = drm.device_info()?;
        let mut metrics = MetricRegistry::with_builtin();
        let supported = enumerate_metrics(&drm.sysfs_dir().join("metrics"), &mut metrics)?;
        info!(
            "device {:#x}: {} EUs, {} of {} metric sets supported",
            device.devid,
            device.n_eus,
            supported,
            metrics.len()
        );

        Ok(Self {
            reactor,
            config,
            device: Rc::new(device),
            metrics,
            ctx_handles: Vec::new(),
            drm: Some(drm),
            time: Rc::new(MonotonicTime::new()),
        })
    }

    /// A simulated device on which every built-in metric set is supported
    pub fn simulated(reactor: Rc<dyn Reactor>, config: StreamConfig) -> Self {
        let mut metrics = MetricRegistry::with_builtin();
        let guids: Vec<String> = metrics.guids().into_iter().map(str::to_string).collect();
        for (id, guid) in guids.iter().enumerate() {
            metrics.mark_supported(guid, id as u64);
        }
        info!("simulated device, {} metric sets", metrics.len());

        Self {
            reactor,
            config: StreamConfig {
                simulated: true,
                ..config
            },
            device: Rc::new(DeviceInfo::simulated()),
            metrics,
            ctx_handles: Vec::new(),
            drm: None,
            time: Rc::new(MonotonicTime::new()),
        }
    }

    /// Replaces the clock simulated streams generate reports against
    pub fn with_time_source(mut self, time: Rc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn reactor(&self) -> &Rc<dyn Reactor> {
        &self.reactor
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn is_simulated(&self) -> bool {
        self.config.simulated
    }

    pub fn device(&self) -> Rc<DeviceInfo> {
        Rc::clone(&self.device)
    }

    pub fn metrics(&self) -> &MetricRegistry {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut MetricRegistry {
        &mut self.metrics
    }

    /// The metric set `guid`, if the device supports it
    pub fn metric_set(&self, guid: &str) -> Result<Rc<MetricSet>, StreamError> {
        let metric_set = self
            .metrics
            .get(guid)
            .ok_or_else(|| StreamError::UnknownMetricSet(guid.to_string()))?;
        if self.metrics.kernel_metrics_set_id(guid).is_none() {
            return Err(StreamError::UnsupportedMetricSet(guid.to_string()));
        }
        Ok(metric_set)
    }

    /// Registers a GPU context created on `fd`
    pub fn add_ctx_handle(&mut self, fd: i32, id: u32) {
        debug!("adding ctx handle {} (fd {})", id, fd);
        self.ctx_handles.retain(|ctx| ctx.id != id);
        self.ctx_handles.push(CtxHandle { id, fd });
    }

    pub fn remove_ctx_handle(&mut self, id: u32) -> bool {
        let before = self.ctx_handles.len();
        self.ctx_handles.retain(|ctx| ctx.id != id);
        before != self.ctx_handles.len()
    }

    pub fn lookup_ctx_handle(&self, id: u32) -> Option<CtxHandle> {
        self.ctx_handles.iter().find(|ctx| ctx.id == id).copied()
    }

    /// The most recently added context
    pub fn first_available_ctx(&self) -> Result<CtxHandle, StreamError> {
        self.ctx_handles.last().copied().ok_or(StreamError::NoContext)
    }
}

/// Marks the sets listed under a `/sys/class/drm/cardN/metrics` directory as
/// supported, with the id the kernel knows them by. Sets the kernel has but
/// the registry lacks are skipped. Returns the number marked.
pub fn enumerate_metrics(dir: &Path, registry: &mut MetricRegistry) -> Result<usize, StreamError> {
    let mut supported = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(guid) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if guid.starts_with('.') {
            continue;
        }
        if registry.get(&guid).is_none() {
            debug!("kernel metric set {} has no descriptor", guid);
            continue;
        }

        match read_sysfs_u64(&entry.path().join("id")) {
            Ok(id) => {
                registry.mark_supported(&guid, id);
                supported += 1;
            }
            Err(e) => warn!("metric set {}: {}", guid, e),
        }
    }
    Ok(supported)
}
