use std::env;
use std::time::Duration;

use log::debug;

use crate::StreamError;

/// Largest record an i915 perf OA stream produces: header plus raw report
pub const MAX_OA_SAMPLE_SIZE: usize = 8 + 256;

/// Environment variable that switches the engine to simulated devices
pub const SIMULATED_ENV: &str = "GPU_STREAMS_SIMULATED";

/// Engine-wide stream settings
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Generate OA reports instead of opening the GPU
    pub simulated: bool,
    /// Size of each of the two OA read buffers
    pub oa_buffer_size: usize,
    /// How often a simulated OA stream is drained
    pub simulated_poll_interval: Duration,
    /// Data size of perf ring buffers, a power of two number of pages
    pub perf_buffer_size: usize,
    /// Window length after which accumulated OA deltas are emitted
    pub aggregation_period: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            simulated: false,
            oa_buffer_size: MAX_OA_SAMPLE_SIZE * 100,
            simulated_poll_interval: Duration::from_millis(1000),
            perf_buffer_size: 256 * 1024,
            aggregation_period: Duration::from_secs(1),
        }
    }
}

impl StreamConfig {
    /// Applies overrides from the environment
    pub fn apply_env(&mut self) {
        if let Ok(value) = env::var(SIMULATED_ENV) {
            self.simulated = value == "1";
            debug!("{}={}: simulated = {}", SIMULATED_ENV, value, self.simulated);
        }
    }

    /// Number of data pages of a perf ring of `perf_buffer_size` bytes
    pub fn perf_pages(&self, page_size: usize) -> Result<u32, StreamError> {
        let pages = self.perf_buffer_size / page_size.max(1);
        if pages == 0 || pages * page_size != self.perf_buffer_size || !pages.is_power_of_two() {
            return Err(StreamError::InvalidBufferSize(self.perf_buffer_size));
        }
        u32::try_from(pages).map_err(|_| StreamError::InvalidBufferSize(self.perf_buffer_size))
    }
}
