use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use log::warn;

use crate::{gen8_deltas, DeviceInfo, OaFormat};

/// Largest integer a consumer holding values as doubles can represent exactly
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Formula reading one counter out of an accumulated delta array
pub type ReadFn<T> = Box<dyn Fn(&DeviceInfo, &MetricSet, &[u64]) -> T>;

/// How a counter is read, tagged by the type it produces
pub enum CounterRead {
    U64(ReadFn<u64>),
    U32(ReadFn<u32>),
    F32(ReadFn<f32>),
    F64(ReadFn<f64>),
    Bool(ReadFn<bool>),
}

impl CounterRead {
    pub fn u64(f: impl Fn(&DeviceInfo, &MetricSet, &[u64]) -> u64 + 'static) -> Self {
        CounterRead::U64(Box::new(f))
    }

    pub fn u32(f: impl Fn(&DeviceInfo, &MetricSet, &[u64]) -> u32 + 'static) -> Self {
        CounterRead::U32(Box::new(f))
    }

    pub fn f32(f: impl Fn(&DeviceInfo, &MetricSet, &[u64]) -> f32 + 'static) -> Self {
        CounterRead::F32(Box::new(f))
    }

    pub fn f64(f: impl Fn(&DeviceInfo, &MetricSet, &[u64]) -> f64 + 'static) -> Self {
        CounterRead::F64(Box::new(f))
    }

    pub fn bool(f: impl Fn(&DeviceInfo, &MetricSet, &[u64]) -> bool + 'static) -> Self {
        CounterRead::Bool(Box::new(f))
    }
}

/// A materialised counter value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CounterValue {
    U64(u64),
    U32(u32),
    F32(f32),
    F64(f64),
    Bool(bool),
}

impl CounterValue {
    pub fn as_f64(self) -> f64 {
        match self {
            CounterValue::U64(v) => v as f64,
            CounterValue::U32(v) => f64::from(v),
            CounterValue::F32(v) => f64::from(v),
            CounterValue::F64(v) => v,
            CounterValue::Bool(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterValue::U64(v) => write!(f, "{}", v),
            CounterValue::U32(v) => write!(f, "{}", v),
            CounterValue::F32(v) => write!(f, "{:.2}", v),
            CounterValue::F64(v) => write!(f, "{:.2}", v),
            CounterValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// Describes one logical counter of a metric set
pub struct CounterDescriptor {
    pub name: String,
    pub symbol_name: String,
    pub description: String,
    pub read: CounterRead,
    pub max: Option<ReadFn<u64>>,
}

impl CounterDescriptor {
    pub fn new(name: &str, symbol_name: &str, read: CounterRead) -> Self {
        Self {
            name: name.to_string(),
            symbol_name: symbol_name.to_string(),
            description: String::new(),
            read,
            max: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_max(mut self, f: impl Fn(&DeviceInfo, &MetricSet, &[u64]) -> u64 + 'static) -> Self {
        self.max = Some(Box::new(f));
        self
    }

    /// Reads the counter from `deltas`.
    ///
    /// Integer values beyond `MAX_SAFE_INTEGER` are clamped to it.
    pub fn read(&self, device: &DeviceInfo, metric_set: &MetricSet, deltas: &[u64]) -> CounterValue {
        match &self.read {
            CounterRead::U64(f) => {
                let value = f(device, metric_set, deltas);
                if value > MAX_SAFE_INTEGER {
                    warn!(
                        "Clamping counter too large to represent exactly: {} = {}",
                        self.symbol_name, value
                    );
                    CounterValue::U64(MAX_SAFE_INTEGER)
                } else {
                    CounterValue::U64(value)
                }
            }
            CounterRead::U32(f) => CounterValue::U32(f(device, metric_set, deltas)),
            CounterRead::F32(f) => CounterValue::F32(f(device, metric_set, deltas)),
            CounterRead::F64(f) => CounterValue::F64(f(device, metric_set, deltas)),
            CounterRead::Bool(f) => CounterValue::Bool(f(device, metric_set, deltas)),
        }
    }

    /// Upper bound of the counter for this window, 0 when it has none
    pub fn max(&self, device: &DeviceInfo, metric_set: &MetricSet, deltas: &[u64]) -> u64 {
        self.max
            .as_ref()
            .map_or(0, |f| f(device, metric_set, deltas))
    }
}

impl fmt::Debug for CounterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterDescriptor")
            .field("name", &self.name)
            .field("symbol_name", &self.symbol_name)
            .field("has_max", &self.max.is_some())
            .finish()
    }
}

/// A named hardware configuration and the counters derived from it
#[derive(Debug)]
pub struct MetricSet {
    pub guid: String,
    pub name: String,
    pub symbol_name: String,
    pub format: OaFormat,
    pub counters: Vec<CounterDescriptor>,
}

impl MetricSet {
    /// Index of the counter with the given symbol name
    pub fn counter_index(&self, symbol_name: &str) -> Option<usize> {
        self.counters
            .iter()
            .position(|counter| counter.symbol_name == symbol_name)
    }

    pub fn read_counter(&self, index: usize, device: &DeviceInfo, deltas: &[u64]) -> Option<CounterValue> {
        self.counters
            .get(index)
            .map(|counter| counter.read(device, self, deltas))
    }
}

/// Metric sets known to the engine, keyed by GUID.
///
/// A set is only usable for sampling once enumeration has marked it
/// supported and recorded the id the kernel knows it by.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    sets: HashMap<String, Rc<MetricSet>>,
    kernel_ids: HashMap<String, u64>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the metric sets built into this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(render_basic_gen8());
        registry
    }

    pub fn register(&mut self, metric_set: MetricSet) -> Rc<MetricSet> {
        let metric_set = Rc::new(metric_set);
        self.sets
            .insert(metric_set.guid.clone(), Rc::clone(&metric_set));
        metric_set
    }

    pub fn get(&self, guid: &str) -> Option<Rc<MetricSet>> {
        self.sets.get(guid).cloned()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// GUIDs of every registered set, sorted
    pub fn guids(&self) -> Vec<&str> {
        let mut guids: Vec<&str> = self.sets.keys().map(String::as_str).collect();
        guids.sort_unstable();
        guids
    }

    /// Records that the kernel supports `guid` under `kernel_id`. Returns
    /// false when no such set is registered.
    pub fn mark_supported(&mut self, guid: &str, kernel_id: u64) -> bool {
        if !self.sets.contains_key(guid) {
            return false;
        }
        self.kernel_ids.insert(guid.to_string(), kernel_id);
        true
    }

    pub fn kernel_metrics_set_id(&self, guid: &str) -> Option<u64> {
        self.kernel_ids.get(guid).copied()
    }

    /// GUIDs of the supported sets, sorted
    pub fn supported(&self) -> Vec<&str> {
        let mut guids: Vec<&str> = self.kernel_ids.keys().map(String::as_str).collect();
        guids.sort_unstable();
        guids
    }
}

/// GUID of the built-in basic render metric set for Gen8 devices
pub const RENDER_BASIC_GEN8_GUID: &str = "b541bd57-0e0f-4154-b4c0-5858010a2bf7";

fn percent_of_eu_cycles(device: &DeviceInfo, deltas: &[u64], counter: usize) -> f64 {
    let eu_cycles = device.n_eus as f64 * deltas[gen8_deltas::GPU_CLOCKS] as f64;
    if eu_cycles == 0.0 {
        return 0.0;
    }
    (deltas[counter] as f64 / eu_cycles * 100.0).min(100.0)
}

/// Basic render metrics for `A32u40A4u32B8C8` reports
pub fn render_basic_gen8() -> MetricSet {
    use gen8_deltas::*;

    let counters = vec![
        CounterDescriptor::new(
            "GPU Time Elapsed",
            "GpuTime",
            CounterRead::u64(|_, _, deltas| deltas[GPU_TIME]),
        )
        .with_description("Time elapsed on the GPU during the measurement, in ns"),
        CounterDescriptor::new(
            "GPU Core Clocks",
            "GpuCoreClocks",
            CounterRead::u64(|_, _, deltas| deltas[GPU_CLOCKS]),
        ),
        CounterDescriptor::new(
            "AVG GPU Core Frequency",
            "AvgGpuCoreFrequency",
            CounterRead::u64(|_, _, deltas| {
                if deltas[GPU_TIME] == 0 {
                    0
                } else {
                    let hz = u128::from(deltas[GPU_CLOCKS]) * 1_000_000_000
                        / u128::from(deltas[GPU_TIME]);
                    u64::try_from(hz).unwrap_or(u64::MAX)
                }
            }),
        )
        .with_max(|device, _, _| device.gt_max_freq * 1_000_000),
        CounterDescriptor::new(
            "EU Active",
            "EuActive",
            CounterRead::f32(|device, _, deltas| percent_of_eu_cycles(device, deltas, A + 7) as f32),
        )
        .with_max(|_, _, _| 100),
        CounterDescriptor::new(
            "EU Stall",
            "EuStall",
            CounterRead::f32(|device, _, deltas| percent_of_eu_cycles(device, deltas, A + 8) as f32),
        )
        .with_max(|_, _, _| 100),
        CounterDescriptor::new(
            "EU Thread Occupancy",
            "EuThreadOccupancy",
            CounterRead::f64(|device, _, deltas| {
                let thread_cycles = device.eu_threads_count as f64 * deltas[GPU_CLOCKS] as f64;
                if thread_cycles == 0.0 {
                    0.0
                } else {
                    (deltas[A + 13] as f64 / thread_cycles * 100.0).min(100.0)
                }
            }),
        )
        .with_max(|_, _, _| 100),
        CounterDescriptor::new(
            "VS Threads Dispatched",
            "VsThreads",
            CounterRead::u64(|_, _, deltas| deltas[A + 1]),
        ),
        CounterDescriptor::new(
            "Sampler Texels",
            "SamplerTexels",
            CounterRead::u32(|_, _, deltas| u32::try_from(deltas[C]).unwrap_or(u32::MAX)),
        ),
        CounterDescriptor::new(
            "Render Engine Busy",
            "RenderBusy",
            CounterRead::bool(|_, _, deltas| deltas[B] > 0),
        ),
    ];

    MetricSet {
        guid: RENDER_BASIC_GEN8_GUID.to_string(),
        name: "Render Metrics Basic Gen8".to_string(),
        symbol_name: "RenderBasic".to_string(),
        format: OaFormat::A32u40A4u32B8C8,
        counters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gen8_deltas::*;
    use log::Level;

    fn deltas_for(clocks: u64, n_eus: u64) -> Vec<u64> {
        let mut deltas = vec![0u64; OaFormat::A32u40A4u32B8C8.n_deltas()];
        deltas[GPU_TIME] = clocks * 2;
        deltas[GPU_CLOCKS] = clocks;
        for i in 0..32 {
            deltas[A + i] = clocks * n_eus;
        }
        deltas[A + 7] = clocks * n_eus / 4;
        deltas[C] = 12;
        deltas
    }

    #[test]
    fn test_render_basic_counters() {
        let device = DeviceInfo::simulated();
        let set = render_basic_gen8();
        let deltas = deltas_for(1000, device.n_eus);

        let read = |symbol: &str| {
            let index = set.counter_index(symbol).unwrap();
            set.read_counter(index, &device, &deltas).unwrap()
        };

        assert_eq!(read("GpuTime"), CounterValue::U64(2000));
        assert_eq!(read("GpuCoreClocks"), CounterValue::U64(1000));
        assert_eq!(read("AvgGpuCoreFrequency"), CounterValue::U64(500_000_000));
        assert_eq!(read("EuActive"), CounterValue::F32(25.0));
        assert_eq!(read("EuStall"), CounterValue::F32(100.0));
        assert_eq!(read("SamplerTexels"), CounterValue::U32(12));
        assert_eq!(read("RenderBusy"), CounterValue::Bool(false));

        match read("EuThreadOccupancy") {
            CounterValue::F64(v) => assert!((v - 100.0 / 7.0).abs() < 1e-9),
            other => panic!("unexpected value {:?}", other),
        }

        let freq = set.counter_index("AvgGpuCoreFrequency").unwrap();
        assert_eq!(set.counters[freq].max(&device, &set, &deltas), 1_100_000_000);
        assert_eq!(set.counters[0].max(&device, &set, &deltas), 0);
    }

    #[test]
    fn test_long_window_counters() {
        let device = DeviceInfo::simulated();
        let set = render_basic_gen8();
        let mut deltas = deltas_for(20_000_000_000, device.n_eus);
        deltas[GPU_TIME] = 20_000_000_000;

        let read = |symbol: &str| {
            let index = set.counter_index(symbol).unwrap();
            set.read_counter(index, &device, &deltas).unwrap()
        };

        assert_eq!(read("AvgGpuCoreFrequency"), CounterValue::U64(1_000_000_000));
        assert_eq!(read("EuActive"), CounterValue::F32(25.0));
        match read("EuThreadOccupancy") {
            CounterValue::F64(v) => assert!((v - 100.0 / 7.0).abs() < 1e-9),
            other => panic!("unexpected value {:?}", other),
        }

        let mut saturated = deltas.clone();
        saturated[GPU_CLOCKS] = u64::MAX;
        saturated[GPU_TIME] = 1;
        let freq = set.counter_index("AvgGpuCoreFrequency").unwrap();
        assert_eq!(
            set.read_counter(freq, &device, &saturated),
            Some(CounterValue::U64(MAX_SAFE_INTEGER))
        );
    }

    #[test]
    fn test_large_u64_values_are_clamped() {
        testing_logger::setup();
        let device = DeviceInfo::simulated();
        let set = render_basic_gen8();
        let mut deltas = deltas_for(1, 1);
        deltas[GPU_TIME] = u64::MAX;

        let value = set.read_counter(0, &device, &deltas).unwrap();
        assert_eq!(value, CounterValue::U64(MAX_SAFE_INTEGER));

        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert_eq!(captured_logs[0].level, Level::Warn);
            assert!(captured_logs[0].body.contains("GpuTime"));
        });
    }

    #[test]
    fn test_unknown_counter() {
        let set = render_basic_gen8();
        assert_eq!(set.counter_index("NoSuchCounter"), None);
        assert_eq!(
            set.read_counter(99, &DeviceInfo::simulated(), &deltas_for(1, 1)),
            None
        );
    }

    #[test]
    fn test_registry_support() {
        let mut registry = MetricRegistry::with_builtin();
        assert_eq!(registry.len(), 1);
        assert!(registry.supported().is_empty());

        assert!(registry.mark_supported(RENDER_BASIC_GEN8_GUID, 3));
        assert!(!registry.mark_supported("00000000-0000-0000-0000-000000000000", 4));

        assert_eq!(registry.kernel_metrics_set_id(RENDER_BASIC_GEN8_GUID), Some(3));
        assert_eq!(registry.supported(), vec![RENDER_BASIC_GEN8_GUID]);
        assert_eq!(
            registry.get(RENDER_BASIC_GEN8_GUID).unwrap().format,
            OaFormat::A32u40A4u32B8C8
        );
    }

    #[test]
    fn test_counter_value_as_f64() {
        assert_eq!(CounterValue::Bool(true).as_f64(), 1.0);
        assert_eq!(CounterValue::U32(7).as_f64(), 7.0);
        assert_eq!(CounterValue::F32(0.5).as_f64(), 0.5);
    }
}
