use crate::OaError;

const THREADS_PER_EU: u32 = 7;

/// GPU topology consulted by counter formulas.
///
/// Read-only once the engine is running; shared between streams.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeviceInfo {
    pub devid: u32,
    pub gen: u32,
    pub timestamp_frequency: u64,
    pub n_eus: u64,
    pub n_eu_slices: u64,
    pub n_eu_sub_slices: u64,
    pub eu_threads_count: u64,
    pub slice_mask: u64,
    pub subslice_mask: u64,
    pub gt_min_freq: u64,
    pub gt_max_freq: u64,
}

impl DeviceInfo {
    /// A Broadwell GT1-like device used when running without hardware
    pub fn simulated() -> Self {
        Self::from_topology(0x1616, 8, 10, 0x1, 0x1, 500, 1100)
    }

    /// Builds the device description from queried topology values
    pub fn from_topology(
        devid: u32,
        gen: u32,
        n_eus: u64,
        slice_mask: u64,
        subslice_mask: u64,
        gt_min_freq: u64,
        gt_max_freq: u64,
    ) -> Self {
        Self {
            devid,
            gen,
            timestamp_frequency: 12_500_000,
            n_eus,
            n_eu_slices: u64::from(slice_mask.count_ones()),
            n_eu_sub_slices: u64::from(subslice_mask.count_ones()),
            eu_threads_count: n_eus * u64::from(THREADS_PER_EU),
            slice_mask,
            subslice_mask,
            gt_min_freq,
            gt_max_freq,
        }
    }

    /// Sets one property by name, as forwarded from a remote device
    pub fn set_property(&mut self, name: &str, value: f64) -> Result<(), OaError> {
        let out_of_range = || OaError::PropertyOutOfRange {
            name: name.to_string(),
            value,
        };

        if value.is_nan() || value < 0.0 {
            return Err(out_of_range());
        }

        match name {
            "devid" | "gen" => {
                if value > f64::from(u32::MAX) {
                    return Err(out_of_range());
                }
                if name == "devid" {
                    self.devid = value as u32;
                } else {
                    self.gen = value as u32;
                }
            }
            "timestamp_frequency" => self.timestamp_frequency = value as u64,
            "n_eus" => self.n_eus = value as u64,
            "n_eu_slices" => self.n_eu_slices = value as u64,
            "n_eu_sub_slices" => self.n_eu_sub_slices = value as u64,
            "eu_threads_count" => self.eu_threads_count = value as u64,
            "slice_mask" => self.slice_mask = value as u64,
            "subslice_mask" => self.subslice_mask = value as u64,
            "gt_min_freq" => self.gt_min_freq = value as u64,
            "gt_max_freq" => self.gt_max_freq = value as u64,
            _ => return Err(OaError::UnknownProperty(name.to_string())),
        }
        Ok(())
    }
}
