/// Nanoseconds per raw report timestamp tick
pub const TIMESTAMP_PERIOD_NS: u64 = 80;

/// Extends the 32-bit report timestamps into a monotonic 64-bit nanosecond
/// clock.
///
/// The raw timestamp wraps roughly every 5.7 minutes. As long as reports are
/// fed in order and less than half a wrap apart, every wrap is accounted for.
#[derive(Debug, Default, Clone)]
pub struct ReportClock {
    last_raw: Option<u32>,
    ticks: u64,
}

impl ReportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the last seen timestamp; the next one restarts the clock
    pub fn reset(&mut self) {
        self.last_raw = None;
        self.ticks = 0;
    }

    pub fn is_initialized(&self) -> bool {
        self.last_raw.is_some()
    }

    /// Advances the clock to the raw timestamp `raw` and returns it in
    /// nanoseconds. A timestamp behind the last one does not move the clock.
    pub fn advance(&mut self, raw: u32) -> u64 {
        match self.last_raw {
            None => {
                self.ticks = u64::from(raw);
                self.last_raw = Some(raw);
            }
            Some(last) => {
                let step = raw.wrapping_sub(last);
                if step <= u32::MAX / 2 {
                    self.ticks += u64::from(step);
                    self.last_raw = Some(raw);
                }
            }
        }
        self.ticks * TIMESTAMP_PERIOD_NS
    }
}
