use std::io::Write;
use std::rc::Rc;

use log::error;
use oa::{CounterValue, MetricSet};
use streams::{UpdateReason, UpdateSink};
use time::macros::format_description;
use time::OffsetDateTime;

/// Prints every window of counter values as a block of text
pub struct PrintSink<W: Write> {
    metric_set: Rc<MetricSet>,
    out: W,
    windows: u64,
}

impl<W: Write> PrintSink<W> {
    pub fn new(metric_set: Rc<MetricSet>, out: W) -> Self {
        Self {
            metric_set,
            out,
            windows: 0,
        }
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    /// Windows printed so far
    pub fn windows(&self) -> u64 {
        self.windows
    }

    fn print(&mut self, line: String) {
        if let Err(e) = writeln!(self.out, "{}", line) {
            error!("Failed to print counter update: {}", e);
        }
    }
}

impl<W: Write> UpdateSink for PrintSink<W> {
    fn begin(&mut self, start_ns: u64, end_ns: u64, reason: UpdateReason) {
        let reason = match reason {
            UpdateReason::Period => "PERIOD",
            UpdateReason::ContextSwitchTo => "CTX_SWITCH_TO",
            UpdateReason::ContextSwitchAway => "CTX_SWITCH_AWAY",
        };
        let line = format!(
            "{} {}: {} start={} duration_ns={}",
            format_time(),
            reason,
            self.metric_set.symbol_name,
            start_ns,
            end_ns.saturating_sub(start_ns)
        );
        self.print(line);
    }

    fn counter_update(&mut self, index: usize, max: u64, value: CounterValue) {
        let name = self
            .metric_set
            .counters
            .get(index)
            .map_or("<unknown>", |counter| counter.symbol_name.as_str());
        let line = if max > 0 {
            format!("  {:<24} {:>16} (max {})", name, value, max)
        } else {
            format!("  {:<24} {:>16}", name, value)
        };
        self.print(line);
    }

    fn end(&mut self) {
        self.windows += 1;
        self.print("-".repeat(60));
        if let Err(e) = self.out.flush() {
            error!("Failed to flush counter update: {}", e);
        }
    }
}

pub fn format_time() -> String {
    if let Ok(now) = OffsetDateTime::now_local() {
        let format = format_description!("[hour]:[minute]:[second].[subsecond digits:3]");
        now.format(&format)
            .unwrap_or_else(|_| "00:00:00.000".to_string())
    } else {
        "00:00:00.000".to_string()
    }
}
