use std::cell::Cell;
use std::mem::size_of;
use std::rc::Rc;
use std::time::Instant;

use crate::{OaError, RecordHeader, RECORD_HEADER_SIZE, RECORD_SAMPLE, TIMESTAMP_PERIOD_NS};

/// Source of the current time in nanoseconds
pub trait TimeSource {
    fn now_ns(&self) -> u64;
}

/// Nanoseconds since the source was created
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// A time source that only moves when told to
#[derive(Debug, Default)]
pub struct ManualTime {
    now: Cell<u64>,
}

impl ManualTime {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: Cell::new(start_ns),
        }
    }

    pub fn advance(&self, ns: u64) {
        self.now.set(self.now.get() + ns);
    }
}

impl TimeSource for ManualTime {
    fn now_ns(&self) -> u64 {
        self.now.get()
    }
}

/// Layout of the `A32u40A4u32B8C8` report written by the generator
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct SimulatedReport {
    report_id: u32,
    timestamp: u32,
    context_id: u32,
    clock_ticks: u32,
    counter_40_lsb: [u32; 32],
    agg_counter: [u32; 4],
    counter_40_msb: [u8; 32],
    bool_custom_counters: [u32; 16],
}

unsafe impl plain::Plain for SimulatedReport {}

/// Size of one generated sample record, header included
pub const SIMULATED_RECORD_SIZE: usize = RECORD_HEADER_SIZE + size_of::<SimulatedReport>();

const SIMULATED_HEADER: RecordHeader = RecordHeader {
    type_: RECORD_SAMPLE,
    pad: 0,
    size: SIMULATED_RECORD_SIZE as u16,
};
const _: () = assert!(SIMULATED_RECORD_SIZE <= u16::MAX as usize);

// Timer-triggered report reason
const SIMULATED_REPORT_ID: u32 = 1 << 19;

/// Generates deterministic sample records at the rate a real OA unit would
/// produce them for a given sampling period exponent.
///
/// Every record advances the timestamp by one period and the GPU clock by
/// half a period; the A counters advance by the clock times the number of
/// EUs, the B and C counters by twice the clock.
pub struct SimulatedOa {
    time: Rc<dyn TimeSource>,
    n_eus: u64,
    period_ns: u64,
    start_ns: u64,
    generated: u64,
    prev_timestamp: u32,
    prev_clocks: u32,
}

impl SimulatedOa {
    pub fn new(period_exponent: u32, n_eus: u64, time: Rc<dyn TimeSource>) -> Result<Self, OaError> {
        if period_exponent > 31 {
            return Err(OaError::InvalidPeriodExponent(period_exponent));
        }
        let now = time.now_ns();
        Ok(Self {
            n_eus,
            period_ns: TIMESTAMP_PERIOD_NS * (2u64 << period_exponent),
            start_ns: now,
            generated: 0,
            prev_timestamp: (now / TIMESTAMP_PERIOD_NS) as u32,
            prev_clocks: now as u32,
            time,
        })
    }

    /// Sampling period in nanoseconds
    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    /// Records produced so far
    pub fn generated(&self) -> u64 {
        self.generated
    }

    /// Records that are due but not yet produced
    pub fn pending_records(&self) -> u64 {
        let elapsed = self.time.now_ns().saturating_sub(self.start_ns);
        (elapsed / self.period_ns).saturating_sub(self.generated)
    }

    /// Writes as many due records as fit into `buf` and returns the number of
    /// bytes written; 0 when nothing is due.
    pub fn fill(&mut self, buf: &mut [u8]) -> usize {
        let fits = (buf.len() / SIMULATED_RECORD_SIZE) as u64;
        let count = self.pending_records().min(fits) as usize;

        for record in buf.chunks_exact_mut(SIMULATED_RECORD_SIZE).take(count) {
            let report = self.next_report();
            SIMULATED_HEADER.write_to(record);
            // Safety: the report is plain data
            let bytes = unsafe { plain::as_bytes(&report) };
            record[RECORD_HEADER_SIZE..].copy_from_slice(bytes);
        }

        count * SIMULATED_RECORD_SIZE
    }

    fn next_report(&mut self) -> SimulatedReport {
        let timestamp = self
            .prev_timestamp
            .wrapping_add((self.period_ns / TIMESTAMP_PERIOD_NS) as u32);
        self.prev_timestamp = timestamp;

        let clocks = self.prev_clocks.wrapping_add((self.period_ns / 2) as u32);
        self.prev_clocks = clocks;

        let counter = u64::from(clocks) * self.n_eus;
        let counter_lsb = counter as u32;
        let counter_msb = (counter >> 32) as u8;
        let custom = u64::from(clocks).wrapping_mul(2) as u32;

        self.generated += 1;

        SimulatedReport {
            report_id: SIMULATED_REPORT_ID,
            timestamp,
            context_id: 0,
            clock_ticks: clocks,
            counter_40_lsb: [counter_lsb; 32],
            agg_counter: [counter_lsb; 4],
            counter_40_msb: [counter_msb; 32],
            bool_custom_counters: [custom; 16],
        }
    }
}
