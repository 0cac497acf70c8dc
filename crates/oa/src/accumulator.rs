use log::debug;

use crate::{gen8_deltas, hsw_deltas, OaFormat, RawReport, ReportClock, TIMESTAMP_PERIOD_NS};

/// A context became current within the window
pub const CTX_SWITCH_TO_SEEN: u32 = 1 << 0;
/// The current context was switched away from within the window
pub const CTX_SWITCH_AWAY_SEEN: u32 = 1 << 1;

const COUNTER_40_MASK: u64 = (1 << 40) - 1;

// Byte offset of the high bytes of the 40-bit A counters
const COUNTER_40_MSB_OFFSET: usize = 160;

/// Accumulates counter deltas between consecutive raw reports over one
/// aggregation window.
#[derive(Debug, Clone)]
pub struct ReportAccumulator {
    format: OaFormat,
    clock: ReportClock,
    first_timestamp: Option<u64>,
    last_timestamp: Option<u64>,
    deltas: Vec<u64>,
    flags: u32,
}

impl ReportAccumulator {
    pub fn new(format: OaFormat) -> Self {
        Self {
            format,
            clock: ReportClock::new(),
            first_timestamp: None,
            last_timestamp: None,
            deltas: vec![0; format.n_deltas()],
            flags: 0,
        }
    }

    pub fn format(&self) -> OaFormat {
        self.format
    }

    /// Adds the deltas between `prev` and `next` to the window.
    ///
    /// Returns false, leaving the window untouched, when either report does
    /// not have the size of this accumulator's format or when `next` was not
    /// taken after `prev`. Context-switch flags are only derived when
    /// `per_context` is set.
    pub fn accumulate(&mut self, prev: &RawReport<'_>, next: &RawReport<'_>, per_context: bool) -> bool {
        let size = self.format.report_size();
        if prev.len() != size || next.len() != size {
            debug!(
                "oa: rejecting report pair of {}/{} bytes for a {} byte format",
                prev.len(),
                next.len(),
                size
            );
            return false;
        }

        // More than half the range backwards is a step back, not a wrap
        let step = next.timestamp().wrapping_sub(prev.timestamp());
        if step == 0 || step > u32::MAX / 2 {
            debug!(
                "oa: rejecting out of order reports (timestamps {} -> {})",
                prev.timestamp(),
                next.timestamp()
            );
            return false;
        }

        let elapsed_ns = u64::from(step) * TIMESTAMP_PERIOD_NS;
        match self.format {
            OaFormat::A32u40A4u32B8C8 => self.accumulate_gen8(prev, next, elapsed_ns),
            OaFormat::A45B8C8 => self.accumulate_hsw(prev, next, elapsed_ns),
        }

        if per_context && self.format.has_context_id() {
            self.flags |= context_switch_flags(prev, next);
        }

        let start = self.clock.advance(prev.timestamp());
        let end = self.clock.advance(next.timestamp());
        if self.first_timestamp.is_none() {
            self.first_timestamp = Some(start);
        }
        self.last_timestamp = Some(end);

        true
    }

    fn accumulate_gen8(&mut self, prev: &RawReport<'_>, next: &RawReport<'_>, elapsed_ns: u64) {
        use gen8_deltas::*;

        self.deltas[GPU_TIME] += elapsed_ns;
        self.deltas[GPU_CLOCKS] += delta_32(prev.clock_ticks(), next.clock_ticks());

        for i in 0..32 {
            self.deltas[A + i] += delta_40(prev, next, i);
        }
        for i in 0..4 {
            self.deltas[A + 32 + i] += delta_32(prev.dword(36 + i), next.dword(36 + i));
        }
        // B and C counters are contiguous in both the report and the deltas
        for i in 0..16 {
            self.deltas[B + i] += delta_32(prev.dword(48 + i), next.dword(48 + i));
        }
    }

    fn accumulate_hsw(&mut self, prev: &RawReport<'_>, next: &RawReport<'_>, elapsed_ns: u64) {
        use hsw_deltas::*;

        self.deltas[GPU_TIME] += elapsed_ns;
        for i in 0..(45 + 8 + 8) {
            self.deltas[A + i] += delta_32(prev.dword(3 + i), next.dword(3 + i));
        }
    }

    /// Starts a new window: timestamps unset, deltas and flags zeroed
    pub fn clear(&mut self) {
        self.first_timestamp = None;
        self.last_timestamp = None;
        self.deltas.fill(0);
        self.flags = 0;
    }

    /// Restarts the 64-bit timestamp extension from the next report
    pub fn reset_clock(&mut self) {
        self.clock.reset();
    }

    /// Start of the window in nanoseconds, unset until the first pairing
    pub fn first_timestamp(&self) -> Option<u64> {
        self.first_timestamp
    }

    /// End of the window in nanoseconds
    pub fn last_timestamp(&self) -> Option<u64> {
        self.last_timestamp
    }

    /// Time covered by the window so far
    pub fn elapsed(&self) -> u64 {
        match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        }
    }

    pub fn deltas(&self) -> &[u64] {
        &self.deltas
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }
}

fn delta_32(start: u32, end: u32) -> u64 {
    u64::from(end.wrapping_sub(start))
}

fn counter_40(report: &RawReport<'_>, index: usize) -> u64 {
    let high = u64::from(report.byte(COUNTER_40_MSB_OFFSET + index));
    let low = u64::from(report.dword(4 + index));
    (high << 32) | low
}

fn delta_40(prev: &RawReport<'_>, next: &RawReport<'_>, index: usize) -> u64 {
    counter_40(next, index).wrapping_sub(counter_40(prev, index)) & COUNTER_40_MASK
}

fn context_switch_flags(prev: &RawReport<'_>, next: &RawReport<'_>) -> u32 {
    match (prev.context_valid(), next.context_valid()) {
        (false, true) => CTX_SWITCH_TO_SEEN,
        (true, false) => CTX_SWITCH_AWAY_SEEN,
        (true, true) if prev.context_id() != next.context_id() => CTX_SWITCH_TO_SEEN,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::REPORT_ID_CONTEXT_VALID;
    use rstest::rstest;

    struct ReportBuilder {
        bytes: Vec<u8>,
    }

    impl ReportBuilder {
        fn new(timestamp: u32) -> Self {
            let mut builder = Self {
                bytes: vec![0u8; 256],
            };
            builder.dword(1, timestamp);
            builder
        }

        fn dword(&mut self, index: usize, value: u32) -> &mut Self {
            self.bytes[index * 4..index * 4 + 4].copy_from_slice(&value.to_ne_bytes());
            self
        }

        fn counter_40(&mut self, index: usize, value: u64) -> &mut Self {
            self.dword(4 + index, value as u32);
            self.bytes[160 + index] = (value >> 32) as u8;
            self
        }

        fn context(&mut self, valid: bool, id: u32) -> &mut Self {
            let report_id = if valid { REPORT_ID_CONTEXT_VALID } else { 0 };
            self.dword(0, report_id).dword(2, id)
        }

        fn report(&self) -> RawReport<'_> {
            RawReport::new(&self.bytes).unwrap()
        }
    }

    #[test]
    fn test_gen8_closed_form_deltas() {
        use gen8_deltas::*;

        let mut start = ReportBuilder::new(1000);
        start.dword(3, 10_000).counter_40(0, 0xff_ffff_fff0).counter_40(5, 100);
        start.dword(36, 7).dword(48, 20).dword(63, u32::MAX);

        let mut end = ReportBuilder::new(1250);
        end.dword(3, 15_000).counter_40(0, 0x10).counter_40(5, 0x1_0000_0064);
        end.dword(36, 107).dword(48, 25).dword(63, 4);

        let mut acc = ReportAccumulator::new(OaFormat::A32u40A4u32B8C8);
        assert!(acc.accumulate(&start.report(), &end.report(), false));

        let deltas = acc.deltas();
        assert_eq!(deltas[GPU_TIME], 250 * 80);
        assert_eq!(deltas[GPU_CLOCKS], 5000);
        // 40-bit wrap: 0xff_ffff_fff0 -> 0x10
        assert_eq!(deltas[A], 0x20);
        assert_eq!(deltas[A + 5], 0x1_0000_0000);
        assert_eq!(deltas[A + 32], 100);
        assert_eq!(deltas[B], 5);
        // C7 wrapped its 32 bits
        assert_eq!(deltas[C + 7], 5);

        assert_eq!(acc.first_timestamp(), Some(1000 * 80));
        assert_eq!(acc.last_timestamp(), Some(1250 * 80));
        assert_eq!(acc.elapsed(), 250 * 80);
    }

    #[test]
    fn test_deltas_add_up_over_window() {
        let reports: Vec<ReportBuilder> = (0..4u32)
            .map(|i| {
                let mut report = ReportBuilder::new(100 + i * 10);
                report.dword(3, i * 1000);
                report
            })
            .collect();

        let mut acc = ReportAccumulator::new(OaFormat::A32u40A4u32B8C8);
        for pair in reports.windows(2) {
            assert!(acc.accumulate(&pair[0].report(), &pair[1].report(), false));
        }

        assert_eq!(acc.deltas()[gen8_deltas::GPU_CLOCKS], 3000);
        assert_eq!(acc.elapsed(), 30 * 80);
        assert_eq!(acc.first_timestamp(), Some(100 * 80));
    }

    #[test]
    fn test_hsw_layout() {
        let mut start = ReportBuilder::new(10);
        start.dword(3, 1).dword(3 + 45, 2).dword(63, 3);
        let mut end = ReportBuilder::new(20);
        end.dword(3, 11).dword(3 + 45, 22).dword(63, 33);

        let mut acc = ReportAccumulator::new(OaFormat::A45B8C8);
        assert!(acc.accumulate(&start.report(), &end.report(), true));

        let deltas = acc.deltas();
        assert_eq!(deltas.len(), 62);
        assert_eq!(deltas[hsw_deltas::GPU_TIME], 800);
        assert_eq!(deltas[hsw_deltas::A], 10);
        assert_eq!(deltas[hsw_deltas::B], 20);
        assert_eq!(deltas[hsw_deltas::C + 7], 30);
        // No context ids in this format
        assert_eq!(acc.flags(), 0);
    }

    #[rstest]
    #[case(100, 100)]
    #[case(100, 50)]
    #[case(10, 10 + u32::MAX / 2 + 1)]
    fn test_out_of_order_rejected(#[case] prev_ts: u32, #[case] next_ts: u32) {
        let mut acc = ReportAccumulator::new(OaFormat::A32u40A4u32B8C8);
        let prev = ReportBuilder::new(prev_ts);
        let mut next = ReportBuilder::new(next_ts);
        next.dword(3, 500);

        assert!(!acc.accumulate(&prev.report(), &next.report(), false));
        assert!(acc.deltas().iter().all(|d| *d == 0));
        assert_eq!(acc.first_timestamp(), None);
        assert_eq!(acc.last_timestamp(), None);
    }

    #[test]
    fn test_timestamp_wrap_accepted() {
        let mut acc = ReportAccumulator::new(OaFormat::A32u40A4u32B8C8);
        let prev = ReportBuilder::new(u32::MAX - 4);
        let next = ReportBuilder::new(5);

        assert!(acc.accumulate(&prev.report(), &next.report(), false));
        assert_eq!(acc.deltas()[gen8_deltas::GPU_TIME], 10 * 80);
        assert_eq!(acc.elapsed(), 10 * 80);
    }

    #[test]
    fn test_wrong_size_rejected() {
        let mut acc = ReportAccumulator::new(OaFormat::A32u40A4u32B8C8);
        let prev = ReportBuilder::new(1);
        let next = ReportBuilder::new(2);
        let short = RawReport::new(&next.bytes[..128]).unwrap();

        assert!(!acc.accumulate(&prev.report(), &short, false));
        assert_eq!(acc.last_timestamp(), None);
    }

    #[rstest]
    #[case(false, 0, true, 1, CTX_SWITCH_TO_SEEN)]
    #[case(true, 1, false, 0, CTX_SWITCH_AWAY_SEEN)]
    #[case(true, 1, true, 2, CTX_SWITCH_TO_SEEN)]
    #[case(true, 1, true, 1, 0)]
    #[case(false, 0, false, 0, 0)]
    fn test_context_switch_flags(
        #[case] prev_valid: bool,
        #[case] prev_id: u32,
        #[case] next_valid: bool,
        #[case] next_id: u32,
        #[case] expected: u32,
    ) {
        let mut prev = ReportBuilder::new(1);
        prev.context(prev_valid, prev_id);
        let mut next = ReportBuilder::new(2);
        next.context(next_valid, next_id);

        let mut acc = ReportAccumulator::new(OaFormat::A32u40A4u32B8C8);
        assert!(acc.accumulate(&prev.report(), &next.report(), true));
        assert_eq!(acc.flags(), expected);

        // Flags are only derived in per-context mode
        let mut acc = ReportAccumulator::new(OaFormat::A32u40A4u32B8C8);
        assert!(acc.accumulate(&prev.report(), &next.report(), false));
        assert_eq!(acc.flags(), 0);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut acc = ReportAccumulator::new(OaFormat::A32u40A4u32B8C8);
        let mut prev = ReportBuilder::new(1);
        prev.context(false, 0);
        let mut next = ReportBuilder::new(9);
        next.context(true, 3).dword(3, 77);
        assert!(acc.accumulate(&prev.report(), &next.report(), true));

        acc.clear();
        let once = (acc.first_timestamp(), acc.last_timestamp(), acc.deltas().to_vec(), acc.flags());
        acc.clear();
        let twice = (acc.first_timestamp(), acc.last_timestamp(), acc.deltas().to_vec(), acc.flags());

        assert_eq!(once, twice);
        assert_eq!(once.0, None);
        assert_eq!(once.1, None);
        assert!(once.2.iter().all(|d| *d == 0));
        assert_eq!(once.3, 0);
    }

    #[test]
    fn test_clock_continues_across_clear() {
        let mut acc = ReportAccumulator::new(OaFormat::A32u40A4u32B8C8);
        let a = ReportBuilder::new(100);
        let b = ReportBuilder::new(200);
        let c = ReportBuilder::new(300);

        assert!(acc.accumulate(&a.report(), &b.report(), false));
        acc.clear();
        assert!(acc.accumulate(&b.report(), &c.report(), false));
        assert_eq!(acc.first_timestamp(), Some(200 * 80));
        assert_eq!(acc.last_timestamp(), Some(300 * 80));

        acc.reset_clock();
        acc.clear();
        assert!(acc.accumulate(&b.report(), &c.report(), false));
        assert_eq!(acc.first_timestamp(), Some(200 * 80));
    }
}
