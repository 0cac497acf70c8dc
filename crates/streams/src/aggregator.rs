use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};
use oa::{
    records, CounterValue, DeviceInfo, MetricSet, OaError, OwnedReport, RawReport, Record,
    ReportAccumulator, CTX_SWITCH_AWAY_SEEN, CTX_SWITCH_TO_SEEN,
};

use crate::ReportHandler;

/// Why a window of counter values was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    /// The window grew past the aggregation period
    Period,
    /// The sampled context became current
    ContextSwitchTo,
    /// The sampled context was switched away from
    ContextSwitchAway,
}

/// Receives windows of materialised counter values.
///
/// Every window is delivered as one `begin`, one `counter_update` per
/// counter of the metric set in order, then `end`.
pub trait UpdateSink {
    fn begin(&mut self, start_ns: u64, end_ns: u64, reason: UpdateReason);
    fn counter_update(&mut self, index: usize, max: u64, value: CounterValue);
    fn end(&mut self);
}

/// Turns consecutive OA reports into windows of counter values.
///
/// Deltas accumulate until the window covers more than the aggregation
/// period, or until a context switch is seen in per-context mode; the
/// window's counters are then read through the metric set and handed to
/// the sink.
pub struct OaAggregator<S> {
    device: Rc<DeviceInfo>,
    metric_set: Rc<MetricSet>,
    accumulator: ReportAccumulator,
    per_context: bool,
    period_ns: u64,
    // Last report of the previous chunk handed to `handle_records`
    continuation: Option<OwnedReport>,
    sink: S,
    updates: u64,
}

impl<S: UpdateSink> OaAggregator<S> {
    pub fn new(
        device: Rc<DeviceInfo>,
        metric_set: Rc<MetricSet>,
        per_context: bool,
        period: Duration,
        sink: S,
    ) -> Self {
        let accumulator = ReportAccumulator::new(metric_set.format);
        Self {
            device,
            metric_set,
            accumulator,
            per_context,
            period_ns: duration_ns(period),
            continuation: None,
            sink,
            updates: 0,
        }
    }

    pub fn set_aggregation_period(&mut self, period: Duration) {
        self.period_ns = duration_ns(period);
    }

    /// Forgets the continuation report and restarts the clock
    pub fn reset(&mut self) {
        self.continuation = None;
        self.accumulator.clear();
        self.accumulator.reset_clock();
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn accumulator(&self) -> &ReportAccumulator {
        &self.accumulator
    }

    /// Windows emitted so far
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Adds one report pair to the window, emitting it when due. Returns
    /// false when the pair was rejected.
    pub fn process_pair(&mut self, prev: &RawReport<'_>, next: &RawReport<'_>) -> bool {
        if !self.accumulator.accumulate(prev, next, self.per_context) {
            return false;
        }

        let flags = self.accumulator.flags();
        let reason = if flags & CTX_SWITCH_AWAY_SEEN != 0 {
            Some(UpdateReason::ContextSwitchAway)
        } else if flags & CTX_SWITCH_TO_SEEN != 0 {
            Some(UpdateReason::ContextSwitchTo)
        } else if self.accumulator.elapsed() > self.period_ns {
            Some(UpdateReason::Period)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.emit(reason);
        }
        true
    }

    /// Consumes a chunk of raw OA records, pairing its first sample with the
    /// last sample of the previous chunk.
    ///
    /// A malformed header abandons the rest of the chunk and is returned as
    /// an error; a record of unknown type abandons the rest of the chunk.
    /// Either way the samples before it have been accounted for. Returns the
    /// number of samples consumed.
    pub fn handle_records(&mut self, buf: &[u8]) -> Result<usize, OaError> {
        let continuation = self.continuation.take();
        if continuation.is_none() {
            self.accumulator.clear();
        }

        let mut prev: Option<RawReport<'_>> = continuation.as_ref().map(OwnedReport::as_report);
        let mut samples = 0;
        let mut result = Ok(());

        for record in records(buf) {
            let record = match record {
                Ok((_, record)) => record,
                Err(e) => {
                    warn!("Spurious OA record: {}", e);
                    result = Err(e);
                    break;
                }
            };

            match record {
                Record::Sample(body) => {
                    let report = match RawReport::new(body) {
                        Ok(report) => report,
                        Err(e) => {
                            warn!("i915 perf: {}", e);
                            continue;
                        }
                    };
                    if let Some(prev) = prev.as_ref() {
                        self.process_pair(prev, &report);
                    }
                    prev = Some(report);
                    samples += 1;
                }
                Record::BufferLost => warn!("i915 perf: OA buffer error - all records lost"),
                Record::ReportLost => debug!("i915 perf: OA report lost"),
                Record::Unknown(type_) => {
                    warn!("i915 perf: Spurious header type = {}", type_);
                    break;
                }
            }
        }

        self.continuation = prev.map(|report| report.to_owned());
        result.map(|()| samples)
    }

    fn emit(&mut self, reason: UpdateReason) {
        let start = self.accumulator.first_timestamp().unwrap_or(0);
        let end = self.accumulator.last_timestamp().unwrap_or(start);
        let deltas = self.accumulator.deltas();

        self.sink.begin(start, end, reason);
        for (index, counter) in self.metric_set.counters.iter().enumerate() {
            let value = counter.read(&self.device, &self.metric_set, deltas);
            let max = counter.max(&self.device, &self.metric_set, deltas);
            self.sink.counter_update(index, max, value);
        }
        self.sink.end();

        self.accumulator.clear();
        self.updates += 1;
    }
}

impl<S: UpdateSink> ReportHandler for OaAggregator<S> {
    fn handle_pair(&mut self, prev: &RawReport<'_>, next: &RawReport<'_>) {
        self.process_pair(prev, next);
    }
}

fn duration_ns(period: Duration) -> u64 {
    u64::try_from(period.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use oa::{
        encode_record, render_basic_gen8, ManualTime, SimulatedOa, RECORD_SAMPLE,
        REPORT_ID_CONTEXT_VALID, SIMULATED_RECORD_SIZE,
    };
    use rstest::rstest;
    use std::cell::RefCell;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Update {
        pub start: u64,
        pub end: u64,
        pub reason: UpdateReason,
        pub values: Vec<(u64, CounterValue)>,
    }

    /// Collects updates into a shared list
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub updates: Rc<RefCell<Vec<Update>>>,
    }

    impl UpdateSink for RecordingSink {
        fn begin(&mut self, start: u64, end: u64, reason: UpdateReason) {
            self.updates.borrow_mut().push(Update {
                start,
                end,
                reason,
                values: Vec::new(),
            });
        }

        fn counter_update(&mut self, index: usize, max: u64, value: CounterValue) {
            let mut updates = self.updates.borrow_mut();
            let update = updates.last_mut().unwrap();
            assert_eq!(update.values.len(), index);
            update.values.push((max, value));
        }

        fn end(&mut self) {}
    }

    // Period of exponent 10 is 163840 ns
    const EXPONENT: u32 = 10;
    const PERIOD_NS: u64 = 163_840;

    fn aggregator(per_context: bool, period: Duration) -> (OaAggregator<RecordingSink>, RecordingSink) {
        let sink = RecordingSink::default();
        let aggregator = OaAggregator::new(
            Rc::new(DeviceInfo::simulated()),
            Rc::new(render_basic_gen8()),
            per_context,
            period,
            sink.clone(),
        );
        (aggregator, sink)
    }

    /// `count` simulated records, one period apart
    fn simulated_records(count: u64) -> Vec<u8> {
        let time = Rc::new(ManualTime::new(0));
        let mut oa = SimulatedOa::new(EXPONENT, 24, time.clone()).unwrap();
        time.advance(oa.period_ns() * count);
        let mut buf = vec![0u8; count as usize * SIMULATED_RECORD_SIZE];
        let len = oa.fill(&mut buf);
        buf.truncate(len);
        buf
    }

    fn report(timestamp: u32, context: Option<u32>) -> Vec<u8> {
        let mut bytes = vec![0u8; 256];
        let report_id = match context {
            Some(_) => REPORT_ID_CONTEXT_VALID,
            None => 0,
        };
        bytes[0..4].copy_from_slice(&report_id.to_ne_bytes());
        bytes[4..8].copy_from_slice(&timestamp.to_ne_bytes());
        bytes[8..12].copy_from_slice(&context.unwrap_or(0).to_ne_bytes());
        bytes
    }

    #[test]
    fn test_emits_after_period() {
        let (mut aggregator, sink) = aggregator(false, Duration::from_millis(1));

        assert_eq!(aggregator.handle_records(&simulated_records(20)), Ok(20));

        // 7 pairs are the first to exceed 1ms
        let updates = sink.updates.borrow();
        assert_eq!(updates.len(), 2);
        assert_eq!(aggregator.updates(), 2);
        for update in updates.iter() {
            assert_eq!(update.reason, UpdateReason::Period);
            assert_eq!(update.end - update.start, 7 * PERIOD_NS);
            assert_eq!(update.values.len(), render_basic_gen8().counters.len());
            assert_eq!(update.values[0].1, CounterValue::U64(7 * PERIOD_NS));
            assert_eq!(update.values[1].1, CounterValue::U64(7 * PERIOD_NS / 2));
        }
        // Windows are contiguous
        assert_eq!(updates[1].start, updates[0].end);

        // The five pairs after the second window are still accumulating
        assert_eq!(aggregator.accumulator().elapsed(), 5 * PERIOD_NS);
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(9)]
    fn test_continuation_across_chunks(#[case] split: usize) {
        let (mut aggregator, sink) = aggregator(false, Duration::from_secs(1));
        let buf = simulated_records(10);
        let (first, second) = buf.split_at(split * SIMULATED_RECORD_SIZE);

        assert_eq!(aggregator.handle_records(first), Ok(split));
        assert_eq!(aggregator.handle_records(second), Ok(10 - split));

        assert!(sink.updates.borrow().is_empty());
        assert_eq!(aggregator.accumulator().elapsed(), 9 * PERIOD_NS);
        assert_eq!(
            aggregator.accumulator().deltas()[oa::gen8_deltas::GPU_TIME],
            9 * PERIOD_NS
        );
    }

    #[test]
    fn test_reset_drops_continuation() {
        let (mut aggregator, _sink) = aggregator(false, Duration::from_secs(1));
        let buf = simulated_records(10);
        let (first, second) = buf.split_at(5 * SIMULATED_RECORD_SIZE);

        aggregator.handle_records(first).unwrap();
        aggregator.reset();
        aggregator.handle_records(second).unwrap();

        assert_eq!(aggregator.accumulator().elapsed(), 4 * PERIOD_NS);
    }

    #[test]
    fn test_corrupt_chunk_keeps_earlier_samples() {
        let (mut aggregator, _sink) = aggregator(false, Duration::from_secs(1));
        let mut buf = simulated_records(4);
        buf.extend([0u8; 8]);
        buf.extend(simulated_records(1));

        testing_logger::setup();
        let result = aggregator.handle_records(&buf);
        assert_eq!(result, Err(OaError::ZeroSizeRecord { offset: 4 * SIMULATED_RECORD_SIZE }));
        assert_eq!(aggregator.accumulator().elapsed(), 3 * PERIOD_NS);
        testing_logger::validate(|logs| {
            assert!(logs.iter().any(|log| log.body.contains("Spurious OA record")));
        });
    }

    #[test]
    fn test_unknown_record_abandons_chunk() {
        let (mut aggregator, _sink) = aggregator(false, Duration::from_secs(1));
        let mut buf = simulated_records(3);
        encode_record(&mut buf, 77, &[0u8; 8]).unwrap();
        encode_record(&mut buf, RECORD_SAMPLE, &report(1, None)).unwrap();

        assert_eq!(aggregator.handle_records(&buf), Ok(3));
        assert_eq!(aggregator.accumulator().elapsed(), 2 * PERIOD_NS);
    }

    #[rstest]
    #[case(None, Some(7), UpdateReason::ContextSwitchTo)]
    #[case(Some(7), None, UpdateReason::ContextSwitchAway)]
    #[case(Some(7), Some(8), UpdateReason::ContextSwitchTo)]
    fn test_context_switch_emits_immediately(
        #[case] from: Option<u32>,
        #[case] to: Option<u32>,
        #[case] reason: UpdateReason,
    ) {
        let (mut aggregator, sink) = aggregator(true, Duration::from_secs(1));
        let prev = report(1000, from);
        let next = report(1010, to);

        assert!(aggregator.process_pair(
            &RawReport::new(&prev).unwrap(),
            &RawReport::new(&next).unwrap()
        ));

        let updates = sink.updates.borrow();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].reason, reason);
        assert_eq!(updates[0].end - updates[0].start, 800);
        assert_eq!(aggregator.accumulator().flags(), 0);
    }

    #[test]
    fn test_same_context_does_not_emit() {
        let (mut aggregator, sink) = aggregator(true, Duration::from_secs(1));
        let prev = report(1000, Some(7));
        let next = report(1010, Some(7));

        aggregator.process_pair(&RawReport::new(&prev).unwrap(), &RawReport::new(&next).unwrap());
        assert!(sink.updates.borrow().is_empty());
    }

    #[test]
    fn test_rejected_pair_is_ignored() {
        let (mut aggregator, sink) = aggregator(false, Duration::ZERO);
        let prev = report(1000, None);
        let next = report(900, None);

        assert!(!aggregator.process_pair(&RawReport::new(&prev).unwrap(), &RawReport::new(&next).unwrap()));
        assert!(sink.updates.borrow().is_empty());
        assert_eq!(aggregator.accumulator().first_timestamp(), None);
    }

    #[test]
    fn test_set_aggregation_period() {
        let (mut aggregator, sink) = aggregator(false, Duration::from_secs(1));
        aggregator.set_aggregation_period(Duration::ZERO);

        let prev = report(1000, None);
        let next = report(1001, None);
        aggregator.process_pair(&RawReport::new(&prev).unwrap(), &RawReport::new(&next).unwrap());

        assert_eq!(sink.updates.borrow().len(), 1);
        assert_eq!(sink.updates.borrow()[0].reason, UpdateReason::Period);
    }
}
