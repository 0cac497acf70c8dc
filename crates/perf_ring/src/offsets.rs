/// Fixed-capacity circular index of record start offsets.
///
/// Perf records are self-describing but variable-length, so once the kernel
/// starts overwriting the oldest bytes of a ring (flight-recorder mode) the
/// remaining records can no longer be found by walking from the tail. The
/// tracker remembers where each record starts, in constant memory, and drops
/// entries whose bytes have been trampled by newer records.
///
/// `head` and `tail` count records ever tracked and dropped; they only grow.
/// The number of live entries `head - tail` never exceeds the capacity.
#[derive(Debug, Clone)]
pub struct HeaderOffsetTracker {
    offsets: Vec<u32>,
    head: u64,
    tail: u64,
    full: bool,
}

impl HeaderOffsetTracker {
    /// Creates a tracker for at most `len` records (at least one)
    pub fn new(len: usize) -> Self {
        Self {
            offsets: vec![0; len.max(1)],
            head: 0,
            tail: 0,
            full: false,
        }
    }

    /// Sizes a tracker for a ring of `buffer_size` bytes holding records of
    /// roughly `sample_size` bytes, with 20% headroom for smaller records.
    pub fn for_ring(buffer_size: u64, sample_size: usize) -> Self {
        let expected_max_samples = (buffer_size / sample_size.max(1) as u64) as f64 * 1.2;
        Self::new(expected_max_samples as usize)
    }

    /// Maximum number of tracked records
    pub fn capacity(&self) -> usize {
        self.offsets.len()
    }

    /// Number of records currently tracked
    pub fn len(&self) -> usize {
        (self.head - self.tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Total number of records ever tracked
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Total number of records dropped, either for capacity or trampled
    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Whether the producer has wrapped and started overwriting old bytes.
    /// Never cleared once set.
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Records a new record starting at data offset `offset` with `size`
    /// bytes, in a ring whose data area is `buffer_size` bytes.
    pub fn track(&mut self, offset: u64, size: u64, buffer_size: u64) {
        // Once a record reaches the end of the ring the producer is eating
        // its own tail from here on
        if offset + size >= buffer_size {
            self.full = true;
        }

        if self.len() == self.capacity() {
            self.tail += 1;
        }

        if self.full {
            // A record may be split at the end of the buffer, a large record
            // may trample several small ones, and it may trample none at all
            let end = offset + size;
            while self.tail != self.head {
                let mut tracked = u64::from(self.offsets[self.slot(self.tail)]);

                // Compare in "ahead of the new record" space
                if tracked < offset {
                    tracked += buffer_size;
                }

                if end <= tracked {
                    break;
                }

                self.tail += 1;
            }
        }

        let slot = self.slot(self.head);
        self.offsets[slot] = offset as u32;
        self.head += 1;
    }

    /// Offsets of the live records, oldest first
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        (self.tail..self.head).map(move |i| self.offsets[self.slot(i)])
    }

    fn slot(&self, index: u64) -> usize {
        (index % self.offsets.len() as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_sizing_for_ring() {
        let tracker = HeaderOffsetTracker::for_ring(4096, 32);
        assert_eq!(tracker.capacity(), 153);
        assert!(tracker.is_empty());
        assert!(!tracker.is_full());
    }

    #[test]
    fn test_tracks_until_capacity() {
        let mut tracker = HeaderOffsetTracker::new(4);
        for i in 0..4 {
            tracker.track(i * 16, 16, 1024);
        }
        assert_eq!(tracker.len(), 4);
        assert_eq!(tracker.offsets().collect::<Vec<_>>(), vec![0, 16, 32, 48]);

        // The oldest record is dropped to make room
        tracker.track(64, 16, 1024);
        assert_eq!(tracker.len(), 4);
        assert_eq!(tracker.tail(), 1);
        assert_eq!(tracker.offsets().collect::<Vec<_>>(), vec![16, 32, 48, 64]);
        assert!(!tracker.is_full());
    }

    #[test]
    fn test_wrapping_record_marks_full_and_evicts_trampled() {
        let mut tracker = HeaderOffsetTracker::new(16);
        // Ring of 64 bytes with 16-byte records at 0, 16 and 32
        for i in 0..3 {
            tracker.track(i * 16, 16, 64);
        }
        assert!(!tracker.is_full());

        // A 24-byte record at 48 spans the end and eats [48, 72)
        tracker.track(48, 24, 64);
        assert!(tracker.is_full());

        // Offset 0 (normalised to 64) is covered by the new record's end (72),
        // 16 (normalised to 80) is not
        assert_eq!(tracker.offsets().collect::<Vec<_>>(), vec![16, 32, 48]);
    }

    #[test]
    fn test_large_record_tramples_several() {
        let mut tracker = HeaderOffsetTracker::new(16);
        for i in 0..7 {
            tracker.track(i * 8, 8, 64);
        }
        // Covers [56, 96) -> offsets 0..=24 (normalised 64..=88) are eaten
        tracker.track(56, 40, 64);
        assert!(tracker.is_full());
        assert_eq!(tracker.offsets().collect::<Vec<_>>(), vec![32, 40, 48, 56]);
    }

    #[test]
    fn test_record_ending_at_buffer_end() {
        let mut tracker = HeaderOffsetTracker::new(16);
        for i in 0..4 {
            tracker.track(i * 16, 16, 64);
        }
        // The last record reached the end: the next one overwrites offset 0
        assert!(tracker.is_full());
        assert_eq!(tracker.len(), 4);

        tracker.track(0, 16, 64);
        assert_eq!(tracker.tail(), 1);
        assert_eq!(tracker.offsets().collect::<Vec<_>>(), vec![16, 32, 48, 0]);
    }

    #[rstest]
    #[case(1, 8)]
    #[case(3, 24)]
    #[case(7, 40)]
    #[case(64, 16)]
    fn test_live_entries_bounded(#[case] len: usize, #[case] record_size: u64) {
        let buffer_size = 256;
        let mut tracker = HeaderOffsetTracker::new(len);
        let mut pos = 0u64;
        let mut last_tail = 0;

        for _ in 0..500 {
            tracker.track(pos % buffer_size, record_size, buffer_size);
            pos += record_size;

            assert!(tracker.len() <= tracker.capacity());
            assert!(tracker.tail() >= last_tail, "tail must never move back");
            last_tail = tracker.tail();
        }

        // Every surviving offset must still be intact: not covered by any
        // younger record
        let live: Vec<u32> = tracker.offsets().collect();
        assert!(live.len() <= len);
        assert_eq!(*live.last().unwrap() as u64, (pos - record_size) % buffer_size);
    }
}
