use log::{debug, warn};

use crate::{HeaderOffsetTracker, PerfEventHeader, PerfRing, PERF_EVENT_HEADER_SIZE};

/// Corruption found while walking the records of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// A record header declared a size of zero
    ZeroSize { pos: u64 },
    /// A record header declared more bytes than the producer has published
    Overshoot { pos: u64, size: u16, available: u64 },
    /// The producer wrote more than a full ring since the last walk
    Lapped { head: u64, tail: u64 },
}

/// Outcome of one walk over newly published records
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkSummary {
    /// Number of records handed to the callback
    pub records: usize,
    /// Bytes covered by those records
    pub bytes: u64,
    /// Set when the walk stopped early
    pub corruption: Option<Corruption>,
}

/// A record inside the ring, valid for the duration of the walk callback
pub struct RingRecord<'a> {
    ring: &'a PerfRing,
    pos: u64,
    header: PerfEventHeader,
}

impl RingRecord<'_> {
    pub fn header(&self) -> &PerfEventHeader {
        &self.header
    }

    /// Free-running cursor the record starts at
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Offset of the record in the ring's data area
    pub fn offset(&self) -> u64 {
        self.ring.offset_of(self.pos)
    }

    /// Number of bytes after the header
    pub fn payload_len(&self) -> usize {
        usize::from(self.header.size).saturating_sub(PERF_EVENT_HEADER_SIZE)
    }

    /// Copies the record payload into `buf`, replacing its contents
    pub fn copy_payload(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.resize(self.payload_len(), 0);
        self.ring
            .copy_out(self.pos + PERF_EVENT_HEADER_SIZE as u64, buf.as_mut_slice());
    }
}

/// Walks every record published since the last walk, then releases them all
/// to the producer.
///
/// Each record is handed to `on_record` in write order. When a `tracker` is
/// given, the start offset of every record is tracked so the records stay
/// locatable after the producer starts overwriting old data.
///
/// A record declaring a size of zero, or more bytes than were published,
/// stops the walk at that record; the records before it have already been
/// delivered. Either way the consumer cursor is moved to the producer cursor
/// so the producer is never blocked.
pub fn walk_records<F>(
    ring: &PerfRing,
    mut tracker: Option<&mut HeaderOffsetTracker>,
    mut on_record: F,
) -> WalkSummary
where
    F: FnMut(&RingRecord<'_>),
{
    let head = ring.read_head();
    let mut tail = ring.read_tail();
    let mut summary = WalkSummary::default();

    if head == tail {
        return summary;
    }

    let available = head.wrapping_sub(tail);
    if available > ring.size() {
        warn!(
            "perf ring: producer lapped the consumer (head={}, tail={}), dropping {} bytes",
            head, tail, available
        );
        summary.corruption = Some(Corruption::Lapped { head, tail });
        ring.commit_tail(head);
        return summary;
    }

    while tail != head {
        let header = ring.header_at(tail);
        let size = u64::from(header.size);
        let available = head.wrapping_sub(tail);

        if size == 0 {
            warn!("perf ring: spurious record size == 0 at {}", tail);
            summary.corruption = Some(Corruption::ZeroSize { pos: tail });
            break;
        }

        if size > available {
            warn!(
                "perf ring: record size {} at {} would overshoot head ({} bytes available)",
                size, tail, available
            );
            summary.corruption = Some(Corruption::Overshoot {
                pos: tail,
                size: header.size,
                available,
            });
            break;
        }

        if let Some(tracker) = tracker.as_deref_mut() {
            tracker.track(ring.offset_of(tail), size, ring.size());
        }

        on_record(&RingRecord {
            ring,
            pos: tail,
            header,
        });

        summary.records += 1;
        summary.bytes += size;
        tail = tail.wrapping_add(size);
    }

    // Consume everything so the producer is never blocked from overwriting
    ring.commit_tail(head);

    debug!(
        "perf ring: walked {} records ({} bytes), head={}",
        summary.records, summary.bytes, head
    );
    summary
}
