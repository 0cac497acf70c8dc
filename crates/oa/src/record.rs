use std::mem::size_of;

use crate::OaError;

/// All pending OA data was lost, the hardware buffer overflowed
pub const RECORD_OA_BUFFER_LOST: u32 = 1;
/// A single report was lost
pub const RECORD_OA_REPORT_LOST: u32 = 2;
/// A sample carrying one raw OA report
pub const RECORD_SAMPLE: u32 = 3;

/// Header in front of every record read from an i915 perf stream
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub type_: u32,
    pub pad: u16,
    pub size: u16,
}

unsafe impl plain::Plain for RecordHeader {}

pub const RECORD_HEADER_SIZE: usize = size_of::<RecordHeader>();

impl RecordHeader {
    /// Header for a record of `type_` carrying `body_len` bytes
    pub fn new(type_: u32, body_len: usize) -> Result<Self, OaError> {
        let size = u16::try_from(RECORD_HEADER_SIZE + body_len)
            .map_err(|_| OaError::RecordTooLarge(body_len))?;
        Ok(Self { type_, pad: 0, size })
    }

    /// Writes the header into the first bytes of `out`
    pub fn write_to(&self, out: &mut [u8]) {
        // Safety: the header is plain data
        let bytes = unsafe { plain::as_bytes(self) };
        out[..RECORD_HEADER_SIZE].copy_from_slice(bytes);
    }
}

/// Appends a complete record to `out`
pub fn encode_record(out: &mut Vec<u8>, type_: u32, body: &[u8]) -> Result<(), OaError> {
    let header = RecordHeader::new(type_, body.len())?;
    let start = out.len();
    out.resize(start + RECORD_HEADER_SIZE, 0);
    header.write_to(&mut out[start..]);
    out.extend_from_slice(body);
    Ok(())
}

/// A decoded record, borrowing its body from the read buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record<'a> {
    BufferLost,
    ReportLost,
    Sample(&'a [u8]),
    Unknown(u32),
}

impl<'a> Record<'a> {
    fn decode(type_: u32, body: &'a [u8]) -> Self {
        match type_ {
            RECORD_OA_BUFFER_LOST => Record::BufferLost,
            RECORD_OA_REPORT_LOST => Record::ReportLost,
            RECORD_SAMPLE => Record::Sample(body),
            other => Record::Unknown(other),
        }
    }
}

/// Iterator over the records of one chunk of stream data.
///
/// Yields the offset of each record alongside it. A malformed header yields
/// a single error and ends the iteration, so the rest of the chunk is
/// abandoned.
pub struct Records<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

/// Walks the records packed in `buf`
pub fn records(buf: &[u8]) -> Records<'_> {
    Records {
        buf,
        offset: 0,
        failed: false,
    }
}

impl<'a> Records<'a> {
    fn fail(&mut self, err: OaError) -> Option<Result<(usize, Record<'a>), OaError>> {
        self.failed = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<(usize, Record<'a>), OaError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }

        let offset = self.offset;
        let rest = &self.buf[offset..];

        let mut header = RecordHeader::default();
        if plain::copy_from_bytes(&mut header, rest).is_err() {
            return self.fail(OaError::TruncatedHeader {
                offset,
                available: rest.len(),
            });
        }

        let size = usize::from(header.size);
        if size == 0 {
            return self.fail(OaError::ZeroSizeRecord { offset });
        }
        if size < RECORD_HEADER_SIZE {
            return self.fail(OaError::UndersizedRecord {
                offset,
                size: header.size,
            });
        }
        if size > rest.len() {
            return self.fail(OaError::RecordOverflow {
                offset,
                size: header.size,
                available: rest.len(),
            });
        }

        self.offset += size;
        let body = &rest[RECORD_HEADER_SIZE..size];
        Some(Ok((offset, Record::decode(header.type_, body))))
    }
}
