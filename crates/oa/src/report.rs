use crate::OaError;

/// Set in the report id when the context id field is valid
pub const REPORT_ID_CONTEXT_VALID: u32 = 1 << 16;

const REPORT_REASON_SHIFT: u32 = 19;
const REPORT_REASON_MASK: u32 = 0x3f;

/// Reason bit for reports triggered by the periodic sampling timer
pub const REPORT_REASON_TIMER: u32 = 1 << 0;
/// Reason bit for reports triggered by a context switch
pub const REPORT_REASON_CONTEXT_SWITCH: u32 = 1 << 3;

/// Raw counter layouts the hardware can be programmed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OaFormat {
    /// Haswell: 45 32-bit A counters, 8 B and 8 C counters
    A45B8C8,
    /// Gen8+: 32 40-bit A counters, 4 32-bit A counters, 8 B and 8 C counters
    A32u40A4u32B8C8,
}

impl OaFormat {
    /// Size in bytes of one raw report
    pub fn report_size(self) -> usize {
        256
    }

    /// Format identifier understood by the i915 perf interface
    pub fn kernel_id(self) -> u64 {
        match self {
            OaFormat::A45B8C8 => 5,
            OaFormat::A32u40A4u32B8C8 => 10,
        }
    }

    /// Number of slots in an accumulator's delta array
    pub fn n_deltas(self) -> usize {
        match self {
            // time, A0-A44, B0-B7, C0-C7
            OaFormat::A45B8C8 => 1 + 45 + 8 + 8,
            // time, clocks, A0-A35, B0-B7, C0-C7
            OaFormat::A32u40A4u32B8C8 => 2 + 36 + 8 + 8,
        }
    }

    /// Whether reports carry a context id and clock ticks
    pub fn has_context_id(self) -> bool {
        matches!(self, OaFormat::A32u40A4u32B8C8)
    }
}

/// Positions in the delta array of an `A32u40A4u32B8C8` accumulator
pub mod gen8_deltas {
    /// Elapsed GPU time in nanoseconds
    pub const GPU_TIME: usize = 0;
    /// Elapsed GPU clock ticks
    pub const GPU_CLOCKS: usize = 1;
    /// A0, the A counters follow contiguously up to A35
    pub const A: usize = 2;
    /// B0..B7
    pub const B: usize = A + 36;
    /// C0..C7
    pub const C: usize = B + 8;
}

/// Positions in the delta array of an `A45B8C8` accumulator
pub mod hsw_deltas {
    pub const GPU_TIME: usize = 0;
    pub const A: usize = 1;
    pub const B: usize = A + 45;
    pub const C: usize = B + 8;
}

/// Borrowed view of one raw OA report.
///
/// Dword 0 is the report id (reason and context-valid bits), dword 1 a
/// timestamp in 80ns units. Gen8+ formats add the context id at dword 2 and
/// GPU clock ticks at dword 3. Values are in host byte order.
#[derive(Debug, Clone, Copy)]
pub struct RawReport<'a> {
    bytes: &'a [u8],
}

/// Number of leading bytes every report is expected to hold
pub const REPORT_HEADER_LEN: usize = 16;

impl<'a> RawReport<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self, OaError> {
        if bytes.len() < REPORT_HEADER_LEN {
            return Err(OaError::ShortReport(bytes.len()));
        }
        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn report_id(&self) -> u32 {
        self.dword(0)
    }

    /// Raw timestamp in 80ns units
    pub fn timestamp(&self) -> u32 {
        self.dword(1)
    }

    pub fn context_id(&self) -> u32 {
        self.dword(2)
    }

    pub fn clock_ticks(&self) -> u32 {
        self.dword(3)
    }

    pub fn context_valid(&self) -> bool {
        self.report_id() & REPORT_ID_CONTEXT_VALID != 0
    }

    /// Reason bits explaining why the hardware wrote this report
    pub fn reason(&self) -> u32 {
        (self.report_id() >> REPORT_REASON_SHIFT) & REPORT_REASON_MASK
    }

    /// 32-bit value at dword `index`, 0 past the end of the report
    pub fn dword(&self, index: usize) -> u32 {
        let offset = index * 4;
        let mut word = [0u8; 4];
        if let Some(bytes) = self.bytes.get(offset..offset + 4) {
            word.copy_from_slice(bytes);
        }
        u32::from_ne_bytes(word)
    }

    /// Byte at `offset`, 0 past the end of the report
    pub fn byte(&self, offset: usize) -> u8 {
        self.bytes.get(offset).copied().unwrap_or(0)
    }

    /// Copies the report so it can outlive the buffer it was read into
    pub fn to_owned(&self) -> OwnedReport {
        OwnedReport {
            bytes: self.bytes.to_vec(),
        }
    }
}

/// A report copied out of its read buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedReport {
    bytes: Vec<u8>,
}

impl OwnedReport {
    pub fn as_report(&self) -> RawReport<'_> {
        RawReport { bytes: &self.bytes }
    }
}
