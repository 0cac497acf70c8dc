//! # oa
//!
//! Everything needed to turn raw i915 OA ("observation architecture")
//! records into counter values: record header decoding, fixed-layout report
//! views, 32 to 64 bit timestamp extension, the report accumulator that pairs
//! consecutive reports into deltas, metric-set descriptors, and a generator
//! of simulated reports for running without hardware.
//!

mod accumulator;
mod clock;
mod device;
mod metrics;
mod record;
mod report;
mod simulated;

pub use accumulator::*;
pub use clock::*;
pub use device::*;
pub use metrics::*;
pub use record::*;
pub use report::*;
pub use simulated::*;

use thiserror::Error;

/// Errors produced while decoding OA data
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OaError {
    #[error("record header at offset {offset} is truncated ({available} bytes left)")]
    TruncatedHeader { offset: usize, available: usize },

    #[error("spurious record size == 0 at offset {offset}")]
    ZeroSizeRecord { offset: usize },

    #[error("record at offset {offset} declares {size} bytes, smaller than its header")]
    UndersizedRecord { offset: usize, size: u16 },

    #[error("record at offset {offset} declares {size} bytes but only {available} remain")]
    RecordOverflow {
        offset: usize,
        size: u16,
        available: usize,
    },

    #[error("record body of {0} bytes does not fit a record header")]
    RecordTooLarge(usize),

    #[error("report of {0} bytes is too short")]
    ShortReport(usize),

    #[error("sampling period exponent {0} is out of range")]
    InvalidPeriodExponent(u32),

    #[error("unknown device property {0}")]
    UnknownProperty(String),

    #[error("value {value} out of range for device property {name}")]
    PropertyOutOfRange { name: String, value: f64 },
}
