//! The three kinds of sample sources a stream can drain.

mod cpu;
mod oa;
mod perf;

pub use self::cpu::*;
pub use self::oa::*;
pub use self::perf::*;

use std::fmt;
use std::os::fd::RawFd;

use log::{debug, trace};

/// Kind of source a stream samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    GenericPerf,
    HardwareOa,
    CpuStats,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::GenericPerf => write!(f, "perf"),
            StreamKind::HardwareOa => write!(f, "i915 OA"),
            StreamKind::CpuStats => write!(f, "CPU stats"),
        }
    }
}

pub enum Backend {
    Perf(PerfBackend),
    Oa(OaBackend),
    Cpu(CpuBackend),
}

impl Backend {
    pub fn kind(&self) -> StreamKind {
        match self {
            Backend::Perf(_) => StreamKind::GenericPerf,
            Backend::Oa(_) => StreamKind::HardwareOa,
            Backend::Cpu(_) => StreamKind::CpuStats,
        }
    }

    /// Reacts to a readiness event or timer expiry
    pub(crate) fn on_ready(&mut self) {
        match self {
            Backend::Cpu(cpu) => cpu.sample(),
            other => other.drain(),
        }
    }

    /// Consumes whatever data is available now
    pub fn drain(&mut self) {
        match self {
            Backend::Perf(perf) => {
                let summary = perf.drain();
                trace!("perf: drained {} records", summary.records);
            }
            Backend::Oa(oa) => oa.drain(),
            // Rows stay in place until the owner reads them
            Backend::Cpu(_) => {}
        }
    }

    pub fn has_pending_data(&self) -> bool {
        match self {
            Backend::Perf(perf) => perf.has_pending_data(),
            Backend::Oa(oa) => oa.has_pending_data(),
            Backend::Cpu(cpu) => cpu.has_pending_data(),
        }
    }

    /// Descriptor watched for readiness; timer-driven backends have none
    pub fn fd(&self) -> Option<RawFd> {
        match self {
            Backend::Perf(perf) => perf.fd(),
            Backend::Oa(oa) => oa.fd(),
            Backend::Cpu(_) => None,
        }
    }

    /// Frees buffers, mappings and descriptors
    pub(crate) fn release(self) {
        debug!("releasing {} backend", self.kind());
        drop(self);
    }
}
