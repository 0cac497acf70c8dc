//! # streams
//!
//! Counter streams driven by a single-threaded reactor. A stream owns one
//! backend (a perf event ring, an i915 OA stream or periodic CPU statistics),
//! drains it whenever the reactor reports it ready and tears it down
//! asynchronously once closed.
//!
//! Streams are opened through an [`EngineContext`], which holds the reactor,
//! the device description and its supported metric sets. OA report pairs can
//! be fed to an [`OaAggregator`] that emits windows of counter values to an
//! [`UpdateSink`].
//!

mod aggregator;
mod backend;
mod config;
mod context;
mod error;
pub mod i915;
mod open;
mod reactor;
mod stream;

#[cfg(test)]
mod test_reactor;

pub use aggregator::*;
pub use backend::*;
pub use config::*;
pub use context::*;
pub use error::*;
pub use open::*;
pub use reactor::*;
pub use stream::*;
