//! Serialized access to a sourcemeter plus the sweep / measurement / post-processing pipeline
//! running on top of it.
//!
//! All instrument traffic goes through one [`channel::CommandSender`] and is executed by exactly
//! one [`iotask::InstrumentWorker`]. The drivers ([`sweep::SweepDriver`],
//! [`measure::MeasurementDriver`]) are just producers on that queue and the
//! [`collect::SampleCollector`] is the consumer of the result queue. Hardware sweeps
//! ([`hardware::HardwareSweep`]) and maximum power tracking ([`mpp::MppTracker`]) go through the
//! same two queues.

pub mod address;
pub mod analyzer;
pub mod cancel;
pub mod channel;
pub mod collect;
pub mod commands;
pub mod console;
pub mod hardware;
pub mod instrument;
pub mod iotask;
pub mod measure;
pub mod mpp;
pub mod postprocess;
pub mod scpi;
pub mod session;
pub mod sink;
pub mod sweep;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use ivsweep_protocol::{
    ConsoleCommand, Error, Event, Operation, Parameter, ProtocolError, RawSample, Response, SourceFunction,
    SweepMode, SweepPlan, SweepState, TransportError,
};

pub type Result<T> = std::result::Result<T, Error>;
