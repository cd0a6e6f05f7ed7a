//! Samples an environmental sensor on the schedule a fusion engine asks
//! for, feeds it the raw readings and keeps the engine's calibration state
//! alive across restarts.
//!
//! Every collaborator sits behind a trait so it can be swapped for a test
//! double or another implementation:
//!
//! - [`BusTransport`] register read/write over a byte bus
//! - [`Clock`] monotonic timestamps and the only suspension point
//! - [`StateStore`] calibration state and engine configuration blobs
//! - [`SensorDriver`] one physical measurement cycle
//! - [`FusionEngine`] turns samples into derived metrics
//! - [`OutputSink`] consumes the results
//!
//! [`AcquisitionLoop`] ties them together.

pub mod acquisition;
pub mod bus;
pub mod clock;
pub mod engine;
pub mod output;
pub mod sensor;
pub mod store;

pub use acquisition::{AcquisitionLoop, Cycle, InitError, RunError, Running, Settings};
#[cfg(target_os = "linux")]
pub use bus::I2cBus;
pub use bus::{BusAddress, BusError, BusTransport, FramedBus};
pub use clock::{Clock, MonotonicClock, StopSignal, Timestamp};
pub use engine::passthrough::Passthrough;
pub use engine::{
    Accuracy, EngineConfig, EngineError, FusionEngine, FusionResult, ProcessOutcome,
    ProcessStatus, SampleRate,
};
pub use output::{OutputSink, PipeSink, PrettySink, SinkError};
pub use sensor::bme680::Bme680;
pub use sensor::{Measurement, NotReady, ProbeError, SensorDriver, SensorSample, SensorSettings};
pub use store::{ConfigSource, FileStore, PersistenceError, StateStore};
