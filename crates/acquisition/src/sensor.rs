use std::time::Duration;

use crate::bus::{BusAddress, BusError};
use crate::clock::{Clock, Timestamp};

pub mod bme680;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Oversampling {
    /// Measurement skipped
    Skip,
    #[default]
    X1,
    X2,
    X4,
    X8,
    X16,
}

/// What the fusion engine wants from the next measurement. Only valid
/// until the engine is asked again.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSettings {
    /// When the engine wants the next sample
    pub next_call: Timestamp,
    /// Target heater plate temperature in °C
    pub heater_temperature: u16,
    pub heater_duration: Duration,
    pub run_gas: bool,
    pub temperature_oversampling: Oversampling,
    pub pressure_oversampling: Oversampling,
    pub humidity_oversampling: Oversampling,
}

/// Raw physical readings from one completed measurement cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    /// When the physical read completed
    pub timestamp: Timestamp,
    /// °C
    pub temperature: f32,
    /// Pa
    pub pressure: f32,
    /// %RH
    pub humidity: f32,
    /// Ω, higher means cleaner air
    pub gas_resistance: f32,
    pub heater_stable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReady {
    /// The heater did not reach its target temperature in time
    HeaterUnstable,
    /// The sensor did not flag new data after the measurement
    DataNotReady,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Ready(SensorSample),
    /// Not an error: the cycle has to be skipped and no data may be fed
    /// to the fusion engine.
    NotReady(NotReady),
}

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("Expected chip id {expected:#04x} but device reported {found:#04x}")]
    DeviceNotFound { expected: u8, found: u8 },
    #[error("Bus failure while probing sensor")]
    Bus(#[from] BusError),
}

pub trait SensorDriver {
    /// Point the underlying bus at the sensor.
    fn bind(&mut self, address: BusAddress) -> Result<(), BusError>;
    /// Check the hardware identity and get the sensor ready for
    /// measurements.
    fn probe(&mut self, clock: &dyn Clock) -> Result<(), ProbeError>;
    /// Run one physical measurement cycle using `settings`.
    fn measure(
        &mut self,
        settings: &SensorSettings,
        clock: &dyn Clock,
    ) -> Result<Measurement, BusError>;
}
