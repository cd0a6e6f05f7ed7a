use std::fmt;
use std::time::Duration;

use crate::clock::Timestamp;
use crate::sensor::{SensorSample, SensorSettings};

pub mod passthrough;

/// How often the engine wants to sample, trading power for response time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleRate {
    /// Every second
    #[default]
    Continuous,
    /// Every 3 seconds
    LowPower,
    /// Every 5 minutes
    UltraLowPower,
}

impl SampleRate {
    #[must_use]
    pub fn interval(self) -> Duration {
        match self {
            SampleRate::Continuous => Duration::from_secs(1),
            SampleRate::LowPower => Duration::from_secs(3),
            SampleRate::UltraLowPower => Duration::from_secs(300),
        }
    }
}

/// How far the engine trusts its derived values. Rises as background
/// calibration progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Accuracy {
    /// Stabilizing or not enough data yet
    #[default]
    Unreliable,
    Low,
    Medium,
    High,
}

impl Accuracy {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Accuracy::Unreliable => 0,
            Accuracy::Low => 1,
            Accuracy::Medium => 2,
            Accuracy::High => 3,
        }
    }
}

impl fmt::Display for Accuracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accuracy::Unreliable => f.write_str("unreliable"),
            Accuracy::Low => f.write_str("low"),
            Accuracy::Medium => f.write_str("medium"),
            Accuracy::High => f.write_str("high"),
        }
    }
}

/// Status of a single processing call. Only `Fatal` ends the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessStatus {
    #[default]
    Ok,
    /// Engine specific warning code, processing continues
    Warning(i32),
    /// Engine specific error code, the engine can no longer produce valid
    /// output
    Fatal(i32),
}

/// Derived metrics plus the echoed physical values they were computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionResult {
    /// Timestamp of the sample this was derived from
    pub timestamp: Timestamp,
    pub iaq: Option<f32>,
    pub static_iaq: Option<f32>,
    /// ppm
    pub co2_equivalent: Option<f32>,
    /// ppm
    pub breath_voc_equivalent: Option<f32>,
    pub accuracy: Accuracy,
    /// °C, compensated for self heating
    pub temperature: f32,
    /// Pa
    pub pressure: f32,
    /// %RH, compensated for self heating
    pub humidity: f32,
    pub raw_temperature: f32,
    pub raw_humidity: f32,
    /// Ω
    pub gas_resistance: f32,
    pub status: ProcessStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutcome {
    /// Empty when the engine has nothing new to report this cycle
    pub results: Vec<FusionResult>,
    pub status: ProcessStatus,
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("Configuration rejected: {0}")]
    InvalidConfig(String),
    #[error("Calibration state rejected: {0}")]
    InvalidState(String),
    #[error("Could not serialize calibration state: {0}")]
    StateUnavailable(String),
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig<'a> {
    pub sample_rate: SampleRate,
    /// °C the sensor reads above ambient due to heat from nearby parts
    pub temperature_offset: f32,
    /// Opaque configuration, handed over verbatim
    pub blob: &'a [u8],
}

/// Stateful algorithm turning raw samples into derived air quality
/// metrics. It dictates when the next sample is needed and how the
/// sensor's heater should be driven for it.
pub trait FusionEngine {
    fn max_config_len(&self) -> usize;
    fn max_state_len(&self) -> usize;

    fn configure(&mut self, config: &EngineConfig<'_>) -> Result<(), EngineError>;
    /// On error the engine must keep its current (uncalibrated) state.
    fn restore_state(&mut self, state: &[u8]) -> Result<(), EngineError>;

    /// Settings and wake time for the next measurement. Must be asked
    /// again every cycle.
    fn sensor_control(&mut self, now: Timestamp) -> SensorSettings;
    fn process(&mut self, sample: &SensorSample) -> ProcessOutcome;
    /// Snapshot of the learned calibration.
    fn state(&mut self) -> Result<Vec<u8>, EngineError>;
}
