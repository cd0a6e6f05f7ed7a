//! Engine for running without a vendor fusion library. It keeps the
//! schedule and heater profile an engine would ask for and echoes the
//! physical readings, but derives no air quality metrics: those stay
//! `None` and accuracy stays [`Accuracy::Unreliable`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    Accuracy, EngineConfig, EngineError, FusionEngine, FusionResult, ProcessOutcome,
    ProcessStatus, SampleRate,
};
use crate::clock::Timestamp;
use crate::sensor::{Oversampling, SensorSample, SensorSettings};

const STATE_VERSION: u8 = 1;
const MAX_STATE_LEN: usize = 64;
const MAX_CONFIG_LEN: usize = 4096;

/// Warning code: sample timestamp lies before the previous one
pub const WARNING_TIMESTAMP_REGRESSED: i32 = 1;

/// Optional configuration, RON encoded. An empty blob means defaults.
///
/// ```ron
/// (heater_temperature: 300, heater_duration_ms: 150, interval_ms: Some(2000))
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Profile {
    /// °C
    pub heater_temperature: u16,
    pub heater_duration_ms: u64,
    /// Overrides the interval that follows from the sample rate
    pub interval_ms: Option<u64>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            heater_temperature: 320,
            heater_duration_ms: 197,
            interval_ms: None,
        }
    }
}

impl Profile {
    fn parse(blob: &[u8]) -> Result<Self, EngineError> {
        if blob.is_empty() {
            return Ok(Self::default());
        }

        let text = std::str::from_utf8(blob)
            .map_err(|e| EngineError::InvalidConfig(format!("not utf-8: {e}")))?;
        let profile: Self =
            ron::from_str(text).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        if profile.heater_temperature > 400 {
            return Err(EngineError::InvalidConfig(format!(
                "heater temperature {}°C is above the 400°C maximum",
                profile.heater_temperature
            )));
        }
        if profile.heater_duration_ms > 4032 {
            return Err(EngineError::InvalidConfig(format!(
                "heater duration {}ms is above the 4032ms maximum",
                profile.heater_duration_ms
            )));
        }
        if profile.interval_ms == Some(0) {
            return Err(EngineError::InvalidConfig(
                "interval must be longer than zero".to_owned(),
            ));
        }
        Ok(profile)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct State {
    version: u8,
    samples: u64,
}

#[derive(Debug, Clone)]
pub struct Passthrough {
    interval: Duration,
    temperature_offset: f32,
    profile: Profile,
    next_call: Option<Timestamp>,
    last_sample: Option<Timestamp>,
    state: State,
}

impl Default for Passthrough {
    fn default() -> Self {
        Self {
            interval: SampleRate::default().interval(),
            temperature_offset: 0.0,
            profile: Profile::default(),
            next_call: None,
            last_sample: None,
            state: State {
                version: STATE_VERSION,
                samples: 0,
            },
        }
    }
}

impl Passthrough {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples processed over the lifetime of the calibration state
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.state.samples
    }

    fn schedule_after(&mut self, sample: Timestamp) {
        let scheduled = self.next_call.unwrap_or(sample);
        let mut next = scheduled.saturating_add(self.interval);
        if next <= sample {
            debug!("fell behind schedule, resyncing to last sample");
            next = sample.saturating_add(self.interval);
        }
        self.next_call = Some(next);
    }
}

impl FusionEngine for Passthrough {
    fn max_config_len(&self) -> usize {
        MAX_CONFIG_LEN
    }

    fn max_state_len(&self) -> usize {
        MAX_STATE_LEN
    }

    fn configure(&mut self, config: &EngineConfig<'_>) -> Result<(), EngineError> {
        let profile = Profile::parse(config.blob)?;
        self.interval = profile
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.sample_rate.interval());
        self.temperature_offset = config.temperature_offset;
        info!(
            "passthrough engine sampling every {:?}, heater at {}°C for {}ms",
            self.interval, profile.heater_temperature, profile.heater_duration_ms
        );
        self.profile = profile;
        Ok(())
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), EngineError> {
        let (restored, _): (State, usize) =
            bincode::serde::decode_from_slice(state, bincode::config::standard())
                .map_err(|e| EngineError::InvalidState(e.to_string()))?;
        if restored.version != STATE_VERSION {
            return Err(EngineError::InvalidState(format!(
                "unsupported version {}, expected {STATE_VERSION}",
                restored.version
            )));
        }
        self.state = restored;
        Ok(())
    }

    fn sensor_control(&mut self, now: Timestamp) -> SensorSettings {
        SensorSettings {
            next_call: *self.next_call.get_or_insert(now),
            heater_temperature: self.profile.heater_temperature,
            heater_duration: Duration::from_millis(self.profile.heater_duration_ms),
            run_gas: true,
            temperature_oversampling: Oversampling::X2,
            pressure_oversampling: Oversampling::X16,
            humidity_oversampling: Oversampling::X1,
        }
    }

    fn process(&mut self, sample: &SensorSample) -> ProcessOutcome {
        let status = match self.last_sample {
            Some(last) if sample.timestamp < last => {
                ProcessStatus::Warning(WARNING_TIMESTAMP_REGRESSED)
            }
            _ => ProcessStatus::Ok,
        };
        self.last_sample = Some(sample.timestamp);
        self.schedule_after(sample.timestamp);
        self.state.samples += 1;

        ProcessOutcome {
            results: vec![FusionResult {
                timestamp: sample.timestamp,
                iaq: None,
                static_iaq: None,
                co2_equivalent: None,
                breath_voc_equivalent: None,
                accuracy: Accuracy::Unreliable,
                temperature: sample.temperature - self.temperature_offset,
                pressure: sample.pressure,
                humidity: sample.humidity,
                raw_temperature: sample.temperature,
                raw_humidity: sample.humidity,
                gas_resistance: sample.gas_resistance,
                status,
            }],
            status,
        }
    }

    fn state(&mut self) -> Result<Vec<u8>, EngineError> {
        bincode::serde::encode_to_vec(&self.state, bincode::config::standard())
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(at: i64) -> SensorSample {
        SensorSample {
            timestamp: Timestamp::from_micros(at),
            temperature: 24.5,
            pressure: 101_325.0,
            humidity: 40.0,
            gas_resistance: 120_000.0,
            heater_stable: true,
        }
    }

    fn configured(blob: &[u8]) -> Passthrough {
        let mut engine = Passthrough::new();
        engine
            .configure(&EngineConfig {
                sample_rate: SampleRate::LowPower,
                temperature_offset: 1.5,
                blob,
            })
            .unwrap();
        engine
    }

    #[test]
    fn first_call_is_immediate() {
        let mut engine = configured(b"");
        let now = Timestamp::from_micros(42);
        assert_eq!(engine.sensor_control(now).next_call, now);
    }

    #[test]
    fn schedule_does_not_drift() {
        let mut engine = configured(b"");
        let start = Timestamp::from_micros(1_000_000);
        assert_eq!(engine.sensor_control(start).next_call, start);

        // sample completes a bit late, next call stays on the grid
        engine.process(&sample(1_250_000));
        assert_eq!(
            engine.sensor_control(start).next_call,
            Timestamp::from_micros(4_000_000)
        );
    }

    #[test]
    fn resyncs_when_behind() {
        let mut engine = configured(b"");
        engine.sensor_control(Timestamp::from_micros(0));
        engine.process(&sample(10_000_000));
        assert_eq!(
            engine.sensor_control(Timestamp::from_micros(0)).next_call,
            Timestamp::from_micros(13_000_000)
        );
    }

    #[test]
    fn applies_offset_and_echoes_raw() {
        let mut engine = configured(b"");
        let outcome = engine.process(&sample(0));
        assert_eq!(outcome.status, ProcessStatus::Ok);

        let [result] = outcome.results.as_slice() else {
            panic!("expected exactly one result");
        };
        assert_eq!(result.temperature, 23.0);
        assert_eq!(result.raw_temperature, 24.5);
        assert_eq!(result.iaq, None);
        assert_eq!(result.accuracy, Accuracy::Unreliable);
    }

    #[test]
    fn warns_on_regressing_timestamp() {
        let mut engine = configured(b"");
        engine.process(&sample(5));
        let outcome = engine.process(&sample(4));
        assert_eq!(
            outcome.status,
            ProcessStatus::Warning(WARNING_TIMESTAMP_REGRESSED)
        );
    }

    #[test]
    fn profile_from_config() {
        let blob = b"(heater_temperature: 300, interval_ms: Some(2000))";
        let mut engine = configured(blob);
        let settings = engine.sensor_control(Timestamp::default());
        assert_eq!(settings.heater_temperature, 300);
        assert_eq!(settings.heater_duration, Duration::from_millis(197));

        engine.process(&sample(0));
        assert_eq!(
            engine.sensor_control(Timestamp::default()).next_call,
            Timestamp::from_micros(2_000_000)
        );
    }

    #[test]
    fn rejects_bad_config() {
        let mut engine = Passthrough::new();
        for blob in [
            b"(heater_temperature: 900)".as_slice(),
            b"(interval_ms: Some(0))",
            b"(colour: 3)",
            &[0xff, 0xfe],
        ] {
            let res = engine.configure(&EngineConfig {
                sample_rate: SampleRate::Continuous,
                temperature_offset: 0.0,
                blob,
            });
            assert!(matches!(res, Err(EngineError::InvalidConfig(_))), "{blob:?}");
        }
    }

    #[test]
    fn state_survives_restart() {
        let mut engine = configured(b"");
        for i in 0..7 {
            engine.process(&sample(i));
        }
        let state = engine.state().unwrap();
        assert!(state.len() <= engine.max_state_len());

        let mut restarted = configured(b"");
        restarted.restore_state(&state).unwrap();
        assert_eq!(restarted.samples(), 7);
    }

    #[test]
    fn rejected_state_keeps_current() {
        let mut engine = configured(b"");
        engine.process(&sample(0));

        let res = engine.restore_state(&[STATE_VERSION + 1, 9]);
        assert!(matches!(res, Err(EngineError::InvalidState(_))));
        assert!(engine.restore_state(&[]).is_err());
        assert_eq!(engine.samples(), 1);
    }
}
