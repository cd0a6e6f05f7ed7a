use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{BusAddress, BusError};
use crate::clock::{Clock, StopSignal, Timestamp};
use crate::engine::{EngineConfig, EngineError, FusionEngine, ProcessStatus, SampleRate};
use crate::output::{OutputSink, SinkError};
use crate::sensor::{Measurement, NotReady, ProbeError, SensorDriver};
use crate::store::{PersistenceError, StateStore};

const fn non_zero(n: u32) -> NonZeroU32 {
    match NonZeroU32::new(n) {
        Some(n) => n,
        None => panic!("must be larger than zero"),
    }
}

/// Samples between state checkpoints when nothing else is configured,
/// one hour at the continuous sample rate.
pub const DEFAULT_CHECKPOINT_PERIOD: NonZeroU32 = non_zero(3600);

const ONE: NonZeroU32 = non_zero(1);
const NOT_READY_BURST: NonZeroU32 = non_zero(10);
const PERSISTENCE_PER_HOUR: NonZeroU32 = non_zero(4);
const PERSISTENCE_BURST: NonZeroU32 = non_zero(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub sample_rate: SampleRate,
    /// °C subtracted from the measured temperature
    pub temperature_offset: f32,
    /// Processed samples between two state saves
    pub checkpoint_period: NonZeroU32,
    pub address: BusAddress,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::default(),
            temperature_offset: 0.0,
            checkpoint_period: DEFAULT_CHECKPOINT_PERIOD,
            address: BusAddress::SECONDARY,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error(
        "No sensor at {address}: expected chip id {expected:#04x} \
        but found {found:#04x}"
    )]
    DeviceNotFound {
        address: BusAddress,
        expected: u8,
        found: u8,
    },
    #[error("Fusion engine rejected its configuration")]
    EngineRejectedConfig(#[source] EngineError),
    #[error("Could not load the fusion engine configuration")]
    ConfigUnavailable(#[source] PersistenceError),
    #[error("Bus failure while setting up the sensor")]
    Bus(#[source] BusError),
}

impl InitError {
    /// Process exit status, distinct per failure so a supervisor can
    /// decide whether restarting makes sense.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            InitError::DeviceNotFound { .. } => 2,
            InitError::EngineRejectedConfig(_) => 3,
            InitError::ConfigUnavailable(_) => 4,
            InitError::Bus(_) => 5,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("Bus failure during measurement")]
    Bus(#[from] BusError),
    #[error("Fusion engine can no longer produce valid output, code: {0}")]
    FusionFatal(i32),
    #[error("Could not forward results")]
    Output(#[from] SinkError),
}

impl RunError {
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Bus(_) => 6,
            RunError::FusionFatal(_) => 7,
            RunError::Output(_) => 8,
        }
    }
}

/// What happened during one pass through the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Measured {
        /// Results forwarded to the sink
        results: usize,
        /// Whether a checkpoint was attempted this cycle
        checkpoint: bool,
    },
    /// Nothing was fed to the engine
    Skipped(NotReady),
    /// The sleep ended before the requested time, nothing was measured
    Interrupted,
}

/// Collaborators wired together but not yet touching the hardware.
pub struct AcquisitionLoop<D, E, S, C, O> {
    driver: D,
    engine: E,
    store: S,
    clock: C,
    sink: O,
    settings: Settings,
}

/// Initialized sensor and engine, sampling on the engine's schedule.
pub struct Running<D, E, S, C, O> {
    driver: D,
    engine: E,
    store: S,
    clock: C,
    sink: O,
    settings: Settings,
    since_checkpoint: u32,
    last_timestamp: Option<Timestamp>,
    not_ready_warnings: DefaultDirectRateLimiter,
    persistence_warnings: DefaultDirectRateLimiter,
}

impl<D, E, S, C, O> AcquisitionLoop<D, E, S, C, O>
where
    D: SensorDriver,
    E: FusionEngine,
    S: StateStore,
    C: Clock,
    O: OutputSink,
{
    pub fn new(driver: D, engine: E, store: S, clock: C, sink: O, settings: Settings) -> Self {
        Self {
            driver,
            engine,
            store,
            clock,
            sink,
            settings,
        }
    }

    #[instrument(skip(self), fields(address = %self.settings.address))]
    pub fn initialize(self) -> Result<Running<D, E, S, C, O>, InitError> {
        let Self {
            mut driver,
            mut engine,
            mut store,
            clock,
            sink,
            settings,
        } = self;

        driver.bind(settings.address).map_err(InitError::Bus)?;
        driver.probe(&clock).map_err(|e| match e {
            ProbeError::DeviceNotFound { expected, found } => InitError::DeviceNotFound {
                address: settings.address,
                expected,
                found,
            },
            ProbeError::Bus(e) => InitError::Bus(e),
        })?;
        info!("sensor found");

        let config = store
            .load_config(engine.max_config_len())
            .map_err(InitError::ConfigUnavailable)?;
        let state = store.load_state(engine.max_state_len());

        engine
            .configure(&EngineConfig {
                sample_rate: settings.sample_rate,
                temperature_offset: settings.temperature_offset,
                blob: &config,
            })
            .map_err(InitError::EngineRejectedConfig)?;

        if !state.is_empty() {
            match engine.restore_state(&state) {
                Ok(()) => info!("fusion engine resumed from saved state"),
                Err(e) => warn!("Starting uncalibrated, {e}"),
            }
        }
        info!(
            "acquisition running, mode: {:?}, checkpoint every {} samples",
            settings.sample_rate, settings.checkpoint_period
        );

        Ok(Running {
            driver,
            engine,
            store,
            clock,
            sink,
            settings,
            since_checkpoint: 0,
            last_timestamp: None,
            not_ready_warnings: RateLimiter::direct(
                Quota::per_minute(ONE).allow_burst(NOT_READY_BURST),
            ),
            persistence_warnings: RateLimiter::direct(
                Quota::per_hour(PERSISTENCE_PER_HOUR).allow_burst(PERSISTENCE_BURST),
            ),
        })
    }
}

impl<D, E, S, C, O> Running<D, E, S, C, O>
where
    D: SensorDriver,
    E: FusionEngine,
    S: StateStore,
    C: Clock,
    O: OutputSink,
{
    /// Wait for the engine's next measurement time, measure and hand the
    /// results on. A fatal engine status is reported only after the
    /// results and any due checkpoint have been handled.
    pub fn cycle(&mut self) -> Result<Cycle, RunError> {
        let now = self.clock.now();
        let settings = self.engine.sensor_control(now);

        let wait = now.until(settings.next_call);
        if !wait.is_zero() {
            debug!("next measurement in {wait:?}");
            self.clock.sleep(wait);
            if self.clock.now() < settings.next_call {
                return Ok(Cycle::Interrupted);
            }
        }

        let mut sample = match self.driver.measure(&settings, &self.clock)? {
            Measurement::Ready(sample) => sample,
            Measurement::NotReady(reason) => {
                if self.not_ready_warnings.check().is_ok() {
                    warn!("Skipping measurement, sensor not ready: {reason:?}");
                }
                return Ok(Cycle::Skipped(reason));
            }
        };
        if let Some(last) = self.last_timestamp {
            sample.timestamp = sample.timestamp.max(last);
        }
        self.last_timestamp = Some(sample.timestamp);

        let outcome = self.engine.process(&sample);
        for result in &outcome.results {
            self.sink.emit(result)?;
        }
        debug!(
            "processed sample at {}, {} results",
            sample.timestamp,
            outcome.results.len()
        );

        self.since_checkpoint += 1;
        let checkpoint = self.since_checkpoint >= self.settings.checkpoint_period.get();
        if checkpoint {
            self.checkpoint();
        }

        let results = outcome.results.len();
        match outcome.status {
            ProcessStatus::Fatal(code) => {
                error!("fusion engine failed fatally, code: {code}");
                return Err(RunError::FusionFatal(code));
            }
            ProcessStatus::Warning(code) => debug!("fusion engine warning, code: {code}"),
            ProcessStatus::Ok => (),
        }
        Ok(Cycle::Measured {
            results,
            checkpoint,
        })
    }

    /// Cycle until `stop` is requested or a fatal error occurs. On stop the
    /// state is saved one last time if samples were processed since the
    /// previous checkpoint.
    pub fn run(&mut self, stop: &StopSignal) -> Result<(), RunError> {
        self.sink.start()?;
        while !stop.is_requested() {
            self.cycle()?;
        }

        info!("stop requested");
        if self.since_checkpoint > 0 {
            self.checkpoint();
        }
        Ok(())
    }

    /// Save the engine state. Failures are logged, the in-memory
    /// calibration carries on regardless. Returns whether the save
    /// succeeded.
    pub fn checkpoint(&mut self) -> bool {
        self.since_checkpoint = 0;

        let state = match self.engine.state() {
            Ok(state) => state,
            Err(e) => {
                if self.persistence_warnings.check().is_ok() {
                    warn!("Could not checkpoint, {e}");
                }
                return false;
            }
        };

        match self.store.save_state(&state) {
            Ok(()) => {
                info!("saved sensor state");
                true
            }
            Err(e) => {
                if self.persistence_warnings.check().is_ok() {
                    warn!("Unable to save sensor state: {e}");
                }
                false
            }
        }
    }

    /// Samples processed since the last checkpoint
    #[must_use]
    pub fn samples_since_checkpoint(&self) -> u32 {
        self.since_checkpoint
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}
