use std::future::Future;
use std::io;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use acquisition::acquisition::DEFAULT_CHECKPOINT_PERIOD;
use acquisition::{
    AcquisitionLoop, Bme680, BusAddress, ConfigSource, FileStore, I2cBus, InitError,
    MonotonicClock, OutputSink, Passthrough, PipeSink, PrettySink, RunError, SampleRate,
    Settings, StopSignal,
};
use clap::Parser;
use color_eyre::eyre::{Context, Report};
use color_eyre::{Result, Section};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Mode {
    /// Sample every second
    Continuous,
    /// Sample every 3 seconds
    LowPower,
    /// Sample every 5 minutes
    UltraLowPower,
}

impl From<Mode> for SampleRate {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Continuous => SampleRate::Continuous,
            Mode::LowPower => SampleRate::LowPower,
            Mode::UltraLowPower => SampleRate::UltraLowPower,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Format {
    /// `|` separated values with a header, for other programs
    Pipe,
    /// Readable line per measurement
    Pretty,
}

#[derive(Parser)]
#[command(name = "iaq-reader")]
#[command(version = "1.0")]
#[command(
    about = "Reads a BME680 air quality sensor over i2c and prints every \
    measurement to stdout"
)]
struct Cli {
    /// The i2c character device the sensor is attached to
    #[arg(long, default_value = "/dev/i2c-1")]
    bus: PathBuf,
    /// Bus address of the sensor, 0x76 or 0x77 for a BME680
    #[arg(long, default_value = "0x77", value_parser = parse_address)]
    address: BusAddress,
    #[arg(long, value_enum, default_value_t = Mode::Continuous)]
    mode: Mode,
    /// °C the sensor reads above the air around it due to nearby heat
    /// sources, subtracted from every temperature
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    temperature_offset: f32,
    /// Number of processed samples between two saves of the calibration
    /// state
    #[arg(long, default_value_t = DEFAULT_CHECKPOINT_PERIOD)]
    checkpoint_period: NonZeroU32,
    /// Where the calibration state is kept between runs
    #[arg(long, default_value = "bsec_state.dat")]
    state_file: PathBuf,
    /// Optional engine configuration (RON)
    #[arg(long)]
    config_file: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = Format::Pipe)]
    format: Format,
}

fn parse_address(arg: &str) -> std::result::Result<BusAddress, String> {
    let parsed = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => arg.parse(),
    };
    match parsed {
        Ok(address) if address <= 0x7f => Ok(BusAddress(address)),
        Ok(address) => Err(format!("{address:#x} is not a 7 bit address")),
        Err(e) => Err(format!("not a number: {e}")),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::setup();
    if let Err(e) = color_eyre::install() {
        warn!("Could not install error report handler: {e}");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("Error: {report:?}");
            ExitCode::from(exit_code(&report))
        }
    }
}

fn exit_code(report: &Report) -> u8 {
    if let Some(e) = report.downcast_ref::<InitError>() {
        return e.exit_code();
    }
    if let Some(e) = report.downcast_ref::<RunError>() {
        return e.exit_code();
    }
    1
}

fn run(cli: Cli) -> Result<()> {
    let stop = StopSignal::new();
    stop_on_signal(stop.clone()).wrap_err("Could not set up signal handling")?;

    let bus = I2cBus::open(&cli.bus, cli.address)
        .map_err(InitError::Bus)
        .wrap_err("Could not open the i2c bus")
        .with_note(|| format!("bus: {}", cli.bus.display()))?;

    let config = match cli.config_file {
        Some(path) => ConfigSource::File(path),
        None => ConfigSource::None,
    };
    let settings = Settings {
        sample_rate: cli.mode.into(),
        temperature_offset: cli.temperature_offset,
        checkpoint_period: cli.checkpoint_period,
        address: cli.address,
    };

    let acquisition = AcquisitionLoop::new(
        Bme680::new(bus),
        Passthrough::new(),
        FileStore::new(cli.state_file, config),
        MonotonicClock::with_stop(stop.clone()),
        sink(cli.format),
        settings,
    );
    let mut running = match acquisition.initialize() {
        Ok(running) => running,
        Err(e @ InitError::DeviceNotFound { .. }) => {
            return Err(e)
                .wrap_err("Could not start acquisition")
                .suggestion("A BME680 responds at 0x76 or 0x77, check --address")
        }
        Err(e) => return Err(e).wrap_err("Could not start acquisition"),
    };

    running.run(&stop).wrap_err("Acquisition stopped")?;
    info!("shut down cleanly");
    Ok(())
}

fn sink(format: Format) -> Box<dyn OutputSink> {
    match format {
        Format::Pipe => Box::new(PipeSink::new(io::stdout())),
        Format::Pretty => Box::new(PrettySink::new(io::stdout())),
    }
}

/// Requests a stop on SIGINT or SIGTERM. The signals are awaited on a
/// separate thread so the acquisition loop stays synchronous.
fn stop_on_signal(stop: StopSignal) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .wrap_err("Could not build runtime")?;
    let mut terminate = {
        let _guard = rt.enter();
        signal(SignalKind::terminate()).wrap_err("Could not listen for SIGTERM")?
    };

    thread::Builder::new()
        .name("signals".to_owned())
        .spawn(move || {
            rt.block_on(stop_requested(tokio::signal::ctrl_c(), terminate.recv()));
            stop.request();
        })
        .wrap_err("Could not spawn signal thread")?;
    Ok(())
}

/// Resolves on the first of `interrupt` or `terminate`. If listening for
/// the interrupt fails only `terminate` can end the wait.
async fn stop_requested(
    interrupt: impl Future<Output = io::Result<()>>,
    terminate: impl Future<Output = Option<()>>,
) {
    tokio::pin!(terminate);
    tokio::select! {
        res = interrupt => match res {
            Ok(()) => {
                info!("interrupted, stopping");
                return;
            }
            Err(e) => warn!("Could not listen for SIGINT, only SIGTERM stops acquisition: {e}"),
        },
        _ = &mut terminate => {
            info!("terminate requested, stopping");
            return;
        }
    }
    terminate.await;
    info!("terminate requested, stopping");
}
