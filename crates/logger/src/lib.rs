use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .try_from_env()
        .unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .parse_lossy("")
        })
}

/// Log to the systemd journal when started as a service, otherwise to
/// stderr. Never to stdout as that carries the measurement records.
///
/// Filter with `RUST_LOG`, for example
/// `RUST_LOG=acquisition::acquisition=debug,info` to follow every cycle.
///
/// Under systemd follow the log using:
/// `journalctl -fu iaq-reader --output-fields=CODE_FILE,CODE_LINE,MESSAGE -o cat`
pub fn setup() {
    let fmt = fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_target(false);

    let registry = tracing_subscriber::Registry::default().with(ErrorLayer::default());

    if !libsystemd::logging::connected_to_journal() {
        registry.with(fmt.with_filter(env_filter())).init();
        tracing::info!("Started logging & tracing to stderr");
        return;
    }

    match tracing_journald::layer() {
        Ok(journal) => {
            registry.with(journal.with_filter(env_filter())).init();
            tracing::info!("Started logging & tracing to journald");
        }
        Err(err) => {
            registry.with(fmt.with_filter(env_filter())).init();
            tracing::error!(
                "Could not log to journald directly. Logging to stderr \
                as fallback. Error connecting to journald: {err}"
            );
        }
    }
}

pub fn setup_for_tests() {
    use std::sync::Once;

    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = color_eyre::install();

        let test_writer = fmt::layer()
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .pretty()
            .with_filter(EnvFilter::from_default_env());
        tracing_subscriber::registry()
            .with(test_writer)
            .with(ErrorLayer::default())
            .init();
    })
}
