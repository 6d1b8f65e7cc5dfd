use crate::core::config::LoggingSettings;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install a global fmt subscriber. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}

pub fn init_from_config(settings: &LoggingSettings) {
    init_tracing(parse_level(&settings.level));
}
