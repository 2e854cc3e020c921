use std::io;

use anyhow::{Context, Result};
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

use crate::config::LogSettings;

/// Dependencies that are chatty below `warn`.
const NOISY_TARGETS: &[&str] = &["sqlx", "hyper", "reqwest", "html5ever"];

/// Log configuration options
pub struct LogConfig {
    /// Log level for console output
    pub console_level: LevelFilter,
    /// Log level for file output
    pub file_level: LevelFilter,
    /// Path to log file (None means no file logging)
    pub log_file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_level: LevelFilter::Info,
            file_level: LevelFilter::Debug,
            log_file: None,
        }
    }
}

impl LogConfig {
    /// Builds from the `log` config section. `console_override` (from the
    /// command line or environment) wins over the configured console level.
    pub fn from_settings(settings: &LogSettings, console_override: Option<&str>) -> Self {
        let console = console_override.unwrap_or(&settings.console_level);
        Self {
            console_level: parse_log_level(console),
            file_level: parse_log_level(&settings.file_level),
            log_file: settings.file.clone(),
        }
    }
}

/// Initialize the logging system with the provided configuration
pub fn init(config: LogConfig) -> Result<()> {
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::Magenta);

    // Collect everything here, each output filters on its own.
    let mut base_config = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.target(),
                colors.color(record.level()),
                message
            ))
        })
        .level(LevelFilter::Trace);
    for target in NOISY_TARGETS {
        base_config = base_config.level_for(*target, LevelFilter::Warn);
    }

    // Console goes to stderr so command output on stdout stays parseable.
    let console_config = fern::Dispatch::new()
        .level(config.console_level)
        .chain(io::stderr());

    let mut log_config = base_config.chain(console_config);

    if let Some(log_file) = config.log_file {
        let file = fern::log_file(&log_file).with_context(|| format!("cannot open log file {}", log_file))?;
        let file_config = fern::Dispatch::new().level(config.file_level).chain(file);
        log_config = log_config.chain(file_config);
    }

    log_config.apply().context("logger already initialised")?;

    Ok(())
}

/// Utility function to convert a string to a log level
pub fn parse_log_level(level: &str) -> LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}
