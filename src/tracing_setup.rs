//! Logging setup.
//!
//! Both nodes log through `tracing`. Every handshake step runs inside a
//! `step` span carrying `step_index` (and `voltage` on the controller), so
//! any line can be traced back to the step that produced it.
//!
//! `RUST_LOG` overrides the level from the configuration file.
//!
//! # Example
//! ```no_run
//! use spectro_scan::{config::ScanConfig, tracing_setup};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScanConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//! tracing::info!("controller starting");
//! # Ok(())
//! # }
//! ```

use crate::config::{LogFormat, ScanConfig};
use crate::error::{AppResult, ScanError};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Most verbose level emitted.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Emit a line when a span opens and closes.
    pub with_span_events: bool,
    /// Include source locations.
    pub with_file_and_line: bool,
    /// Colors, Pretty format only.
    pub with_ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LogSettings {
    /// Settings from `[application]`.
    pub fn from_config(config: &ScanConfig) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format,
            ..Default::default()
        })
    }

    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle span open and close lines.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Toggle colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the global subscriber described by `config.application`.
pub fn init_from_config(config: &ScanConfig) -> AppResult<()> {
    init(LogSettings::from_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: a second call, or a call after a test harness installed its
/// own subscriber, is a no-op.
pub fn init(settings: LogSettings) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str().to_lowercase()));
    let span_events = if settings.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match settings.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_ansi(settings.with_ansi)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_span_events(span_events)
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_filter(filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Already installed elsewhere.
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(ScanError::Configuration(format!(
            "failed to initialize logging: {e}"
        ))),
    }
}

fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ScanError::Configuration(format!(
            "invalid log level '{level}', expected one of: trace, debug, info, warn, error"
        ))),
    }
}
