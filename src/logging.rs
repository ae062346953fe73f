//! Tracing setup for applications built on the dataset layer.
//!
//! The library only emits `tracing` events (file create/open/close at `info`,
//! per-array write ranges at `debug`, close failures and unsupported metadata at
//! `warn`). Binaries install a subscriber here:
//! - Pretty, compact or JSON output
//! - `RUST_LOG` wins over the configured level
//! - Level taken from [`Settings::log_level`]
//!
//! # Example
//! ```no_run
//! use daq_dataset::{config::Settings, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! logging::init_from_settings(&settings)?;
//! info!(location = "2024-01-01/#001_sweep", "data set created");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use once_cell::sync::OnceCell;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (interactive use)
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Maximum level when `RUST_LOG` is not set
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Log span open/close, e.g. around `DataSet::read` and `DataSet::finalize`
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// ANSI colors (Pretty only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Config at the level named in the settings
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        Ok(Self::new(parse_log_level(&settings.log_level)?))
    }

    /// Config at `level` with default options
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable source locations
    pub fn with_file_and_line(mut self, enabled: bool) -> Self {
        self.with_file_and_line = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level).into())
            .from_env_lossy()
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.with_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_span_events(span_events)
            .with_file(self.with_file_and_line)
            .with_line_number(self.with_file_and_line);

        match self.format {
            OutputFormat::Pretty => layer.pretty().with_ansi(self.with_ansi).boxed(),
            OutputFormat::Compact => layer.compact().with_ansi(false).boxed(),
            OutputFormat::Json => layer.json().boxed(),
        }
    }
}

/// Install the subscriber for the level in `settings`
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// Calling it again, or after another component installed a subscriber, is a no-op.
pub fn init(config: TracingConfig) -> Result<(), String> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let result = tracing_subscriber::registry()
        .with(config.fmt_layer().with_filter(config.filter()))
        .try_init();
    if let Err(e) = result {
        if !e.to_string().contains("already") {
            return Err(format!("Failed to initialize tracing: {e}"));
        }
    }
    let _ = INITIALIZED.set(());
    Ok(())
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    Level::from_str(level).map_err(|_| {
        format!("Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error")
    })
}
