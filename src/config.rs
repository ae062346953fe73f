//! Configuration System using Figment
//!
//! Settings are loaded from:
//! 1. `config/default.toml` (base configuration)
//! 2. Environment variables prefixed with `DAQ_DATASET_` (nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use daq_dataset::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Writing data below {}", settings.storage.base_location.display());
//! # Ok::<(), daq_dataset::error::DatasetError>(())
//! ```

use crate::data::io::DiskIo;
use crate::data::location::FormatLocation;
use crate::error::{DatasetError, DatasetResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Storage settings
    pub storage: StorageSettings,
}

/// Where and how data sets are stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSettings {
    /// Base directory that locations are resolved against
    pub base_location: PathBuf,
    /// Format string for new locations, see [`FormatLocation`]
    #[serde(default = "default_location_format")]
    pub location_format: String,
    /// Formatter used when none is given explicitly (hdf5 or gnuplot)
    #[serde(default = "default_formatter")]
    pub default_formatter: String,
    /// Automatic write period while storing points (None = write on demand only)
    #[serde(default)]
    pub write_period_secs: Option<f64>,
    /// Flush the backing file after every write
    #[serde(default = "default_flush_on_write")]
    pub flush_on_write: bool,
}

fn default_location_format() -> String {
    "{date}/#{counter}_{name}_{time}".to_string()
}

fn default_formatter() -> String {
    "hdf5".to_string()
}

fn default_flush_on_write() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            storage: StorageSettings {
                base_location: PathBuf::from("data"),
                location_format: default_location_format(),
                default_formatter: default_formatter(),
                write_period_secs: Some(5.0),
                flush_on_write: default_flush_on_write(),
            },
        }
    }
}

impl Settings {
    /// Load settings from `config/default.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `DAQ_DATASET_`.
    /// Example: `DAQ_DATASET_STORAGE__DEFAULT_FORMATTER=gnuplot`
    pub fn load() -> DatasetResult<Self> {
        Self::load_from("config/default.toml")
    }

    /// Load settings from a specific file path
    ///
    /// Missing keys fall back to [`Settings::default`].
    pub fn load_from<P: AsRef<Path>>(path: P) -> DatasetResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_DATASET_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate settings after loading
    pub fn validate(&self) -> DatasetResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(DatasetError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formatters = ["hdf5", "gnuplot"];
        if !valid_formatters.contains(&self.storage.default_formatter.as_str()) {
            return Err(DatasetError::Configuration(format!(
                "Invalid default_formatter '{}'. Must be one of: {}",
                self.storage.default_formatter,
                valid_formatters.join(", ")
            )));
        }

        if let Some(period) = self.storage.write_period_secs {
            if !(period.is_finite() && period > 0.0) {
                return Err(DatasetError::Configuration(format!(
                    "Invalid write_period_secs {period}. Must be a positive number"
                )));
            }
        }

        if self.storage.location_format.trim().is_empty() {
            return Err(DatasetError::Configuration(
                "location_format cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Write period as a `Duration`
    pub fn write_period(&self) -> Option<Duration> {
        self.storage.write_period_secs.map(Duration::from_secs_f64)
    }

    /// Disk IO rooted at the configured base location
    pub fn disk_io(&self) -> DiskIo {
        DiskIo::new(&self.storage.base_location)
    }

    /// Location provider using the configured format string
    pub fn location_provider(&self) -> FormatLocation {
        FormatLocation::new(&self.storage.location_format)
    }
}
