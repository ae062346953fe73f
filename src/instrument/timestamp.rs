//! Software instrument reporting wall-clock time.

use super::parameter::{ParamValue, Parameter};
use anyhow::Result;
use chrono::Local;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Instrument with `timediff`, `timestamp` and `timestring` parameters.
#[derive(Debug)]
pub struct TimeStampInstrument {
    name: String,
    t0: Arc<Mutex<f64>>,
    /// Seconds since the time offset
    pub timediff: Parameter,
    /// Seconds since the Unix epoch
    pub timestamp: Parameter,
    /// Local time as text
    pub timestring: Parameter,
}

impl TimeStampInstrument {
    /// New instrument with the offset set to now
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let t0 = Arc::new(Mutex::new(unix_now()));
        let offset = t0.clone();

        let instrument = Self {
            name: name.into(),
            t0,
            timediff: Parameter::new("timediff")
                .with_label("Time since offset")
                .with_units("s")
                .with_getter(move || Ok(ParamValue::Float(unix_now() - *offset.lock()))),
            timestamp: Parameter::new("timestamp")
                .with_label("Unix timestamp")
                .with_units("s")
                .with_getter(|| Ok(ParamValue::Float(unix_now()))),
            timestring: Parameter::new("timestring")
                .with_label("Local time")
                .with_getter(|| {
                    Ok(ParamValue::Text(
                        Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
                    ))
                }),
        };
        instrument.timestamp.get()?;
        instrument.timestring.get()?;
        Ok(instrument)
    }

    /// Instrument name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reset the offset for `timediff`; `None` means now.
    pub fn set_time_offset(&self, t0: Option<f64>) {
        *self.t0.lock() = t0.unwrap_or_else(unix_now);
    }

    /// Current offset in seconds since the Unix epoch
    pub fn time_offset(&self) -> f64 {
        *self.t0.lock()
    }

    /// Description of the instrument and its parameters
    pub fn snapshot(&self) -> Value {
        json!({
            "name": self.name,
            "parameters": {
                "timediff": self.timediff.snapshot(),
                "timestamp": self.timestamp.snapshot(),
                "timestring": self.timestring.snapshot(),
            }
        })
    }
}
