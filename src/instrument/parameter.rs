//! Gettable/settable instrument parameters.
//!
//! A [`Parameter`] wraps a getter and an optional setter closure. The last value
//! read or written is cached for snapshots.

use crate::error::DatasetError;
use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Debug;
use std::sync::Arc;

/// Value of a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Numeric value
    Float(f64),
    /// Text value
    Text(String),
}

impl ParamValue {
    /// The numeric value, if any
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Text(_) => None,
        }
    }

    /// The text value, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Float(_) => None,
            ParamValue::Text(s) => Some(s),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

type Getter = Arc<dyn Fn() -> Result<ParamValue> + Send + Sync>;
type Setter = Arc<dyn Fn(ParamValue) -> Result<()> + Send + Sync>;

/// Named instrument parameter backed by closures.
pub struct Parameter {
    name: String,
    label: String,
    units: String,
    docstring: Option<String>,
    getter: Option<Getter>,
    setter: Option<Setter>,
    latest: Mutex<Option<ParamValue>>,
}

impl Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("units", &self.units)
            .field("gettable", &self.getter.is_some())
            .field("settable", &self.setter.is_some())
            .finish()
    }
}

impl Parameter {
    /// Parameter without getter or setter; the label defaults to the name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            units: String::new(),
            docstring: None,
            getter: None,
            setter: None,
            latest: Mutex::new(None),
        }
    }

    /// Set the display label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the unit
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    /// Set the docstring
    pub fn with_docstring(mut self, docstring: impl Into<String>) -> Self {
        self.docstring = Some(docstring.into());
        self
    }

    /// Connect a getter
    pub fn with_getter(mut self, getter: impl Fn() -> Result<ParamValue> + Send + Sync + 'static) -> Self {
        self.getter = Some(Arc::new(getter));
        self
    }

    /// Connect a setter
    pub fn with_setter(mut self, setter: impl Fn(ParamValue) -> Result<()> + Send + Sync + 'static) -> Self {
        self.setter = Some(Arc::new(setter));
        self
    }

    /// Parameter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Unit
    pub fn units(&self) -> &str {
        &self.units
    }

    /// Docstring
    pub fn docstring(&self) -> Option<&str> {
        self.docstring.as_deref()
    }

    /// Read the current value
    pub fn get(&self) -> Result<ParamValue> {
        let getter = self
            .getter
            .as_ref()
            .ok_or_else(|| DatasetError::ParameterNotGettable(self.name.clone()))?;
        let value = getter()?;
        *self.latest.lock() = Some(value.clone());
        Ok(value)
    }

    /// Read the current value as a number
    pub fn get_f64(&self) -> Result<f64> {
        self.get()?
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("Parameter '{}' is not numeric", self.name))
    }

    /// Write a value
    pub fn set(&self, value: impl Into<ParamValue>) -> Result<()> {
        let setter = self
            .setter
            .as_ref()
            .ok_or_else(|| DatasetError::ParameterReadOnly(self.name.clone()))?;
        let value = value.into();
        setter(value.clone())?;
        *self.latest.lock() = Some(value);
        Ok(())
    }

    /// Last value read or written
    pub fn latest(&self) -> Option<ParamValue> {
        self.latest.lock().clone()
    }

    /// Description including the last known value
    pub fn snapshot(&self) -> Value {
        json!({
            "name": self.name,
            "label": self.label,
            "units": self.units,
            "value": self.latest(),
        })
    }
}
