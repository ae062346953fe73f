//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DatasetError`. Using the `thiserror`
//! crate, it gives one consistent way to report everything that can go wrong while
//! building, writing and reading data sets.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: parse errors from `figment` and semantic
//!   validation errors in the loaded settings.
//! - **`Io`**, **`Serialization`**, **`Hdf5`**: failures of the backing store. These
//!   are always surfaced to the caller, in particular a storage-open conflict on a
//!   file that another writer left open and unflushed.
//! - **`DuplicateArrayId`**, **`ArrayNotFound`**, **`MissingSetArray`**,
//!   **`IndexOutOfBounds`**, **`ShapeMismatch`**, **`Nesting`**: misuse of the
//!   in-memory data model.
//! - **`LocationExists`**, **`NoLocation`**, **`Format`**, **`Metadata`**: location
//!   and file-content problems.
//! - **`ManagerNeedsRestart`**: the data manager must be recreated before it can
//!   accept a new data set.
//!
//! Lifecycle no-ops (closing twice, closing before the first write) have no variant:
//! `Formatter::close_file` returns `()` and cannot fail.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DatasetResult<T> = std::result::Result<T, DatasetError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage_hdf5")]
    #[error("HDF5 storage error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[cfg(feature = "storage_gnuplot")]
    #[error("Delimited data error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Array '{0}' already exists in data set")]
    DuplicateArrayId(String),

    #[error("Array '{0}' not found in data set")]
    ArrayNotFound(String),

    #[error("Array '{array_id}' depends on set array '{set_array_id}' which is not in the data set")]
    MissingSetArray {
        array_id: String,
        set_array_id: String,
    },

    #[error("Index {index:?} out of bounds for array '{array_id}' with shape {shape:?}")]
    IndexOutOfBounds {
        array_id: String,
        index: Vec<usize>,
        shape: Vec<usize>,
    },

    #[error("Shape mismatch for array '{array_id}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        array_id: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Cannot nest array '{0}': {1}")]
    Nesting(String, String),

    #[error("Location '{0}' already exists")]
    LocationExists(String),

    #[error("Data set has no location")]
    NoLocation,

    #[error("Malformed data file '{path}': {reason}")]
    Format { path: String, reason: String },

    #[error("Unsupported metadata at '{key}': {reason}")]
    Metadata { key: String, reason: String },

    #[error("Unknown formatter '{0}'")]
    UnknownFormatter(String),

    #[error("Data manager needs a restart")]
    ManagerNeedsRestart,

    #[error("Unexpected query to data manager: {0}")]
    UnexpectedQuery(String),

    #[error("Parameter '{0}' is read-only")]
    ParameterReadOnly(String),

    #[error("Parameter '{0}' has no getter")]
    ParameterNotGettable(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DatasetError {
    fn from(value: figment::Error) -> Self {
        DatasetError::Config(Box::new(value))
    }
}

impl DatasetError {
    /// Build a `Format` error for a file path.
    pub fn format(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        DatasetError::Format {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error came from the backing store rather than from misuse of
    /// the in-memory model.
    pub fn is_storage(&self) -> bool {
        match self {
            DatasetError::Io(_) | DatasetError::Format { .. } => true,
            #[cfg(feature = "storage_hdf5")]
            DatasetError::Hdf5(_) => true,
            #[cfg(feature = "storage_gnuplot")]
            DatasetError::Csv(_) => true,
            _ => false,
        }
    }
}
