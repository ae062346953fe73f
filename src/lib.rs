//! # DAQ Dataset Library
//!
//! Incremental persistence of measurement data sets. A measurement loop stores points
//! into a [`data::dataset::DataSet`]; the data set's formatter writes only what changed
//! since the last save, so a long sweep can be saved (and inspected) while it runs.
//!
//! ## Crate Structure
//!
//! - **`config`**: Settings loaded with `figment` from `config/default.toml` and the
//!   environment. See `config::Settings`.
//! - **`data`**: Data arrays with their save cursors, the `DataSet` container, metadata
//!   helpers, location IO and location providers.
//! - **`error`**: The `DatasetError` enum used across the crate.
//! - **`formatter`**: The `Formatter` trait and its HDF5 and GNUPlot implementations
//!   (behind the `storage_hdf5` and `storage_gnuplot` features), plus a registry to
//!   create them by name.
//! - **`instrument`**: Closure-backed parameters and a timestamp instrument.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`testing`**: Fixtures and mocks for tests of code that uses data sets.
//!
//! ## Example
//!
//! ```no_run
//! use daq_dataset::data::array::DataArray;
//! use daq_dataset::data::dataset::DataSet;
//!
//! # fn main() -> Result<(), daq_dataset::error::DatasetError> {
//! let x = DataArray::builder("x").setpoint().shape(&[3]).build();
//! let y = DataArray::builder("y").set_arrays(&[&x]).shape(&[3]).build();
//! let mut data_set = DataSet::builder().array(x).array(y).name("sweep").build()?;
//!
//! for (i, v) in [0.0, 0.5, 1.0].into_iter().enumerate() {
//!     data_set.store(&[i], &[("x_set", v), ("y", v * v)])?;
//!     data_set.write(true)?;
//! }
//! data_set.finalize()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod formatter;
pub mod instrument;
pub mod logging;
pub mod testing;
