//! `DataSet`: a named collection of arrays with metadata, bound to a storage
//! location and a formatter.
//!
//! The data set owns the only open file resource of its formatter (see
//! [`StorageHandle`]), so two data sets never share a file handle and the lifecycle
//! of that handle is visible from one place:
//!
//! ```text
//! build ──► write* ──► finalize ──► (closed)
//!             │  ▲          │
//!             ▼  │          └── close_file: always succeeds, safe to repeat
//!            read / read_metadata
//! ```

use crate::config::Settings;
use crate::data::array::{share, DataArray, SharedArray};
use crate::data::io::{DiskIo, LocationIo};
use crate::data::location::FormatLocation;
use crate::data::metadata::{deep_update, Metadata};
use crate::error::{DatasetError, DatasetResult};
use crate::formatter::{default_formatter, Formatter, FormatterRegistry, StorageHandle, WriteOptions};
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Arrays, metadata and the storage binding of one measurement.
#[derive(Debug)]
pub struct DataSet {
    location: Option<String>,
    arrays: IndexMap<String, SharedArray>,
    metadata: Metadata,
    formatter: Arc<dyn Formatter>,
    io: Arc<dyn LocationIo>,
    handle: Option<StorageHandle>,
    write_period: Option<Duration>,
    last_write: Instant,
}

impl DataSet {
    /// Empty data set at `location` on the local disk.
    pub fn new(location: Option<String>, formatter: Arc<dyn Formatter>) -> Self {
        Self {
            location,
            arrays: IndexMap::new(),
            metadata: Metadata::new(),
            formatter,
            io: Arc::new(DiskIo::default()),
            handle: None,
            write_period: None,
            last_write: Instant::now(),
        }
    }

    /// Start building a data set
    pub fn builder() -> DataSetBuilder {
        DataSetBuilder::default()
    }

    /// Replace the location IO
    pub fn with_io(mut self, io: Arc<dyn LocationIo>) -> Self {
        self.io = io;
        self
    }

    /// Storage location, relative to the IO's base location
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Storage location, or [`DatasetError::NoLocation`]
    pub fn require_location(&self) -> DatasetResult<&str> {
        self.location.as_deref().ok_or(DatasetError::NoLocation)
    }

    /// Point the data set at another location. An open file is closed first.
    pub fn set_location(&mut self, location: Option<String>) {
        if self.location != location {
            self.close_file();
        }
        self.location = location;
    }

    /// Location IO
    pub fn io(&self) -> &Arc<dyn LocationIo> {
        &self.io
    }

    /// The formatter
    pub fn formatter(&self) -> Arc<dyn Formatter> {
        Arc::clone(&self.formatter)
    }

    /// Switch formatter. An open file of the old formatter is closed first.
    pub fn set_formatter(&mut self, formatter: Arc<dyn Formatter>) {
        self.close_file();
        self.formatter = formatter;
    }

    /// Metadata tree
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable metadata tree
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Deep-merge `update` into the metadata
    pub fn add_metadata(&mut self, update: &Metadata) {
        deep_update(&mut self.metadata, update);
    }

    /// Arrays in insertion order
    pub fn arrays(&self) -> &IndexMap<String, SharedArray> {
        &self.arrays
    }

    /// Array ids in insertion order
    pub fn array_ids(&self) -> Vec<String> {
        self.arrays.keys().cloned().collect()
    }

    /// Shared handle to an array
    pub fn array(&self, array_id: &str) -> DatasetResult<SharedArray> {
        self.arrays
            .get(array_id)
            .cloned()
            .ok_or_else(|| DatasetError::ArrayNotFound(array_id.to_string()))
    }

    /// Add an array and return its shared handle.
    ///
    /// Set arrays may be added later; [`DataSet::validate`] checks the links.
    pub fn add_array(&mut self, array: DataArray) -> DatasetResult<SharedArray> {
        let shared = share(array);
        self.add_shared_array(Arc::clone(&shared))?;
        Ok(shared)
    }

    /// Add an array that is already shared with other holders
    pub fn add_shared_array(&mut self, array: SharedArray) -> DatasetResult<()> {
        let array_id = array.read().array_id().to_string();
        if self.arrays.contains_key(&array_id) {
            return Err(DatasetError::DuplicateArrayId(array_id));
        }
        debug!(array_id = %array_id, "added array");
        self.arrays.insert(array_id, array);
        Ok(())
    }

    /// Remove an array. Other arrays referencing it as a set array are left as they
    /// are and will fail validation.
    pub fn remove_array(&mut self, array_id: &str) -> DatasetResult<SharedArray> {
        self.arrays
            .shift_remove(array_id)
            .ok_or_else(|| DatasetError::ArrayNotFound(array_id.to_string()))
    }

    /// Check that every referenced set array is part of the data set.
    pub fn validate(&self) -> DatasetResult<()> {
        for (array_id, array) in &self.arrays {
            for set_array_id in array.read().set_arrays() {
                if !self.arrays.contains_key(set_array_id) {
                    return Err(DatasetError::MissingSetArray {
                        array_id: array_id.clone(),
                        set_array_id: set_array_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Write period for automatic writes from [`DataSet::store`]
    pub fn set_write_period(&mut self, write_period: Option<Duration>) {
        self.write_period = write_period;
    }

    /// Store one measured point.
    ///
    /// Each array is indexed with as many leading entries of `loop_indices` as it has
    /// dimensions. When a write period is set and has elapsed, the arrays are
    /// written and flushed to disk; metadata waits for the next explicit write.
    pub fn store(&mut self, loop_indices: &[usize], values: &[(&str, f64)]) -> DatasetResult<()> {
        for (array_id, value) in values {
            let array = self
                .arrays
                .get(*array_id)
                .ok_or_else(|| DatasetError::ArrayNotFound(array_id.to_string()))?;
            let mut array = array.write();
            let ndim = array.ndim().min(loop_indices.len());
            array.set(&loop_indices[..ndim], *value)?;
        }

        if let Some(period) = self.write_period {
            if self.last_write.elapsed() >= period {
                debug!(?period, "write period elapsed");
                self.write_with(WriteOptions::flush(true).without_metadata())?;
            }
        }
        Ok(())
    }

    /// Load array contents and metadata from storage
    #[instrument(skip(self), fields(location = ?self.location))]
    pub fn read(&mut self) -> DatasetResult<()> {
        let formatter = self.formatter();
        formatter.read(self)
    }

    /// Load the metadata from storage
    pub fn read_metadata(&mut self) -> DatasetResult<()> {
        let formatter = self.formatter();
        formatter.read_metadata(self)
    }

    /// Write everything modified since the previous write
    pub fn write(&mut self, flush: bool) -> DatasetResult<()> {
        self.write_with(WriteOptions::flush(flush))
    }

    /// Write with explicit options
    pub fn write_with(&mut self, options: WriteOptions) -> DatasetResult<()> {
        let formatter = self.formatter();
        let result = formatter.write(self, options);
        self.last_write = Instant::now();
        result
    }

    /// Write the metadata, merged over what is already stored
    pub fn write_metadata(&mut self) -> DatasetResult<()> {
        let formatter = self.formatter();
        formatter.write_metadata(self, true)
    }

    /// Final write and close.
    ///
    /// The file is closed even when the write fails; the error is returned.
    #[instrument(skip(self), fields(location = ?self.location))]
    pub fn finalize(&mut self) -> DatasetResult<()> {
        let formatter = self.formatter();
        let result = formatter.finalize(self);
        match &result {
            Ok(()) => info!("data set finalized"),
            Err(e) => warn!(error = %e, "final write failed, file closed anyway"),
        }
        result
    }

    /// Release the open file. Never fails; safe to call repeatedly and before
    /// anything was written.
    pub fn close_file(&mut self) {
        let formatter = self.formatter();
        formatter.close_file(self);
    }

    /// Whether the formatter currently holds an open file
    pub fn has_open_file(&self) -> bool {
        self.handle.is_some()
    }

    /// Path of the open file, if any
    pub fn file_path(&self) -> Option<PathBuf> {
        self.handle.as_ref().map(StorageHandle::path)
    }

    /// Take the open file out of the data set.
    pub fn take_handle(&mut self) -> Option<StorageHandle> {
        self.handle.take()
    }

    /// Hand an open file to the data set. A previously held file is dropped.
    pub fn set_handle(&mut self, handle: StorageHandle) {
        self.handle = Some(handle);
    }

    /// Record a description of the data set in its metadata and return a copy.
    pub fn snapshot(&mut self) -> Metadata {
        let arrays: serde_json::Map<String, Value> = self
            .arrays
            .iter()
            .map(|(id, array)| {
                let snap = serde_json::to_value(array.read().snapshot()).unwrap_or(Value::Null);
                (id.clone(), snap)
            })
            .collect();

        self.metadata.insert("__class__".to_string(), json!("daq_dataset::DataSet"));
        self.metadata.insert("location".to_string(), json!(self.location));
        self.metadata.insert("arrays".to_string(), Value::Object(arrays));
        self.metadata
            .insert("formatter".to_string(), json!(self.formatter.name()));
        self.metadata.insert(
            "io".to_string(),
            json!(self.io.base_location().display().to_string()),
        );
        self.metadata.clone()
    }

    /// Fraction of all array elements that are filled
    pub fn fraction_complete(&self) -> f64 {
        let mut filled = 0.0;
        let mut total = 0usize;
        for array in self.arrays.values() {
            let array = array.read();
            if array.is_setpoint() {
                continue;
            }
            filled += array.fraction_complete() * array.len() as f64;
            total += array.len();
        }
        if total == 0 {
            0.0
        } else {
            filled / total as f64
        }
    }

    /// The array most likely to be plotted: the first non-setpoint array.
    pub fn default_parameter_array(&self) -> Option<SharedArray> {
        self.arrays
            .values()
            .find(|a| !a.read().is_setpoint())
            .or_else(|| self.arrays.values().next())
            .cloned()
    }
}

/// Builder for [`DataSet`].
///
/// Without an explicit location, one is generated by the location provider.
/// An explicit location that already holds data is rejected unless `overwrite` is set.
#[derive(Default)]
pub struct DataSetBuilder {
    arrays: Vec<DataArray>,
    location: Option<String>,
    name: Option<String>,
    io: Option<Arc<dyn LocationIo>>,
    formatter: Option<Arc<dyn Formatter>>,
    location_provider: Option<FormatLocation>,
    overwrite: bool,
    write_period: Option<Duration>,
    metadata: Metadata,
}

impl DataSetBuilder {
    /// Builder preconfigured from settings: IO, location provider, formatter and
    /// write period.
    pub fn from_settings(settings: &Settings) -> DatasetResult<Self> {
        let formatter = FormatterRegistry::new().create(&settings.storage.default_formatter)?;
        Ok(Self::default()
            .io(Arc::new(settings.disk_io()))
            .location_provider(settings.location_provider())
            .formatter(formatter)
            .write_period(settings.write_period()))
    }

    /// Add an array
    pub fn array(mut self, array: DataArray) -> Self {
        self.arrays.push(array);
        self
    }

    /// Add several arrays
    pub fn arrays(mut self, arrays: impl IntoIterator<Item = DataArray>) -> Self {
        self.arrays.extend(arrays);
        self
    }

    /// Explicit location
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Name used by the location provider
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Location IO
    pub fn io(mut self, io: Arc<dyn LocationIo>) -> Self {
        self.io = Some(io);
        self
    }

    /// Formatter
    pub fn formatter(mut self, formatter: Arc<dyn Formatter>) -> Self {
        self.formatter = Some(formatter);
        self
    }

    /// Location provider for generated locations
    pub fn location_provider(mut self, provider: FormatLocation) -> Self {
        self.location_provider = Some(provider);
        self
    }

    /// Allow an explicit location that already exists
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Automatic write period for [`DataSet::store`]
    pub fn write_period(mut self, write_period: Option<Duration>) -> Self {
        self.write_period = write_period;
        self
    }

    /// Initial metadata
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build and validate the data set
    pub fn build(self) -> DatasetResult<DataSet> {
        let io = self.io.unwrap_or_else(|| Arc::new(DiskIo::default()));
        let formatter = self.formatter.unwrap_or_else(default_formatter);

        let location = match self.location {
            Some(location) => {
                if !self.overwrite && io.exists(&location) {
                    return Err(DatasetError::LocationExists(location));
                }
                location
            }
            None => self
                .location_provider
                .unwrap_or_default()
                .location(io.as_ref(), self.name.as_deref())?,
        };

        let mut data_set = DataSet::new(Some(location), formatter).with_io(io);
        data_set.write_period = self.write_period;
        data_set.metadata = self.metadata;
        for array in self.arrays {
            data_set.add_array(array)?;
        }
        data_set.validate()?;

        debug!(
            location = ?data_set.location,
            formatter = data_set.formatter.name(),
            arrays = data_set.arrays.len(),
            "created data set"
        );
        Ok(data_set)
    }
}

/// Data set bound to an existing location, filled by reading it.
pub fn load_data(
    location: impl Into<String>,
    formatter: Arc<dyn Formatter>,
    io: Arc<dyn LocationIo>,
) -> DatasetResult<DataSet> {
    let mut data_set = DataSet::new(Some(location.into()), formatter).with_io(io);
    data_set.read()?;
    Ok(data_set)
}
