//! Formatters: serialization strategies between an in-memory [`DataSet`] and a
//! backing store.
//!
//! A formatter is stateless. Everything it needs between calls lives in the data
//! set, including the single open file resource ([`StorageHandle`]). Formatters take
//! the handle out of the data set for the duration of an operation and only put it
//! back on success; on error the handle is dropped, which closes the file.
//!
//! Backends are selected at compile time:
//! - `storage_hdf5` → [`hdf5::Hdf5Format`]
//! - `storage_gnuplot` → [`gnuplot::GnuplotFormat`]

use crate::data::array::SharedArray;
use crate::data::dataset::DataSet;
use crate::error::{DatasetError, DatasetResult};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

#[cfg(feature = "storage_gnuplot")]
pub mod gnuplot;
#[cfg(feature = "storage_hdf5")]
pub mod hdf5;

/// Options for [`Formatter::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Flush the backing file to disk after writing
    pub flush: bool,
    /// Also (re)write the metadata
    pub write_metadata: bool,
    /// Rewrite everything from index 0 instead of only the modified ranges
    pub force_write: bool,
    /// For row-oriented formats: only write rows that every array has reached
    pub only_complete: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            flush: true,
            write_metadata: true,
            force_write: false,
            only_complete: true,
        }
    }
}

impl WriteOptions {
    /// Default options with the given flush behaviour
    pub fn flush(flush: bool) -> Self {
        Self {
            flush,
            ..Default::default()
        }
    }

    /// Skip the metadata
    pub fn without_metadata(mut self) -> Self {
        self.write_metadata = false;
        self
    }

    /// Rewrite everything
    pub fn forced(mut self) -> Self {
        self.force_write = true;
        self
    }

    /// Write partially filled rows too
    pub fn incomplete(mut self) -> Self {
        self.only_complete = false;
        self
    }
}

/// The open file resource a formatter keeps between calls.
pub enum StorageHandle {
    /// Open HDF5 file
    #[cfg(feature = "storage_hdf5")]
    Hdf5(::hdf5::File),
}

impl StorageHandle {
    /// Path of the open file
    pub fn path(&self) -> PathBuf {
        match *self {
            #[cfg(feature = "storage_hdf5")]
            StorageHandle::Hdf5(ref file) => PathBuf::from(file.filename()),
        }
    }
}

impl Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StorageHandle")
            .field(&self.path().display())
            .finish()
    }
}

/// Serialization strategy for data sets.
pub trait Formatter: Send + Sync + Debug {
    /// Short registry name (`"hdf5"`, `"gnuplot"`)
    fn name(&self) -> &'static str;

    /// Persist everything modified since the previous write.
    fn write(&self, data_set: &mut DataSet, options: WriteOptions) -> DatasetResult<()>;

    /// Load array contents, set-array links and metadata into `data_set`.
    ///
    /// Arrays already present in the data set are refreshed in place.
    fn read(&self, data_set: &mut DataSet) -> DatasetResult<()>;

    /// Persist the metadata. With `read_first`, metadata already stored is read and
    /// overlaid with the in-memory metadata before writing.
    fn write_metadata(&self, data_set: &mut DataSet, read_first: bool) -> DatasetResult<()>;

    /// Load the stored metadata into the data set.
    fn read_metadata(&self, data_set: &mut DataSet) -> DatasetResult<()>;

    /// Release the open file, if any. Never fails.
    fn close_file(&self, data_set: &mut DataSet) {
        drop(data_set.take_handle());
    }

    /// Final flushing write followed by [`Formatter::close_file`].
    ///
    /// The file is closed even if the write fails.
    fn finalize(&self, data_set: &mut DataSet) -> DatasetResult<()> {
        let result = self.write(data_set, WriteOptions::default().incomplete());
        self.close_file(data_set);
        result
    }
}

/// Arrays that share one set-array chain.
#[derive(Debug, Clone)]
pub struct ArrayGroup {
    /// Set array ids joined with `_`
    pub name: String,
    /// Shape of the innermost set array
    pub shape: Vec<usize>,
    /// Set arrays, outermost first
    pub set_arrays: Vec<SharedArray>,
    /// Dependent arrays
    pub data: Vec<SharedArray>,
}

/// Group arrays by their set-array chain.
///
/// Setpoint arrays are not repeated as data of their own group, and a group without
/// data whose chain is the outer part of a longer chain is dropped: its values are
/// written as part of the longer one.
pub fn group_arrays(arrays: &IndexMap<String, SharedArray>) -> DatasetResult<Vec<ArrayGroup>> {
    let mut chains: Vec<Vec<String>> = Vec::new();
    let mut members: Vec<Vec<String>> = Vec::new();
    for (id, array) in arrays {
        let chain = array.read().set_arrays().to_vec();
        match chains.iter().position(|c| *c == chain) {
            Some(i) => members[i].push(id.clone()),
            None => {
                chains.push(chain);
                members.push(vec![id.clone()]);
            }
        }
    }

    let all_set_ids: std::collections::HashSet<&String> = chains.iter().flatten().collect();

    let mut groups = Vec::new();
    for (chain, ids) in chains.iter().zip(&members) {
        let data_ids: Vec<&String> = ids.iter().filter(|id| !all_set_ids.contains(id)).collect();
        let is_outer_loop = chains
            .iter()
            .any(|other| other.len() > chain.len() && other.starts_with(chain));
        if data_ids.is_empty() && (is_outer_loop || chain.is_empty()) {
            continue;
        }

        let lookup = |id: &String| {
            arrays
                .get(id)
                .cloned()
                .ok_or_else(|| DatasetError::MissingSetArray {
                    array_id: ids.first().cloned().unwrap_or_default(),
                    set_array_id: id.clone(),
                })
        };
        let set_arrays = chain.iter().map(lookup).collect::<DatasetResult<Vec<_>>>()?;
        let data = data_ids.into_iter().map(lookup).collect::<DatasetResult<Vec<_>>>()?;

        let (name, shape) = match set_arrays.last() {
            Some(inner) => (chain.join("_"), inner.read().shape().to_vec()),
            // Arrays without setpoints form their own group
            None => (
                ids.join("_"),
                data.first().map(|a| a.read().shape().to_vec()).unwrap_or_default(),
            ),
        };

        groups.push(ArrayGroup {
            name,
            shape,
            set_arrays,
            data,
        });
    }
    Ok(groups)
}

/// Formatter used when data sets are created without one: HDF5 when compiled in,
/// otherwise GNUPlot.
pub fn default_formatter() -> Arc<dyn Formatter> {
    #[cfg(feature = "storage_hdf5")]
    {
        Arc::new(hdf5::Hdf5Format::new())
    }
    #[cfg(all(not(feature = "storage_hdf5"), feature = "storage_gnuplot"))]
    {
        Arc::new(gnuplot::GnuplotFormat::new())
    }
    #[cfg(not(any(feature = "storage_hdf5", feature = "storage_gnuplot")))]
    {
        Arc::new(DisabledFormatter)
    }
}

/// Placeholder used when no storage backend is compiled in.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledFormatter;

impl Formatter for DisabledFormatter {
    fn name(&self) -> &'static str {
        "disabled"
    }
    fn write(&self, _data_set: &mut DataSet, _options: WriteOptions) -> DatasetResult<()> {
        Err(DatasetError::FeatureNotEnabled("storage_hdf5".to_string()))
    }
    fn read(&self, _data_set: &mut DataSet) -> DatasetResult<()> {
        Err(DatasetError::FeatureNotEnabled("storage_hdf5".to_string()))
    }
    fn write_metadata(&self, _data_set: &mut DataSet, _read_first: bool) -> DatasetResult<()> {
        Err(DatasetError::FeatureNotEnabled("storage_hdf5".to_string()))
    }
    fn read_metadata(&self, _data_set: &mut DataSet) -> DatasetResult<()> {
        Err(DatasetError::FeatureNotEnabled("storage_hdf5".to_string()))
    }
}

type FormatterFactory = Box<dyn Fn() -> Arc<dyn Formatter> + Send + Sync>;

/// Registry of formatter factories with automatic feature-based registration.
///
/// ```
/// use daq_dataset::formatter::FormatterRegistry;
///
/// let registry = FormatterRegistry::new();
/// for name in registry.list_formats() {
///     println!("Available format: {}", name);
/// }
/// # #[cfg(feature = "storage_gnuplot")]
/// let formatter = registry.create("gnuplot")?;
/// # Ok::<(), daq_dataset::error::DatasetError>(())
/// ```
pub struct FormatterRegistry {
    factories: HashMap<String, FormatterFactory>,
}

impl Default for FormatterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatterRegistry {
    /// Registry with every compiled-in formatter registered
    pub fn new() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self {
            factories: HashMap::new(),
        };

        #[cfg(feature = "storage_hdf5")]
        registry.register("hdf5", || Arc::new(hdf5::Hdf5Format::new()));

        #[cfg(feature = "storage_gnuplot")]
        registry.register("gnuplot", || Arc::new(gnuplot::GnuplotFormat::new()));

        registry
    }

    /// Register (or replace) a factory under `name`
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Formatter> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Create the formatter registered under `name`
    pub fn create(&self, name: &str) -> DatasetResult<Arc<dyn Formatter>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| DatasetError::UnknownFormatter(name.to_string()))
    }

    /// Whether `name` is registered
    pub fn is_available(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order
    pub fn list_formats(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dataset_1d, dataset_2d, dataset_combined, MockFormatter};
    use tempfile::TempDir;

    fn build(builder: crate::data::dataset::DataSetBuilder, dir: &TempDir) -> DataSet {
        builder
            .io(Arc::new(crate::data::io::DiskIo::new(dir.path())))
            .formatter(Arc::new(MockFormatter::default()))
            .location("grouping")
            .build()
            .unwrap()
    }

    fn ids(arrays: &[SharedArray]) -> Vec<String> {
        arrays.iter().map(|a| a.read().array_id().to_string()).collect()
    }

    #[test]
    fn groups_1d() {
        let dir = TempDir::new().unwrap();
        let ds = build(dataset_1d(), &dir);
        let groups = group_arrays(ds.arrays()).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "x_set");
        assert_eq!(groups[0].shape, vec![5]);
        assert_eq!(ids(&groups[0].set_arrays), vec!["x_set"]);
        assert_eq!(ids(&groups[0].data), vec!["y"]);
    }

    #[test]
    fn outer_loop_without_data_is_dropped() {
        let dir = TempDir::new().unwrap();
        let ds = build(dataset_2d(), &dir);
        let groups = group_arrays(ds.arrays()).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "x_set_y_set");
        assert_eq!(groups[0].shape, vec![6, 4]);
        assert_eq!(ids(&groups[0].data), vec!["z"]);
    }

    #[test]
    fn combined_groups_keep_insertion_order() {
        let dir = TempDir::new().unwrap();
        let ds = build(dataset_combined(), &dir);
        let groups = group_arrays(ds.arrays()).unwrap();
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["x_set", "x_set_y_set"]);
        assert_eq!(ids(&groups[0].data), vec!["y1", "y2"]);
        assert_eq!(ids(&groups[1].set_arrays), vec!["x_set", "y_set"]);
        assert_eq!(ids(&groups[1].data), vec!["z1", "z2"]);
        assert_eq!(groups[1].shape, vec![2, 3]);
    }

    #[test]
    fn write_options_builders() {
        let options = WriteOptions::flush(false).without_metadata().forced().incomplete();
        assert!(!options.flush);
        assert!(!options.write_metadata);
        assert!(options.force_write);
        assert!(!options.only_complete);
        assert_eq!(WriteOptions::default(), WriteOptions::flush(true));
    }

    #[test]
    fn registry_lists_and_creates() {
        let mut registry = FormatterRegistry::new();
        #[cfg(feature = "storage_hdf5")]
        assert_eq!(registry.create("hdf5").unwrap().name(), "hdf5");
        #[cfg(feature = "storage_gnuplot")]
        assert_eq!(registry.create("gnuplot").unwrap().name(), "gnuplot");
        assert!(matches!(
            registry.create("netcdf"),
            Err(DatasetError::UnknownFormatter(_))
        ));

        registry.register("mock", || Arc::new(MockFormatter::default()));
        assert!(registry.is_available("mock"));
        assert!(registry.list_formats().contains(&"mock".to_string()));
    }

    #[test]
    fn disabled_formatter_reports_missing_feature() {
        let dir = TempDir::new().unwrap();
        let mut ds = build(dataset_1d(), &dir);
        let formatter = DisabledFormatter;
        assert!(matches!(
            formatter.write(&mut ds, WriteOptions::default()),
            Err(DatasetError::FeatureNotEnabled(_))
        ));
        // Closing still never fails
        formatter.close_file(&mut ds);
        formatter.close_file(&mut ds);
    }
}
