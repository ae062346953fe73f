//! HDF5 formatter.
//!
//! One file per data set at `<location>/<basename>.hdf5`:
//!
//! ```text
//! /                         attrs: __format_tag = "hdf5", __format_version = "0.1"
//! ├── Data Arrays/
//! │   ├── x_set             1-D chunked f64, attrs: label, name, units, is_setpoint,
//! │   └── y                 set_arrays (JSON list of ids), shape
//! └── metadata/             nested groups and attributes
//! ```
//!
//! Arrays are stored flattened in row-major order and grow by resizing, so an
//! incremental write only touches the modified range. The `shape` attribute restores
//! the n-d shape on read; missing trailing points come back as NaN.
//!
//! Metadata encoding:
//! - objects → groups, scalars → attributes
//! - `null` → the string `NoneType:__None__`, `[]` → `NoneType:__emptylist__`
//! - lists of numbers or strings → datasets tagged `list_type = "array"` / `"str"`
//! - lists of objects → a group tagged `list_type = "dict"` with one sub-group per item
//! - any other list → a group tagged `list_type = "json"` holding the JSON text

use super::{Formatter, StorageHandle, WriteOptions};
use crate::data::array::DataArray;
use crate::data::dataset::DataSet;
use crate::data::metadata::{deep_update, Metadata};
use crate::error::{DatasetError, DatasetResult};
use hdf5::types::{TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Attribute, Dataset, File, Group, Location};
use ndarray::{ArrayD, IxDyn};
use serde_json::{Number, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DATA_ARRAYS: &str = "Data Arrays";
const METADATA: &str = "metadata";
const NONE_MARKER: &str = "NoneType:__None__";
const EMPTY_LIST_MARKER: &str = "NoneType:__emptylist__";
// Attributes tagging a group as an encoded list rather than a nested object
const LIST_TYPE: &str = "__list_type";
const BASE_LIST_KEY: &str = "__base_list_key";
const LIST_LENGTH: &str = "__list_length";
const LIST_VALUE: &str = "__list_value";

/// HDF5 formatter with incremental, resizable array datasets.
#[derive(Debug, Clone)]
pub struct Hdf5Format {
    chunk_size: usize,
}

impl Default for Hdf5Format {
    fn default() -> Self {
        Self::new()
    }
}

impl Hdf5Format {
    /// Value of the `__format_tag` root attribute
    pub const FORMAT_TAG: &'static str = "hdf5";
    /// Value of the `__format_version` root attribute
    pub const FORMAT_VERSION: &'static str = "0.1";

    /// Formatter with the default chunk size
    pub fn new() -> Self {
        Self { chunk_size: 1024 }
    }

    /// Chunk size for new array datasets
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// File path of the data set: `<location>/<basename of location>.hdf5`
    pub fn filepath(&self, data_set: &DataSet) -> DatasetResult<PathBuf> {
        let dir = data_set.io().to_path(data_set.require_location()?);
        let stem = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        Ok(dir.join(format!("{stem}.hdf5")))
    }

    fn create_file(&self, path: &Path) -> DatasetResult<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::append(path)?;
        info!(path = %path.display(), "opened HDF5 file for writing");
        Ok(file)
    }

    fn open_file(&self, path: &Path) -> DatasetResult<File> {
        let file = File::open_rw(path)?;
        debug!(path = %path.display(), "opened HDF5 file for reading");
        Ok(file)
    }

    /// Run `op` on the open file, opening it with `open` when the data set holds none.
    ///
    /// The handle goes back into the data set only on success. On error the file is
    /// closed before the error is returned.
    fn with_file<T>(
        &self,
        data_set: &mut DataSet,
        open: impl FnOnce(&Path) -> DatasetResult<File>,
        op: impl FnOnce(&File, &mut DataSet) -> DatasetResult<T>,
    ) -> DatasetResult<T> {
        let file = match data_set.take_handle() {
            Some(StorageHandle::Hdf5(file)) => file,
            None => open(&self.filepath(data_set)?)?,
        };
        match op(&file, data_set) {
            Ok(value) => {
                data_set.set_handle(StorageHandle::Hdf5(file));
                Ok(value)
            }
            Err(e) => {
                warn!(error = %e, "HDF5 operation failed, closing file");
                if let Err(close_err) = file.close() {
                    warn!(error = %close_err, "failed to close HDF5 file");
                }
                Err(e)
            }
        }
    }

    fn init_root(&self, file: &File) -> DatasetResult<()> {
        write_str_attr(file, "__format_tag", Self::FORMAT_TAG)?;
        write_str_attr(file, "__format_version", Self::FORMAT_VERSION)?;
        if !file.link_exists(DATA_ARRAYS) {
            file.create_group(DATA_ARRAYS)?;
        }
        Ok(())
    }

    fn create_array_dataset(&self, group: &Group, array: &DataArray) -> DatasetResult<Dataset> {
        let dset = group
            .new_dataset::<f64>()
            .chunk(self.chunk_size)
            .shape(0..)
            .create(array.array_id())?;
        write_str_attr(&dset, "label", array.label())?;
        write_str_attr(&dset, "name", array.name())?;
        write_str_attr(&dset, "units", array.units())?;
        write_str_attr(&dset, "is_setpoint", if array.is_setpoint() { "True" } else { "False" })?;
        write_str_attr(&dset, "set_arrays", &serde_json::to_string(array.set_arrays())?)?;
        write_shape_attr(&dset, array.shape())?;
        Ok(dset)
    }

    fn write_arrays(&self, file: &File, data_set: &DataSet, force_write: bool) -> DatasetResult<()> {
        let group = file.group(DATA_ARRAYS)?;
        for (array_id, shared) in data_set.arrays() {
            let mut array = shared.write();
            let exists = group.link_exists(array_id);
            let range = if force_write {
                (!array.is_empty()).then(|| (0, array.len() - 1))
            } else {
                array.modified_range()
            };
            if exists && range.is_none() {
                continue;
            }

            let dset = if exists && !force_write {
                group.dataset(array_id)?
            } else {
                if exists {
                    group.unlink(array_id)?;
                }
                self.create_array_dataset(&group, &array)?
            };

            let Some((lo, hi)) = range else {
                continue;
            };
            let old_len = dset.size();
            let new_len = old_len.max(hi + 1);
            if new_len != old_len {
                dset.resize((new_len,))?;
            }
            // Points between the stored end and the modified range are written too
            let start = lo.min(old_len);
            let values = array.flat_range(start, hi + 1);
            dset.write_slice(&values, start..hi + 1)?;
            write_shape_attr(&dset, array.shape())?;
            array.mark_saved(hi);
            debug!(array_id = %array_id, start, end = hi + 1, "wrote array range");
        }
        Ok(())
    }

    fn read_arrays(&self, file: &File, data_set: &mut DataSet) -> DatasetResult<()> {
        let group = file.group(DATA_ARRAYS)?;
        let mut links = Vec::new();

        for dset in group.datasets()? {
            let array_id = basename(&dset.name());
            let label = read_str_attr(&dset, "label")?.unwrap_or_else(|| array_id.clone());
            let name = read_str_attr(&dset, "name")?.unwrap_or_else(|| array_id.clone());
            let units = read_str_attr(&dset, "units")?.unwrap_or_default();
            let is_setpoint = read_str_attr(&dset, "is_setpoint")?.as_deref() == Some("True");
            let set_arrays: Vec<String> = match read_str_attr(&dset, "set_arrays")? {
                Some(text) => serde_json::from_str(&text)?,
                None => Vec::new(),
            };

            let mut values = dset.read_raw::<f64>()?;
            let stored = values.len();
            let shape: Vec<usize> = if has_attr(&dset, "shape")? {
                dset.attr("shape")?
                    .read_raw::<u64>()?
                    .into_iter()
                    .map(|d| d as usize)
                    .collect()
            } else {
                vec![stored]
            };
            let total: usize = shape.iter().product();
            if stored > total {
                return Err(DatasetError::format(
                    file.filename(),
                    format!("array '{array_id}' holds {stored} values but has shape {shape:?}"),
                ));
            }
            values.resize(total, f64::NAN);
            let data = ArrayD::from_shape_vec(IxDyn(&shape), values)
                .map_err(|e| DatasetError::format(file.filename(), e.to_string()))?;

            let shared = match data_set.arrays().get(&array_id) {
                Some(existing) => existing.clone(),
                None => data_set.add_array(
                    DataArray::builder(name.clone())
                        .array_id(array_id.clone())
                        .build(),
                )?,
            };
            {
                let mut array = shared.write();
                array.set_attributes(name, label, units, is_setpoint);
                array.replace_data(data);
                array.set_modified_range(None);
                if stored > 0 {
                    array.mark_saved(stored - 1);
                }
            }
            links.push((shared, set_arrays));
        }

        for (shared, set_arrays) in links {
            shared.write().set_set_arrays(set_arrays);
        }
        data_set.validate()?;
        info!(arrays = data_set.arrays().len(), "read HDF5 arrays");
        Ok(())
    }

    fn read_metadata_from(&self, file: &File) -> DatasetResult<Metadata> {
        if !file.link_exists(METADATA) {
            return Ok(Metadata::new());
        }
        read_object(&file.group(METADATA)?)
    }

    fn write_metadata_to(&self, file: &File, data_set: &mut DataSet, read_first: bool) -> DatasetResult<()> {
        if read_first {
            let mut stored = self.read_metadata_from(file)?;
            deep_update(&mut stored, data_set.metadata());
            *data_set.metadata_mut() = stored;
        }
        if file.link_exists(METADATA) {
            file.unlink(METADATA)?;
        }
        let group = file.create_group(METADATA)?;
        write_object(&group, data_set.metadata())?;
        debug!(keys = data_set.metadata().len(), "wrote HDF5 metadata");
        Ok(())
    }
}

impl Formatter for Hdf5Format {
    fn name(&self) -> &'static str {
        "hdf5"
    }

    fn write(&self, data_set: &mut DataSet, options: WriteOptions) -> DatasetResult<()> {
        self.with_file(
            data_set,
            |path| self.create_file(path),
            |file, data_set| {
                if options.force_write || !file.link_exists(DATA_ARRAYS) {
                    self.init_root(file)?;
                }
                self.write_arrays(file, data_set, options.force_write)?;
                if options.write_metadata {
                    self.write_metadata_to(file, data_set, false)?;
                }
                if options.flush {
                    file.flush()?;
                }
                Ok(())
            },
        )
    }

    fn read(&self, data_set: &mut DataSet) -> DatasetResult<()> {
        self.with_file(
            data_set,
            |path| self.open_file(path),
            |file, data_set| {
                self.read_arrays(file, data_set)?;
                let loaded = self.read_metadata_from(file)?;
                data_set.metadata_mut().extend(loaded);
                Ok(())
            },
        )
    }

    fn write_metadata(&self, data_set: &mut DataSet, read_first: bool) -> DatasetResult<()> {
        self.with_file(
            data_set,
            |path| self.create_file(path),
            |file, data_set| {
                if !file.link_exists(DATA_ARRAYS) {
                    self.init_root(file)?;
                }
                self.write_metadata_to(file, data_set, read_first)?;
                file.flush()?;
                Ok(())
            },
        )
    }

    fn read_metadata(&self, data_set: &mut DataSet) -> DatasetResult<()> {
        self.with_file(
            data_set,
            |path| self.open_file(path),
            |file, data_set| {
                let loaded = self.read_metadata_from(file)?;
                data_set.metadata_mut().extend(loaded);
                Ok(())
            },
        )
    }

    fn close_file(&self, data_set: &mut DataSet) {
        let Some(StorageHandle::Hdf5(file)) = data_set.take_handle() else {
            return;
        };
        let filename = file.filename();
        match file.close() {
            Ok(()) => info!(path = %filename, "closed HDF5 file"),
            Err(e) => warn!(path = %filename, error = %e, "failed to close HDF5 file"),
        }
    }
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn has_attr(loc: &Location, name: &str) -> DatasetResult<bool> {
    Ok(loc.attr_names()?.iter().any(|n| n == name))
}

fn to_varlen(key: &str, value: &str) -> DatasetResult<VarLenUnicode> {
    value.parse::<VarLenUnicode>().map_err(|e| DatasetError::Metadata {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn write_str_attr(loc: &Location, name: &str, value: &str) -> DatasetResult<()> {
    if has_attr(loc, name)? {
        loc.delete_attr(name)?;
    }
    loc.new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&to_varlen(name, value)?)?;
    Ok(())
}

fn read_str_attr(loc: &Location, name: &str) -> DatasetResult<Option<String>> {
    if !has_attr(loc, name)? {
        return Ok(None);
    }
    let value = loc.attr(name)?.read_scalar::<VarLenUnicode>()?;
    Ok(Some(value.as_str().to_string()))
}

fn write_shape_attr(dset: &Dataset, shape: &[usize]) -> DatasetResult<()> {
    if has_attr(dset, "shape")? {
        dset.delete_attr("shape")?;
    }
    let shape: Vec<u64> = shape.iter().map(|&d| d as u64).collect();
    dset.new_attr::<u64>()
        .shape(shape.len())
        .create("shape")?
        .write(&shape)?;
    Ok(())
}

fn check_key(key: &str) -> DatasetResult<()> {
    if key.is_empty() || key.contains('/') {
        return Err(DatasetError::Metadata {
            key: key.to_string(),
            reason: "keys stored as HDF5 links must be non-empty and free of '/'".to_string(),
        });
    }
    Ok(())
}

fn write_object(group: &Group, map: &Metadata) -> DatasetResult<()> {
    for (key, value) in map {
        if key == LIST_TYPE {
            return Err(DatasetError::Metadata {
                key: key.clone(),
                reason: "reserved for list encoding".to_string(),
            });
        }
        match value {
            Value::Null => write_str_attr(group, key, NONE_MARKER)?,
            Value::Bool(b) => {
                group.new_attr::<bool>().create(key.as_str())?.write_scalar(b)?;
            }
            Value::Number(n) => write_number_attr(group, key, n)?,
            Value::String(s) => write_str_attr(group, key, s)?,
            Value::Object(obj) => {
                check_key(key)?;
                let sub = group.create_group(key)?;
                write_object(&sub, obj)?;
            }
            Value::Array(items) => write_list(group, key, items)?,
        }
    }
    Ok(())
}

fn write_number_attr(group: &Group, key: &str, n: &Number) -> DatasetResult<()> {
    if let Some(i) = n.as_i64() {
        group.new_attr::<i64>().create(key)?.write_scalar(&i)?;
    } else if let Some(u) = n.as_u64() {
        group.new_attr::<u64>().create(key)?.write_scalar(&u)?;
    } else {
        let f = n.as_f64().unwrap_or(f64::NAN);
        group.new_attr::<f64>().create(key)?.write_scalar(&f)?;
    }
    Ok(())
}

fn write_list(group: &Group, key: &str, items: &[Value]) -> DatasetResult<()> {
    if items.is_empty() {
        return write_str_attr(group, key, EMPTY_LIST_MARKER);
    }
    check_key(key)?;

    // Integers and floats are kept apart so the list reads back with the same types
    if let Some(ints) = items.iter().map(Value::as_i64).collect::<Option<Vec<_>>>() {
        let dset = group.new_dataset_builder().with_data(&ints).create(key)?;
        return write_str_attr(&dset, LIST_TYPE, "array");
    }
    if items.iter().all(|v| matches!(v, Value::Number(n) if n.is_f64())) {
        let floats: Vec<f64> = items.iter().filter_map(Value::as_f64).collect();
        let dset = group.new_dataset_builder().with_data(&floats).create(key)?;
        return write_str_attr(&dset, LIST_TYPE, "array");
    }
    if let Some(strings) = items.iter().map(Value::as_str).collect::<Option<Vec<_>>>() {
        let strings = strings
            .into_iter()
            .map(|s| to_varlen(key, s))
            .collect::<DatasetResult<Vec<_>>>()?;
        let dset = group.new_dataset_builder().with_data(&strings).create(key)?;
        return write_str_attr(&dset, LIST_TYPE, "str");
    }

    let sub = group.create_group(key)?;
    if let Some(objects) = items.iter().map(Value::as_object).collect::<Option<Vec<_>>>() {
        write_str_attr(&sub, LIST_TYPE, "dict")?;
        write_str_attr(&sub, BASE_LIST_KEY, "list_idx_{}")?;
        sub.new_attr::<u64>()
            .create(LIST_LENGTH)?
            .write_scalar(&(objects.len() as u64))?;
        for (i, object) in objects.into_iter().enumerate() {
            let item = sub.create_group(&format!("list_idx_{i}"))?;
            write_object(&item, object)?;
        }
    } else {
        write_str_attr(&sub, LIST_TYPE, "json")?;
        write_str_attr(&sub, LIST_VALUE, &serde_json::to_string(items)?)?;
    }
    Ok(())
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn read_object(group: &Group) -> DatasetResult<Metadata> {
    let mut map = Metadata::new();
    for sub in group.groups()? {
        let key = basename(&sub.name());
        let value = read_group_value(&sub)?;
        map.insert(key, value);
    }
    for dset in group.datasets()? {
        let key = basename(&dset.name());
        let value = read_dataset_value(&dset)?;
        map.insert(key, value);
    }
    for name in group.attr_names()? {
        let attr = group.attr(&name)?;
        match read_attr_value(&attr)? {
            Some(value) => {
                map.insert(name, value);
            }
            None => warn!(key = %name, "skipping metadata attribute with unsupported type"),
        }
    }
    Ok(map)
}

fn read_group_value(group: &Group) -> DatasetResult<Value> {
    let Some(list_type) = read_str_attr(group, LIST_TYPE)? else {
        return Ok(Value::Object(read_object(group)?));
    };
    match list_type.as_str() {
        "dict" => {
            let base = read_str_attr(group, BASE_LIST_KEY)?
                .unwrap_or_else(|| "list_idx_{}".to_string());
            let length = group.attr(LIST_LENGTH)?.read_scalar::<u64>()?;
            let mut items = Vec::with_capacity(length as usize);
            for i in 0..length {
                let item = group.group(&base.replace("{}", &i.to_string()))?;
                items.push(Value::Object(read_object(&item)?));
            }
            Ok(Value::Array(items))
        }
        "json" => {
            let text = read_str_attr(group, LIST_VALUE)?.unwrap_or_else(|| "[]".to_string());
            Ok(serde_json::from_str(&text)?)
        }
        other => Err(DatasetError::Metadata {
            key: group.name(),
            reason: format!("unknown list_type '{other}'"),
        }),
    }
}

fn read_dataset_value(dset: &Dataset) -> DatasetResult<Value> {
    let values = match dset.dtype()?.to_descriptor()? {
        TypeDescriptor::Integer(_) => dset.read_raw::<i64>()?.into_iter().map(Value::from).collect(),
        TypeDescriptor::Unsigned(_) => dset.read_raw::<u64>()?.into_iter().map(Value::from).collect(),
        TypeDescriptor::Float(_) => dset.read_raw::<f64>()?.into_iter().map(float_value).collect(),
        TypeDescriptor::Boolean => dset.read_raw::<bool>()?.into_iter().map(Value::from).collect(),
        TypeDescriptor::VarLenUnicode => dset
            .read_raw::<VarLenUnicode>()?
            .into_iter()
            .map(|s| Value::from(s.as_str()))
            .collect(),
        TypeDescriptor::VarLenAscii => dset
            .read_raw::<VarLenAscii>()?
            .into_iter()
            .map(|s| Value::from(s.as_str()))
            .collect(),
        other => {
            return Err(DatasetError::Metadata {
                key: dset.name(),
                reason: format!("unsupported dataset type {other:?}"),
            })
        }
    };
    Ok(Value::Array(values))
}

fn read_attr_value(attr: &Attribute) -> DatasetResult<Option<Value>> {
    let scalar = attr.is_scalar();
    let value = match attr.dtype()?.to_descriptor()? {
        TypeDescriptor::Integer(_) if scalar => Value::from(attr.read_scalar::<i64>()?),
        TypeDescriptor::Integer(_) => attr.read_raw::<i64>()?.into_iter().map(Value::from).collect(),
        TypeDescriptor::Unsigned(_) if scalar => Value::from(attr.read_scalar::<u64>()?),
        TypeDescriptor::Unsigned(_) => attr.read_raw::<u64>()?.into_iter().map(Value::from).collect(),
        TypeDescriptor::Float(_) if scalar => float_value(attr.read_scalar::<f64>()?),
        TypeDescriptor::Float(_) => attr.read_raw::<f64>()?.into_iter().map(float_value).collect(),
        TypeDescriptor::Boolean if scalar => Value::from(attr.read_scalar::<bool>()?),
        TypeDescriptor::VarLenUnicode if scalar => string_value(attr.read_scalar::<VarLenUnicode>()?.as_str()),
        TypeDescriptor::VarLenAscii if scalar => string_value(attr.read_scalar::<VarLenAscii>()?.as_str()),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn string_value(s: &str) -> Value {
    match s {
        NONE_MARKER => Value::Null,
        EMPTY_LIST_MARKER => Value::Array(Vec::new()),
        _ => Value::from(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::io::DiskIo;
    use crate::data::metadata::compare_metadata;
    use crate::testing::{check_arrays_equal, dataset_1d, dataset_2d};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn builder(dir: &TempDir) -> crate::data::dataset::DataSetBuilder {
        dataset_1d()
            .io(Arc::new(DiskIo::new(dir.path())))
            .formatter(Arc::new(Hdf5Format::new()))
    }

    fn reopen(dir: &TempDir, location: &str) -> DataSet {
        DataSet::new(Some(location.to_string()), Arc::new(Hdf5Format::new()))
            .with_io(Arc::new(DiskIo::new(dir.path())))
    }

    fn object(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => Metadata::new(),
        }
    }

    #[test]
    fn file_lives_inside_location() {
        let dir = TempDir::new().unwrap();
        let mut ds = builder(&dir).location("2016-07-29/run_1").build().unwrap();
        ds.write(true).unwrap();
        let expected = dir.path().join("2016-07-29/run_1/run_1.hdf5");
        assert_eq!(ds.file_path(), Some(expected.clone()));
        assert!(expected.exists());
        ds.close_file();
        assert!(!ds.has_open_file());
    }

    #[test]
    fn root_carries_format_tag() {
        let dir = TempDir::new().unwrap();
        let mut ds = builder(&dir).location("tagged").build().unwrap();
        ds.finalize().unwrap();

        let file = File::open(dir.path().join("tagged/tagged.hdf5")).unwrap();
        assert_eq!(read_str_attr(&file, "__format_tag").unwrap().as_deref(), Some("hdf5"));
        assert_eq!(read_str_attr(&file, "__format_version").unwrap().as_deref(), Some("0.1"));
        let dset = file.group(DATA_ARRAYS).unwrap().dataset("y").unwrap();
        assert_eq!(read_str_attr(&dset, "is_setpoint").unwrap().as_deref(), Some("False"));
        assert_eq!(read_str_attr(&dset, "set_arrays").unwrap().as_deref(), Some("[\"x_set\"]"));
    }

    #[test]
    fn write_then_read_round_trips_arrays() {
        let dir = TempDir::new().unwrap();
        let mut ds = builder(&dir).location("roundtrip").build().unwrap();
        ds.finalize().unwrap();

        let mut loaded = reopen(&dir, "roundtrip");
        loaded.read().unwrap();
        loaded.close_file();
        check_arrays_equal(&ds, &loaded, "x_set").unwrap();
        check_arrays_equal(&ds, &loaded, "y").unwrap();
        let y = loaded.array("y").unwrap();
        assert_eq!(y.read().modified_range(), None);
        assert_eq!(y.read().last_saved_index(), Some(4));
    }

    #[test]
    fn two_dimensional_shape_is_restored() {
        let dir = TempDir::new().unwrap();
        let mut ds = dataset_2d()
            .io(Arc::new(DiskIo::new(dir.path())))
            .formatter(Arc::new(Hdf5Format::new()))
            .location("grid")
            .build()
            .unwrap();
        ds.finalize().unwrap();

        let mut loaded = reopen(&dir, "grid");
        loaded.read().unwrap();
        loaded.close_file();
        assert_eq!(loaded.array("z").unwrap().read().shape(), &[6, 4]);
        check_arrays_equal(&ds, &loaded, "z").unwrap();
    }

    #[test]
    fn incremental_writes_extend_datasets() {
        let dir = TempDir::new().unwrap();
        let mut ds = builder(&dir).location("incremental").build().unwrap();
        for id in ["x_set", "y"] {
            let array = ds.array(id).unwrap();
            let mut array = array.write();
            array.fill(f64::NAN);
            array.set_modified_range(None);
        }
        ds.write(true).unwrap();

        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let ys = [3.0, 4.0, 5.0, 6.0, 7.0];
        for i in 0..3 {
            ds.store(&[i], &[("x_set", xs[i]), ("y", ys[i])]).unwrap();
            ds.write(true).unwrap();
            assert_eq!(ds.array("y").unwrap().read().last_saved_index(), Some(i));
        }
        ds.close_file();

        let mut loaded = reopen(&dir, "incremental");
        loaded.read().unwrap();
        loaded.close_file();
        let y = loaded.array("y").unwrap();
        let y = y.read();
        assert_eq!(y.shape(), &[5]);
        assert_eq!(&y.to_vec()[..3], &[3.0, 4.0, 5.0]);
        assert!(y.get(&[3]).unwrap().is_nan());
        assert_eq!(y.last_saved_index(), Some(2));
    }

    #[test]
    fn read_refreshes_arrays_in_place() {
        let dir = TempDir::new().unwrap();
        let mut ds = builder(&dir).location("inplace").build().unwrap();
        ds.finalize().unwrap();

        let mut target = builder(&dir).location("inplace").overwrite(true).build().unwrap();
        let held = target.array("y").unwrap();
        held.write().fill(0.0);
        target.read().unwrap();
        target.close_file();
        assert!(Arc::ptr_eq(&held, &target.array("y").unwrap()));
        assert_eq!(held.read().to_vec(), vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn metadata_round_trips_with_types() {
        let dir = TempDir::new().unwrap();
        let mut ds = builder(&dir).location("meta").build().unwrap();
        ds.add_metadata(&object(json!({
            "none": null,
            "empty": [],
            "flag": true,
            "count": 3,
            "big": 18446744073709551615u64,
            "ratio": 0.25,
            "name": "sweep",
            "ints": [1, 2, 3],
            "floats": [0.5, 1.5],
            "words": ["a", "b"],
            "dicts": [{"a": 1}, {"b": {"c": "d"}}],
            "mixed": [1, "two", null],
            "nested": {"deeper": {"value": -7}}
        })));
        ds.snapshot();
        ds.finalize().unwrap();

        let mut loaded = reopen(&dir, "meta");
        loaded.read_metadata().unwrap();
        loaded.close_file();
        let (equal, report) = compare_metadata(ds.metadata(), loaded.metadata(), "original", "loaded");
        assert!(equal, "{report}");
    }

    #[test]
    fn list_tag_names_are_ordinary_metadata_keys() {
        let dir = TempDir::new().unwrap();
        let mut ds = builder(&dir).location("tags").build().unwrap();
        ds.add_metadata(&object(json!({
            "settings": {"list_type": "linear", "list_length": 4, "value": "x"},
            "sweeps": [{"list_type": "log"}, {"base_list_key": "k"}]
        })));
        ds.snapshot();
        ds.finalize().unwrap();

        let mut loaded = reopen(&dir, "tags");
        loaded.read_metadata().unwrap();
        loaded.close_file();
        let (equal, report) = compare_metadata(ds.metadata(), loaded.metadata(), "original", "loaded");
        assert!(equal, "{report}");
        assert_eq!(loaded.metadata()["settings"]["list_type"], json!("linear"));
    }

    #[test]
    fn reserved_list_tag_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut ds = builder(&dir).location("reserved").build().unwrap();
        ds.add_metadata(&object(json!({"settings": {LIST_TYPE: "dict"}})));
        let err = ds.write_metadata().unwrap_err();
        ds.close_file();
        assert!(matches!(err, DatasetError::Metadata { ref key, .. } if key == LIST_TYPE), "{err}");
    }

    #[test]
    fn write_metadata_merges_over_stored_values() {
        let dir = TempDir::new().unwrap();
        let mut ds = builder(&dir).location("merge").build().unwrap();
        ds.add_metadata(&object(json!({"station": {"a": 1, "b": 2}})));
        ds.write_metadata().unwrap();
        ds.close_file();

        let mut other = reopen(&dir, "merge");
        other.add_metadata(&object(json!({"station": {"b": 3}, "run": "second"})));
        other.write_metadata().unwrap();
        other.close_file();
        assert_eq!(
            Value::Object(other.metadata().clone()),
            json!({"station": {"a": 1, "b": 3}, "run": "second"})
        );

        let mut loaded = reopen(&dir, "merge");
        loaded.read_metadata().unwrap();
        loaded.close_file();
        assert_eq!(loaded.metadata(), other.metadata());
    }

    #[test]
    fn slash_in_group_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut ds = builder(&dir).location("badkey").build().unwrap();
        ds.add_metadata(&object(json!({"a/b": {"c": 1}})));
        let err = ds.write_metadata().unwrap_err();
        assert!(matches!(err, DatasetError::Metadata { .. }));
        // Failed operations do not leave the file open
        assert!(!ds.has_open_file());
    }

    #[test]
    fn close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut ds = builder(&dir).location("closing").build().unwrap();
        ds.close_file();
        ds.write(true).unwrap();
        assert!(ds.has_open_file());
        ds.close_file();
        ds.close_file();
        assert!(!ds.has_open_file());
    }

    #[test]
    fn finalized_file_can_be_copied_and_opened() {
        let dir = TempDir::new().unwrap();
        let mut ds = builder(&dir).location("copyable").build().unwrap();
        ds.finalize().unwrap();

        let source = dir.path().join("copyable/copyable.hdf5");
        std::fs::create_dir_all(dir.path().join("copy")).unwrap();
        std::fs::copy(&source, dir.path().join("copy/copy.hdf5")).unwrap();
        let mut copy = reopen(&dir, "copy");
        copy.read().unwrap();
        copy.close_file();
        check_arrays_equal(&ds, &copy, "y").unwrap();
    }

    #[test]
    fn garbage_file_surfaces_storage_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken/broken.hdf5"), b"not an hdf5 file").unwrap();
        let mut ds = reopen(&dir, "broken");
        let err = ds.read().unwrap_err();
        assert!(err.is_storage());
        assert!(!ds.has_open_file());
    }

    #[test]
    fn reading_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let mut ds = reopen(&dir, "nothing_here");
        assert!(ds.read().is_err());
        assert!(!ds.has_open_file());
    }
}
