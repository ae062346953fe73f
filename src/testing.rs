//! Fixtures and mocks for tests of code built on data sets.
//!
//! - data set fixtures (`dataset_1d`, `dataset_2d`, `dataset_combined`,
//!   `make_dataset_2d`) returned as builders, so callers pick IO, formatter and
//!   location
//! - the exact GNUPlot text those fixtures produce
//! - formatters that record what they were asked to do
//! - a mock data manager, a synthetic location IO and a parabola instrument
//! - `sweep_1d` / `sweep_2d`, minimal measurement loops storing and writing after
//!   every point

use crate::data::array::DataArray;
use crate::data::dataset::{DataSet, DataSetBuilder};
use crate::data::io::LocationIo;
use crate::data::metadata::Metadata;
use crate::error::{DatasetError, DatasetResult};
use crate::formatter::{Formatter, WriteOptions};
use crate::instrument::{ParamValue, Parameter};
use ndarray::{arr1, arr2, Array1, Array2, ArrayD};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `x_set = [1..5]` (label `X`) and `y = [3..7]` (label `Y`) against it.
pub fn dataset_1d() -> DataSetBuilder {
    let x = DataArray::builder("x")
        .label("X")
        .setpoint()
        .preset_data(arr1(&[1.0, 2.0, 3.0, 4.0, 5.0]))
        .build();
    let y = DataArray::builder("y")
        .label("Y")
        .set_arrays(&[&x])
        .preset_data(arr1(&[3.0, 4.0, 5.0, 6.0, 7.0]))
        .build();
    DataSet::builder().array(x).array(y)
}

/// 6x4 grid: `x_set = 0..6`, `y_set[i][j] = j`, `z = x² + y²`.
pub fn dataset_2d() -> DataSetBuilder {
    let x = DataArray::builder("x")
        .setpoint()
        .preset_data(Array1::from_iter((0..6).map(f64::from)))
        .build();
    let y = DataArray::builder("y")
        .setpoint()
        .set_arrays(&[&x])
        .preset_data(Array2::from_shape_fn((6, 4), |(_, j)| j as f64))
        .build();
    let z = DataArray::builder("z")
        .set_arrays(&[&x, &y])
        .preset_data(Array2::from_shape_fn((6, 4), |(i, j)| (i * i + j * j) as f64))
        .build();
    DataSet::builder().array(x).array(y).array(z)
}

/// Two groups sharing the outer setpoint: `y1`, `y2` against `x_set`, and `z1`, `z2`
/// against `x_set` and a nested 2x3 `y_set`.
pub fn dataset_combined() -> DataSetBuilder {
    let x = DataArray::builder("x")
        .label("X!")
        .setpoint()
        .preset_data(arr1(&[16.0, 17.0]))
        .build();
    let y1 = DataArray::builder("y1")
        .label("Y1")
        .set_arrays(&[&x])
        .preset_data(arr1(&[18.0, 19.0]))
        .build();
    let y2 = DataArray::builder("y2")
        .label("Y2")
        .set_arrays(&[&x])
        .preset_data(arr1(&[20.0, 21.0]))
        .build();
    let y_set = DataArray::builder("y")
        .label("Y")
        .setpoint()
        .set_arrays(&[&x])
        .preset_data(arr2(&[[22.0, 23.0, 24.0], [22.0, 23.0, 24.0]]))
        .build();
    let z1 = DataArray::builder("z1")
        .label("Z1")
        .set_arrays(&[&x, &y_set])
        .preset_data(arr2(&[[25.0, 26.0, 27.0], [28.0, 29.0, 30.0]]))
        .build();
    let z2 = DataArray::builder("z2")
        .label("Z2")
        .set_arrays(&[&x, &y_set])
        .preset_data(arr2(&[[31.0, 32.0, 33.0], [34.0, 35.0, 36.0]]))
        .build();
    DataSet::builder().arrays([x, y1, y2, y_set, z1, z2])
}

/// One swept axis: parameter name, label and setpoint values.
#[derive(Debug, Clone, Copy)]
pub struct SweepAxis<'a> {
    /// Parameter name; the setpoint array id is `<name>_set`
    pub name: &'a str,
    /// Display label
    pub label: &'a str,
    /// Setpoint values
    pub values: &'a [f64],
}

impl<'a> SweepAxis<'a> {
    /// Axis from its parts
    pub fn new(name: &'a str, label: &'a str, values: &'a [f64]) -> Self {
        Self { name, label, values }
    }
}

/// 2D data set over two axes with a measured array `measured_name`.
///
/// The measured array holds `preset` when given, NaN otherwise. It is added before
/// its set arrays.
pub fn make_dataset_2d(
    outer: SweepAxis<'_>,
    inner: SweepAxis<'_>,
    measured_name: &str,
    preset: Option<ArrayD<f64>>,
) -> DataSetBuilder {
    let (n_outer, n_inner) = (outer.values.len(), inner.values.len());
    let x = DataArray::builder(outer.name)
        .label(outer.label)
        .setpoint()
        .preset_data(Array1::from(outer.values.to_vec()))
        .build();
    let y = DataArray::builder(inner.name)
        .label(inner.label)
        .setpoint()
        .set_arrays(&[&x])
        .preset_data(Array2::from_shape_fn((n_outer, n_inner), |(_, j)| inner.values[j]))
        .build();
    let z = DataArray::builder(measured_name).set_arrays(&[&x, &y]);
    let z = match preset {
        Some(data) => z.preset_data(data),
        None => z.shape(&[n_outer, n_inner]),
    };
    DataSet::builder().array(z.build()).array(x).array(y)
}

/// GNUPlot file written for [`dataset_1d`].
pub fn file_1d() -> String {
    [
        "# x_set\ty",
        "# \"X\"\t\"Y\"",
        "# 5",
        "1\t3",
        "2\t4",
        "3\t5",
        "4\t6",
        "5\t7",
        "",
    ]
    .join("\n")
}

/// GNUPlot files written for [`dataset_combined`], in file name order.
pub fn files_combined() -> Vec<String> {
    vec![
        [
            "# x_set\ty1\ty2",
            "# \"X!\"\t\"Y1\"\t\"Y2\"",
            "# 2",
            "16\t18\t20",
            "17\t19\t21",
            "",
        ]
        .join("\n"),
        [
            "# x_set\ty_set\tz1\tz2",
            "# \"X!\"\t\"Y\"\t\"Z1\"\t\"Z2\"",
            "# 2\t3",
            "16\t22\t25\t31",
            "16\t23\t26\t32",
            "16\t24\t27\t33",
            "",
            "17\t22\t28\t34",
            "17\t23\t29\t35",
            "17\t24\t30\t36",
            "",
        ]
        .join("\n"),
    ]
}

fn same_values(a: &DataArray, b: &DataArray) -> bool {
    a.shape() == b.shape()
        && a
            .values()
            .iter()
            .zip(b.values().iter())
            .all(|(x, y)| x == y || (x.is_nan() && y.is_nan()))
}

/// Compare one array, and the set arrays it points at, between two data sets.
///
/// NaN equals NaN. Units are not compared since not every format stores them.
pub fn check_arrays_equal(a: &DataSet, b: &DataSet, array_id: &str) -> Result<(), String> {
    let (a_shared, b_shared) = (
        a.array(array_id).map_err(|e| e.to_string())?,
        b.array(array_id).map_err(|e| e.to_string())?,
    );
    let (a_arr, b_arr) = (a_shared.read(), b_shared.read());

    let mismatch = |what: &str, left: String, right: String| {
        Err(format!("array '{array_id}': {what} differs: {left} != {right}"))
    };
    if a_arr.name() != b_arr.name() {
        return mismatch("name", a_arr.name().into(), b_arr.name().into());
    }
    if a_arr.label() != b_arr.label() {
        return mismatch("label", a_arr.label().into(), b_arr.label().into());
    }
    if a_arr.is_setpoint() != b_arr.is_setpoint() {
        return mismatch(
            "is_setpoint",
            a_arr.is_setpoint().to_string(),
            b_arr.is_setpoint().to_string(),
        );
    }
    if a_arr.set_arrays() != b_arr.set_arrays() {
        return mismatch(
            "set_arrays",
            format!("{:?}", a_arr.set_arrays()),
            format!("{:?}", b_arr.set_arrays()),
        );
    }
    if !same_values(&a_arr, &b_arr) {
        return mismatch("values", format!("{}", a_arr.values()), format!("{}", b_arr.values()));
    }

    for set_id in a_arr.set_arrays().iter().filter(|id| id.as_str() != array_id) {
        let (a_set, b_set) = (
            a.array(set_id).map_err(|e| e.to_string())?,
            b.array(set_id).map_err(|e| e.to_string())?,
        );
        if !same_values(&a_set.read(), &b_set.read()) {
            return Err(format!("array '{array_id}': set array '{set_id}' values differ"));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone)]
struct MockCalls {
    read_data: bool,
    read_metadata: bool,
    writes: usize,
    metadata_writes: usize,
    closes: usize,
}

/// Formatter that only counts what it is asked to do.
#[derive(Debug, Default)]
pub struct MockFormatter {
    calls: Mutex<MockCalls>,
}

impl MockFormatter {
    /// Whether `read` was called
    pub fn has_read_data(&self) -> bool {
        self.calls.lock().read_data
    }

    /// Whether `read_metadata` was called
    pub fn has_read_metadata(&self) -> bool {
        self.calls.lock().read_metadata
    }

    /// Number of `write` calls
    pub fn write_count(&self) -> usize {
        self.calls.lock().writes
    }

    /// Number of `write_metadata` calls
    pub fn metadata_write_count(&self) -> usize {
        self.calls.lock().metadata_writes
    }

    /// Number of `close_file` calls
    pub fn close_count(&self) -> usize {
        self.calls.lock().closes
    }
}

impl Formatter for MockFormatter {
    fn name(&self) -> &'static str {
        "mock"
    }
    fn write(&self, _data_set: &mut DataSet, _options: WriteOptions) -> DatasetResult<()> {
        self.calls.lock().writes += 1;
        Ok(())
    }
    fn read(&self, _data_set: &mut DataSet) -> DatasetResult<()> {
        self.calls.lock().read_data = true;
        Ok(())
    }
    fn write_metadata(&self, _data_set: &mut DataSet, _read_first: bool) -> DatasetResult<()> {
        self.calls.lock().metadata_writes += 1;
        Ok(())
    }
    fn read_metadata(&self, _data_set: &mut DataSet) -> DatasetResult<()> {
        self.calls.lock().read_metadata = true;
        Ok(())
    }
    fn close_file(&self, data_set: &mut DataSet) {
        drop(data_set.take_handle());
        self.calls.lock().closes += 1;
    }
}

/// One recorded `write` call.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCall {
    /// IO base location
    pub base_location: PathBuf,
    /// Data set location
    pub location: Option<String>,
    /// Modified range of every array when the write was requested
    pub modified_ranges: BTreeMap<String, Option<(usize, usize)>>,
    /// Last saved index of every array when the write was requested
    pub last_saved_indices: BTreeMap<String, Option<usize>>,
    /// Options the write was requested with
    pub options: WriteOptions,
}

/// One recorded `write_metadata` call.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataWriteCall {
    /// IO base location
    pub base_location: PathBuf,
    /// Data set location
    pub location: Option<String>,
    /// Whether stored metadata was to be read first
    pub read_first: bool,
}

/// Formatter recording the state it sees without persisting anything.
#[derive(Debug, Default)]
pub struct RecordingFormatter {
    writes: Mutex<Vec<WriteCall>>,
    metadata_writes: Mutex<Vec<MetadataWriteCall>>,
}

impl RecordingFormatter {
    /// Recorded writes, oldest first
    pub fn write_calls(&self) -> Vec<WriteCall> {
        self.writes.lock().clone()
    }

    /// Recorded metadata writes, oldest first
    pub fn metadata_write_calls(&self) -> Vec<MetadataWriteCall> {
        self.metadata_writes.lock().clone()
    }
}

impl Formatter for RecordingFormatter {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn write(&self, data_set: &mut DataSet, options: WriteOptions) -> DatasetResult<()> {
        let mut modified_ranges = BTreeMap::new();
        let mut last_saved_indices = BTreeMap::new();
        for (id, array) in data_set.arrays() {
            let array = array.read();
            modified_ranges.insert(id.clone(), array.modified_range());
            last_saved_indices.insert(id.clone(), array.last_saved_index());
        }
        self.writes.lock().push(WriteCall {
            base_location: data_set.io().base_location().to_path_buf(),
            location: data_set.location().map(str::to_string),
            modified_ranges,
            last_saved_indices,
            options,
        });
        Ok(())
    }

    fn read(&self, _data_set: &mut DataSet) -> DatasetResult<()> {
        Ok(())
    }

    fn write_metadata(&self, data_set: &mut DataSet, read_first: bool) -> DatasetResult<()> {
        self.metadata_writes.lock().push(MetadataWriteCall {
            base_location: data_set.io().base_location().to_path_buf(),
            location: data_set.location().map(str::to_string),
            read_first,
        });
        Ok(())
    }

    fn read_metadata(&self, _data_set: &mut DataSet) -> DatasetResult<()> {
        Ok(())
    }
}

static QUERY_LOCK: Lazy<ReentrantMutex<()>> = Lazy::new(|| ReentrantMutex::new(()));

/// Hold the process-wide data manager query lock. The same thread may take it again.
pub fn query_lock() -> ReentrantMutexGuard<'static, ()> {
    QUERY_LOCK.lock()
}

/// Request to a [`MockDataManager`].
#[derive(Debug)]
pub enum Query {
    /// Location of the live data set
    Location,
    /// Metadata of the live data set
    LiveData,
    /// Replace the live data set
    NewData(Box<DataSet>),
    /// Anything the manager does not understand
    Other(String),
}

/// Answer from a [`MockDataManager`].
#[derive(Debug, PartialEq)]
pub enum Reply {
    /// Location of the live data set
    Location(Option<String>),
    /// Metadata of the live data set
    LiveData(Option<Metadata>),
    /// The new data set was taken over
    Accepted,
}

/// Stand-in for a data manager holding the live data set of a measurement.
#[derive(Debug, Default)]
pub struct MockDataManager {
    /// When set, new data sets are refused until [`MockDataManager::restart`]
    pub needs_restart: bool,
    live: Option<Box<DataSet>>,
}

impl MockDataManager {
    /// Manager that may need a restart before taking data
    pub fn new(needs_restart: bool) -> Self {
        Self {
            needs_restart,
            live: None,
        }
    }

    /// Answer a query under the global query lock
    pub fn ask(&mut self, query: Query) -> DatasetResult<Reply> {
        let _guard = query_lock();
        match query {
            Query::Location => Ok(Reply::Location(
                self.live.as_ref().and_then(|ds| ds.location().map(str::to_string)),
            )),
            Query::LiveData => Ok(Reply::LiveData(self.live.as_ref().map(|ds| ds.metadata().clone()))),
            Query::NewData(_) if self.needs_restart => Err(DatasetError::ManagerNeedsRestart),
            Query::NewData(data_set) => {
                self.live = Some(data_set);
                Ok(Reply::Accepted)
            }
            Query::Other(query) => Err(DatasetError::UnexpectedQuery(query)),
        }
    }

    /// Clear the restart flag
    pub fn restart(&mut self) {
        self.needs_restart = false;
    }

    /// The live data set
    pub fn live_data(&self) -> Option<&DataSet> {
        self.live.as_deref()
    }
}

/// Location IO reporting synthetic matches `<location><n>.something` for every
/// configured counter `n`. Nothing exists on disk.
#[derive(Debug, Clone)]
pub struct MatchIo {
    existing: Vec<u64>,
    base_location: PathBuf,
}

impl MatchIo {
    /// IO reporting the given counters
    pub fn new(existing: Vec<u64>) -> Self {
        Self {
            existing,
            base_location: PathBuf::from("."),
        }
    }
}

impl LocationIo for MatchIo {
    fn base_location(&self) -> &Path {
        &self.base_location
    }

    fn list(&self, location: &str) -> DatasetResult<Vec<String>> {
        Ok(self
            .existing
            .iter()
            .map(|n| format!("{location}{n}.something"))
            .collect())
    }

    fn exists(&self, _location: &str) -> bool {
        false
    }
}

/// Instrument computing `x² + y² + z²` and a skewed variant from settable inputs.
#[derive(Debug)]
pub struct MockParabola {
    /// Input x
    pub x: Parameter,
    /// Input y
    pub y: Parameter,
    /// Input z
    pub z: Parameter,
    /// `x² + y² + z²`
    pub parabola: Parameter,
    /// `(x² + y² + z²) · (1 + |y - x|)`
    pub skewed_parabola: Parameter,
}

impl Default for MockParabola {
    fn default() -> Self {
        Self::new()
    }
}

impl MockParabola {
    /// All inputs start at 0
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new([0.0f64; 3]));

        let input = |name: &str, axis: usize| {
            let state = state.clone();
            Parameter::new(name).with_units("V").with_setter(move |value: ParamValue| {
                let value = value
                    .as_f64()
                    .ok_or_else(|| anyhow::anyhow!("{value:?} is not a number"))?;
                state.lock()[axis] = value;
                Ok(())
            })
        };
        let x = input("x", 0);
        let y = input("y", 1);
        let z = input("z", 2);

        let parabola_state = state.clone();
        let parabola = Parameter::new("parabola").with_getter(move || {
            let [x, y, z] = *parabola_state.lock();
            Ok(ParamValue::Float(x * x + y * y + z * z))
        });
        let skewed_state = state;
        let skewed_parabola = Parameter::new("skewed_parabola").with_getter(move || {
            let [x, y, z] = *skewed_state.lock();
            Ok(ParamValue::Float((x * x + y * y + z * z) * (1.0 + (y - x).abs())))
        });

        Self {
            x,
            y,
            z,
            parabola,
            skewed_parabola,
        }
    }
}

/// Sweep `x` over `xs` measuring `skewed_parabola`, storing and writing every point,
/// then finalize.
pub fn sweep_1d(par: &MockParabola, xs: &[f64], builder: DataSetBuilder) -> anyhow::Result<DataSet> {
    let n = xs.len();
    let x = DataArray::builder(par.x.name())
        .label(par.x.label())
        .setpoint()
        .shape(&[n])
        .build();
    let measured = DataArray::builder(par.skewed_parabola.name())
        .set_arrays(&[&x])
        .shape(&[n])
        .build();
    let x_id = x.array_id().to_string();
    let m_id = measured.array_id().to_string();

    let mut data_set = builder.array(x).array(measured).build()?;
    data_set.snapshot();
    data_set.write_metadata()?;
    for (i, &xv) in xs.iter().enumerate() {
        par.x.set(xv)?;
        let value = par.skewed_parabola.get_f64()?;
        data_set.store(&[i], &[(x_id.as_str(), xv), (m_id.as_str(), value)])?;
        data_set.write_with(WriteOptions::default().without_metadata())?;
    }
    data_set.finalize()?;
    Ok(data_set)
}

/// Sweep `x` over `xs` (outer) and `y` over `ys` (inner) measuring `parabola`,
/// storing and writing every point, then finalize.
pub fn sweep_2d(
    par: &MockParabola,
    xs: &[f64],
    ys: &[f64],
    builder: DataSetBuilder,
) -> anyhow::Result<DataSet> {
    let shape = [xs.len(), ys.len()];
    let x = DataArray::builder(par.x.name())
        .label(par.x.label())
        .setpoint()
        .shape(&shape[..1])
        .build();
    let y = DataArray::builder(par.y.name())
        .label(par.y.label())
        .setpoint()
        .set_arrays(&[&x])
        .shape(&shape)
        .build();
    let measured = DataArray::builder(par.parabola.name())
        .set_arrays(&[&x, &y])
        .shape(&shape)
        .build();
    let (x_id, y_id, m_id) = (
        x.array_id().to_string(),
        y.array_id().to_string(),
        measured.array_id().to_string(),
    );

    let mut data_set = builder.array(x).array(y).array(measured).build()?;
    data_set.snapshot();
    data_set.write_metadata()?;
    for (i, &xv) in xs.iter().enumerate() {
        par.x.set(xv)?;
        for (j, &yv) in ys.iter().enumerate() {
            par.y.set(yv)?;
            let value = par.parabola.get_f64()?;
            data_set.store(&[i, j], &[(x_id.as_str(), xv), (y_id.as_str(), yv), (m_id.as_str(), value)])?;
            data_set.write_with(WriteOptions::default().without_metadata())?;
        }
    }
    data_set.finalize()?;
    Ok(data_set)
}
