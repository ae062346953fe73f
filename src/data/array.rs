//! `DataArray`: one labelled numeric array plus its setpoint dependencies.
//!
//! Values live in a row-major `ndarray::ArrayD<f64>`. Every write goes through
//! [`DataArray::set`] (or a sibling), which widens the array's *modified range*: the
//! inclusive span of flat indices changed since the last persisted write. Formatters
//! read that span, persist it and call [`DataArray::mark_saved`], so a write where
//! nothing changed costs O(1) per array.

use crate::error::{DatasetError, DatasetResult};
use ndarray::{ArrayD, Dimension, IxDyn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared, in-place refreshable handle to an array.
///
/// A `DataSet` and any number of callers hold the same handle, so a read that refreshes
/// the contents is visible to every holder.
pub type SharedArray = Arc<RwLock<DataArray>>;

/// Wrap an array into a [`SharedArray`].
pub fn share(array: DataArray) -> SharedArray {
    Arc::new(RwLock::new(array))
}

/// Labelled n-dimensional numeric array with explicit save cursor.
#[derive(Debug, Clone)]
pub struct DataArray {
    array_id: String,
    name: String,
    label: String,
    units: String,
    is_setpoint: bool,
    /// Set array ids, outermost loop first. Setpoint arrays end with their own id.
    set_arrays: Vec<String>,
    data: ArrayD<f64>,
    modified_range: Option<(usize, usize)>,
    last_saved_index: Option<usize>,
    preset: bool,
}

/// Serializable summary of an array, used in data set snapshots.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArraySnapshot {
    pub array_id: String,
    pub name: String,
    pub label: String,
    pub units: String,
    pub is_setpoint: bool,
    pub shape: Vec<usize>,
    pub set_arrays: Vec<String>,
}

/// Builder for [`DataArray`].
#[derive(Debug, Clone, Default)]
pub struct DataArrayBuilder {
    name: String,
    array_id: Option<String>,
    label: Option<String>,
    units: String,
    is_setpoint: bool,
    set_arrays: Vec<String>,
    shape: Option<Vec<usize>>,
    preset: Option<ArrayD<f64>>,
}

impl DataArrayBuilder {
    /// Explicit array id. Defaults to the name, or `<name>_set` for setpoints.
    pub fn array_id(mut self, array_id: impl Into<String>) -> Self {
        self.array_id = Some(array_id.into());
        self
    }

    /// Display label. Defaults to the name.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Unit of measurement
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    /// Mark as an independent (setpoint) variable
    pub fn setpoint(mut self) -> Self {
        self.is_setpoint = true;
        self
    }

    /// Set arrays this array is indexed against, outermost first
    pub fn set_arrays(mut self, set_arrays: &[&DataArray]) -> Self {
        self.set_arrays = set_arrays.iter().map(|a| a.array_id.clone()).collect();
        self
    }

    /// Set arrays given by id, outermost first
    pub fn set_array_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_arrays = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Allocate a NaN-filled array of this shape
    pub fn shape(mut self, shape: &[usize]) -> Self {
        self.shape = Some(shape.to_vec());
        self
    }

    /// Preset contents. The whole array starts out modified.
    pub fn preset_data<D: Dimension>(mut self, data: ndarray::Array<f64, D>) -> Self {
        self.preset = Some(data.into_dyn());
        self
    }

    /// Build the array
    pub fn build(self) -> DataArray {
        let array_id = self.array_id.unwrap_or_else(|| {
            if self.is_setpoint {
                format!("{}_set", self.name)
            } else {
                self.name.clone()
            }
        });

        let mut set_arrays = self.set_arrays;
        if self.is_setpoint && set_arrays.last() != Some(&array_id) {
            set_arrays.push(array_id.clone());
        }

        let mut array = DataArray {
            label: self.label.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            array_id,
            units: self.units,
            is_setpoint: self.is_setpoint,
            set_arrays,
            data: ArrayD::zeros(IxDyn(&[0])),
            modified_range: None,
            last_saved_index: None,
            preset: false,
        };

        if let Some(preset) = self.preset {
            array.data = standard_layout(preset);
            array.preset = true;
            if !array.is_empty() {
                array.modified_range = Some((0, array.len() - 1));
            }
        } else if let Some(shape) = self.shape {
            array.init_data(&shape);
        }
        array
    }
}

fn standard_layout(data: ArrayD<f64>) -> ArrayD<f64> {
    if data.is_standard_layout() {
        data
    } else {
        data.as_standard_layout().into_owned()
    }
}

/// Convert a flat row-major index into an n-d index for `shape`.
pub fn unravel_index(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut index = vec![0; shape.len()];
    for (axis, &dim) in shape.iter().enumerate().rev() {
        if dim == 0 {
            continue;
        }
        index[axis] = flat % dim;
        flat /= dim;
    }
    index
}

/// Convert an n-d index into a flat row-major index for `shape`.
///
/// Returns `None` when the index has the wrong rank or is out of bounds.
pub fn ravel_index(index: &[usize], shape: &[usize]) -> Option<usize> {
    if index.len() != shape.len() {
        return None;
    }
    let mut flat = 0usize;
    for (&i, &dim) in index.iter().zip(shape) {
        if i >= dim {
            return None;
        }
        flat = flat * dim + i;
    }
    Some(flat)
}

impl DataArray {
    /// Start building an array with the given name
    pub fn builder(name: impl Into<String>) -> DataArrayBuilder {
        DataArrayBuilder {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Unique id within the data set
    pub fn array_id(&self) -> &str {
        &self.array_id
    }

    /// Parameter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Unit of measurement
    pub fn units(&self) -> &str {
        &self.units
    }

    /// Whether this is an independent (setpoint) variable
    pub fn is_setpoint(&self) -> bool {
        self.is_setpoint
    }

    /// Set array ids, outermost first
    pub fn set_arrays(&self) -> &[String] {
        &self.set_arrays
    }

    /// Update descriptive attributes in place.
    pub fn set_attributes(
        &mut self,
        name: impl Into<String>,
        label: impl Into<String>,
        units: impl Into<String>,
        is_setpoint: bool,
    ) {
        self.name = name.into();
        self.label = label.into();
        self.units = units.into();
        self.is_setpoint = is_setpoint;
    }

    /// Replace the set array chain.
    pub fn set_set_arrays(&mut self, set_arrays: Vec<String>) {
        self.set_arrays = set_arrays;
    }

    /// Shape of the array
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the array holds no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read-only view of the values
    pub fn values(&self) -> &ArrayD<f64> {
        &self.data
    }

    /// All values in row-major order
    pub fn to_vec(&self) -> Vec<f64> {
        self.data.iter().copied().collect()
    }

    /// Values `start..end` in row-major order
    pub fn flat_range(&self, start: usize, end: usize) -> Vec<f64> {
        let end = end.min(self.len());
        if start >= end {
            return Vec::new();
        }
        match self.data.as_slice() {
            Some(slice) => slice[start..end].to_vec(),
            None => self.data.iter().skip(start).take(end - start).copied().collect(),
        }
    }

    /// Allocate a NaN-filled array of `shape` and forget all save state.
    pub fn init_data(&mut self, shape: &[usize]) {
        self.data = ArrayD::from_elem(IxDyn(shape), f64::NAN);
        self.preset = false;
        self.modified_range = None;
        self.last_saved_index = None;
    }

    /// Refresh the contents in place, keeping identity and attributes.
    ///
    /// Save state is left untouched; readers set it afterwards.
    pub fn replace_data(&mut self, data: ArrayD<f64>) {
        self.data = standard_layout(data);
        self.preset = true;
    }

    fn flat_index(&self, index: &[usize]) -> DatasetResult<usize> {
        ravel_index(index, self.shape()).ok_or_else(|| DatasetError::IndexOutOfBounds {
            array_id: self.array_id.clone(),
            index: index.to_vec(),
            shape: self.shape().to_vec(),
        })
    }

    /// Value at an n-d index
    pub fn get(&self, index: &[usize]) -> DatasetResult<f64> {
        self.flat_index(index)?;
        Ok(self.data[IxDyn(index)])
    }

    fn check_flat(&self, flat: usize) -> DatasetResult<()> {
        if flat >= self.len() {
            return Err(DatasetError::IndexOutOfBounds {
                array_id: self.array_id.clone(),
                index: vec![flat],
                shape: self.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Value at a flat row-major index
    pub fn get_flat(&self, flat: usize) -> DatasetResult<f64> {
        self.check_flat(flat)?;
        Ok(self.data[IxDyn(&unravel_index(flat, self.shape()))])
    }

    /// Write one value and widen the modified range.
    pub fn set(&mut self, index: &[usize], value: f64) -> DatasetResult<()> {
        let flat = self.flat_index(index)?;
        self.data[IxDyn(index)] = value;
        self.update_modified_range(flat, flat);
        Ok(())
    }

    /// Write one value at a flat row-major index.
    pub fn set_flat(&mut self, flat: usize, value: f64) -> DatasetResult<()> {
        self.check_flat(flat)?;
        let index = unravel_index(flat, self.shape());
        self.set(&index, value)
    }

    /// Write every element with `value`; the whole array becomes modified.
    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
        if !self.is_empty() {
            self.update_modified_range(0, self.len() - 1);
        }
    }

    fn update_modified_range(&mut self, low: usize, high: usize) {
        self.modified_range = Some(match self.modified_range {
            Some((lo, hi)) => (lo.min(low), hi.max(high)),
            None => (low, high),
        });
    }

    /// Inclusive flat span written since the last persisted write
    pub fn modified_range(&self) -> Option<(usize, usize)> {
        self.modified_range
    }

    /// Override the modified range (e.g. to mark prefilled data as clean).
    pub fn set_modified_range(&mut self, range: Option<(usize, usize)>) {
        self.modified_range = range;
    }

    /// Last flat index known to be persisted
    pub fn last_saved_index(&self) -> Option<usize> {
        self.last_saved_index
    }

    /// Record that everything up to `last_saved_index` is persisted.
    pub fn mark_saved(&mut self, last_saved_index: usize) {
        if let Some((lo, hi)) = self.modified_range {
            self.modified_range = if last_saved_index >= hi {
                None
            } else {
                Some((lo.max(last_saved_index + 1), hi))
            };
        }
        self.last_saved_index = Some(last_saved_index);
    }

    /// Forget the persisted cursor so the next write starts over.
    pub fn clear_save(&mut self) {
        if let Some(last) = self.last_saved_index.take() {
            self.update_modified_range(0, last);
        }
    }

    /// Add an outer loop of `size` iterations over `set_array_id`.
    ///
    /// Only preset arrays can be nested; the existing data is repeated for every
    /// outer index and the whole array becomes modified.
    pub fn nest(&mut self, size: usize, set_array_id: &str) -> DatasetResult<()> {
        if !self.preset {
            return Err(DatasetError::Nesting(
                self.array_id.clone(),
                "only preset arrays can be nested".to_string(),
            ));
        }
        let mut shape = Vec::with_capacity(self.ndim() + 1);
        shape.push(size);
        shape.extend_from_slice(self.shape());

        let inner = self.to_vec();
        let mut values = Vec::with_capacity(inner.len() * size);
        for _ in 0..size {
            values.extend_from_slice(&inner);
        }
        self.data = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| DatasetError::Nesting(self.array_id.clone(), e.to_string()))?;
        self.set_arrays.insert(0, set_array_id.to_string());
        self.modified_range = if self.is_empty() {
            None
        } else {
            Some((0, self.len() - 1))
        };
        Ok(())
    }

    /// Fraction of the array known to be filled.
    pub fn fraction_complete(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let saved = self.last_saved_index.map(|i| i + 1).unwrap_or(0);
        let modified = self.modified_range.map(|(_, hi)| hi + 1).unwrap_or(0);
        saved.max(modified) as f64 / self.len() as f64
    }

    /// Serializable summary
    pub fn snapshot(&self) -> ArraySnapshot {
        ArraySnapshot {
            array_id: self.array_id.clone(),
            name: self.name.clone(),
            label: self.label.clone(),
            units: self.units.clone(),
            is_setpoint: self.is_setpoint,
            shape: self.shape().to_vec(),
            set_arrays: self.set_arrays.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn preset_x() -> DataArray {
        DataArray::builder("x")
            .label("X")
            .setpoint()
            .preset_data(arr1(&[1.0, 2.0, 3.0, 4.0, 5.0]))
            .build()
    }

    #[test]
    fn setpoint_ids_and_self_reference() {
        let x = preset_x();
        assert_eq!(x.array_id(), "x_set");
        assert_eq!(x.set_arrays(), ["x_set".to_string()]);

        let y = DataArray::builder("y")
            .set_arrays(&[&x])
            .preset_data(arr1(&[3.0, 4.0, 5.0, 6.0, 7.0]))
            .build();
        assert_eq!(y.array_id(), "y");
        assert_eq!(y.label(), "y");
        assert_eq!(y.set_arrays(), ["x_set".to_string()]);
    }

    #[test]
    fn preset_marks_everything_modified() {
        let x = preset_x();
        assert_eq!(x.modified_range(), Some((0, 4)));
        assert_eq!(x.last_saved_index(), None);
        assert_eq!(x.fraction_complete(), 1.0);
    }

    #[test]
    fn shaped_array_is_nan_and_clean() {
        let z = DataArray::builder("z").shape(&[2, 3]).build();
        assert_eq!(z.shape(), &[2, 3]);
        assert!(z.values().iter().all(|v| v.is_nan()));
        assert_eq!(z.modified_range(), None);
        assert_eq!(z.fraction_complete(), 0.0);
    }

    #[test]
    fn set_widens_modified_range() {
        let mut z = DataArray::builder("z").shape(&[2, 3]).build();
        z.set(&[1, 1], 4.0).unwrap();
        assert_eq!(z.modified_range(), Some((4, 4)));
        z.set(&[0, 2], 2.0).unwrap();
        assert_eq!(z.modified_range(), Some((2, 4)));
        z.set_flat(5, 9.0).unwrap();
        assert_eq!(z.modified_range(), Some((2, 5)));
        assert_eq!(z.get(&[1, 2]).unwrap(), 9.0);
        assert_eq!(z.get_flat(4).unwrap(), 4.0);
    }

    #[test]
    fn out_of_bounds_is_reported() {
        let mut z = DataArray::builder("z").shape(&[2, 3]).build();
        assert!(matches!(
            z.set(&[2, 0], 1.0),
            Err(DatasetError::IndexOutOfBounds { .. })
        ));
        assert!(z.get(&[0]).is_err());
        assert!(z.get_flat(6).is_err());
        assert_eq!(z.modified_range(), None);
    }

    #[test]
    fn set_flat_past_the_end_leaves_array_untouched() {
        let mut z = DataArray::builder("z").shape(&[2, 3]).build();
        z.fill(1.0);
        z.set_modified_range(None);
        match z.set_flat(6, 42.0) {
            Err(DatasetError::IndexOutOfBounds { index, shape, .. }) => {
                assert_eq!(index, vec![6]);
                assert_eq!(shape, vec![2, 3]);
            }
            other => panic!("expected IndexOutOfBounds, got {other:?}"),
        }
        assert!(z.values().iter().all(|&v| v == 1.0));
        assert_eq!(z.modified_range(), None);
    }

    #[test]
    fn mark_saved_shrinks_or_clears() {
        let mut x = preset_x();
        x.mark_saved(2);
        assert_eq!(x.modified_range(), Some((3, 4)));
        assert_eq!(x.last_saved_index(), Some(2));

        x.mark_saved(4);
        assert_eq!(x.modified_range(), None);
        assert_eq!(x.last_saved_index(), Some(4));

        // Saving with nothing modified only moves the cursor.
        x.mark_saved(1);
        assert_eq!(x.modified_range(), None);
        assert_eq!(x.last_saved_index(), Some(1));
    }

    #[test]
    fn clear_save_folds_cursor_back_into_range() {
        let mut x = preset_x();
        x.mark_saved(4);
        x.set(&[4], 10.0).unwrap();
        x.mark_saved(3);
        x.clear_save();
        assert_eq!(x.last_saved_index(), None);
        assert_eq!(x.modified_range(), Some((0, 4)));
    }

    #[test]
    fn nest_repeats_data_and_prepends_set_array() {
        let mut y = DataArray::builder("y")
            .setpoint()
            .preset_data(arr1(&[22.0, 23.0, 24.0]))
            .build();
        y.mark_saved(2);
        y.nest(2, "x_set").unwrap();
        assert_eq!(y.shape(), &[2, 3]);
        assert_eq!(y.set_arrays(), ["x_set".to_string(), "y_set".to_string()]);
        assert_eq!(y.to_vec(), vec![22.0, 23.0, 24.0, 22.0, 23.0, 24.0]);
        assert_eq!(y.modified_range(), Some((0, 5)));
    }

    #[test]
    fn nest_requires_preset() {
        let mut y = DataArray::builder("y").shape(&[3]).build();
        assert!(matches!(y.nest(2, "x_set"), Err(DatasetError::Nesting(..))));
    }

    #[test]
    fn index_helpers_round_trip() {
        let shape = [3, 4, 2];
        for flat in 0..24 {
            let index = unravel_index(flat, &shape);
            assert_eq!(ravel_index(&index, &shape), Some(flat));
        }
        assert_eq!(ravel_index(&[3, 0, 0], &shape), None);
        assert_eq!(ravel_index(&[0, 0], &shape), None);
    }

    #[test]
    fn non_standard_layout_is_normalized() {
        let transposed = arr2(&[[1.0, 2.0], [3.0, 4.0]]).reversed_axes();
        let a = DataArray::builder("a").preset_data(transposed).build();
        assert_eq!(a.to_vec(), vec![1.0, 3.0, 2.0, 4.0]);
        assert_eq!(a.flat_range(1, 3), vec![3.0, 2.0]);
        assert!(a.values().as_slice().is_some());
    }

    #[test]
    fn snapshot_reflects_attributes() {
        let x = preset_x();
        let snap = x.snapshot();
        assert_eq!(snap.array_id, "x_set");
        assert_eq!(snap.label, "X");
        assert!(snap.is_setpoint);
        assert_eq!(snap.shape, vec![5]);
    }
}
