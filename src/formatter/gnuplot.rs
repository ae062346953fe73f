//! GNUPlot formatter: one tab-separated text file per set-array group.
//!
//! ```text
//! # x_set	y_set	z
//! # "X"	"Y"	"Z"
//! # 2	3
//! 1	5	0.5
//! 1	6	0.75
//! 1	7	1
//!
//! 2	5	1.5
//! ...
//! ```
//!
//! The header holds the array ids, the quoted labels and the shape of the group.
//! Each row holds the setpoint values followed by the data values of one point. A
//! blank line separates blocks of the inner loop, one more blank line per outer loop
//! that wraps at the same point. Metadata goes to `snapshot.json` next to the data
//! files.

use super::{group_arrays, ArrayGroup, Formatter, WriteOptions};
use crate::data::array::{ravel_index, unravel_index, DataArray, SharedArray};
use crate::data::dataset::DataSet;
use crate::data::metadata::{deep_update, Metadata};
use crate::error::{DatasetError, DatasetResult};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const COMMENT: &str = "# ";

/// Tab-separated text formatter readable by GNUPlot.
#[derive(Debug, Clone)]
pub struct GnuplotFormat {
    extension: String,
    precision: usize,
    metadata_file: String,
}

impl Default for GnuplotFormat {
    fn default() -> Self {
        Self::new()
    }
}

/// Save cursor of one array, read once before deciding what to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SaveState {
    modified: Option<(usize, usize)>,
    last_saved: Option<usize>,
}

impl SaveState {
    fn of(array: &SharedArray) -> Self {
        let array = array.read();
        Self {
            modified: array.modified_range(),
            last_saved: array.last_saved_index(),
        }
    }

    fn reached(&self) -> isize {
        let saved = self.last_saved.map_or(-1, |i| i as isize);
        let modified = self.modified.map_or(-1, |(_, hi)| hi as isize);
        saved.max(modified)
    }
}

impl GnuplotFormat {
    /// Formatter writing `.dat` files with 12 significant digits
    pub fn new() -> Self {
        Self {
            extension: "dat".to_string(),
            precision: 12,
            metadata_file: "snapshot.json".to_string(),
        }
    }

    /// Use another data file extension
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Significant digits written per value
    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision.max(1);
        self
    }

    fn location_path(&self, data_set: &DataSet, file_name: &str) -> DatasetResult<PathBuf> {
        let io = data_set.io();
        Ok(io.to_path(&io.join(&[data_set.require_location()?, file_name])))
    }

    fn make_header(&self, group: &ArrayGroup) -> String {
        let arrays: Vec<_> = group.set_arrays.iter().chain(&group.data).map(|a| a.read()).collect();
        let ids: Vec<&str> = arrays.iter().map(|a| a.array_id()).collect();
        let labels: Vec<String> = arrays
            .iter()
            .map(|a| format!("\"{}\"", a.label().replace('"', "\\\"")))
            .collect();
        let shape: Vec<String> = group.shape.iter().map(ToString::to_string).collect();
        format!(
            "{COMMENT}{}\n{COMMENT}{}\n{COMMENT}{}\n",
            ids.join("\t"),
            labels.join("\t"),
            shape.join("\t")
        )
    }

    fn write_group(
        &self,
        data_set: &DataSet,
        group: &ArrayGroup,
        options: WriteOptions,
    ) -> DatasetResult<()> {
        let path = self.location_path(data_set, &format!("{}.{}", group.name, self.extension))?;
        let Some(inner) = group.set_arrays.last() else {
            warn!(group = %group.name, "skipping arrays without setpoints");
            return Ok(());
        };
        let data_states: Vec<SaveState> = group.data.iter().map(SaveState::of).collect();
        let range = if options.force_write {
            // Rewrite everything written so far, modified or not
            let all: Vec<SaveState> = std::iter::once(SaveState::of(inner))
                .chain(data_states.iter().copied())
                .collect();
            whole_file_range(&all, options.only_complete)
        } else {
            match_save_range(
                SaveState::of(inner),
                &data_states,
                path.exists(),
                options.only_complete,
            )
        };
        let Some((start, end)) = range else {
            return Ok(());
        };

        let overwrite = start == 0 || options.force_write;
        let start = if overwrite { 0 } else { start };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = if overwrite {
            File::create(&path)?
        } else {
            OpenOptions::new().append(true).open(&path)?
        };
        let mut out = BufWriter::new(file);
        if overwrite {
            out.write_all(self.make_header(group).as_bytes())?;
        }

        let mut builder = WriterBuilder::new();
        builder
            .delimiter(b'\t')
            .quote_style(QuoteStyle::Never)
            .terminator(Terminator::Any(b'\n'));
        {
            let sets: Vec<_> = group.set_arrays.iter().map(|a| a.read()).collect();
            let data: Vec<_> = group.data.iter().map(|a| a.read()).collect();
            let mut block: Vec<Vec<String>> = Vec::new();
            for i in start..=end {
                let indices = unravel_index(i, &group.shape);
                // One blank line per loop that wrapped back to index 0
                let wrapped = indices.iter().rev().position(|&index| index != 0).unwrap_or(0);
                if wrapped > 0 {
                    write_rows(&builder, &mut out, &block)?;
                    block.clear();
                    out.write_all(&vec![b'\n'; wrapped])?;
                }
                let mut row = Vec::with_capacity(sets.len() + data.len());
                for set in &sets {
                    row.push(format_g(set.get(&indices[..set.ndim()])?, self.precision));
                }
                for array in &data {
                    row.push(format_g(array.get(&indices)?, self.precision));
                }
                block.push(row);
            }
            write_rows(&builder, &mut out, &block)?;
        }
        out.flush()?;

        self.mark_group_saved(group, end);
        debug!(file = %path.display(), start, end, overwrite, "wrote data file");
        Ok(())
    }

    fn mark_group_saved(&self, group: &ArrayGroup, end: usize) {
        for array in group.data.iter().chain(group.set_arrays.last()) {
            array.write().mark_saved(end);
        }
        // Outer setpoints have lower rank and may be further along in another group
        let last = unravel_index(end, &group.shape);
        let outer = group.set_arrays.len().saturating_sub(1);
        for array in &group.set_arrays[..outer] {
            let mut array = array.write();
            let ndim = array.ndim().min(last.len());
            let saved = ravel_index(&last[..ndim], array.shape());
            if let Some(saved) = saved {
                if array.last_saved_index().map_or(true, |l| l < saved) {
                    array.mark_saved(saved);
                }
            }
        }
    }

    fn read_one_file(
        &self,
        data_set: &mut DataSet,
        path: &Path,
        ids_read: &mut HashSet<String>,
    ) -> DatasetResult<()> {
        let text = fs::read_to_string(path)?;
        let mut parts = text.splitn(4, '\n');
        let ids_line = comment_line(parts.next(), path)?;
        let labels_line = comment_line(parts.next(), path)?;
        let shape_line = comment_line(parts.next(), path)?;
        let body = parts.next().unwrap_or("");

        let ids: Vec<&str> = ids_line.split_whitespace().collect();
        let labels = parse_labels(labels_line);
        let shape = shape_line
            .split_whitespace()
            .map(str::parse::<usize>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DatasetError::format(path, format!("bad shape line: {e}")))?;
        let ndim = shape.len();
        if ids.len() != labels.len() || ids.len() <= ndim {
            return Err(DatasetError::format(path, "mismatched ids, labels, or shape"));
        }

        let mut set_ids: Vec<String> = Vec::with_capacity(ndim);
        let mut set_arrays = Vec::with_capacity(ndim);
        for (i, (&array_id, label)) in ids.iter().zip(&labels).take(ndim).enumerate() {
            let set_shape = &shape[..=i];
            set_ids.push(array_id.to_string());
            let shared = match data_set.arrays().get(array_id).cloned() {
                Some(existing) => {
                    {
                        let mut array = existing.write();
                        if ids_read.contains(array_id) {
                            if array.shape() != set_shape {
                                return Err(DatasetError::format(
                                    path,
                                    format!("set array '{array_id}' has inconsistent shape"),
                                ));
                            }
                        } else {
                            refresh(&mut array, label, true, set_ids.clone(), set_shape);
                        }
                    }
                    existing
                }
                None => data_set.add_array(
                    DataArray::builder(array_id.strip_suffix("_set").unwrap_or(array_id))
                        .array_id(array_id)
                        .label(label.as_str())
                        .setpoint()
                        .set_array_ids(set_ids.clone())
                        .shape(set_shape)
                        .build(),
                )?,
            };
            ids_read.insert(array_id.to_string());
            set_arrays.push(shared);
        }

        let mut data_arrays = Vec::with_capacity(ids.len() - ndim);
        for (&array_id, label) in ids.iter().zip(&labels).skip(ndim) {
            if ids_read.contains(array_id) {
                return Err(DatasetError::format(
                    path,
                    format!("duplicate data id found: {array_id}"),
                ));
            }
            let shared = match data_set.arrays().get(array_id).cloned() {
                Some(existing) => {
                    refresh(&mut existing.write(), label, false, set_ids.clone(), &shape);
                    existing
                }
                None => data_set.add_array(
                    DataArray::builder(array_id)
                        .label(label.as_str())
                        .set_array_ids(set_ids.clone())
                        .shape(&shape)
                        .build(),
                )?,
            };
            ids_read.insert(array_id.to_string());
            data_arrays.push(shared);
        }

        let mut sets: Vec<_> = set_arrays.iter().map(|a| a.write()).collect();
        let mut data: Vec<_> = data_arrays.iter().map(|a| a.write()).collect();
        let mut indices = vec![0usize; ndim];
        let mut any_row = false;
        let mut blank_lines = 0usize;
        // Body starts after the three header lines
        for (line, text) in (4..).zip(body.lines()) {
            let text = text.trim_end_matches('\r');
            if text.trim().is_empty() {
                blank_lines += 1;
                continue;
            }
            if text.starts_with('#') {
                continue;
            }
            if any_row {
                // Each blank line resets one more loop
                if blank_lines >= ndim {
                    return Err(DatasetError::format(
                        path,
                        format!("line {line}: {blank_lines} blank lines for {ndim} loops"),
                    ));
                }
                let axis = ndim - blank_lines - 1;
                indices[axis] += 1;
                for index in &mut indices[axis + 1..] {
                    *index = 0;
                }
            }
            any_row = true;
            blank_lines = 0;

            let values = text
                .split('\t')
                .map(|field| field.trim().parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| DatasetError::format(path, format!("line {line}: {e}")))?;
            if values.len() != ids.len() {
                return Err(DatasetError::format(
                    path,
                    format!("line {line}: expected {} values, found {}", ids.len(), values.len()),
                ));
            }

            for (value, set) in values.iter().zip(sets.iter_mut()) {
                let index = &indices[..set.ndim()];
                let stored = set.get(index)?;
                if stored.is_nan() {
                    set.set(index, *value)?;
                } else if stored != *value {
                    return Err(DatasetError::format(
                        path,
                        format!(
                            "line {line}: inconsistent setpoint value {value} for '{}', expected {stored}",
                            set.array_id()
                        ),
                    ));
                }
            }
            for (value, array) in values[ndim..].iter().zip(data.iter_mut()) {
                array.set(&indices, *value)?;
            }
        }

        for array in sets.iter_mut().chain(data.iter_mut()) {
            array.set_modified_range(None);
            if any_row {
                let ndim = array.ndim();
                if let Some(saved) = ravel_index(&indices[..ndim], array.shape()) {
                    array.mark_saved(saved);
                }
            }
        }
        debug!(file = %path.display(), arrays = ids.len(), "read data file");
        Ok(())
    }

    fn load_metadata(&self, data_set: &DataSet) -> DatasetResult<Metadata> {
        let path = self.location_path(data_set, &self.metadata_file)?;
        if !path.exists() {
            return Ok(Metadata::new());
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }
}

fn write_rows<W: Write>(builder: &WriterBuilder, out: &mut W, rows: &[Vec<String>]) -> DatasetResult<()> {
    let mut writer = builder.from_writer(out);
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn refresh(array: &mut DataArray, label: &str, is_setpoint: bool, set_arrays: Vec<String>, shape: &[usize]) {
    let name = array.name().to_string();
    let units = array.units().to_string();
    array.set_attributes(name, label, units, is_setpoint);
    array.set_set_arrays(set_arrays);
    array.init_data(shape);
}

fn comment_line<'a>(line: Option<&'a str>, path: &Path) -> DatasetResult<&'a str> {
    let line = line.unwrap_or("");
    match line.strip_prefix('#') {
        Some(rest) => Ok(rest.strip_prefix(' ').unwrap_or(rest).trim_end_matches('\r')),
        None => Err(DatasetError::format(
            path,
            format!("expected a comment line, found: {line:?}"),
        )),
    }
}

fn parse_labels(line: &str) -> Vec<String> {
    let line = line.trim();
    if line.len() >= 2 && line.starts_with('"') && line.ends_with('"') {
        line[1..line.len() - 1]
            .split("\"\t\"")
            .map(|label| label.replace("\\\"", "\""))
            .collect()
    } else {
        line.split_whitespace().map(str::to_string).collect()
    }
}

/// Decide which flat range of a group to write.
///
/// Returns `None` when nothing changed. A range starting at 0 means the file is
/// rewritten from scratch, anything else is appended. With `only_complete`, the
/// range ends at the last point every array has reached.
fn match_save_range(
    inner: SaveState,
    data: &[SaveState],
    file_exists: bool,
    only_complete: bool,
) -> Option<(usize, usize)> {
    let all: Vec<SaveState> = std::iter::once(inner).chain(data.iter().copied()).collect();
    if all.iter().all(|s| s.modified.is_none()) {
        return None;
    }

    let last_saved = match inner.last_saved {
        Some(last_saved) if file_exists => last_saved,
        last_saved => {
            if last_saved.is_none() && file_exists {
                warn!("data file exists but nothing is marked saved, rewriting it");
            }
            return whole_file_range(&all, only_complete);
        }
    };

    if data.iter().any(|s| s.last_saved != Some(last_saved)) {
        return whole_file_range(&all, only_complete);
    }
    incremental_range(&all, last_saved, only_complete)
}

fn whole_file_range(all: &[SaveState], only_complete: bool) -> Option<(usize, usize)> {
    let reached = all.iter().map(SaveState::reached);
    let max_save = if only_complete { reached.min() } else { reached.max() }?;
    (max_save >= 0).then_some((0, max_save as usize))
}

fn incremental_range(all: &[SaveState], last_saved: usize, only_complete: bool) -> Option<(usize, usize)> {
    let mut ranges = Vec::with_capacity(all.len());
    for state in all {
        match state.modified {
            Some(range) => ranges.push(range),
            None if only_complete => return None,
            None => {}
        }
    }
    let (mut lo, mut hi) = *ranges.first()?;
    for &(l, h) in &ranges[1..] {
        lo = lo.min(l);
        hi = if only_complete { hi.min(h) } else { hi.max(h) };
    }

    if last_saved >= hi {
        Some((0, last_saved))
    } else if last_saved >= lo {
        Some((0, hi))
    } else {
        Some((last_saved + 1, hi))
    }
}

/// Format like C's `%.{precision}g`: shortest of fixed and scientific notation,
/// trailing zeros removed.
pub fn format_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let precision = precision.max(1);
    let scientific = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= precision as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exponent.abs())
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

fn trim_fraction(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}

impl Formatter for GnuplotFormat {
    fn name(&self) -> &'static str {
        "gnuplot"
    }

    fn write(&self, data_set: &mut DataSet, options: WriteOptions) -> DatasetResult<()> {
        let groups = group_arrays(data_set.arrays())?;
        for group in &groups {
            self.write_group(data_set, group, options)?;
        }
        if options.write_metadata {
            self.write_metadata(data_set, false)?;
        }
        Ok(())
    }

    fn read(&self, data_set: &mut DataSet) -> DatasetResult<()> {
        let dir = data_set.io().to_path(data_set.require_location()?);
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == self.extension.as_str()) {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(DatasetError::format(&dir, "no data files found"));
        }
        files.sort();

        let mut ids_read = HashSet::new();
        for path in &files {
            self.read_one_file(data_set, path, &mut ids_read)?;
        }
        self.read_metadata(data_set)?;
        data_set.validate()?;
        info!(location = %dir.display(), files = files.len(), "read GNUPlot data");
        Ok(())
    }

    fn write_metadata(&self, data_set: &mut DataSet, read_first: bool) -> DatasetResult<()> {
        if read_first {
            let mut stored = self.load_metadata(data_set)?;
            deep_update(&mut stored, data_set.metadata());
            *data_set.metadata_mut() = stored;
        }
        let path = self.location_path(data_set, &self.metadata_file)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&path)?);
        let mut serializer = serde_json::Serializer::with_formatter(
            &mut out,
            serde_json::ser::PrettyFormatter::with_indent(b"    "),
        );
        data_set.metadata().serialize(&mut serializer)?;
        out.flush()?;
        debug!(file = %path.display(), "wrote metadata");
        Ok(())
    }

    fn read_metadata(&self, data_set: &mut DataSet) -> DatasetResult<()> {
        let loaded = self.load_metadata(data_set)?;
        data_set.metadata_mut().extend(loaded);
        Ok(())
    }

    fn close_file(&self, _data_set: &mut DataSet) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::io::DiskIo;
    use crate::data::metadata::compare_metadata;
    use crate::testing::{check_arrays_equal, dataset_1d, dataset_combined, file_1d, files_combined};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn build(builder: crate::data::dataset::DataSetBuilder, dir: &TempDir, location: &str) -> DataSet {
        builder
            .io(Arc::new(DiskIo::new(dir.path())))
            .formatter(Arc::new(GnuplotFormat::new()))
            .location(location)
            .build()
            .unwrap()
    }

    fn reopen(dir: &TempDir, location: &str) -> DataSet {
        DataSet::new(Some(location.to_string()), Arc::new(GnuplotFormat::new()))
            .with_io(Arc::new(DiskIo::new(dir.path())))
    }

    fn contents(dir: &TempDir, file: &str) -> String {
        fs::read_to_string(dir.path().join(file)).unwrap()
    }

    #[test]
    fn format_g_matches_printf() {
        assert_eq!(format_g(16.0, 12), "16");
        assert_eq!(format_g(0.5, 12), "0.5");
        assert_eq!(format_g(-2.5, 12), "-2.5");
        assert_eq!(format_g(0.1 + 0.2, 12), "0.3");
        assert_eq!(format_g(1e-5, 6), "1e-05");
        assert_eq!(format_g(123456789.0, 6), "1.23457e+08");
        assert_eq!(format_g(100000.0, 6), "100000");
        assert_eq!(format_g(1e6, 6), "1e+06");
        assert_eq!(format_g(f64::NAN, 12), "nan");
        assert_eq!(format_g(f64::NEG_INFINITY, 12), "-inf");
        assert_eq!(format_g(0.0, 12), "0");
    }

    #[test]
    fn full_write_1d() {
        let dir = TempDir::new().unwrap();
        let mut ds = build(dataset_1d(), &dir, "full_1d");
        ds.write(true).unwrap();
        assert_eq!(contents(&dir, "full_1d/x_set.dat"), file_1d());
        assert!(dir.path().join("full_1d/snapshot.json").exists());

        // Nothing modified: nothing rewritten
        fs::write(dir.path().join("full_1d/x_set.dat"), "untouched").unwrap();
        ds.write(true).unwrap();
        assert_eq!(contents(&dir, "full_1d/x_set.dat"), "untouched");
    }

    #[test]
    fn combined_groups_write_one_file_each() {
        let dir = TempDir::new().unwrap();
        let mut ds = build(dataset_combined(), &dir, "combined");
        ds.write(true).unwrap();
        let expected = files_combined();
        assert_eq!(contents(&dir, "combined/x_set.dat"), expected[0]);
        assert_eq!(contents(&dir, "combined/x_set_y_set.dat"), expected[1]);
    }

    #[test]
    fn incremental_write_appends_complete_rows() {
        let dir = TempDir::new().unwrap();
        let mut ds = build(dataset_1d(), &dir, "incremental");
        let x = ds.array("x_set").unwrap();
        let y = ds.array("y").unwrap();
        for array in [&x, &y] {
            let mut array = array.write();
            array.fill(f64::NAN);
            array.set_modified_range(None);
        }
        let path = "incremental/x_set.dat";

        x.write().set(&[0], 1.0).unwrap();
        ds.write(true).unwrap();
        // Only x has data, no complete row yet
        assert!(!dir.path().join(path).exists());

        y.write().set(&[0], 3.0).unwrap();
        ds.write(true).unwrap();
        assert_eq!(contents(&dir, path), "# x_set\ty\n# \"X\"\t\"Y\"\n# 5\n1\t3\n");

        x.write().set(&[1], 2.0).unwrap();
        ds.write(true).unwrap();
        assert_eq!(contents(&dir, path), "# x_set\ty\n# \"X\"\t\"Y\"\n# 5\n1\t3\n");

        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let ys = [3.0, 4.0, 5.0, 6.0, 7.0];
        for i in 1..5 {
            ds.store(&[i], &[("x_set", xs[i]), ("y", ys[i])]).unwrap();
            ds.write(true).unwrap();
        }
        assert_eq!(contents(&dir, path), file_1d());
        assert_eq!(y.read().last_saved_index(), Some(4));
        assert_eq!(x.read().modified_range(), None);
    }

    #[test]
    fn incomplete_rows_when_requested() {
        let dir = TempDir::new().unwrap();
        let mut ds = build(dataset_1d(), &dir, "partial");
        let y = ds.array("y").unwrap();
        {
            let mut y = y.write();
            y.fill(f64::NAN);
            y.set_modified_range(None);
        }
        ds.write_with(WriteOptions::default().incomplete()).unwrap();
        let text = contents(&dir, "partial/x_set.dat");
        assert!(text.ends_with("5\tnan\n"), "{text}");
    }

    #[test]
    fn read_back_1d() {
        let dir = TempDir::new().unwrap();
        let mut ds = build(dataset_1d(), &dir, "read_1d");
        ds.finalize().unwrap();

        let mut loaded = reopen(&dir, "read_1d");
        loaded.read().unwrap();
        check_arrays_equal(&ds, &loaded, "x_set").unwrap();
        check_arrays_equal(&ds, &loaded, "y").unwrap();
        let y = loaded.array("y").unwrap();
        assert_eq!(y.read().last_saved_index(), Some(4));
        assert_eq!(y.read().modified_range(), None);
        assert_eq!(loaded.array("x_set").unwrap().read().name(), "x");
    }

    #[test]
    fn read_back_combined() {
        let dir = TempDir::new().unwrap();
        let mut ds = build(dataset_combined(), &dir, "read_combined");
        ds.finalize().unwrap();

        let mut loaded = reopen(&dir, "read_combined");
        loaded.read().unwrap();
        for id in ["x_set", "y1", "y2", "y_set", "z1", "z2"] {
            check_arrays_equal(&ds, &loaded, id).unwrap();
        }
        // The shared outer setpoint is a single array
        assert_eq!(
            loaded.array("z1").unwrap().read().set_arrays(),
            ["x_set".to_string(), "y_set".to_string()]
        );
        assert_eq!(loaded.arrays().len(), 6);
    }

    #[test]
    fn blank_lines_advance_the_outer_loop() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("grid")).unwrap();
        fs::write(
            dir.path().join("grid/x_set_y_set.dat"),
            "# x_set\ty_set\tz\n# \"X\"\t\"Y\"\t\"Z\"\n# 2\t3\n\
             1\t5\t0.5\n1\t6\t0.75\n1\t7\t1\n\n2\t5\t1.5\n2\t6\t2\n2\t7\t2.5\n",
        )
        .unwrap();

        let mut loaded = reopen(&dir, "grid");
        loaded.read().unwrap();
        let x = loaded.array("x_set").unwrap();
        let y = loaded.array("y_set").unwrap();
        let z = loaded.array("z").unwrap();
        assert_eq!(x.read().to_vec(), vec![1.0, 2.0]);
        assert_eq!(y.read().shape(), [2, 3]);
        assert_eq!(y.read().to_vec(), vec![5.0, 6.0, 7.0, 5.0, 6.0, 7.0]);
        assert_eq!(z.read().to_vec(), vec![0.5, 0.75, 1.0, 1.5, 2.0, 2.5]);
        assert_eq!(z.read().last_saved_index(), Some(5));
    }

    #[test]
    fn written_grid_reads_back() {
        let dir = TempDir::new().unwrap();
        let mut ds = build(dataset_combined(), &dir, "grid_round");
        ds.finalize().unwrap();
        let text = contents(&dir, "grid_round/x_set_y_set.dat");
        assert!(text.contains("\n\n"), "blocks separated by a blank line: {text}");

        let mut loaded = reopen(&dir, "grid_round");
        loaded.read().unwrap();
        for id in ["y_set", "z1", "z2"] {
            check_arrays_equal(&ds, &loaded, id).unwrap();
        }
    }

    #[test]
    fn forced_write_rewrites_unmodified_files() {
        let dir = TempDir::new().unwrap();
        let mut ds = build(dataset_1d(), &dir, "forced");
        ds.write(true).unwrap();
        let path = dir.path().join("forced/x_set.dat");
        fs::write(&path, "stale").unwrap();

        ds.write(true).unwrap();
        assert_eq!(contents(&dir, "forced/x_set.dat"), "stale");
        ds.write_with(WriteOptions::default().forced()).unwrap();
        assert_eq!(contents(&dir, "forced/x_set.dat"), file_1d());
    }

    #[test]
    fn read_refreshes_existing_arrays_in_place() {
        let dir = TempDir::new().unwrap();
        let mut ds = build(dataset_1d(), &dir, "in_place");
        ds.finalize().unwrap();

        let mut target = dataset_1d()
            .io(Arc::new(DiskIo::new(dir.path())))
            .formatter(Arc::new(GnuplotFormat::new()))
            .location("in_place")
            .overwrite(true)
            .build()
            .unwrap();
        let held = target.array("y").unwrap();
        held.write().fill(0.0);
        target.read().unwrap();
        assert!(Arc::ptr_eq(&held, &target.array("y").unwrap()));
        assert_eq!(held.read().to_vec(), vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn metadata_round_trips_through_snapshot_json() {
        let dir = TempDir::new().unwrap();
        let mut ds = build(dataset_1d(), &dir, "meta");
        if let Value::Object(extra) = json!({"sweep": {"points": 5, "label": "X"}, "none": null}) {
            ds.add_metadata(&extra);
        }
        ds.snapshot();
        ds.finalize().unwrap();

        let text = contents(&dir, "meta/snapshot.json");
        assert!(text.contains("\n    \""), "four space indent: {text}");

        let mut loaded = reopen(&dir, "meta");
        loaded.read_metadata().unwrap();
        let (equal, report) = compare_metadata(ds.metadata(), loaded.metadata(), "original", "loaded");
        assert!(equal, "{report}");
    }

    #[test]
    fn malformed_files_are_reported() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("bad")).unwrap();
        fs::write(dir.path().join("bad/x_set.dat"), "x_set\ty\n").unwrap();
        let err = reopen(&dir, "bad").read().unwrap_err();
        assert!(matches!(err, DatasetError::Format { .. }));

        fs::write(
            dir.path().join("bad/x_set.dat"),
            "# x_set\ty\n# \"X\"\t\"Y\"\n# 2\n1\t3\n1\t4\n",
        )
        .unwrap();
        let mut ds = DataSet::new(Some("bad".to_string()), Arc::new(GnuplotFormat::new()))
            .with_io(Arc::new(DiskIo::new(dir.path())));
        // Second row repeats setpoint 1 at a new index: fine. A third row overflows.
        ds.read().unwrap();
        fs::write(
            dir.path().join("bad/x_set.dat"),
            "# x_set\ty\n# \"X\"\t\"Y\"\n# 2\n1\t3\n2\t4\n3\t5\n",
        )
        .unwrap();
        let mut ds = reopen(&dir, "bad");
        assert!(ds.read().is_err());
    }

    #[test]
    fn inconsistent_setpoints_are_rejected() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("inconsistent")).unwrap();
        fs::write(
            dir.path().join("inconsistent/x_set_y_set.dat"),
            "# x_set\ty_set\tz\n# \"X\"\t\"Y\"\t\"Z\"\n# 2\t2\n1\t5\t0\n2\t6\t1\n\n1\t5\t2\n1\t6\t3\n",
        )
        .unwrap();
        let err = reopen(&dir, "inconsistent").read().unwrap_err();
        assert!(err.to_string().contains("inconsistent setpoint"), "{err}");
    }

    #[test]
    fn empty_location_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        let err = reopen(&dir, "empty").read().unwrap_err();
        assert!(err.is_storage());
    }

    #[test]
    fn labels_with_quotes_survive() {
        assert_eq!(
            parse_labels("\"a \\\"b\\\"\"\t\"c\""),
            vec!["a \"b\"".to_string(), "c".to_string()]
        );
        assert_eq!(parse_labels("a b"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn save_range_rules() {
        let clean = |last| SaveState { modified: None, last_saved: last };
        let dirty = |lo, hi, last| SaveState { modified: Some((lo, hi)), last_saved: last };

        assert_eq!(match_save_range(clean(Some(3)), &[clean(Some(3))], true, true), None);
        // Fresh file: everything every array reached
        assert_eq!(match_save_range(dirty(0, 4, None), &[dirty(0, 2, None)], false, true), Some((0, 2)));
        assert_eq!(match_save_range(dirty(0, 4, None), &[dirty(0, 2, None)], false, false), Some((0, 4)));
        // Appending
        assert_eq!(match_save_range(dirty(3, 4, Some(2)), &[dirty(3, 4, Some(2))], true, true), Some((3, 4)));
        // Incomplete row waits
        assert_eq!(match_save_range(dirty(3, 3, Some(2)), &[clean(Some(2))], true, true), None);
        // Rewriting saved points restarts the file
        assert_eq!(match_save_range(dirty(1, 1, Some(2)), &[dirty(1, 1, Some(2))], true, true), Some((0, 2)));
        // Missing file restarts too
        assert_eq!(match_save_range(dirty(3, 4, Some(2)), &[dirty(3, 4, Some(2))], false, true), Some((0, 4)));
    }
}
