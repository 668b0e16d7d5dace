//! Column-oriented tables written alongside the pipeline outputs.
//!
//! Analysis steps persist their results as small named-column tables, to
//! Parquet for downstream tooling and to CSV for eyeballing. `Frame` keeps
//! the column order stable so both formats agree.

use anyhow::{anyhow, bail, Context, Result};
use arrow::array::{Array, PrimitiveArray, Utf8Array};
use arrow::chunk::Chunk;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::Result as ArrowResult;
use arrow::io::parquet::read as parquet_read;
use arrow::io::parquet::write::{
    CompressionOptions, Encoding, FileWriter, RowGroupIterator, Version, WriteOptions,
};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// One named column of values. Floats keep NaN as a value, not a null.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Str(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Float(values) => values.len(),
            Column::Int(values) => values.len(),
            Column::Str(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered named columns of uniform length.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    columns: Vec<(String, Column)>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column. Fails if the name repeats or the length disagrees
    /// with the columns already present.
    pub fn push(&mut self, name: impl Into<String>, column: Column) -> Result<()> {
        let name = name.into();
        if let Some((first_name, first)) = self.columns.first() {
            if column.len() != first.len() {
                bail!(
                    "column {:?} has {} rows but {:?} has {}",
                    name,
                    column.len(),
                    first_name,
                    first.len()
                );
            }
        }
        if self.columns.iter().any(|(existing, _)| *existing == name) {
            bail!("duplicate column name {:?}", name);
        }
        self.columns.push((name, column));
        Ok(())
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, |(_, column)| column.len())
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, column)| column)
    }

    pub fn columns(&self) -> &[(String, Column)] {
        &self.columns
    }

    /// Write the frame as comma-separated text with a header row.
    ///
    /// Floats use Rust's shortest round-trip formatting, so whole values
    /// keep a trailing `.0` and NaN is spelled `NaN`.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if self.columns.is_empty() {
            bail!("cannot write a frame with no columns");
        }
        let mut writer = csv::WriterBuilder::new()
            .from_path(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        writer.write_record(self.columns.iter().map(|(name, _)| name.as_str()))?;
        let mut record = Vec::with_capacity(self.columns.len());
        for row in 0..self.n_rows() {
            record.clear();
            for (_, column) in &self.columns {
                record.push(match column {
                    Column::Float(values) => format!("{:?}", values[row]),
                    Column::Int(values) => values[row].to_string(),
                    Column::Str(values) => values[row].clone(),
                });
            }
            writer.write_record(&record)?;
        }
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", path.display()))?;
        Ok(())
    }

    /// Read a CSV with a header row, inferring each column as Int, then
    /// Float, then Str.
    pub fn read_csv(path: &Path) -> Result<Frame> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for result in reader.records() {
            let record = result.context("reading csv record")?;
            if record.len() != headers.len() {
                bail!(
                    "row has {} fields but the header has {}",
                    record.len(),
                    headers.len()
                );
            }
            for (slot, value) in cells.iter_mut().zip(record.iter()) {
                slot.push(value.to_string());
            }
        }
        let mut frame = Frame::new();
        for (name, raw) in headers.into_iter().zip(cells) {
            frame.push(name, infer_column(raw))?;
        }
        Ok(frame)
    }

    /// Write the frame as an uncompressed single-row-group Parquet file.
    pub fn write_parquet(&self, path: &Path) -> Result<()> {
        if self.columns.is_empty() {
            bail!("cannot write a frame with no columns");
        }
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|(name, column)| {
                let data_type = match column {
                    Column::Float(_) => DataType::Float64,
                    Column::Int(_) => DataType::Int64,
                    Column::Str(_) => DataType::Utf8,
                };
                Field::new(name.clone(), data_type, false)
            })
            .collect();
        let schema = Schema::from(fields);
        let options = WriteOptions {
            write_statistics: false,
            version: Version::V2,
            compression: CompressionOptions::Uncompressed,
            data_pagesize_limit: None,
        };
        let encodings = vec![vec![Encoding::Plain]; self.columns.len()];
        let arrays: Vec<Arc<dyn Array>> = self
            .columns
            .iter()
            .map(|(_, column)| match column {
                Column::Float(values) => {
                    Arc::new(PrimitiveArray::<f64>::from_vec(values.clone())) as Arc<dyn Array>
                }
                Column::Int(values) => {
                    Arc::new(PrimitiveArray::<i64>::from_vec(values.clone())) as Arc<dyn Array>
                }
                Column::Str(values) => {
                    Arc::new(Utf8Array::<i32>::from_slice(values.as_slice())) as Arc<dyn Array>
                }
            })
            .collect();
        let chunk = Chunk::try_new(arrays)?;
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut writer = FileWriter::try_new(file, schema.clone(), options)
            .context("failed to initialize parquet writer")?;
        let row_groups = RowGroupIterator::try_new(
            std::iter::once(ArrowResult::Ok(chunk)),
            &schema,
            options,
            encodings,
        )?;
        for group in row_groups {
            writer
                .write(group?)
                .context("failed to write parquet row group")?;
        }
        writer
            .end(None)
            .with_context(|| format!("failed to finalize {}", path.display()))?;
        Ok(())
    }

    /// Read a Parquet file written by `write_parquet` (or any file holding
    /// only float64, int64, and utf8 columns).
    pub fn read_parquet(path: &Path) -> Result<Frame> {
        let mut file = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let metadata =
            parquet_read::read_metadata(&mut file).context("reading parquet metadata")?;
        let schema = parquet_read::infer_schema(&metadata)?;
        let mut columns: Vec<(String, Column)> = schema
            .fields
            .iter()
            .map(|field| {
                let column = match &field.data_type {
                    DataType::Float64 => Column::Float(Vec::new()),
                    DataType::Int64 => Column::Int(Vec::new()),
                    DataType::Utf8 | DataType::LargeUtf8 => Column::Str(Vec::new()),
                    other => {
                        return Err(anyhow!(
                            "unsupported parquet column type {:?} for {:?}",
                            other,
                            field.name
                        ))
                    }
                };
                Ok((field.name.clone(), column))
            })
            .collect::<Result<_>>()?;
        let reader = parquet_read::FileReader::new(
            file,
            metadata.row_groups,
            schema,
            None,
            None,
            None,
        );
        for maybe_chunk in reader {
            let chunk = maybe_chunk.context("reading parquet row group")?;
            for ((name, column), array) in columns.iter_mut().zip(chunk.arrays()) {
                append_array(name, column, array.as_ref())?;
            }
        }
        let mut frame = Frame::new();
        for (name, column) in columns {
            frame.push(name, column)?;
        }
        Ok(frame)
    }
}

fn append_array(name: &str, column: &mut Column, array: &dyn Array) -> Result<()> {
    match column {
        Column::Float(values) => {
            let typed = array
                .as_any()
                .downcast_ref::<PrimitiveArray<f64>>()
                .ok_or_else(|| anyhow!("column {:?} is not float64", name))?;
            values.extend(typed.iter().map(|v| v.copied().unwrap_or(f64::NAN)));
        }
        Column::Int(values) => {
            let typed = array
                .as_any()
                .downcast_ref::<PrimitiveArray<i64>>()
                .ok_or_else(|| anyhow!("column {:?} is not int64", name))?;
            for value in typed.iter() {
                values.push(
                    *value.ok_or_else(|| anyhow!("null value in integer column {:?}", name))?,
                );
            }
        }
        Column::Str(values) => {
            if let Some(typed) = array.as_any().downcast_ref::<Utf8Array<i32>>() {
                for value in typed.iter() {
                    values.push(
                        value
                            .ok_or_else(|| anyhow!("null value in string column {:?}", name))?
                            .to_string(),
                    );
                }
            } else if let Some(typed) = array.as_any().downcast_ref::<Utf8Array<i64>>() {
                for value in typed.iter() {
                    values.push(
                        value
                            .ok_or_else(|| anyhow!("null value in string column {:?}", name))?
                            .to_string(),
                    );
                }
            } else {
                bail!("column {:?} is not utf8", name);
            }
        }
    }
    Ok(())
}

fn infer_column(raw: Vec<String>) -> Column {
    if raw.is_empty() {
        return Column::Str(raw);
    }
    if let Some(ints) = parse_all::<i64>(&raw) {
        return Column::Int(ints);
    }
    if let Some(floats) = parse_all::<f64>(&raw) {
        return Column::Float(floats);
    }
    Column::Str(raw)
}

fn parse_all<T: std::str::FromStr>(raw: &[String]) -> Option<Vec<T>> {
    raw.iter().map(|value| value.trim().parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        let mut frame = Frame::new();
        frame
            .push(
                "roi",
                Column::Str(vec![
                    "precentral-lh".into(),
                    "precentral-rh".into(),
                    "postcentral-lh".into(),
                ]),
            )
            .unwrap();
        frame
            .push("n_vertices", Column::Int(vec![412, 398, 377]))
            .unwrap();
        frame
            .push(
                "psd_uv2_per_hz",
                Column::Float(vec![1.0, 0.125, f64::NAN]),
            )
            .unwrap();
        frame
    }

    fn assert_frames_equal(left: &Frame, right: &Frame) {
        assert_eq!(left.names(), right.names());
        for (name, column) in left.columns() {
            let other = right.column(name).expect("column present");
            match (column, other) {
                (Column::Float(a), Column::Float(b)) => {
                    assert_eq!(a.len(), b.len(), "{name}");
                    for (x, y) in a.iter().zip(b) {
                        let same = x.to_bits() == y.to_bits() || (x.is_nan() && y.is_nan());
                        assert!(same, "{name}: {x} vs {y}");
                    }
                }
                (Column::Int(a), Column::Int(b)) => assert_eq!(a, b, "{name}"),
                (Column::Str(a), Column::Str(b)) => assert_eq!(a, b, "{name}"),
                other => panic!("column {name} changed type: {other:?}"),
            }
        }
    }

    #[test]
    fn uniform_length_is_enforced() {
        let mut frame = Frame::new();
        frame.push("a", Column::Float(vec![1.0, 2.0])).unwrap();
        assert!(frame.push("b", Column::Int(vec![1])).is_err());
        assert!(frame.push("a", Column::Float(vec![3.0, 4.0])).is_err());
        assert_eq!(frame.n_columns(), 1);
        assert_eq!(frame.n_rows(), 2);
    }

    #[test]
    fn round_trip_matches_across_formats() {
        let dir = tempfile::tempdir().unwrap();
        let frame = sample_frame();

        let csv_path = dir.path().join("table.csv");
        frame.write_csv(&csv_path).unwrap();
        let from_csv = Frame::read_csv(&csv_path).unwrap();
        assert_frames_equal(&frame, &from_csv);

        let parquet_path = dir.path().join("table.parquet");
        frame.write_parquet(&parquet_path).unwrap();
        let from_parquet = Frame::read_parquet(&parquet_path).unwrap();
        assert_frames_equal(&frame, &from_parquet);
    }

    #[test]
    fn csv_reader_infers_column_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.csv");
        std::fs::write(&path, "band,freq_hz,label\n1,4.0,delta\n2,NaN,theta\n").unwrap();
        let frame = Frame::read_csv(&path).unwrap();
        assert_eq!(frame.column("band"), Some(&Column::Int(vec![1, 2])));
        match frame.column("freq_hz") {
            Some(Column::Float(values)) => {
                assert_eq!(values[0], 4.0);
                assert!(values[1].is_nan());
            }
            other => panic!("unexpected column {other:?}"),
        }
        assert_eq!(
            frame.column("label"),
            Some(&Column::Str(vec!["delta".into(), "theta".into()]))
        );
    }

    #[test]
    fn whole_floats_stay_floats_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut frame = Frame::new();
        frame
            .push("power", Column::Float(vec![1.0, 2.0, 3.0]))
            .unwrap();
        let path = dir.path().join("whole.csv");
        frame.write_csv(&path).unwrap();
        let reloaded = Frame::read_csv(&path).unwrap();
        assert_frames_equal(&frame, &reloaded);
    }
}
