use std::fmt::Display;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, LazyLock};

use arrow::array::{Array, ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow::csv::ReaderBuilder;
use arrow::csv::reader::Format;
use arrow::datatypes::{DataType as ArrowType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use regex::Regex;
use tracing::debug;

use crate::domain::LocalFormat;
use crate::error::TaigaError;

const BATCH_SIZE: usize = 8192;

static NULL_CELL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(|NA|NaN|nan)$").expect("null cell pattern is valid"));

/// A numeric matrix with labelled rows and columns. Missing cells are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    pub row_labels: Vec<String>,
    pub column_labels: Vec<String>,
    /// Row-major, `row_labels.len() * column_labels.len()` values.
    pub values: Vec<f64>,
}

impl Matrix {
    pub fn nrows(&self) -> usize {
        self.row_labels.len()
    }

    pub fn ncols(&self) -> usize {
        self.column_labels.len()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.nrows() || col >= self.ncols() {
            return None;
        }
        self.values.get(row * self.ncols() + col).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl Table {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }
}

/// In-memory form of a cached datafile.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Matrix(Matrix),
    Table(Table),
}

/// Builds `target` from the file at `source`, writing into `out`.
pub fn convert(
    source_format: LocalFormat,
    source: &Path,
    target: LocalFormat,
    out: &mut File,
) -> Result<(), TaigaError> {
    debug!(from = %source_format, to = %target, "converting");
    match (source_format, target) {
        (LocalFormat::CsvMatrix, LocalFormat::FeatherMatrix) => {
            let (schema, batches) = read_matrix_csv(source, target)?;
            write_feather(&schema, batches, target, out)
        }
        (LocalFormat::CsvTable, LocalFormat::ParquetTable) => {
            let (schema, batches) = read_table_csv(source, target)?;
            write_parquet(&schema, batches, target, out)
        }
        (LocalFormat::CsvTable, LocalFormat::FeatherTable) => {
            let (schema, batches) = read_table_csv(source, target)?;
            write_feather(&schema, batches, target, out)
        }
        (from, to) => Err(failed(to, format!("no conversion from {from}"))),
    }
}

/// Loads the artifact `get` returns for `format`.
pub fn read_artifact(format: LocalFormat, path: &Path) -> Result<Artifact, TaigaError> {
    match format {
        LocalFormat::FeatherMatrix => read_feather_matrix(path).map(Artifact::Matrix),
        LocalFormat::ParquetTable => read_parquet_table(path).map(Artifact::Table),
        other => Err(failed(other, "format cannot be loaded into memory")),
    }
}

type Batches = Box<dyn Iterator<Item = Result<RecordBatch, ArrowError>>>;

fn read_table_csv(source: &Path, target: LocalFormat) -> Result<(SchemaRef, Batches), TaigaError> {
    let mut file = open(source)?;
    let format = Format::default()
        .with_header(true)
        .with_null_regex(NULL_CELL.clone());
    let (schema, _) = format
        .infer_schema(&mut file, None)
        .map_err(|err| failed(target, err))?;
    let schema = Arc::new(schema);

    rewind(&mut file)?;
    let reader = ReaderBuilder::new(schema.clone())
        .with_format(format)
        .with_batch_size(BATCH_SIZE)
        .build(file)
        .map_err(|err| failed(target, err))?;
    Ok((schema, Box::new(reader)))
}

/// Cells are read as text so that only value cells, never row labels, are
/// subject to the missing-value spellings.
fn read_matrix_csv(source: &Path, target: LocalFormat) -> Result<(SchemaRef, Batches), TaigaError> {
    let mut file = open(source)?;
    let format = Format::default().with_header(true);
    let (header, _) = format
        .infer_schema(&mut file, Some(0))
        .map_err(|err| failed(target, err))?;
    let schema = Arc::new(matrix_schema(&header, target)?);
    let text = Arc::new(Schema::new(
        header
            .fields()
            .iter()
            .map(|field| Field::new(field.name(), ArrowType::Utf8, true))
            .collect::<Vec<_>>(),
    ));

    rewind(&mut file)?;
    let reader = ReaderBuilder::new(text)
        .with_format(format)
        .with_batch_size(BATCH_SIZE)
        .build(file)
        .map_err(|err| failed(target, err))?;
    let typed = schema.clone();
    let batches = reader.map(move |batch| batch.and_then(|batch| typed_matrix_batch(&typed, &batch)));
    Ok((schema, Box::new(batches)))
}

fn typed_matrix_batch(schema: &SchemaRef, batch: &RecordBatch) -> Result<RecordBatch, ArrowError> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());
    for (index, column) in batch.columns().iter().enumerate() {
        let cells = column
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| ArrowError::SchemaError("matrix cells were not read as text".to_string()))?;
        if index == 0 {
            // The CSV reader turns an empty label into null.
            let labels: StringArray = cells
                .iter()
                .map(|label| Some(label.unwrap_or_default()))
                .collect();
            columns.push(Arc::new(labels));
            continue;
        }
        let values = cells
            .iter()
            .map(|cell| match cell {
                Some(cell) if !NULL_CELL.is_match(cell) => {
                    cell.trim().parse::<f64>().map(Some).map_err(|err| {
                        ArrowError::ParseError(format!("cannot read {cell:?} as a number: {err}"))
                    })
                }
                _ => Ok(None),
            })
            .collect::<Result<Float64Array, _>>()?;
        columns.push(Arc::new(values));
    }
    RecordBatch::try_new(schema.clone(), columns)
}

fn matrix_schema(header: &Schema, target: LocalFormat) -> Result<Schema, TaigaError> {
    let mut fields = header.fields().iter();
    let labels = fields
        .next()
        .ok_or_else(|| failed(target, "matrix has no columns"))?;
    let mut columns = vec![Field::new(labels.name(), ArrowType::Utf8, false)];
    columns.extend(fields.map(|field| Field::new(field.name(), ArrowType::Float64, true)));
    Ok(Schema::new(columns))
}

fn open(path: &Path) -> Result<File, TaigaError> {
    File::open(path).map_err(|err| TaigaError::Filesystem(err.to_string()))
}

fn rewind(file: &mut File) -> Result<(), TaigaError> {
    file.seek(SeekFrom::Start(0))
        .map(|_| ())
        .map_err(|err| TaigaError::Filesystem(err.to_string()))
}

fn write_feather(
    schema: &SchemaRef,
    batches: Batches,
    target: LocalFormat,
    out: &mut File,
) -> Result<(), TaigaError> {
    let mut writer = FileWriter::try_new(out, schema).map_err(|err| failed(target, err))?;
    for batch in batches {
        let batch = batch.map_err(|err| failed(target, err))?;
        writer.write(&batch).map_err(|err| failed(target, err))?;
    }
    writer.finish().map_err(|err| failed(target, err))
}

fn write_parquet(
    schema: &SchemaRef,
    batches: Batches,
    target: LocalFormat,
    out: &mut File,
) -> Result<(), TaigaError> {
    let mut writer =
        ArrowWriter::try_new(out, schema.clone(), None).map_err(|err| failed(target, err))?;
    for batch in batches {
        let batch = batch.map_err(|err| failed(target, err))?;
        writer.write(&batch).map_err(|err| failed(target, err))?;
    }
    writer.close().map_err(|err| failed(target, err))?;
    Ok(())
}

fn read_feather_matrix(path: &Path) -> Result<Matrix, TaigaError> {
    let target = LocalFormat::FeatherMatrix;
    let file = open(path)?;
    let reader = FileReader::try_new(file, None).map_err(|err| failed(target, err))?;
    let schema = reader.schema();
    let column_labels: Vec<String> = schema
        .fields()
        .iter()
        .skip(1)
        .map(|field| field.name().clone())
        .collect();

    let mut row_labels = Vec::new();
    let mut values = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|err| failed(target, err))?;
        if batch.num_columns() == 0 {
            continue;
        }
        let labels = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| failed(target, "row labels are not strings"))?;
        let columns = (1..batch.num_columns())
            .map(|index| {
                batch
                    .column(index)
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| failed(target, "matrix column is not f64"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        for row in 0..batch.num_rows() {
            row_labels.push(labels.value(row).to_string());
            for column in &columns {
                values.push(if column.is_null(row) {
                    f64::NAN
                } else {
                    column.value(row)
                });
            }
        }
    }

    Ok(Matrix {
        row_labels,
        column_labels,
        values,
    })
}

fn read_parquet_table(path: &Path) -> Result<Table, TaigaError> {
    let target = LocalFormat::ParquetTable;
    let file = open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|err| failed(target, err))?;
    let schema = builder.schema().clone();
    let reader = builder.build().map_err(|err| failed(target, err))?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| failed(target, err))?;
    Ok(Table { schema, batches })
}

fn failed(format: LocalFormat, err: impl Display) -> TaigaError {
    TaigaError::Conversion {
        format: format.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_matches::assert_matches;

    use super::*;

    fn convert_text(
        dir: &tempfile::TempDir,
        source_format: LocalFormat,
        body: &str,
        target: LocalFormat,
    ) -> Result<std::path::PathBuf, TaigaError> {
        let source = dir.path().join("source.csv");
        fs::write(&source, body).unwrap();
        let dest = dir.path().join(format!("out.{}", target.suffix()));
        let mut out = File::create(&dest).unwrap();
        convert(source_format, &source, target, &mut out)?;
        Ok(dest)
    }

    #[test]
    fn matrix_csv_to_feather() {
        let dir = tempfile::tempdir().unwrap();
        let dest = convert_text(
            &dir,
            LocalFormat::CsvMatrix,
            ",a,b\nr1,1.5,2\nr2,,4\n",
            LocalFormat::FeatherMatrix,
        )
        .unwrap();

        let Artifact::Matrix(matrix) = read_artifact(LocalFormat::FeatherMatrix, &dest).unwrap()
        else {
            panic!("expected matrix");
        };
        assert_eq!(matrix.row_labels, vec!["r1", "r2"]);
        assert_eq!(matrix.column_labels, vec!["a", "b"]);
        assert_eq!(matrix.get(0, 0), Some(1.5));
        assert!(matrix.get(1, 0).unwrap().is_nan());
        assert_eq!(matrix.get(1, 1), Some(4.0));
        assert_eq!(matrix.get(2, 0), None);
    }

    #[test]
    fn missing_value_spellings_are_kept_as_row_labels() {
        let dir = tempfile::tempdir().unwrap();
        let dest = convert_text(
            &dir,
            LocalFormat::CsvMatrix,
            ",a\nNA,1\nnan,NA\n,3\n",
            LocalFormat::FeatherMatrix,
        )
        .unwrap();

        let Artifact::Matrix(matrix) = read_artifact(LocalFormat::FeatherMatrix, &dest).unwrap()
        else {
            panic!("expected matrix");
        };
        assert_eq!(matrix.row_labels, vec!["NA", "nan", ""]);
        assert_eq!(matrix.get(0, 0), Some(1.0));
        assert!(matrix.get(1, 0).unwrap().is_nan());
        assert_eq!(matrix.get(2, 0), Some(3.0));
    }

    #[test]
    fn non_numeric_matrix_cell_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = convert_text(
            &dir,
            LocalFormat::CsvMatrix,
            ",a\nr1,hello\n",
            LocalFormat::FeatherMatrix,
        )
        .unwrap_err();
        assert_matches!(err, TaigaError::Conversion { .. });
    }

    #[test]
    fn table_csv_to_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let dest = convert_text(
            &dir,
            LocalFormat::CsvTable,
            "name,count,flag\nx,1,true\ny,2,false\n",
            LocalFormat::ParquetTable,
        )
        .unwrap();

        let Artifact::Table(table) = read_artifact(LocalFormat::ParquetTable, &dest).unwrap()
        else {
            panic!("expected table");
        };
        assert_eq!(table.num_rows(), 2);
        assert_eq!(table.schema.field(1).data_type(), &ArrowType::Int64);
    }

    #[test]
    fn raw_has_no_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let err = convert_text(&dir, LocalFormat::Raw, "x", LocalFormat::ParquetTable).unwrap_err();
        assert_matches!(err, TaigaError::Conversion { .. });
    }
}
