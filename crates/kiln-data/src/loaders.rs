use std::fmt::Debug;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use csv::ReaderBuilder;
use kiln_types::{DataError, KilnError, KilnResult};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

/// Reads a processed dataset file into an in-memory table.
pub trait Loader: Send + Sync + Debug {
    fn load(&self, path: &Path) -> KilnResult<RecordBatch>;

    /// File extensions (lowercase, without dot) this loader understands.
    fn extensions(&self) -> &[&'static str];

    fn name(&self) -> &str;

    fn accepts(&self, path: &Path) -> bool {
        DataFormat::extension_of(path)
            .map(|ext| self.extensions().contains(&ext.as_str()))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Parquet,
}

impl DataFormat {
    fn extension_of(path: &Path) -> Option<String> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
    }

    pub fn from_path(path: &Path) -> KilnResult<Self> {
        let extension = Self::extension_of(path).unwrap_or_default();
        match extension.as_str() {
            "csv" | "tsv" => Ok(Self::Csv),
            "parquet" | "pq" => Ok(Self::Parquet),
            _ => Err(DataError::UnsupportedFormat { extension }.into()),
        }
    }

    pub fn loader(self) -> Box<dyn Loader> {
        match self {
            Self::Csv => Box::new(CsvLoader::new()),
            Self::Parquet => Box::new(ParquetLoader),
        }
    }
}

/// Load a CSV or Parquet file, choosing the loader from the extension.
pub fn load_table(path: &Path) -> KilnResult<RecordBatch> {
    if !path.exists() {
        return Err(DataError::SourceNotFound(path.display().to_string()).into());
    }
    let format = DataFormat::from_path(path)?;
    format.loader().load(path)
}

// ---- CSV ----

/// CSV loader with per-column type inference (integer, float, then string).
#[derive(Debug, Clone)]
pub struct CsvLoader {
    delimiter: u8,
}

impl CsvLoader {
    pub fn new() -> Self {
        Self { delimiter: b',' }
    }

    pub fn with_delimiter(delimiter: u8) -> Self {
        Self { delimiter }
    }

    fn infer_column(values: &[Option<&str>]) -> ArrayRef {
        let present = || values.iter().flatten();

        if present().all(|v| v.parse::<i64>().is_ok()) {
            let ints: Int64Array = values
                .iter()
                .map(|v| v.and_then(|s| s.parse::<i64>().ok()))
                .collect();
            return Arc::new(ints);
        }
        if present().all(|v| v.parse::<f64>().is_ok()) {
            let floats: Float64Array = values
                .iter()
                .map(|v| v.and_then(|s| s.parse::<f64>().ok()))
                .collect();
            return Arc::new(floats);
        }
        let strings: StringArray = values.iter().copied().collect();
        Arc::new(strings)
    }
}

impl Default for CsvLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader for CsvLoader {
    fn load(&self, path: &Path) -> KilnResult<RecordBatch> {
        tracing::info!("Loading CSV data from: {}", path.display());

        let delimiter = match DataFormat::extension_of(path).as_deref() {
            Some("tsv") => b'\t',
            _ => self.delimiter,
        };
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .delimiter(delimiter)
            .from_path(path)
            .map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to open {}: {}", path.display(), e),
            })?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| DataError::ParseError {
                message: format!("CSV header error: {e}"),
            })?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut records = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|e| DataError::ParseError {
                message: format!("CSV parsing error: {e}"),
            })?;
            if record.len() != headers.len() {
                return Err(DataError::InvalidFormat {
                    message: format!(
                        "row has {} fields, header has {}",
                        record.len(),
                        headers.len()
                    ),
                }
                .into());
            }
            records.push(record);
        }

        let mut fields = Vec::with_capacity(headers.len());
        let mut columns = Vec::with_capacity(headers.len());
        for (index, name) in headers.iter().enumerate() {
            let values: Vec<Option<&str>> = records
                .iter()
                .map(|r| r.get(index).map(str::trim).filter(|v| !v.is_empty()))
                .collect();
            let column = Self::infer_column(&values);
            fields.push(Field::new(name, column.data_type().clone(), true));
            columns.push(column);
        }

        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .map_err(|e| KilnError::Arrow(e.to_string()))?;

        tracing::info!("Loaded {} rows from CSV file: {}", batch.num_rows(), path.display());
        Ok(batch)
    }

    fn extensions(&self) -> &[&'static str] {
        &["csv", "tsv"]
    }

    fn name(&self) -> &str {
        "csv"
    }
}

// ---- Parquet ----

/// Parquet loader; all row groups are concatenated into one batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetLoader;

impl Loader for ParquetLoader {
    fn load(&self, path: &Path) -> KilnResult<RecordBatch> {
        tracing::info!("Loading Parquet data from: {}", path.display());

        let file = fs::File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| {
            KilnError::Parquet(format!(
                "Failed to create Parquet reader for {}: {}",
                path.display(),
                e
            ))
        })?;
        let schema = builder.schema().clone();
        let reader = builder
            .build()
            .map_err(|e| KilnError::Parquet(format!("Failed to build Parquet reader: {e}")))?;

        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch.map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to read Parquet batch: {e}"),
            })?);
        }

        let batch = arrow::compute::concat_batches(&schema, &batches)
            .map_err(|e| KilnError::Arrow(e.to_string()))?;

        tracing::info!("Loaded {} rows from Parquet file: {}", batch.num_rows(), path.display());
        Ok(batch)
    }

    fn extensions(&self) -> &[&'static str] {
        &["parquet", "pq"]
    }

    fn name(&self) -> &str {
        "parquet"
    }
}

/// Returns the column types as a compact summary, useful in log lines.
pub fn describe_schema(batch: &RecordBatch) -> String {
    batch
        .schema()
        .fields()
        .iter()
        .map(|f| match f.data_type() {
            DataType::Int64 => format!("{}:int", f.name()),
            DataType::Float64 => format!("{}:float", f.name()),
            DataType::Utf8 => format!("{}:string", f.name()),
            other => format!("{}:{other}", f.name()),
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use parquet::arrow::ArrowWriter;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_csv_loading_infers_types() {
        let mut temp_file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(temp_file, "x1,x2,label").unwrap();
        writeln!(temp_file, "1,0.5,yes").unwrap();
        writeln!(temp_file, "2,,no").unwrap();
        writeln!(temp_file, "3,1.5,yes").unwrap();
        temp_file.flush().unwrap();

        let batch = load_table(temp_file.path()).unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), 3);
        assert_eq!(describe_schema(&batch), "x1:int,x2:float,label:string");

        let x2 = batch
            .column(1)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert!(x2.is_null(1));
        assert_eq!(x2.value(2), 1.5);
    }

    #[test]
    fn test_csv_ragged_rows_rejected() {
        let mut temp_file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(temp_file, "a,b").unwrap();
        writeln!(temp_file, "1,2,3").unwrap();
        temp_file.flush().unwrap();

        assert!(CsvLoader::new().load(temp_file.path()).is_err());
    }

    #[test]
    fn test_parquet_loading() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.parquet");

        let schema = Arc::new(Schema::new(vec![
            Field::new("x", DataType::Float64, false),
            Field::new("y", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Float64Array::from(vec![0.1, 0.2, 0.3])),
                Arc::new(Int64Array::from(vec![1, 0, 1])),
            ],
        )
        .unwrap();

        let file = fs::File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let loaded = load_table(&path).unwrap();
        assert_eq!(loaded.num_rows(), 3);
        assert_eq!(loaded.column(0).as_ref(), batch.column(0).as_ref());
        assert_eq!(loaded.column(1).as_ref(), batch.column(1).as_ref());
    }

    #[test]
    fn test_unknown_extension_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let json = dir.path().join("data.json");
        fs::write(&json, "{}").unwrap();

        assert!(matches!(
            load_table(&json),
            Err(KilnError::Data(DataError::UnsupportedFormat { .. }))
        ));
        assert!(matches!(
            load_table(&dir.path().join("missing.csv")),
            Err(KilnError::Data(DataError::SourceNotFound(_)))
        ));
    }
}
