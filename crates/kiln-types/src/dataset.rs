use arrow::record_batch::RecordBatch;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reference to the dataset every trial trains on.
///
/// Cloning is cheap: in-memory tables are shared between trials.
#[derive(Clone)]
pub enum DatasetRef {
    /// A CSV or Parquet file on disk.
    Path(PathBuf),
    /// A table already loaded in memory.
    Table(Arc<RecordBatch>),
}

impl DatasetRef {
    pub fn path(path: impl AsRef<Path>) -> Self {
        Self::Path(path.as_ref().to_path_buf())
    }

    pub fn table(batch: RecordBatch) -> Self {
        Self::Table(Arc::new(batch))
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            Self::Table(_) => None,
        }
    }

    pub fn as_table(&self) -> Option<&RecordBatch> {
        match self {
            Self::Path(_) => None,
            Self::Table(batch) => Some(batch),
        }
    }

    pub fn num_rows(&self) -> Option<usize> {
        self.as_table().map(RecordBatch::num_rows)
    }
}

impl fmt::Debug for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Table(batch) => f
                .debug_struct("Table")
                .field("rows", &batch.num_rows())
                .field("columns", &batch.num_columns())
                .finish(),
        }
    }
}

impl From<PathBuf> for DatasetRef {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<RecordBatch> for DatasetRef {
    fn from(batch: RecordBatch) -> Self {
        Self::table(batch)
    }
}
