pub mod cache;
pub mod dataset;
pub mod download;
pub mod loaders;
pub mod process;
pub mod storage;

pub use cache::*;
pub use dataset::*;
pub use download::*;
pub use loaders::*;
pub use process::{IdentityProcessor, Processor};
pub use storage::*;

use kiln_types::{DatasetRef, KilnResult};

/// Data manager coordinates dataset preparation for a search
#[derive(Debug, Default)]
pub struct DataManager {
    pub cache: TableCache,
}

impl DataManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(cache: TableCache) -> Self {
        Self { cache }
    }

    /// Turn a dataset reference into an in-memory table so trials share one
    /// parsed copy. Tables pass through untouched.
    pub fn resolve(&self, dataset: DatasetRef) -> KilnResult<DatasetRef> {
        match dataset {
            DatasetRef::Table(table) => Ok(DatasetRef::Table(table)),
            DatasetRef::Path(path) => {
                let table = self.cache.load(&path)?;
                tracing::info!(
                    path = %path.display(),
                    rows = table.num_rows(),
                    schema = %describe_schema(&table),
                    "Dataset preloaded"
                );
                Ok(DatasetRef::Table(table))
            }
        }
    }

    /// Run a [`Dataset`] pipeline and return the result as a reference.
    pub async fn prepare(&self, dataset: &Dataset) -> KilnResult<DatasetRef> {
        Ok(DatasetRef::Table(dataset.load().await?))
    }
}
