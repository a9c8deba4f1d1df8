use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use kiln_types::{config_error, DataError, KilnError, KilnResult};

use crate::download::Downloader;
use crate::loaders::{CsvLoader, Loader};
use crate::process::{is_marker, IdentityProcessor, Processor, COMPLETE_MARKER};

/// Default root for dataset caches: `<user cache dir>/kiln/datasets`.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kiln")
        .join("datasets")
}

/// A named dataset assembled from a downloader, a processor and a loader.
///
/// Each stage writes into its own directory under `<cache_dir>/<name>` and
/// leaves a completion marker, so a second `load` skips finished stages.
#[derive(Debug)]
pub struct Dataset {
    name: String,
    cache_dir: PathBuf,
    downloader: Box<dyn Downloader>,
    processor: Box<dyn Processor>,
    loader: Box<dyn Loader>,
}

impl Dataset {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_dir(&self) -> PathBuf {
        self.cache_dir.join(&self.name)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root_dir().join("raw")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root_dir().join("processed")
    }

    pub fn is_downloaded(&self) -> bool {
        self.raw_dir().join(COMPLETE_MARKER).exists()
    }

    pub fn is_processed(&self) -> bool {
        self.processed_dir().join(COMPLETE_MARKER).exists()
    }

    pub async fn download(&self) -> KilnResult<()> {
        if self.is_downloaded() {
            tracing::debug!(dataset = %self.name, "Raw files already present");
            return Ok(());
        }
        let raw_dir = self.raw_dir();
        let files = self.downloader.download(&raw_dir).await?;
        tracing::info!(
            dataset = %self.name,
            downloader = self.downloader.name(),
            files = files.len(),
            "Downloaded dataset"
        );
        fs::write(raw_dir.join(COMPLETE_MARKER), "")?;
        Ok(())
    }

    pub fn process(&self) -> KilnResult<()> {
        if self.is_processed() {
            return Ok(());
        }
        let processed_dir = self.processed_dir();
        let files = self.processor.process(&self.raw_dir(), &processed_dir)?;
        tracing::info!(
            dataset = %self.name,
            processor = self.processor.name(),
            files = files.len(),
            "Processed dataset"
        );
        fs::write(processed_dir.join(COMPLETE_MARKER), "")?;
        Ok(())
    }

    /// Processed files this dataset's loader accepts, sorted by name.
    pub fn processed_files(&self) -> KilnResult<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(self.processed_dir())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && !is_marker(path) && self.loader.accepts(path))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Download, process and load the dataset as a single table.
    pub async fn load(&self) -> KilnResult<Arc<RecordBatch>> {
        self.download().await?;
        self.process()?;

        let files = self.processed_files()?;
        if files.is_empty() {
            return Err(DataError::LoadingFailed {
                message: format!(
                    "no {} files in {}",
                    self.loader.name(),
                    self.processed_dir().display()
                ),
            }
            .into());
        }

        let batches = files
            .iter()
            .map(|path| self.loader.load(path))
            .collect::<KilnResult<Vec<_>>>()?;
        let schema = batches[0].schema();
        let table = arrow::compute::concat_batches(&schema, &batches).map_err(|e| {
            KilnError::from(DataError::InvalidFormat {
                message: format!("processed files disagree on schema: {e}"),
            })
        })?;

        tracing::info!(dataset = %self.name, rows = table.num_rows(), "Dataset loaded");
        Ok(Arc::new(table))
    }

    /// Remove every cached stage of this dataset.
    pub fn clear(&self) -> KilnResult<()> {
        let root = self.root_dir();
        if root.exists() {
            fs::remove_dir_all(root)?;
        }
        Ok(())
    }
}

/// Builder for [`Dataset`]
#[derive(Debug)]
pub struct DatasetBuilder {
    name: String,
    cache_dir: Option<PathBuf>,
    downloader: Option<Box<dyn Downloader>>,
    processor: Option<Box<dyn Processor>>,
    loader: Option<Box<dyn Loader>>,
}

impl DatasetBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache_dir: None,
            downloader: None,
            processor: None,
            loader: None,
        }
    }

    pub fn cache_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cache_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn downloader<D: Downloader + 'static>(mut self, downloader: D) -> Self {
        self.downloader = Some(Box::new(downloader));
        self
    }

    pub fn processor<P: Processor + 'static>(mut self, processor: P) -> Self {
        self.processor = Some(Box::new(processor));
        self
    }

    pub fn loader<L: Loader + 'static>(mut self, loader: L) -> Self {
        self.loader = Some(Box::new(loader));
        self
    }

    pub fn build(self) -> KilnResult<Dataset> {
        if self.name.trim().is_empty() || self.name.contains(['/', '\\']) {
            return Err(config_error!("invalid dataset name '{}'", self.name));
        }
        let downloader = self
            .downloader
            .ok_or_else(|| config_error!("dataset '{}' has no downloader", self.name))?;

        Ok(Dataset {
            cache_dir: self.cache_dir.unwrap_or_else(default_cache_dir),
            downloader,
            processor: self
                .processor
                .unwrap_or_else(|| Box::new(IdentityProcessor)),
            loader: self.loader.unwrap_or_else(|| Box::new(CsvLoader::new())),
            name: self.name,
        })
    }
}
