use async_trait::async_trait;
use kiln_types::{DataError, KilnResult};
use std::path::{Path, PathBuf};

/// Fetches raw dataset files into a local directory.
#[async_trait]
pub trait Downloader: Send + Sync + std::fmt::Debug {
    /// Place the raw files in `raw_dir` and return their paths.
    async fn download(&self, raw_dir: &Path) -> KilnResult<Vec<PathBuf>>;

    /// Get downloader name
    fn name(&self) -> &str;

    /// Get downloader configuration
    fn config(&self) -> serde_json::Value;
}

/// Copies files from a local mirror (a mounted bucket, a shared drive, a
/// fixture directory).
#[derive(Debug, Clone)]
pub struct LocalMirrorDownloader {
    pub files: Vec<PathBuf>,
}

impl LocalMirrorDownloader {
    pub fn new<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            files: files.into_iter().map(|p| p.as_ref().to_path_buf()).collect(),
        }
    }
}

#[async_trait]
impl Downloader for LocalMirrorDownloader {
    async fn download(&self, raw_dir: &Path) -> KilnResult<Vec<PathBuf>> {
        tokio::fs::create_dir_all(raw_dir).await?;

        let mut written = Vec::with_capacity(self.files.len());
        for source in &self.files {
            let file_name = source.file_name().ok_or_else(|| {
                DataError::SourceNotFound(source.display().to_string())
            })?;
            if !source.exists() {
                return Err(DataError::SourceNotFound(source.display().to_string()).into());
            }
            let target = raw_dir.join(file_name);
            tokio::fs::copy(source, &target).await?;
            written.push(target);
        }

        tracing::info!("Copied {} raw files into {}", written.len(), raw_dir.display());
        Ok(written)
    }

    fn name(&self) -> &str {
        "local_mirror"
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "local_mirror",
            "files": self.files,
        })
    }
}

/// Downloads files over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    pub urls: Vec<String>,
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            client: reqwest::Client::new(),
        }
    }

    /// Name of the file a URL is saved under: its last path segment with any
    /// query string removed.
    fn file_name_for(url: &str) -> Option<String> {
        let without_query = url.split(['?', '#']).next()?;
        without_query
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, raw_dir: &Path) -> KilnResult<Vec<PathBuf>> {
        tokio::fs::create_dir_all(raw_dir).await?;

        let mut written = Vec::with_capacity(self.urls.len());
        for url in &self.urls {
            let file_name = Self::file_name_for(url).ok_or_else(|| DataError::DownloadFailed {
                url: url.clone(),
                message: "URL has no file name".to_string(),
            })?;

            let failed = |message: String| DataError::DownloadFailed {
                url: url.clone(),
                message,
            };
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| failed(e.to_string()))?;
            if !response.status().is_success() {
                return Err(failed(format!("HTTP status {}", response.status())).into());
            }
            let body = response.bytes().await.map_err(|e| failed(e.to_string()))?;

            let target = raw_dir.join(file_name);
            tokio::fs::write(&target, &body).await?;
            tracing::info!("Downloaded {} bytes from {}", body.len(), url);
            written.push(target);
        }

        Ok(written)
    }

    fn name(&self) -> &str {
        "http"
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "http",
            "urls": self.urls,
        })
    }
}
