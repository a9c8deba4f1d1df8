use kiln_types::{DataError, KilnResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Turns raw downloaded files into files a [`crate::Loader`] can read.
pub trait Processor: Send + Sync + std::fmt::Debug {
    fn process(&self, raw_dir: &Path, processed_dir: &Path) -> KilnResult<Vec<PathBuf>>;

    fn name(&self) -> &str;
}

/// Copies raw files unchanged into the processed directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityProcessor;

impl Processor for IdentityProcessor {
    fn process(&self, raw_dir: &Path, processed_dir: &Path) -> KilnResult<Vec<PathBuf>> {
        fs::create_dir_all(processed_dir)?;

        let mut entries: Vec<PathBuf> = fs::read_dir(raw_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && !is_marker(path))
            .collect();
        entries.sort();

        if entries.is_empty() {
            return Err(DataError::ProcessingFailed {
                message: format!("no raw files in {}", raw_dir.display()),
            }
            .into());
        }

        let mut written = Vec::with_capacity(entries.len());
        for source in entries {
            if let Some(name) = source.file_name() {
                let target = processed_dir.join(name);
                fs::copy(&source, &target)?;
                written.push(target);
            }
        }
        Ok(written)
    }

    fn name(&self) -> &str {
        "identity"
    }
}

/// Marker file written once a pipeline stage completed.
pub(crate) const COMPLETE_MARKER: &str = ".complete";

pub(crate) fn is_marker(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()) == Some(COMPLETE_MARKER)
}
