//! Background upload of finished trial directories to durable storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_data::DurableStorage;
use kiln_types::HyperoptError;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Counts of finished sync tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncSummary {
    pub synced: usize,
    pub failed: usize,
}

/// Copies terminal trial directories to `<remote_dir>/<experiment>/<trial>`
/// and removes the local copy once the upload succeeded.
///
/// Failures are logged and never touch trial state.
#[derive(Debug)]
pub struct CheckpointSyncer {
    storage: Arc<dyn DurableStorage>,
    remote_dir: String,
    tasks: JoinSet<bool>,
}

impl CheckpointSyncer {
    pub fn new(storage: Arc<dyn DurableStorage>, remote_dir: impl Into<String>) -> Self {
        Self {
            storage,
            remote_dir: remote_dir.into(),
            tasks: JoinSet::new(),
        }
    }

    pub fn storage_name(&self) -> &str {
        self.storage.name()
    }

    /// Durable target for one trial directory.
    pub fn remote_target(&self, experiment: &str, trial_dir_name: &str) -> String {
        [self.remote_dir.as_str(), experiment, trial_dir_name]
            .iter()
            .map(|segment| segment.trim_matches('/'))
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Start uploading `local_dir` in the background. Missing directories are skipped.
    pub fn spawn(&mut self, trial_id: Uuid, local_dir: &Path, target: String) {
        if !local_dir.is_dir() {
            tracing::debug!(trial = %trial_id, dir = %local_dir.display(), "No trial directory to sync");
            return;
        }
        let storage = self.storage.clone();
        let local_dir: PathBuf = local_dir.to_path_buf();

        self.tasks.spawn(async move {
            match storage.copy_dir(&local_dir, &target).await {
                Ok(()) => {
                    if let Err(e) = tokio::fs::remove_dir_all(&local_dir).await {
                        tracing::warn!(trial = %trial_id, error = %e, "Synced but could not remove local trial directory");
                    }
                    tracing::debug!(trial = %trial_id, %target, "Trial directory synced");
                    true
                }
                Err(e) => {
                    let error = HyperoptError::Sync {
                        path: local_dir.display().to_string(),
                        message: e.to_string(),
                    };
                    tracing::warn!(trial = %trial_id, %target, %error, "Checkpoint sync failed");
                    // do not leave a partial upload behind
                    if let Err(e) = storage.delete_dir(&target).await {
                        tracing::warn!(trial = %trial_id, %target, error = %e, "Could not remove partial upload");
                    }
                    false
                }
            }
        });
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every spawned upload to finish.
    pub async fn join_all(&mut self) -> SyncSummary {
        let mut summary = SyncSummary::default();
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(true) => summary.synced += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "Checkpoint sync task aborted");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}
