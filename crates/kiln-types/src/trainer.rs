//! Contract between the hyperopt layer and the training subsystem.
//!
//! The model zoo lives elsewhere; a search only needs something that can turn
//! a merged configuration and a dataset into [`TrainingStats`].

use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::dataset::DatasetRef;
use crate::stats::TrainingStats;

/// What the trainer should do after reporting an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingControl {
    Continue,
    Stop,
}

impl TrainingControl {
    pub fn should_stop(self) -> bool {
        self == Self::Stop
    }
}

/// Receives intermediate statistics while a trial trains.
pub trait ProgressSink: Send + Sync {
    /// Called after each completed iteration (epoch) with the cumulative
    /// statistics so far.
    fn report(&self, iteration: u64, stats: &TrainingStats) -> TrainingControl;
}

/// Sink that never asks a run to stop.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _iteration: u64, _stats: &TrainingStats) -> TrainingControl {
        TrainingControl::Continue
    }
}

/// Per-trial information handed to the trainer.
#[derive(Clone)]
pub struct TrialContext {
    pub trial_id: Uuid,
    pub trial_number: usize,
    /// Directory the trainer may write checkpoints and artifacts into.
    pub trial_dir: PathBuf,
    /// Seed derived for this trial; trainers should seed their RNGs with it.
    pub seed: u64,
    pub progress: Arc<dyn ProgressSink>,
}

impl TrialContext {
    /// Report an epoch and return whether training should continue.
    pub fn report(&self, iteration: u64, stats: &TrainingStats) -> TrainingControl {
        self.progress.report(iteration, stats)
    }
}

impl fmt::Debug for TrialContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrialContext")
            .field("trial_id", &self.trial_id)
            .field("trial_number", &self.trial_number)
            .field("trial_dir", &self.trial_dir)
            .field("seed", &self.seed)
            .finish()
    }
}

/// The training subsystem: one call per trial.
///
/// Implementations run on worker threads and may block. They should call
/// [`TrialContext::report`] once per epoch and return early (with the
/// statistics gathered so far) when it answers [`TrainingControl::Stop`].
pub trait Trainer: Send + Sync {
    fn train(
        &self,
        config: &Value,
        dataset: &DatasetRef,
        context: &TrialContext,
    ) -> anyhow::Result<TrainingStats>;
}

impl<F> Trainer for F
where
    F: Fn(&Value, &DatasetRef, &TrialContext) -> anyhow::Result<TrainingStats> + Send + Sync,
{
    fn train(
        &self,
        config: &Value,
        dataset: &DatasetRef,
        context: &TrialContext,
    ) -> anyhow::Result<TrainingStats> {
        self(config, dataset, context)
    }
}
