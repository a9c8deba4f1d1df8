//! Trial tracking and the search goal.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use kiln_types::stats::{COMBINED, LOSS, TRAINING, VALIDATION};
use kiln_types::{HyperoptError, KilnResult, MetricKey, TrainingStats};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::ResourceRequest;
use crate::space::Assignment;

/// Whether we are minimizing or maximizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    #[default]
    Minimize,
    Maximize,
}

impl Goal {
    /// Order two metric values so that the better one comes first.
    pub fn compare(self, a: f64, b: f64) -> Ordering {
        let ascending = a.total_cmp(&b);
        match self {
            Goal::Minimize => ascending,
            Goal::Maximize => ascending.reverse(),
        }
    }

    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        self.compare(candidate, incumbent) == Ordering::Less
    }

    /// Map a metric so that larger is always better.
    pub fn signed(self, metric: f64) -> f64 {
        match self {
            Goal::Minimize => -metric,
            Goal::Maximize => metric,
        }
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Goal::Minimize => f.write_str("minimize"),
            Goal::Maximize => f.write_str("maximize"),
        }
    }
}

/// What the search optimizes; fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchGoal {
    pub goal: Goal,
    pub metric: String,
    pub output_feature: String,
    pub split: String,
}

impl Default for SearchGoal {
    fn default() -> Self {
        Self::new(Goal::Minimize, LOSS, COMBINED)
    }
}

impl SearchGoal {
    pub fn new(goal: Goal, metric: impl Into<String>, output_feature: impl Into<String>) -> Self {
        Self {
            goal,
            metric: metric.into(),
            output_feature: output_feature.into(),
            split: VALIDATION.to_string(),
        }
    }

    pub fn with_split(mut self, split: impl Into<String>) -> Self {
        self.split = split.into();
        self
    }

    pub fn metric_key(&self) -> MetricKey {
        MetricKey::new(&self.split, &self.output_feature, &self.metric)
    }

    /// Last reported value of the goal metric, falling back to the training
    /// split when the requested split was never reported.
    pub fn latest(&self, stats: &TrainingStats) -> Option<f64> {
        let key = self.metric_key();
        stats
            .last(&key)
            .or_else(|| stats.last(&key.with_split(TRAINING)))
    }

    /// Extract the final metric of a finished run.
    pub fn extract(&self, stats: &TrainingStats) -> Result<f64, String> {
        match self.latest(stats) {
            Some(value) if value.is_finite() => Ok(value),
            Some(value) => Err(format!("metric {} is not finite ({value})", self.metric_key())),
            None => Err(format!(
                "metric {} was never reported by the trainer",
                self.metric_key()
            )),
        }
    }
}

/// Lifecycle state of a trial. `Pending` is initial; the last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Where a trial's checkpoint lives. The executor never reads the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub trial_id: Uuid,
    pub local_dir: PathBuf,
    /// Planned durable location, when checkpoint sync is configured.
    pub remote: Option<String>,
}

/// A single trial (one sampled assignment trained once).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    pub trial_number: usize,
    pub parameters: Assignment,
    pub resources: ResourceRequest,
    pub status: TrialStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub metric: Option<f64>,
    pub early_stopped: bool,
    pub iterations: u64,
    pub worker: Option<String>,
    pub error: Option<String>,
    pub checkpoint: Option<CheckpointRef>,
}

impl Trial {
    pub fn new(trial_number: usize, parameters: Assignment, resources: ResourceRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            trial_number,
            parameters,
            resources,
            status: TrialStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            metric: None,
            early_stopped: false,
            iterations: 0,
            worker: None,
            error: None,
            checkpoint: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, allowed_from: &[TrialStatus], to: TrialStatus) -> KilnResult<()> {
        if !allowed_from.contains(&self.status) {
            return Err(HyperoptError::InvalidTransition {
                trial_id: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        self.status = to;
        Ok(())
    }

    fn finish(&mut self, iterations: u64) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.iterations = iterations;
        self.duration_seconds = self
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
    }

    pub fn mark_running(&mut self, worker: impl Into<String>) -> KilnResult<()> {
        self.transition(&[TrialStatus::Pending], TrialStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.worker = Some(worker.into());
        Ok(())
    }

    pub fn mark_succeeded(&mut self, metric: f64, iterations: u64) -> KilnResult<()> {
        self.transition(&[TrialStatus::Running], TrialStatus::Succeeded)?;
        self.metric = Some(metric);
        self.finish(iterations);
        Ok(())
    }

    /// A trial may fail before it ever ran (for example when it cannot be
    /// submitted).
    pub fn mark_failed(&mut self, error: impl Into<String>, iterations: u64) -> KilnResult<()> {
        self.transition(
            &[TrialStatus::Pending, TrialStatus::Running],
            TrialStatus::Failed,
        )?;
        self.error = Some(error.into());
        self.finish(iterations);
        Ok(())
    }

    pub fn mark_stopped(
        &mut self,
        metric: Option<f64>,
        iterations: u64,
        early_stopped: bool,
    ) -> KilnResult<()> {
        self.transition(&[TrialStatus::Running], TrialStatus::Stopped)?;
        self.metric = metric;
        self.early_stopped = early_stopped;
        self.finish(iterations);
        Ok(())
    }

    pub fn attach_checkpoint(&mut self, checkpoint: CheckpointRef) -> KilnResult<()> {
        if self.is_terminal() {
            return Err(HyperoptError::InvalidTransition {
                trial_id: self.id.to_string(),
                from: self.status.to_string(),
                to: "checkpoint attached".to_string(),
            }
            .into());
        }
        self.checkpoint = Some(checkpoint);
        Ok(())
    }
}
