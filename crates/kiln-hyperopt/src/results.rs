//! Ranking and persistence of finished searches.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_types::KilnResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trial::{SearchGoal, Trial, TrialStatus};

/// File name of the persisted search report.
pub const HYPEROPT_STATISTICS_FILE: &str = "hyperopt_statistics.json";

/// Why the executor stopped launching trials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The sampler had nothing left to propose.
    Exhausted,
    Cancelled,
    TimeBudget,
    /// The sampler failed after trials had already launched.
    SamplerError(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total_trials: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stopped: usize,
    pub early_stopped: usize,
    pub best_trial_id: Option<Uuid>,
    pub best_metric: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub termination: Termination,
}

/// Final report of a search: ranked trials (best first) then unranked ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub goal: SearchGoal,
    pub summary: ExecutionSummary,
    pub trials: Vec<Trial>,
}

impl ExecutionResult {
    /// Trials that carry a metric, in rank order.
    pub fn ranked(&self) -> impl Iterator<Item = &Trial> {
        self.trials.iter().filter(|t| t.metric.is_some())
    }

    pub fn best(&self) -> Option<&Trial> {
        self.ranked().next()
    }

    pub fn failed(&self) -> impl Iterator<Item = &Trial> {
        self.trials
            .iter()
            .filter(|t| t.status == TrialStatus::Failed)
    }

    /// Write `hyperopt_statistics.json` into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> KilnResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(HYPEROPT_STATISTICS_FILE);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        tracing::info!(path = %path.display(), trials = self.trials.len(), "Saved hyperopt statistics");
        Ok(path)
    }

    pub fn load(path: &Path) -> KilnResult<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Orders terminal trials by the search goal and builds the summary.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    goal: SearchGoal,
}

impl ResultAggregator {
    pub fn new(goal: SearchGoal) -> Self {
        Self { goal }
    }

    pub fn goal(&self) -> &SearchGoal {
        &self.goal
    }

    /// Rank trials with a metric by the goal, ties by submission number;
    /// trials without a metric follow in submission order.
    pub fn rank(&self, trials: Vec<Trial>) -> Vec<Trial> {
        let (mut ranked, mut unranked): (Vec<Trial>, Vec<Trial>) =
            trials.into_iter().partition(|t| t.metric.is_some());

        let goal = self.goal.goal;
        ranked.sort_by(|a, b| {
            let (ma, mb) = (a.metric.unwrap_or_default(), b.metric.unwrap_or_default());
            goal.compare(ma, mb)
                .then_with(|| a.trial_number.cmp(&b.trial_number))
        });
        unranked.sort_by_key(|t| t.trial_number);

        ranked.extend(unranked);
        ranked
    }

    pub fn aggregate(
        &self,
        trials: Vec<Trial>,
        started_at: DateTime<Utc>,
        termination: Termination,
    ) -> ExecutionResult {
        let trials = self.rank(trials);
        let count = |status: TrialStatus| trials.iter().filter(|t| t.status == status).count();
        let best = trials.iter().find(|t| t.metric.is_some());

        if best.is_none() && !trials.is_empty() {
            tracing::warn!(
                trials = trials.len(),
                metric = %self.goal.metric_key(),
                "No trial produced a metric; ranking is empty"
            );
        }

        let summary = ExecutionSummary {
            total_trials: trials.len(),
            succeeded: count(TrialStatus::Succeeded),
            failed: count(TrialStatus::Failed),
            stopped: count(TrialStatus::Stopped),
            early_stopped: trials.iter().filter(|t| t.early_stopped).count(),
            best_trial_id: best.map(|t| t.id),
            best_metric: best.and_then(|t| t.metric),
            started_at,
            elapsed_seconds: (Utc::now() - started_at).num_milliseconds().max(0) as f64 / 1000.0,
            termination,
        };

        ExecutionResult {
            goal: self.goal.clone(),
            summary,
            trials,
        }
    }
}
