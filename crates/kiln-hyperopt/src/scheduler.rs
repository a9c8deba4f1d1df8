//! Early-stopping schedulers consulted each time a trial reports progress.

use std::collections::HashMap;
use std::fmt::Debug;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trial::Goal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerDecision {
    Continue,
    /// Underperforming: end the trial early.
    Stop,
    /// The trial used up its iteration budget and ends as completed.
    Complete,
}

/// Decides, from intermediate results, whether a running trial should go on.
pub trait TrialScheduler: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Called with the goal metric after each reported iteration.
    fn on_result(&self, trial_id: Uuid, iteration: u64, metric: f64) -> SchedulerDecision;

    /// Called once with the final metric of a trial that ran to completion.
    fn on_trial_complete(&self, _trial_id: Uuid, _iteration: u64, _metric: f64) {}
}

/// Lets every trial run to completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoScheduler;

impl TrialScheduler for FifoScheduler {
    fn name(&self) -> &str {
        "fifo"
    }

    fn on_result(&self, _trial_id: Uuid, _iteration: u64, _metric: f64) -> SchedulerDecision {
        SchedulerDecision::Continue
    }
}

/// Settings for [`AsyncHyperBandScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperBandSettings {
    /// Iteration budget; a trial reaching it ends as completed.
    pub max_t: u64,
    /// Trials are never stopped before this many iterations.
    pub grace_period: u64,
    pub reduction_factor: f64,
}

impl Default for HyperBandSettings {
    fn default() -> Self {
        Self {
            max_t: 100,
            grace_period: 1,
            reduction_factor: 4.0,
        }
    }
}

#[derive(Debug)]
struct Rung {
    milestone: u64,
    recorded: HashMap<Uuid, f64>,
}

/// Asynchronous successive halving over a single bracket.
///
/// Rungs sit at `grace_period * reduction_factor^k` iterations. The first
/// time a trial reaches a rung it is compared with everything recorded
/// there and stopped if it falls below the `1 - 1/reduction_factor`
/// quantile.
#[derive(Debug)]
pub struct AsyncHyperBandScheduler {
    goal: Goal,
    settings: HyperBandSettings,
    rungs: Mutex<Vec<Rung>>,
}

impl AsyncHyperBandScheduler {
    pub fn new(goal: Goal, settings: HyperBandSettings) -> Self {
        let grace = settings.grace_period.max(1);
        let factor = settings.reduction_factor.max(1.0 + f64::EPSILON);
        let mut milestones = Vec::new();
        let mut milestone = grace as f64;
        while milestone <= settings.max_t as f64 + 1e-9 {
            milestones.push(milestone.round() as u64);
            milestone *= factor;
        }
        // highest rung first
        let rungs = milestones
            .into_iter()
            .rev()
            .map(|milestone| Rung {
                milestone,
                recorded: HashMap::new(),
            })
            .collect();

        Self {
            goal,
            settings: HyperBandSettings {
                grace_period: grace,
                reduction_factor: factor,
                ..settings
            },
            rungs: Mutex::new(rungs),
        }
    }

    pub fn milestones(&self) -> Vec<u64> {
        self.rungs.lock().iter().map(|r| r.milestone).collect()
    }

    fn cutoff(&self, recorded: &HashMap<Uuid, f64>) -> Option<f64> {
        let mut values: Vec<f64> = recorded.values().copied().filter(|v| !v.is_nan()).collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let quantile = 1.0 - 1.0 / self.settings.reduction_factor;
        Some(percentile(&values, quantile))
    }
}

/// Linear-interpolated percentile of sorted values, `q` in [0, 1].
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = q * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    let weight = rank - low as f64;
    sorted[low] + (sorted[high] - sorted[low]) * weight
}

impl AsyncHyperBandScheduler {
    /// Record `metric` at the highest rung the trial reached for the first
    /// time and report whether it fell below that rung's cutoff.
    fn record(&self, trial_id: Uuid, iteration: u64, metric: f64) -> SchedulerDecision {
        let reward = self.goal.signed(metric);

        let mut rungs = self.rungs.lock();
        for rung in rungs.iter_mut() {
            if iteration < rung.milestone || rung.recorded.contains_key(&trial_id) {
                continue;
            }
            let cutoff = self.cutoff(&rung.recorded);
            rung.recorded.insert(trial_id, reward);
            if matches!(cutoff, Some(cutoff) if reward < cutoff) {
                tracing::debug!(
                    trial = %trial_id,
                    iteration,
                    milestone = rung.milestone,
                    "Trial below rung cutoff"
                );
                return SchedulerDecision::Stop;
            }
            break;
        }
        SchedulerDecision::Continue
    }
}

impl TrialScheduler for AsyncHyperBandScheduler {
    fn name(&self) -> &str {
        "async_hyperband"
    }

    fn on_result(&self, trial_id: Uuid, iteration: u64, metric: f64) -> SchedulerDecision {
        if iteration >= self.settings.max_t {
            // still recorded so later trials are compared against it
            let _ = self.record(trial_id, iteration, metric);
            return SchedulerDecision::Complete;
        }
        self.record(trial_id, iteration, metric)
    }

    fn on_trial_complete(&self, trial_id: Uuid, iteration: u64, metric: f64) {
        let _ = self.record(trial_id, iteration, metric);
    }
}
