use std::sync::Arc;

use kiln_types::{MetricKey, ProgressSink, TrainingControl, TrainingStats};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::scheduler::{SchedulerDecision, TrialScheduler};
use crate::trial::SearchGoal;

/// Why a trial was asked to stop before finishing on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EarlyStopped,
    Cancelled,
}

#[derive(Debug, Default)]
struct ReporterState {
    iterations: u64,
    last_metric: Option<f64>,
    stop: Option<StopReason>,
    /// Set once the trainer has been handed `TrainingControl::Stop` for `stop`.
    stop_delivered: bool,
}

/// Progress sink handed to the trainer of one trial.
///
/// Tracks the latest goal metric, consults the trial scheduler, and carries
/// stop requests from the executor back to the trainer.
#[derive(Debug)]
pub struct TrialReporter {
    trial_id: Uuid,
    goal: SearchGoal,
    scheduler: Option<Arc<dyn TrialScheduler>>,
    state: Mutex<ReporterState>,
}

impl TrialReporter {
    pub fn new(trial_id: Uuid, goal: SearchGoal, scheduler: Option<Arc<dyn TrialScheduler>>) -> Self {
        Self {
            trial_id,
            goal,
            scheduler,
            state: Mutex::new(ReporterState::default()),
        }
    }

    pub fn trial_id(&self) -> Uuid {
        self.trial_id
    }

    pub fn metric_key(&self) -> MetricKey {
        self.goal.metric_key()
    }

    /// Ask the trainer to stop at its next report. The first reason wins.
    pub fn request_stop(&self, reason: StopReason) {
        let mut state = self.state.lock();
        if state.stop.is_none() {
            state.stop = Some(reason);
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.state.lock().stop
    }

    /// The stop reason the trainer actually acted on. A stop requested after
    /// the trainer's last report never reached it, so the run was complete.
    pub fn delivered_stop(&self) -> Option<StopReason> {
        let state = self.state.lock();
        state.stop.filter(|_| state.stop_delivered)
    }

    pub fn iterations(&self) -> u64 {
        self.state.lock().iterations
    }

    pub fn last_metric(&self) -> Option<f64> {
        self.state.lock().last_metric
    }
}

impl ProgressSink for TrialReporter {
    fn report(&self, iteration: u64, stats: &TrainingStats) -> TrainingControl {
        let metric = self.goal.latest(stats);
        {
            let mut state = self.state.lock();
            state.iterations = state.iterations.max(iteration);
            if metric.is_some() {
                state.last_metric = metric;
            }
            if state.stop.is_some() {
                state.stop_delivered = true;
                return TrainingControl::Stop;
            }
        }

        let decision = match (&self.scheduler, metric) {
            (Some(scheduler), Some(value)) if value.is_finite() => {
                scheduler.on_result(self.trial_id, iteration, value)
            }
            _ => SchedulerDecision::Continue,
        };

        match decision {
            SchedulerDecision::Continue => TrainingControl::Continue,
            SchedulerDecision::Stop => {
                tracing::info!(trial = %self.trial_id, iteration, ?metric, "Scheduler stopped trial");
                let mut state = self.state.lock();
                if state.stop.is_none() {
                    state.stop = Some(StopReason::EarlyStopped);
                }
                state.stop_delivered = true;
                TrainingControl::Stop
            }
            SchedulerDecision::Complete => {
                tracing::debug!(trial = %self.trial_id, iteration, "Trial reached its iteration budget");
                TrainingControl::Stop
            }
        }
    }
}
