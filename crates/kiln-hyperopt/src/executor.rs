//! Trial executor: pulls assignments from a sampler, launches them on a
//! backend under resource limits and collects their outcomes.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kiln_types::{DatasetRef, HyperoptError, KilnError, KilnResult};
use serde_json::Value;

use crate::backend::{Backend, ResourceRequest, TrialHandle, TrialJob, TrialOutcome};
use crate::cancel::CancelHandle;
use crate::events::{EventSink, SearchEvent};
use crate::reporter::{StopReason, TrialReporter};
use crate::results::{ExecutionResult, ResultAggregator, Termination};
use crate::sampling::Sampler;
use crate::scheduler::TrialScheduler;
use crate::space::{apply_assignment, Assignment, ParameterSpace};
use crate::sync::CheckpointSyncer;
use crate::trial::{CheckpointRef, SearchGoal, Trial};

/// Knobs of the executor loop.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub resources_per_trial: ResourceRequest,
    /// Upper bound on simultaneously running trials, on top of what the
    /// backend allows.
    pub max_concurrent_trials: Option<usize>,
    pub poll_interval: Duration,
    pub time_budget: Option<Duration>,
    /// How long stopped trials get to report before they are abandoned.
    pub stop_grace_period: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            resources_per_trial: ResourceRequest::new(1.0, 0.0),
            max_concurrent_trials: None,
            poll_interval: Duration::from_millis(100),
            time_budget: None,
            stop_grace_period: Duration::from_secs(30),
        }
    }
}

/// Inputs of one search.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Training configuration without the hyperopt section.
    pub base_config: Value,
    pub dataset: DatasetRef,
    pub output_directory: PathBuf,
    pub experiment_name: String,
}

impl ExecutionRequest {
    pub fn experiment_dir(&self) -> PathBuf {
        self.output_directory.join(&self.experiment_name)
    }
}

pub fn trial_dir_name(trial_number: usize) -> String {
    format!("trial_{trial_number:04}")
}

struct InFlight {
    trial: Trial,
    handle: TrialHandle,
}

/// Runs a search to completion, cancellation or time budget.
pub struct TrialExecutor {
    space: ParameterSpace,
    goal: SearchGoal,
    backend: Arc<dyn Backend>,
    settings: ExecutorSettings,
    scheduler: Option<Arc<dyn TrialScheduler>>,
    syncer: Option<CheckpointSyncer>,
    events: Option<EventSink>,
}

impl TrialExecutor {
    pub fn new(space: ParameterSpace, goal: SearchGoal, backend: Arc<dyn Backend>) -> Self {
        Self {
            space,
            goal,
            backend,
            settings: ExecutorSettings::default(),
            scheduler: None,
            syncer: None,
            events: None,
        }
    }

    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn TrialScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_syncer(mut self, syncer: CheckpointSyncer) -> Self {
        self.syncer = Some(syncer);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn goal(&self) -> &SearchGoal {
        &self.goal
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    fn emit(&self, event: SearchEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Check everything that can be checked before the first launch.
    fn preflight(&self, request: &ExecutionRequest) -> KilnResult<()> {
        self.space.validate()?;
        self.space.validate_against(&request.base_config)?;

        let wanted = self.settings.resources_per_trial;
        if wanted.cpu < 0.0 || wanted.gpu < 0.0 {
            return Err(kiln_types::config_error!(
                "resources per trial must not be negative, got {wanted}"
            ));
        }
        if self.settings.max_concurrent_trials == Some(0) {
            return Err(kiln_types::config_error!("max_concurrent_trials must be at least 1"));
        }

        let capacity = self.backend.capacity();
        if !capacity.fits(&wanted) {
            return Err(HyperoptError::ResourceUnavailable {
                requested: wanted.to_string(),
                available: capacity.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Run the search and persist `hyperopt_statistics.json` into the
    /// output directory.
    ///
    /// Configuration and resource problems are returned before any trial
    /// launches. After that, trial failures are recorded and the search
    /// keeps going; cancellation and the time budget end it early with
    /// whatever finished so far.
    pub async fn execute(
        &mut self,
        sampler: &mut dyn Sampler,
        request: ExecutionRequest,
        cancel: &CancelHandle,
    ) -> KilnResult<ExecutionResult> {
        self.preflight(&request)?;

        let started_at = Utc::now();
        let clock = Instant::now();
        let experiment_dir = request.experiment_dir();
        let cap = self.settings.max_concurrent_trials.unwrap_or(usize::MAX);

        tracing::info!(
            experiment = %request.experiment_name,
            sampler = sampler.name(),
            backend = self.backend.name(),
            goal = %self.goal.goal,
            metric = %self.goal.metric_key(),
            total = ?sampler.total_hint(),
            "Starting hyperparameter search"
        );
        self.emit(SearchEvent::SearchStarted {
            experiment: request.experiment_name.clone(),
            sampler: sampler.name().to_string(),
            backend: self.backend.name().to_string(),
        });

        let mut finished: Vec<Trial> = Vec::new();
        let mut running: Vec<InFlight> = Vec::new();
        let mut queue: VecDeque<Assignment> = VecDeque::new();
        let mut next_number = 0usize;
        let mut sampler_done = false;
        let mut sampler_error: Option<String> = None;

        let termination = loop {
            self.drain(&mut running, &mut finished, sampler, &request);

            if cancel.is_cancelled() {
                break Termination::Cancelled;
            }
            if self
                .settings
                .time_budget
                .is_some_and(|budget| clock.elapsed() >= budget)
            {
                tracing::info!(elapsed = ?clock.elapsed(), "Time budget exhausted");
                break Termination::TimeBudget;
            }

            // Launch while the backend reports room for one more trial.
            while running.len() < cap
                && self
                    .backend
                    .available_resources()
                    .fits(&self.settings.resources_per_trial)
            {
                let Some(assignment) = queue.pop_front() else {
                    if sampler_done {
                        break;
                    }
                    match sampler.next_batch(1) {
                        Ok(batch) => {
                            sampler_done = batch.finished
                                || (batch.assignments.is_empty() && running.is_empty());
                            if batch.assignments.is_empty() {
                                break;
                            }
                            queue.extend(batch.assignments);
                            continue;
                        }
                        Err(e) if next_number == 0 => return Err(e),
                        Err(e) => {
                            tracing::error!(error = %e, "Sampler failed; no further trials");
                            sampler_error = Some(e.to_string());
                            sampler_done = true;
                            break;
                        }
                    }
                };

                match self
                    .launch(assignment.clone(), next_number, &request, &experiment_dir)
                    .await
                {
                    Ok(flight) => {
                        next_number += 1;
                        running.push(flight);
                    }
                    Err(e) if e.is_resource_unavailable() => {
                        tracing::debug!(error = %e, "Backend full; trial stays queued");
                        queue.push_front(assignment);
                        break;
                    }
                    Err(e) if next_number == 0 && e.is_configuration() => return Err(e),
                    Err(e) => {
                        let mut trial = Trial::new(
                            next_number,
                            assignment,
                            self.settings.resources_per_trial,
                        );
                        next_number += 1;
                        tracing::warn!(trial = %trial.id, error = %e, "Trial could not be launched");
                        if trial.mark_failed(e.to_string(), 0).is_ok() {
                            sampler.report(&trial.parameters, None);
                            self.finish_event(&trial);
                            finished.push(trial);
                        }
                    }
                }
            }

            if sampler_done && queue.is_empty() && running.is_empty() {
                break match sampler_error.take() {
                    Some(message) => Termination::SamplerError(message),
                    None => Termination::Exhausted,
                };
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = cancel.cancelled() => {}
            }
        };

        if !running.is_empty() {
            self.stop_all(running, &mut finished, sampler, &request).await;
        }

        if let Some(syncer) = self.syncer.as_mut() {
            let summary = syncer.join_all().await;
            tracing::info!(synced = summary.synced, failed = summary.failed, "Checkpoint sync finished");
        }

        let result =
            ResultAggregator::new(self.goal.clone()).aggregate(finished, started_at, termination);
        tracing::info!(
            trials = result.summary.total_trials,
            succeeded = result.summary.succeeded,
            failed = result.summary.failed,
            stopped = result.summary.stopped,
            best = ?result.summary.best_metric,
            termination = ?result.summary.termination,
            "Hyperparameter search finished"
        );
        self.emit(SearchEvent::SearchFinished {
            total_trials: result.summary.total_trials,
            termination: result.summary.termination.clone(),
        });

        result.save(&request.output_directory)?;
        Ok(result)
    }

    async fn launch(
        &self,
        assignment: Assignment,
        trial_number: usize,
        request: &ExecutionRequest,
        experiment_dir: &std::path::Path,
    ) -> KilnResult<InFlight> {
        self.space.validate_assignment(&assignment)?;
        let config = apply_assignment(&request.base_config, &assignment)?;

        let mut trial = Trial::new(trial_number, assignment, self.settings.resources_per_trial);
        let dir_name = trial_dir_name(trial_number);
        let trial_dir = experiment_dir.join(&dir_name);
        trial.attach_checkpoint(CheckpointRef {
            trial_id: trial.id,
            local_dir: trial_dir.clone(),
            remote: self
                .syncer
                .as_ref()
                .map(|s| s.remote_target(&request.experiment_name, &dir_name)),
        })?;

        let reporter = Arc::new(TrialReporter::new(
            trial.id,
            self.goal.clone(),
            self.scheduler.clone(),
        ));
        let job = TrialJob {
            trial_id: trial.id,
            trial_number,
            parameters: trial.parameters.clone(),
            config,
            dataset: request.dataset.clone(),
            resources: trial.resources,
            trial_dir,
            reporter,
        };

        let handle = self.backend.run_trial(job).await?;
        trial.mark_running(handle.worker.clone())?;

        tracing::info!(
            trial = %trial.id,
            number = trial_number,
            worker = %handle.worker,
            parameters = ?trial.parameters,
            "Trial launched"
        );
        self.emit(SearchEvent::TrialLaunched {
            trial_id: trial.id,
            trial_number,
            parameters: trial.parameters.clone(),
        });
        Ok(InFlight { trial, handle })
    }

    /// Collect every trial whose outcome is already available.
    fn drain(
        &mut self,
        running: &mut Vec<InFlight>,
        finished: &mut Vec<Trial>,
        sampler: &mut dyn Sampler,
        request: &ExecutionRequest,
    ) {
        let mut index = 0;
        while index < running.len() {
            match self.backend.poll_trial(&mut running[index].handle) {
                Some(outcome) => {
                    let flight = running.remove(index);
                    let trial = self.complete(flight, outcome, sampler, request, true);
                    finished.push(trial);
                }
                None => index += 1,
            }
        }
    }

    /// Ask every in-flight trial to stop and wait out the grace period.
    async fn stop_all(
        &mut self,
        running: Vec<InFlight>,
        finished: &mut Vec<Trial>,
        sampler: &mut dyn Sampler,
        request: &ExecutionRequest,
    ) {
        tracing::info!(
            in_flight = running.len(),
            grace = ?self.settings.stop_grace_period,
            "Stopping in-flight trials"
        );
        for flight in &running {
            if let Err(e) = self.backend.stop_trial(&flight.handle).await {
                tracing::warn!(trial = %flight.trial.id, error = %e, "Stop request failed");
            }
        }

        let grace = self.settings.stop_grace_period;
        let deadline = Instant::now().checked_add(grace);
        for mut flight in running {
            let remaining = deadline.map_or(grace, |d| d.saturating_duration_since(Instant::now()));
            let (outcome, resolved) = match self.backend.await_trial(&mut flight.handle, remaining).await {
                Some(outcome) => (outcome, true),
                None => {
                    tracing::warn!(trial = %flight.trial.id, "Trial did not stop within the grace period");
                    let outcome = TrialOutcome::Stopped {
                        reason: StopReason::Cancelled,
                        stats: Default::default(),
                        iterations: flight.handle.reporter().iterations(),
                    };
                    (outcome, false)
                }
            };
            // an abandoned worker may still be writing its trial directory
            let trial = self.complete(flight, outcome, sampler, request, resolved);
            finished.push(trial);
        }
    }

    /// Terminal transition plus all bookkeeping that follows it.
    fn complete(
        &mut self,
        flight: InFlight,
        outcome: TrialOutcome,
        sampler: &mut dyn Sampler,
        request: &ExecutionRequest,
        sync_checkpoint: bool,
    ) -> Trial {
        let InFlight { mut trial, handle } = flight;

        if let Err(e) = self.record_outcome(&mut trial, outcome) {
            tracing::error!(trial = %trial.id, error = %e, "Invalid trial transition");
        }
        self.backend.release(&handle);

        sampler.report(&trial.parameters, trial.metric);
        if let (Some(scheduler), Some(metric)) = (&self.scheduler, trial.metric) {
            scheduler.on_trial_complete(trial.id, trial.iterations, metric);
        }

        if !sync_checkpoint && self.syncer.is_some() {
            tracing::warn!(trial = %trial.id, "Skipping checkpoint sync for abandoned trial");
        } else if let (Some(syncer), Some(checkpoint)) = (self.syncer.as_mut(), &trial.checkpoint) {
            let target = checkpoint.remote.clone().unwrap_or_else(|| {
                syncer.remote_target(&request.experiment_name, &trial_dir_name(trial.trial_number))
            });
            syncer.spawn(trial.id, &checkpoint.local_dir, target);
        }

        self.finish_event(&trial);
        trial
    }

    fn record_outcome(&self, trial: &mut Trial, outcome: TrialOutcome) -> KilnResult<()> {
        match outcome {
            TrialOutcome::Completed { stats, iterations } => match self.goal.extract(&stats) {
                Ok(metric) => {
                    trial.mark_succeeded(metric, iterations)?;
                    tracing::info!(trial = %trial.id, metric, iterations, "Trial succeeded");
                }
                Err(message) => self.fail(trial, message, iterations)?,
            },
            TrialOutcome::Stopped {
                reason: StopReason::EarlyStopped,
                stats,
                iterations,
            } => {
                let metric = self.goal.extract(&stats).ok();
                trial.mark_stopped(metric, iterations, true)?;
                tracing::info!(trial = %trial.id, ?metric, iterations, "Trial stopped early");
            }
            TrialOutcome::Stopped {
                reason: StopReason::Cancelled,
                stats,
                iterations,
            } => {
                let metric = self.goal.extract(&stats).ok();
                trial.mark_stopped(metric, iterations, false)?;
                tracing::info!(trial = %trial.id, ?metric, iterations, "Trial cancelled");
            }
            TrialOutcome::Failed { error, iterations } => self.fail(trial, error, iterations)?,
        }
        Ok(())
    }

    fn fail(&self, trial: &mut Trial, message: String, iterations: u64) -> KilnResult<()> {
        let error = KilnError::from(HyperoptError::TrialRuntime {
            trial_id: trial.id.to_string(),
            message: message.clone(),
        });
        tracing::warn!(trial = %trial.id, number = trial.trial_number, %error, "Trial failed");
        trial.mark_failed(message, iterations)
    }

    fn finish_event(&self, trial: &Trial) {
        self.emit(SearchEvent::TrialFinished {
            trial_id: trial.id,
            trial_number: trial.trial_number,
            status: trial.status,
            metric: trial.metric,
        });
    }
}
