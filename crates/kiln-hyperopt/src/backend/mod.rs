//! Where trials physically run.
//!
//! A [`Backend`] owns the accounting of compute resources. The executor only
//! reads [`Backend::available_resources`] before each launch and never keeps
//! its own tally.

pub mod local;
pub mod ray;

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_types::{
    DatasetRef, HyperoptError, KilnResult, Trainer, TrainingStats, TrialContext,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::reporter::{StopReason, TrialReporter};
use crate::space::Assignment;

pub use local::{LocalBackend, LocalMode};
pub use ray::{ClusterScheduler, InProcessCluster, RayBackend, RayClusterConfig, RayTaskDescriptor};

const EPSILON: f64 = 1e-9;

/// CPU and GPU shares requested by one trial.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu: f64,
    pub gpu: f64,
}

impl ResourceRequest {
    pub fn new(cpu: f64, gpu: f64) -> Self {
        Self { cpu, gpu }
    }
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{cpu: {}, gpu: {}}}", self.cpu, self.gpu)
    }
}

/// Resources a backend can hand out right now (or in total).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceInventory {
    pub cpu: f64,
    pub gpu: f64,
    /// Number of trials that may run at once.
    pub parallelism: usize,
}

impl ResourceInventory {
    pub fn new(cpu: f64, gpu: f64, parallelism: usize) -> Self {
        Self { cpu, gpu, parallelism }
    }

    /// Whether one more trial with `request` fits.
    pub fn fits(&self, request: &ResourceRequest) -> bool {
        self.parallelism >= 1
            && request.cpu <= self.cpu + EPSILON
            && request.gpu <= self.gpu + EPSILON
    }
}

impl fmt::Display for ResourceInventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{cpu: {}, gpu: {}, parallelism: {}}}",
            self.cpu, self.gpu, self.parallelism
        )
    }
}

/// Highest simultaneous usage seen by a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub gpu: f64,
    pub trials: usize,
}

#[derive(Debug, Default)]
struct LedgerState {
    held: HashMap<Uuid, ResourceRequest>,
    cpu: f64,
    gpu: f64,
    peak: ResourceUsage,
}

/// Single point of truth for resources held by running trials.
#[derive(Debug)]
pub struct ResourceLedger {
    total: ResourceInventory,
    state: Mutex<LedgerState>,
}

impl ResourceLedger {
    pub fn new(total: ResourceInventory) -> Self {
        Self {
            total,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn total(&self) -> ResourceInventory {
        self.total
    }

    pub fn available(&self) -> ResourceInventory {
        let state = self.state.lock();
        ResourceInventory {
            cpu: (self.total.cpu - state.cpu).max(0.0),
            gpu: (self.total.gpu - state.gpu).max(0.0),
            parallelism: self.total.parallelism.saturating_sub(state.held.len()),
        }
    }

    /// Reserve `request` for `trial_id`; `false` if it does not fit.
    pub fn try_acquire(&self, trial_id: Uuid, request: ResourceRequest) -> bool {
        let mut state = self.state.lock();
        let available = ResourceInventory {
            cpu: self.total.cpu - state.cpu,
            gpu: self.total.gpu - state.gpu,
            parallelism: self.total.parallelism.saturating_sub(state.held.len()),
        };
        if state.held.contains_key(&trial_id) || !available.fits(&request) {
            return false;
        }
        state.held.insert(trial_id, request);
        state.cpu += request.cpu;
        state.gpu += request.gpu;
        state.peak = ResourceUsage {
            cpu: state.peak.cpu.max(state.cpu),
            gpu: state.peak.gpu.max(state.gpu),
            trials: state.peak.trials.max(state.held.len()),
        };
        true
    }

    pub fn release(&self, trial_id: Uuid) -> Option<ResourceRequest> {
        let mut state = self.state.lock();
        let request = state.held.remove(&trial_id)?;
        state.cpu = (state.cpu - request.cpu).max(0.0);
        state.gpu = (state.gpu - request.gpu).max(0.0);
        Some(request)
    }

    pub fn running(&self) -> usize {
        self.state.lock().held.len()
    }

    pub fn peak(&self) -> ResourceUsage {
        self.state.lock().peak
    }

    pub(crate) fn unavailable(&self, request: &ResourceRequest) -> HyperoptError {
        HyperoptError::ResourceUnavailable {
            requested: request.to_string(),
            available: self.available().to_string(),
        }
    }
}

/// Everything a worker needs to run one trial.
#[derive(Debug, Clone)]
pub struct TrialJob {
    pub trial_id: Uuid,
    pub trial_number: usize,
    pub parameters: Assignment,
    /// Base configuration with the assignment merged in.
    pub config: Value,
    pub dataset: DatasetRef,
    pub resources: ResourceRequest,
    pub trial_dir: PathBuf,
    pub reporter: Arc<TrialReporter>,
}

/// How a trial ended, as seen by the worker.
#[derive(Debug, Clone)]
pub enum TrialOutcome {
    Completed {
        stats: TrainingStats,
        iterations: u64,
    },
    Stopped {
        reason: StopReason,
        stats: TrainingStats,
        iterations: u64,
    },
    Failed {
        error: String,
        iterations: u64,
    },
}

/// Seed handed to the trainer of trial `trial_number`.
pub fn trial_seed(seed: u64, trial_number: usize) -> u64 {
    seed.wrapping_add(trial_number as u64)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Run the trainer for one job on the current thread. Trainer errors and
/// panics become [`TrialOutcome::Failed`].
pub fn execute_job(trainer: &dyn Trainer, job: &TrialJob, seed: u64) -> TrialOutcome {
    let reporter = job.reporter.clone();
    if let Err(e) = std::fs::create_dir_all(&job.trial_dir) {
        return TrialOutcome::Failed {
            error: format!("cannot create trial directory {}: {e}", job.trial_dir.display()),
            iterations: 0,
        };
    }

    let context = TrialContext {
        trial_id: job.trial_id,
        trial_number: job.trial_number,
        trial_dir: job.trial_dir.clone(),
        seed,
        progress: reporter.clone(),
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        trainer.train(&job.config, &job.dataset, &context)
    }));
    let iterations = reporter.iterations();

    match result {
        Ok(Ok(stats)) => match reporter.delivered_stop() {
            Some(reason) => TrialOutcome::Stopped {
                reason,
                iterations: iterations.max(stats_epochs(&stats)),
                stats,
            },
            None => TrialOutcome::Completed {
                iterations: iterations.max(stats_epochs(&stats)),
                stats,
            },
        },
        Ok(Err(error)) => TrialOutcome::Failed {
            error: format!("{error:#}"),
            iterations,
        },
        Err(payload) => TrialOutcome::Failed {
            error: format!("trainer panicked: {}", panic_message(payload.as_ref())),
            iterations,
        },
    }
}

fn stats_epochs(stats: &TrainingStats) -> u64 {
    stats
        .splits
        .values()
        .flat_map(|features| features.values())
        .flat_map(|metrics| metrics.values())
        .map(|history| history.len() as u64)
        .max()
        .unwrap_or(0)
}

/// Asynchronous handle on a launched trial.
#[derive(Debug)]
pub struct TrialHandle {
    pub trial_id: Uuid,
    pub trial_number: usize,
    pub worker: String,
    receiver: oneshot::Receiver<TrialOutcome>,
    reporter: Arc<TrialReporter>,
}

impl TrialHandle {
    pub fn new(
        job: &TrialJob,
        worker: impl Into<String>,
        receiver: oneshot::Receiver<TrialOutcome>,
    ) -> Self {
        Self {
            trial_id: job.trial_id,
            trial_number: job.trial_number,
            worker: worker.into(),
            receiver,
            reporter: job.reporter.clone(),
        }
    }

    fn lost(&self) -> TrialOutcome {
        TrialOutcome::Failed {
            error: format!("worker {} dropped the trial without reporting", self.worker),
            iterations: self.reporter.iterations(),
        }
    }

    /// Non-blocking check for completion.
    pub fn poll(&mut self) -> Option<TrialOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(self.lost()),
        }
    }

    /// Wait up to `timeout` for completion.
    pub async fn wait(&mut self, timeout: Duration) -> Option<TrialOutcome> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(_)) => Some(self.lost()),
            Err(_) => None,
        }
    }

    pub fn request_stop(&self, reason: StopReason) {
        self.reporter.request_stop(reason);
    }

    pub fn reporter(&self) -> &TrialReporter {
        &self.reporter
    }
}

/// Abstraction over where trials run.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Resources free for new trials right now.
    fn available_resources(&self) -> ResourceInventory;

    /// Resources the backend has in total.
    fn capacity(&self) -> ResourceInventory;

    /// Reserve resources and start the trial. Fails with
    /// `ResourceUnavailable` when the request does not fit.
    async fn run_trial(&self, job: TrialJob) -> KilnResult<TrialHandle>;

    fn poll_trial(&self, handle: &mut TrialHandle) -> Option<TrialOutcome> {
        handle.poll()
    }

    async fn await_trial(&self, handle: &mut TrialHandle, timeout: Duration) -> Option<TrialOutcome> {
        handle.wait(timeout).await
    }

    /// Ask a running trial to stop.
    async fn stop_trial(&self, handle: &TrialHandle) -> KilnResult<()>;

    /// Give back the trial's resources. Call after its terminal transition.
    fn release(&self, handle: &TrialHandle);
}
