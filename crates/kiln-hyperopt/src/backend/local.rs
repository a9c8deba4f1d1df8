use std::sync::Arc;

use async_trait::async_trait;
use kiln_types::{HyperoptError, KilnResult, Trainer};
use tokio::sync::oneshot;

use super::{
    execute_job, trial_seed, Backend, ResourceInventory, ResourceLedger, TrialHandle, TrialJob,
};
use crate::reporter::StopReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalMode {
    /// One trial at a time.
    Serial,
    /// Up to `num_workers` trials at once.
    Parallel,
}

/// Runs trials in-process on a small rayon thread pool.
pub struct LocalBackend {
    mode: LocalMode,
    workers: usize,
    pool: rayon::ThreadPool,
    ledger: ResourceLedger,
    trainer: Arc<dyn Trainer>,
    seed: u64,
}

impl LocalBackend {
    pub fn new(
        trainer: Arc<dyn Trainer>,
        mode: LocalMode,
        num_workers: usize,
        seed: u64,
    ) -> KilnResult<Self> {
        let workers = match mode {
            LocalMode::Serial => 1,
            LocalMode::Parallel => num_workers.max(1),
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("kiln-trial-{i}"))
            .build()
            .map_err(|e| HyperoptError::Backend {
                message: format!("failed to start local worker pool: {e}"),
            })?;

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(workers);

        tracing::debug!(?mode, workers, cpus, "Local backend ready");
        Ok(Self {
            mode,
            workers,
            pool,
            ledger: ResourceLedger::new(ResourceInventory::new(cpus as f64, 0.0, workers)),
            trainer,
            seed,
        })
    }

    /// Override the CPU and GPU totals the backend hands out.
    pub fn with_capacity(mut self, cpu: f64, gpu: f64) -> Self {
        self.ledger = ResourceLedger::new(ResourceInventory::new(cpu, gpu, self.workers));
        self
    }

    pub fn mode(&self) -> LocalMode {
        self.mode
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("mode", &self.mode)
            .field("workers", &self.workers)
            .field("ledger", &self.ledger)
            .field("seed", &self.seed)
            .finish()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        match self.mode {
            LocalMode::Serial => "serial",
            LocalMode::Parallel => "parallel",
        }
    }

    fn available_resources(&self) -> ResourceInventory {
        self.ledger.available()
    }

    fn capacity(&self) -> ResourceInventory {
        self.ledger.total()
    }

    async fn run_trial(&self, job: TrialJob) -> KilnResult<TrialHandle> {
        if !self.ledger.try_acquire(job.trial_id, job.resources) {
            return Err(self.ledger.unavailable(&job.resources).into());
        }

        let (tx, rx) = oneshot::channel();
        let handle = TrialHandle::new(&job, self.name(), rx);
        let trainer = self.trainer.clone();
        let seed = trial_seed(self.seed, job.trial_number);

        self.pool.spawn(move || {
            let outcome = execute_job(trainer.as_ref(), &job, seed);
            // the executor may have gone away after cancellation
            let _ = tx.send(outcome);
        });
        Ok(handle)
    }

    async fn stop_trial(&self, handle: &TrialHandle) -> KilnResult<()> {
        handle.request_stop(StopReason::Cancelled);
        Ok(())
    }

    fn release(&self, handle: &TrialHandle) {
        self.ledger.release(handle.trial_id);
    }
}
