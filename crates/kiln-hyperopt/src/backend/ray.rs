//! Ray cluster configuration, task descriptors and the cluster-backed adapter.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_types::{KilnResult, MetricKey, Trainer};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{
    execute_job, trial_seed, Backend, ResourceInventory, ResourceLedger, TrialHandle, TrialJob,
};
use crate::reporter::{StopReason, TrialReporter};
use crate::space::Assignment;

/// Configuration for connecting to a Ray cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RayClusterConfig {
    /// Ray head node address (e.g. "ray://localhost:10001").
    pub address: String,

    /// Namespace for this search.
    pub namespace: String,

    /// Runtime environment packages (pip requirements).
    pub runtime_env: Option<RuntimeEnv>,

    /// Memory and custom resources added to every task.
    pub worker_resources: WorkerResources,

    /// Maximum number of concurrent Ray tasks.
    pub max_concurrent_tasks: usize,
}

impl Default for RayClusterConfig {
    fn default() -> Self {
        Self {
            address: "ray://localhost:10001".to_string(),
            namespace: "kiln".to_string(),
            runtime_env: None,
            worker_resources: WorkerResources::default(),
            max_concurrent_tasks: 4,
        }
    }
}

/// Runtime environment for Ray workers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeEnv {
    pub pip: Vec<String>,
    pub working_dir: Option<String>,
    pub env_vars: HashMap<String, String>,
}

/// Resource requirements for a single Ray worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerResources {
    /// Number of CPUs per worker (fractional ok).
    pub num_cpus: f64,
    /// Number of GPUs per worker (0 = no GPU).
    pub num_gpus: f64,
    /// Memory in bytes (0 = no limit).
    pub memory_bytes: u64,
    pub custom: HashMap<String, f64>,
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self {
            num_cpus: 1.0,
            num_gpus: 0.0,
            memory_bytes: 0,
            custom: HashMap::new(),
        }
    }
}

/// Describes a single training trial to be dispatched to a Ray worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RayTaskDescriptor {
    /// Unique task id (matches the trial id).
    pub task_id: Uuid,
    pub namespace: String,
    pub trial_number: usize,
    pub parameters: Assignment,
    /// Training configuration with the parameters already merged.
    pub config: serde_json::Value,
    /// Metric the trainer must report.
    pub metric: MetricKey,
    pub resources: WorkerResources,
    pub runtime_env: Option<RuntimeEnv>,
    pub trial_dir: PathBuf,
    pub seed: u64,
}

/// Cluster-wide scheduler capability: submit, cancel, release, and report
/// resource inventory. It is the only owner of cluster resource accounting.
#[async_trait]
pub trait ClusterScheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Resources free for new tasks.
    fn inventory(&self) -> ResourceInventory;

    /// Total cluster resources.
    fn capacity(&self) -> ResourceInventory;

    async fn submit(&self, task: RayTaskDescriptor, job: TrialJob) -> KilnResult<TrialHandle>;

    async fn cancel(&self, task_id: Uuid) -> KilnResult<()>;

    fn release(&self, task_id: Uuid);
}

/// Cluster that runs tasks on the tokio blocking pool of this process.
pub struct InProcessCluster {
    trainer: Arc<dyn Trainer>,
    ledger: ResourceLedger,
    tasks: Mutex<HashMap<Uuid, (RayTaskDescriptor, Arc<TrialReporter>)>>,
}

impl InProcessCluster {
    pub fn new(trainer: Arc<dyn Trainer>, capacity: ResourceInventory) -> Self {
        Self {
            trainer,
            ledger: ResourceLedger::new(capacity),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Descriptors of tasks submitted and not yet released.
    pub fn active_tasks(&self) -> Vec<RayTaskDescriptor> {
        let mut tasks: Vec<_> = self.tasks.lock().values().map(|(d, _)| d.clone()).collect();
        tasks.sort_by_key(|d| d.trial_number);
        tasks
    }
}

impl std::fmt::Debug for InProcessCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessCluster")
            .field("ledger", &self.ledger)
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

#[async_trait]
impl ClusterScheduler for InProcessCluster {
    fn name(&self) -> &str {
        "in_process"
    }

    fn inventory(&self) -> ResourceInventory {
        self.ledger.available()
    }

    fn capacity(&self) -> ResourceInventory {
        self.ledger.total()
    }

    async fn submit(&self, task: RayTaskDescriptor, job: TrialJob) -> KilnResult<TrialHandle> {
        if !self.ledger.try_acquire(task.task_id, job.resources) {
            return Err(self.ledger.unavailable(&job.resources).into());
        }

        let (tx, rx) = oneshot::channel();
        let handle = TrialHandle::new(&job, format!("{}/{}", self.name(), task.namespace), rx);
        let trainer = self.trainer.clone();
        let seed = task.seed;
        self.tasks
            .lock()
            .insert(task.task_id, (task, job.reporter.clone()));

        tokio::task::spawn_blocking(move || {
            let outcome = execute_job(trainer.as_ref(), &job, seed);
            let _ = tx.send(outcome);
        });
        Ok(handle)
    }

    async fn cancel(&self, task_id: Uuid) -> KilnResult<()> {
        if let Some((_, reporter)) = self.tasks.lock().get(&task_id) {
            reporter.request_stop(StopReason::Cancelled);
        }
        Ok(())
    }

    fn release(&self, task_id: Uuid) {
        self.tasks.lock().remove(&task_id);
        self.ledger.release(task_id);
    }
}

/// Backend that hands every trial to a [`ClusterScheduler`].
pub struct RayBackend {
    cluster: Arc<dyn ClusterScheduler>,
    config: RayClusterConfig,
    seed: u64,
}

impl RayBackend {
    pub fn new(cluster: Arc<dyn ClusterScheduler>, config: RayClusterConfig, seed: u64) -> Self {
        tracing::info!(
            address = %config.address,
            namespace = %config.namespace,
            cluster = cluster.name(),
            "Using Ray backend"
        );
        Self {
            cluster,
            config,
            seed,
        }
    }

    pub fn descriptor(&self, job: &TrialJob) -> RayTaskDescriptor {
        RayTaskDescriptor {
            task_id: job.trial_id,
            namespace: self.config.namespace.clone(),
            trial_number: job.trial_number,
            parameters: job.parameters.clone(),
            config: job.config.clone(),
            metric: job.reporter.metric_key(),
            resources: WorkerResources {
                num_cpus: job.resources.cpu,
                num_gpus: job.resources.gpu,
                ..self.config.worker_resources.clone()
            },
            runtime_env: self.config.runtime_env.clone(),
            trial_dir: job.trial_dir.clone(),
            seed: trial_seed(self.seed, job.trial_number),
        }
    }
}

#[async_trait]
impl Backend for RayBackend {
    fn name(&self) -> &str {
        "ray"
    }

    fn available_resources(&self) -> ResourceInventory {
        let available = self.cluster.inventory();
        let capacity = self.cluster.capacity();
        let running = capacity.parallelism.saturating_sub(available.parallelism);
        ResourceInventory {
            parallelism: available
                .parallelism
                .min(self.config.max_concurrent_tasks.saturating_sub(running)),
            ..available
        }
    }

    fn capacity(&self) -> ResourceInventory {
        let capacity = self.cluster.capacity();
        ResourceInventory {
            parallelism: capacity.parallelism.min(self.config.max_concurrent_tasks),
            ..capacity
        }
    }

    async fn run_trial(&self, job: TrialJob) -> KilnResult<TrialHandle> {
        let task = self.descriptor(&job);
        tracing::debug!(task = %task.task_id, trial = task.trial_number, "Submitting Ray task");
        self.cluster.submit(task, job).await
    }

    async fn stop_trial(&self, handle: &TrialHandle) -> KilnResult<()> {
        handle.request_stop(StopReason::Cancelled);
        self.cluster.cancel(handle.trial_id).await
    }

    fn release(&self, handle: &TrialHandle) {
        self.cluster.release(handle.trial_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::job_in;
    use crate::backend::{ResourceRequest, TrialOutcome};
    use kiln_types::stats::{COMBINED, LOSS, VALIDATION};
    use kiln_types::{DatasetRef, TrainingStats, TrialContext};
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;

    fn trainer() -> Arc<dyn Trainer> {
        Arc::new(|_: &Value, _: &DatasetRef, ctx: &TrialContext| {
            let mut stats = TrainingStats::new();
            stats.push(VALIDATION, COMBINED, LOSS, ctx.trial_number as f64);
            Ok::<_, anyhow::Error>(stats)
        })
    }

    #[test]
    fn default_cluster_config() {
        let config = RayClusterConfig::default();
        assert_eq!(config.address, "ray://localhost:10001");
        assert_eq!(config.namespace, "kiln");
        assert_eq!(config.max_concurrent_tasks, 4);

        let parsed: RayClusterConfig =
            serde_json::from_value(serde_json::json!({"max_concurrent_tasks": 2})).unwrap();
        assert_eq!(parsed.max_concurrent_tasks, 2);
        assert_eq!(parsed.address, config.address);
    }

    #[test]
    fn task_descriptor_serialization() {
        let dir = TempDir::new().unwrap();
        let cluster = Arc::new(InProcessCluster::new(trainer(), ResourceInventory::new(4.0, 0.0, 4)));
        let config = RayClusterConfig {
            worker_resources: WorkerResources {
                memory_bytes: 1 << 30,
                ..WorkerResources::default()
            },
            ..RayClusterConfig::default()
        };
        let backend = RayBackend::new(cluster, config, 5);

        let mut job = job_in(dir.path(), 2);
        job.resources = ResourceRequest::new(0.5, 0.0);
        let task = backend.descriptor(&job);
        assert_eq!(task.seed, 7);
        assert_eq!(task.resources.num_cpus, 0.5);
        assert_eq!(task.resources.memory_bytes, 1 << 30);

        let json = serde_json::to_string(&task).unwrap();
        let back: RayTaskDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }

    #[tokio::test]
    async fn submits_through_the_cluster() {
        let dir = TempDir::new().unwrap();
        let cluster = Arc::new(InProcessCluster::new(trainer(), ResourceInventory::new(8.0, 0.0, 8)));
        let config = RayClusterConfig {
            max_concurrent_tasks: 2,
            ..RayClusterConfig::default()
        };
        let backend = RayBackend::new(cluster.clone(), config, 0);
        assert_eq!(backend.capacity().parallelism, 2);

        let mut a = backend.run_trial(job_in(dir.path(), 0)).await.unwrap();
        let mut b = backend.run_trial(job_in(dir.path(), 1)).await.unwrap();
        assert_eq!(backend.available_resources().parallelism, 0);
        assert_eq!(cluster.active_tasks().len(), 2);

        for handle in [&mut a, &mut b] {
            match backend.await_trial(&mut *handle, Duration::from_secs(10)).await {
                Some(TrialOutcome::Completed { stats, .. }) => {
                    let loss = stats.splits[VALIDATION][COMBINED][LOSS][0];
                    assert_eq!(loss, handle.trial_number as f64);
                }
                other => panic!("unexpected outcome {other:?}"),
            }
            backend.release(handle);
        }
        assert_eq!(backend.available_resources().parallelism, 2);
        assert!(cluster.active_tasks().is_empty());
        assert_eq!(cluster.ledger().peak().trials, 2);
    }

    #[tokio::test]
    async fn submit_rejects_requests_beyond_inventory() {
        let dir = TempDir::new().unwrap();
        let cluster = InProcessCluster::new(trainer(), ResourceInventory::new(1.0, 0.0, 4));
        let mut job = job_in(dir.path(), 0);
        job.resources = ResourceRequest::new(2.0, 0.0);
        let task = RayTaskDescriptor {
            task_id: job.trial_id,
            namespace: "kiln".into(),
            trial_number: 0,
            parameters: Assignment::new(),
            config: Value::Null,
            metric: MetricKey::new(VALIDATION, COMBINED, LOSS),
            resources: WorkerResources::default(),
            runtime_env: None,
            trial_dir: job.trial_dir.clone(),
            seed: 0,
        };
        let err = cluster.submit(task, job).await.unwrap_err();
        assert!(err.is_resource_unavailable());
    }
}
