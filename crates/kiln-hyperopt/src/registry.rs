//! Type tags from configuration resolved to the components they build.
//!
//! Each table is built once per process. Unknown tags are configuration
//! errors that list the accepted names.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use kiln_data::{CommandStorage, DurableStorage, LocalDirStorage};
use kiln_types::{config_error, KilnResult, Trainer};

use crate::backend::{
    Backend, ClusterScheduler, InProcessCluster, LocalBackend, LocalMode, RayBackend,
    ResourceInventory,
};
use crate::config::{ExecutorConfig, HyperoptConfig, SchedulerConfig, SyncConfig};
use crate::sampling::{
    BayesianSearch, DelegatedSampler, GridSampler, RandomSampler, Sampler, SearchAlgorithm,
    VariantGenerator,
};
use crate::scheduler::{AsyncHyperBandScheduler, FifoScheduler, TrialScheduler};
use crate::space::ParameterSpace;
use crate::sync::CheckpointSyncer;
use crate::trial::Goal;

type Table<K> = BTreeMap<&'static str, K>;

fn resolve<K: Copy>(
    table: &'static OnceLock<Table<K>>,
    entries: &[(&'static str, K)],
    what: &str,
    tag: &str,
) -> KilnResult<K> {
    let table = table.get_or_init(|| entries.iter().copied().collect());
    table.get(tag).copied().ok_or_else(|| {
        let known: Vec<&str> = table.keys().copied().collect();
        config_error!("unknown {what} type `{tag}`, expected one of: {}", known.join(", "))
    })
}

// ---- Samplers ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    Grid,
    Random,
    /// Delegates proposals to a search algorithm.
    Ray,
}

impl SamplerKind {
    pub fn from_tag(tag: &str) -> KilnResult<Self> {
        static TABLE: OnceLock<Table<SamplerKind>> = OnceLock::new();
        resolve(
            &TABLE,
            &[
                ("grid", Self::Grid),
                ("random", Self::Random),
                ("ray", Self::Ray),
                ("tune", Self::Ray),
            ],
            "sampler",
            tag,
        )
    }

    pub fn build(self, config: &HyperoptConfig, seed: u64) -> KilnResult<Box<dyn Sampler>> {
        let space = &config.parameters;
        let num_samples = config.sampler.num_samples;
        Ok(match self {
            Self::Grid => Box::new(GridSampler::new(space)?),
            Self::Random => Box::new(RandomSampler::new(space, num_samples, seed)?),
            Self::Ray => {
                let search_alg = &config.sampler.search_alg;
                let algorithm = SearchAlgKind::from_tag(&search_alg.kind)?.build(
                    space,
                    config.goal,
                    num_samples,
                    search_alg.exploration_weight,
                    seed,
                )?;
                Box::new(DelegatedSampler::new(space, algorithm)?)
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchAlgKind {
    VariantGenerator,
    /// Model-based search; `bohb` resolves here as well.
    Bayesian,
}

impl SearchAlgKind {
    pub fn from_tag(tag: &str) -> KilnResult<Self> {
        static TABLE: OnceLock<Table<SearchAlgKind>> = OnceLock::new();
        resolve(
            &TABLE,
            &[
                ("variant_generator", Self::VariantGenerator),
                ("bayesian", Self::Bayesian),
                ("bohb", Self::Bayesian),
            ],
            "search algorithm",
            tag,
        )
    }

    pub fn build(
        self,
        space: &ParameterSpace,
        goal: Goal,
        num_samples: usize,
        exploration_weight: f64,
        seed: u64,
    ) -> KilnResult<Box<dyn SearchAlgorithm>> {
        Ok(match self {
            Self::VariantGenerator => Box::new(VariantGenerator::new(space, num_samples, seed)?),
            Self::Bayesian => Box::new(BayesianSearch::new(
                space,
                goal,
                num_samples,
                exploration_weight,
                seed,
            )),
        })
    }
}

// ---- Trial schedulers ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Fifo,
    /// Successive-halving rungs; `hb_bohb` resolves here as well.
    AsyncHyperBand,
}

impl SchedulerKind {
    pub fn from_tag(tag: &str) -> KilnResult<Self> {
        static TABLE: OnceLock<Table<SchedulerKind>> = OnceLock::new();
        resolve(
            &TABLE,
            &[
                ("fifo", Self::Fifo),
                ("async_hyperband", Self::AsyncHyperBand),
                ("asha", Self::AsyncHyperBand),
                ("hb_bohb", Self::AsyncHyperBand),
            ],
            "scheduler",
            tag,
        )
    }

    pub fn build(self, goal: Goal, config: &SchedulerConfig) -> Arc<dyn TrialScheduler> {
        match self {
            Self::Fifo => Arc::new(FifoScheduler),
            Self::AsyncHyperBand => Arc::new(AsyncHyperBandScheduler::new(goal, config.hyperband())),
        }
    }
}

// ---- Executors ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Serial,
    Parallel,
    Ray,
}

impl ExecutorKind {
    pub fn from_tag(tag: &str) -> KilnResult<Self> {
        static TABLE: OnceLock<Table<ExecutorKind>> = OnceLock::new();
        resolve(
            &TABLE,
            &[
                ("serial", Self::Serial),
                ("local", Self::Serial),
                ("parallel", Self::Parallel),
                ("ray", Self::Ray),
            ],
            "executor",
            tag,
        )
    }

    /// Build the backend. `cluster` replaces the in-process cluster for `ray`.
    pub fn build(
        self,
        config: &ExecutorConfig,
        trainer: Arc<dyn Trainer>,
        cluster: Option<Arc<dyn ClusterScheduler>>,
        seed: u64,
    ) -> KilnResult<Arc<dyn Backend>> {
        let local = |mode: LocalMode| -> KilnResult<Arc<dyn Backend>> {
            let backend = LocalBackend::new(trainer.clone(), mode, config.num_workers, seed)?;
            let total = backend.capacity();
            let backend = match (config.num_cpus, config.num_gpus) {
                (None, None) => backend,
                (cpu, gpu) => backend.with_capacity(cpu.unwrap_or(total.cpu), gpu.unwrap_or(total.gpu)),
            };
            Ok(Arc::new(backend))
        };

        match self {
            Self::Serial => local(LocalMode::Serial),
            Self::Parallel => local(LocalMode::Parallel),
            Self::Ray => {
                let cluster = cluster.unwrap_or_else(|| {
                    let cpus = std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(1) as f64;
                    let capacity = ResourceInventory::new(
                        config.num_cpus.unwrap_or(cpus),
                        config.num_gpus.unwrap_or(0.0),
                        config.num_workers,
                    );
                    Arc::new(InProcessCluster::new(trainer.clone(), capacity))
                });
                Ok(Arc::new(RayBackend::new(cluster, config.ray.clone(), seed)))
            }
        }
    }
}

// ---- Convenience ----

pub fn build_sampler(config: &HyperoptConfig, seed: u64) -> KilnResult<Box<dyn Sampler>> {
    SamplerKind::from_tag(&config.sampler.kind)?.build(config, seed)
}

pub fn build_scheduler(config: &HyperoptConfig) -> KilnResult<Option<Arc<dyn TrialScheduler>>> {
    match &config.sampler.scheduler {
        Some(scheduler) => {
            let kind = SchedulerKind::from_tag(&scheduler.kind)?;
            Ok(Some(kind.build(config.goal, scheduler)))
        }
        None => Ok(None),
    }
}

pub fn build_backend(
    config: &ExecutorConfig,
    trainer: Arc<dyn Trainer>,
    cluster: Option<Arc<dyn ClusterScheduler>>,
    seed: u64,
) -> KilnResult<Arc<dyn Backend>> {
    ExecutorKind::from_tag(&config.kind)?.build(config, trainer, cluster, seed)
}

/// Syncer for `executor.sync`; `storage` takes precedence over the
/// configured store.
pub fn build_syncer(
    config: &SyncConfig,
    storage: Option<Arc<dyn DurableStorage>>,
) -> KilnResult<CheckpointSyncer> {
    let storage: Arc<dyn DurableStorage> = match (storage, &config.local_root, &config.sync_template) {
        (Some(storage), _, _) => storage,
        (None, Some(root), _) => Arc::new(LocalDirStorage::new(root)),
        (None, None, Some(template)) => Arc::new(CommandStorage::new(
            template.clone(),
            config
                .delete_template
                .clone()
                .unwrap_or_else(|| "true".to_string()),
        )),
        (None, None, None) => {
            return Err(config_error!(
                "executor.sync needs either local_root or sync_template"
            ))
        }
    };
    Ok(CheckpointSyncer::new(storage, config.remote_dir.clone()))
}
