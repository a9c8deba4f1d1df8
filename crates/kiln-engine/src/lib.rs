// Kiln hyperparameter search runner
// Wires a model configuration into the hyperopt execution layer

pub mod logging;
pub mod simulator;

use std::path::Path;
use std::sync::Arc;

use kiln_data::{DataManager, Dataset, DurableStorage};
use kiln_hyperopt::{
    build_backend, build_sampler, build_scheduler, build_syncer, CancelHandle, CheckpointSyncer,
    ClusterScheduler, EventSink, ExecutionRequest, ExecutionResult, HyperoptConfig, TrialExecutor,
};
use kiln_types::config::{output_feature_names, HYPEROPT};
use kiln_types::stats::COMBINED;
use kiln_types::{config_error, DatasetRef, KilnResult, Trainer};
use serde_json::Value;
use tracing::info;

pub use logging::init_logging;
pub use simulator::SimulatedTrainer;

/// Experiment name used by [`hyperopt`].
pub const DEFAULT_EXPERIMENT_NAME: &str = "hyperopt";

/// Runs the `hyperopt` section of a model configuration end to end
pub struct HyperoptRunner {
    trainer: Arc<dyn Trainer>,
    cluster: Option<Arc<dyn ClusterScheduler>>,
    storage: Option<Arc<dyn DurableStorage>>,
    data: DataManager,
    events: Option<EventSink>,
    cancel: CancelHandle,
    preload_dataset: bool,
}

impl HyperoptRunner {
    pub fn new(trainer: Arc<dyn Trainer>) -> Self {
        Self {
            trainer,
            cluster: None,
            storage: None,
            data: DataManager::new(),
            events: None,
            cancel: CancelHandle::new(),
            preload_dataset: true,
        }
    }

    /// Cluster used by the `ray` executor instead of the in-process one.
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterScheduler>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Durable store for trial directories. Overrides `executor.sync`.
    pub fn with_storage(mut self, storage: Arc<dyn DurableStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_data_manager(mut self, data: DataManager) -> Self {
        self.data = data;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Load path datasets into memory once before the first trial.
    pub fn with_preload_dataset(mut self, preload: bool) -> Self {
        self.preload_dataset = preload;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run a search described by `config["hyperopt"]`.
    ///
    /// Configuration problems are reported before any dataset is loaded or
    /// trial launched, and leave nothing on disk. The ranked result is also
    /// written to `<output_directory>/hyperopt_statistics.json`.
    pub async fn run(
        &self,
        config: &Value,
        dataset: impl Into<DatasetRef>,
        output_directory: impl AsRef<Path>,
        experiment_name: &str,
    ) -> KilnResult<ExecutionResult> {
        let section = config
            .get(HYPEROPT)
            .ok_or_else(|| config_error!("configuration has no `{HYPEROPT}` section"))?;
        let hyperopt = HyperoptConfig::from_json(section)?;
        if experiment_name.trim().is_empty() {
            return Err(config_error!("experiment name must not be empty"));
        }

        let mut base_config = config.clone();
        if let Some(sections) = base_config.as_object_mut() {
            sections.remove(HYPEROPT);
        }
        check_output_feature(&hyperopt, &base_config)?;
        hyperopt.parameters.validate_against(&base_config)?;

        let seed = hyperopt.sampler.seed.unwrap_or_else(rand::random);
        let executor_seed = hyperopt.executor.seed.unwrap_or(seed);
        info!(
            experiment = experiment_name,
            seed,
            executor_seed,
            sampler = %hyperopt.sampler.kind,
            executor = %hyperopt.executor.kind,
            parameters = hyperopt.parameters.len(),
            "Preparing hyperparameter search"
        );

        let mut sampler = build_sampler(&hyperopt, seed)?;
        let backend = build_backend(
            &hyperopt.executor,
            self.trainer.clone(),
            self.cluster.clone(),
            executor_seed,
        )?;
        let mut executor = TrialExecutor::new(hyperopt.parameters.clone(), hyperopt.search_goal(), backend)
            .with_settings(hyperopt.executor.settings());
        if let Some(scheduler) = build_scheduler(&hyperopt)? {
            executor = executor.with_scheduler(scheduler);
        }
        if let Some(syncer) = self.syncer(&hyperopt)? {
            executor = executor.with_syncer(syncer);
        }
        if let Some(events) = &self.events {
            executor = executor.with_events(events.clone());
        }

        let dataset = dataset.into();
        let dataset = if self.preload_dataset {
            self.data.resolve(dataset)?
        } else {
            dataset
        };

        let request = ExecutionRequest {
            base_config,
            dataset,
            output_directory: output_directory.as_ref().to_path_buf(),
            experiment_name: experiment_name.to_string(),
        };
        executor.execute(sampler.as_mut(), request, &self.cancel).await
    }

    /// Run a search on a [`Dataset`] pipeline.
    pub async fn run_dataset(
        &self,
        config: &Value,
        dataset: &Dataset,
        output_directory: impl AsRef<Path>,
        experiment_name: &str,
    ) -> KilnResult<ExecutionResult> {
        info!(dataset = dataset.name(), "Preparing dataset");
        let table = self.data.prepare(dataset).await?;
        self.run(config, table, output_directory, experiment_name).await
    }

    fn syncer(&self, hyperopt: &HyperoptConfig) -> KilnResult<Option<CheckpointSyncer>> {
        match (&hyperopt.executor.sync, &self.storage) {
            (Some(sync), storage) => build_syncer(sync, storage.clone()).map(Some),
            (None, Some(storage)) => Ok(Some(CheckpointSyncer::new(storage.clone(), ""))),
            (None, None) => Ok(None),
        }
    }
}

/// Run a search with default runner settings and experiment name.
pub async fn hyperopt(
    config: &Value,
    dataset: impl Into<DatasetRef>,
    output_directory: impl AsRef<Path>,
    trainer: Arc<dyn Trainer>,
) -> KilnResult<ExecutionResult> {
    HyperoptRunner::new(trainer)
        .run(config, dataset, output_directory, DEFAULT_EXPERIMENT_NAME)
        .await
}

/// Cancel `cancel` on the first Ctrl-C. The task ends early if the search is
/// cancelled some other way.
pub fn cancel_on_ctrl_c(cancel: CancelHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    tracing::warn!("Interrupt received, stopping hyperparameter search");
                    cancel.cancel();
                }
                Err(e) => tracing::error!(error = %e, "Cannot listen for interrupts"),
            },
            _ = cancel.cancelled() => {}
        }
    })
}

fn check_output_feature(hyperopt: &HyperoptConfig, base_config: &Value) -> KilnResult<()> {
    let feature = hyperopt.output_feature.as_str();
    let known = output_feature_names(base_config);
    if feature == COMBINED || known.contains(&feature) {
        return Ok(());
    }
    Err(config_error!(
        "hyperopt output_feature `{feature}` is not one of the output features {known:?} or `{COMBINED}`"
    ))
}
