//! # kiln-hyperopt
//!
//! Hyperparameter search execution for Kiln.
//!
//! Turns a declarative parameter space into trials, runs them on a local
//! worker pool or a Ray-style cluster under per-trial resource budgets,
//! applies optional early stopping and checkpoint sync, and ranks the
//! outcomes into `hyperopt_statistics.json`.

pub mod backend;
pub mod cancel;
pub mod config;
pub mod events;
pub mod executor;
pub mod registry;
pub mod reporter;
pub mod results;
pub mod sampling;
pub mod scheduler;
pub mod space;
pub mod sync;
pub mod trial;

pub use backend::{
    Backend, ClusterScheduler, InProcessCluster, LocalBackend, LocalMode, RayBackend,
    RayClusterConfig, RayTaskDescriptor, ResourceInventory, ResourceLedger, ResourceRequest,
    TrialHandle, TrialJob, TrialOutcome,
};
pub use cancel::CancelHandle;
pub use config::{
    ExecutorConfig, HyperoptConfig, SamplerConfig, SchedulerConfig, SearchAlgConfig, SyncConfig,
};
pub use events::{EventSink, SearchEvent};
pub use executor::{ExecutionRequest, ExecutorSettings, TrialExecutor};
pub use registry::{
    build_backend, build_sampler, build_scheduler, build_syncer, ExecutorKind, SamplerKind,
    SchedulerKind, SearchAlgKind,
};
pub use reporter::{StopReason, TrialReporter};
pub use results::{
    ExecutionResult, ExecutionSummary, ResultAggregator, Termination, HYPEROPT_STATISTICS_FILE,
};
pub use sampling::{
    BayesianSearch, DelegatedSampler, GridSampler, RandomSampler, SampleBatch, Sampler,
    SearchAlgorithm, VariantGenerator,
};
pub use scheduler::{
    AsyncHyperBandScheduler, FifoScheduler, HyperBandSettings, SchedulerDecision, TrialScheduler,
};
pub use space::{apply_assignment, Assignment, Distribution, ParameterKind, ParameterSpace, ParameterValue};
pub use sync::{CheckpointSyncer, SyncSummary};
pub use trial::{CheckpointRef, Goal, SearchGoal, Trial, TrialStatus};
