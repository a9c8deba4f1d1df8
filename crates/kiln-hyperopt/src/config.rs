//! The `hyperopt` section of a model configuration.

use std::time::Duration;

use kiln_types::stats::{COMBINED, LOSS, VALIDATION};
use kiln_types::{config_error, KilnResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{RayClusterConfig, ResourceRequest};
use crate::executor::ExecutorSettings;
use crate::scheduler::HyperBandSettings;
use crate::space::ParameterSpace;
use crate::trial::{Goal, SearchGoal};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperoptConfig {
    pub parameters: ParameterSpace,
    pub goal: Goal,
    pub output_feature: String,
    #[serde(alias = "validation_metric")]
    pub metric: String,
    pub split: String,
    pub sampler: SamplerConfig,
    pub executor: ExecutorConfig,
}

impl Default for HyperoptConfig {
    fn default() -> Self {
        Self {
            parameters: ParameterSpace::new(),
            goal: Goal::Minimize,
            output_feature: COMBINED.to_string(),
            metric: LOSS.to_string(),
            split: VALIDATION.to_string(),
            sampler: SamplerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl HyperoptConfig {
    /// Parse and validate a `hyperopt` section.
    pub fn from_json(value: &Value) -> KilnResult<Self> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| config_error!("cannot parse hyperopt section: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KilnResult<()> {
        self.parameters.validate()?;
        if self.output_feature.is_empty() || self.metric.is_empty() || self.split.is_empty() {
            return Err(config_error!(
                "output_feature, metric and split must not be empty"
            ));
        }
        self.sampler.validate()?;
        self.executor.validate()
    }

    pub fn search_goal(&self) -> SearchGoal {
        SearchGoal::new(self.goal, &self.metric, &self.output_feature).with_split(&self.split)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub num_samples: usize,
    /// Drawn once and logged when absent.
    pub seed: Option<u64>,
    pub search_alg: SearchAlgConfig,
    pub scheduler: Option<SchedulerConfig>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            kind: "random".to_string(),
            num_samples: 10,
            seed: None,
            search_alg: SearchAlgConfig::default(),
            scheduler: None,
        }
    }
}

impl SamplerConfig {
    fn validate(&self) -> KilnResult<()> {
        if self.num_samples == 0 {
            return Err(config_error!("sampler.num_samples must be at least 1"));
        }
        let weight = self.search_alg.exploration_weight;
        if !(0.0..=1.0).contains(&weight) {
            return Err(config_error!(
                "search_alg.exploration_weight must be within [0, 1], got {weight}"
            ));
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchAlgConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub exploration_weight: f64,
}

impl Default for SearchAlgConfig {
    fn default() -> Self {
        Self {
            kind: "variant_generator".to_string(),
            exploration_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub max_t: u64,
    pub grace_period: u64,
    pub reduction_factor: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let hyperband = HyperBandSettings::default();
        Self {
            kind: "fifo".to_string(),
            max_t: hyperband.max_t,
            grace_period: hyperband.grace_period,
            reduction_factor: hyperband.reduction_factor,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> KilnResult<()> {
        if self.reduction_factor <= 1.0 {
            return Err(config_error!(
                "scheduler.reduction_factor must be greater than 1, got {}",
                self.reduction_factor
            ));
        }
        if self.grace_period == 0 || self.max_t < self.grace_period {
            return Err(config_error!(
                "scheduler needs 1 <= grace_period <= max_t, got {} and {}",
                self.grace_period,
                self.max_t
            ));
        }
        Ok(())
    }

    pub fn hyperband(&self) -> HyperBandSettings {
        HyperBandSettings {
            max_t: self.max_t,
            grace_period: self.grace_period,
            reduction_factor: self.reduction_factor,
        }
    }
}

/// Where finished trial directories are uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Prefix of every remote target.
    #[serde(default)]
    pub remote_dir: String,
    /// Root directory of a local durable store.
    #[serde(default)]
    pub local_root: Option<String>,
    /// Shell template with `{source}` and `{target}`.
    #[serde(default)]
    pub sync_template: Option<String>,
    #[serde(default)]
    pub delete_template: Option<String>,
}

/// Longest accepted `stop_grace_period_s`, one day.
pub const MAX_STOP_GRACE_PERIOD_S: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub num_workers: usize,
    pub cpu_resources_per_trial: f64,
    pub gpu_resources_per_trial: f64,
    /// Override the CPU total the backend reports.
    pub num_cpus: Option<f64>,
    pub num_gpus: Option<f64>,
    pub max_concurrent_trials: Option<usize>,
    pub time_budget_s: Option<f64>,
    pub poll_interval_ms: u64,
    pub stop_grace_period_s: f64,
    /// Base of per-trial training seeds; defaults to the sampler seed.
    pub seed: Option<u64>,
    pub sync: Option<SyncConfig>,
    /// Cluster settings for the `ray` executor.
    pub ray: RayClusterConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: "serial".to_string(),
            num_workers: 2,
            cpu_resources_per_trial: 1.0,
            gpu_resources_per_trial: 0.0,
            num_cpus: None,
            num_gpus: None,
            max_concurrent_trials: None,
            time_budget_s: None,
            poll_interval_ms: 100,
            stop_grace_period_s: 30.0,
            seed: None,
            sync: None,
            ray: RayClusterConfig::default(),
        }
    }
}

impl ExecutorConfig {
    fn validate(&self) -> KilnResult<()> {
        if self.cpu_resources_per_trial < 0.0 || self.gpu_resources_per_trial < 0.0 {
            return Err(config_error!("resources per trial must not be negative"));
        }
        if self.num_workers == 0 {
            return Err(config_error!("executor.num_workers must be at least 1"));
        }
        if self.max_concurrent_trials == Some(0) {
            return Err(config_error!("executor.max_concurrent_trials must be at least 1"));
        }
        if let Some(budget) = self.time_budget_s {
            if Duration::try_from_secs_f64(budget).map_or(true, |d| d.is_zero()) {
                return Err(config_error!(
                    "executor.time_budget_s must be a positive finite number of seconds, got {budget}"
                ));
            }
        }
        if !(0.0..=MAX_STOP_GRACE_PERIOD_S).contains(&self.stop_grace_period_s) {
            return Err(config_error!(
                "executor.stop_grace_period_s must be within [0, {MAX_STOP_GRACE_PERIOD_S}], got {}",
                self.stop_grace_period_s
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(config_error!("executor.poll_interval_ms must be positive"));
        }
        if let Some(sync) = &self.sync {
            if sync.local_root.is_none() && sync.sync_template.is_none() {
                return Err(config_error!(
                    "executor.sync needs either local_root or sync_template"
                ));
            }
        }
        Ok(())
    }

    pub fn resources_per_trial(&self) -> ResourceRequest {
        ResourceRequest::new(self.cpu_resources_per_trial, self.gpu_resources_per_trial)
    }

    pub fn settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            resources_per_trial: self.resources_per_trial(),
            max_concurrent_trials: self.max_concurrent_trials,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            time_budget: self
                .time_budget_s
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
            stop_grace_period: Duration::try_from_secs_f64(
                self.stop_grace_period_s.min(MAX_STOP_GRACE_PERIOD_S),
            )
            .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = HyperoptConfig::from_json(&json!({
            "parameters": {
                "training.learning_rate": {"space": "loguniform", "lower": 0.001, "upper": 0.1}
            }
        }))
        .unwrap();

        assert_eq!(config.goal, Goal::Minimize);
        assert_eq!(config.search_goal(), SearchGoal::default());
        assert_eq!(config.sampler.kind, "random");
        assert_eq!(config.sampler.num_samples, 10);
        assert_eq!(config.executor.kind, "serial");
        assert_eq!(config.executor.settings().stop_grace_period, Duration::from_secs(30));
        assert_eq!(config.executor.resources_per_trial(), ResourceRequest::new(1.0, 0.0));
    }

    #[test]
    fn full_section_parses() {
        let config = HyperoptConfig::from_json(&json!({
            "parameters": {
                "combiner.num_fc_layers": {"space": "randint", "lower": 2, "upper": 6},
                "combiner.num_steps": {"space": "grid_search", "values": [3, 4, 5]}
            },
            "goal": "maximize",
            "output_feature": "label",
            "validation_metric": "accuracy",
            "split": "test",
            "sampler": {
                "type": "ray",
                "num_samples": 2,
                "seed": 42,
                "scheduler": {"type": "async_hyperband", "reduction_factor": 2, "time_attr": "training_iteration"}
            },
            "executor": {
                "type": "parallel",
                "num_workers": 4,
                "gpu_resources_per_trial": 0.5,
                "time_budget_s": 60,
                "sync": {"remote_dir": "runs", "local_root": "/tmp/durable"}
            }
        }))
        .unwrap();

        let goal = config.search_goal();
        assert_eq!(goal.goal, Goal::Maximize);
        assert_eq!(goal.metric_key().to_string(), "test.label.accuracy");
        assert_eq!(config.sampler.seed, Some(42));
        let scheduler = config.sampler.scheduler.as_ref().unwrap();
        assert_eq!(scheduler.kind, "async_hyperband");
        assert_eq!(scheduler.hyperband().reduction_factor, 2.0);
        assert_eq!(config.sampler.search_alg.kind, "variant_generator");
        assert_eq!(config.executor.settings().time_budget, Some(Duration::from_secs(60)));
        assert_eq!(config.executor.resources_per_trial().gpu, 0.5);
        assert_eq!(config.executor.sync.as_ref().unwrap().remote_dir, "runs");
    }

    #[test]
    fn invalid_sections_are_configuration_errors() {
        let cases = [
            json!({"parameters": {}}),
            json!({"parameters": {"training.lr": {"space": "gaussian"}}}),
            json!({"parameters": {"training.lr": {"space": "uniform", "lower": 1.0, "upper": 0.5}}}),
            json!({
                "parameters": {"training.lr": {"space": "uniform", "lower": 0.0, "upper": 0.5}},
                "sampler": {"num_samples": 0}
            }),
            json!({
                "parameters": {"training.lr": {"space": "uniform", "lower": 0.0, "upper": 0.5}},
                "executor": {"cpu_resources_per_trial": -1}
            }),
            json!({
                "parameters": {"training.lr": {"space": "uniform", "lower": 0.0, "upper": 0.5}},
                "executor": {"sync": {"remote_dir": "runs"}}
            }),
            json!({
                "parameters": {"training.lr": {"space": "uniform", "lower": 0.0, "upper": 0.5}},
                "sampler": {"scheduler": {"type": "async_hyperband", "reduction_factor": 1}}
            }),
            json!({
                "parameters": {"training.lr": {"space": "uniform", "lower": 0.0, "upper": 0.5}},
                "goal": "sideways"
            }),
        ];
        for case in cases {
            let err = HyperoptConfig::from_json(&case).unwrap_err();
            assert!(err.is_configuration(), "{case} gave {err}");
        }
    }

    #[test]
    fn grace_period_and_budget_are_bounded() {
        let with_executor = |executor: serde_json::Value| {
            HyperoptConfig::from_json(&json!({
                "parameters": {"training.lr": {"space": "uniform", "lower": 0.0, "upper": 0.5}},
                "executor": executor
            }))
        };

        for executor in [
            json!({"stop_grace_period_s": -1.0}),
            json!({"stop_grace_period_s": 1e20}),
            json!({"stop_grace_period_s": MAX_STOP_GRACE_PERIOD_S + 1.0}),
            json!({"time_budget_s": 0.0}),
            json!({"time_budget_s": 1e300}),
            json!({"poll_interval_ms": 0}),
        ] {
            let err = with_executor(executor.clone()).unwrap_err();
            assert!(err.is_configuration(), "{executor} gave {err}");
        }

        let longest = with_executor(json!({"stop_grace_period_s": MAX_STOP_GRACE_PERIOD_S})).unwrap();
        assert_eq!(
            longest.executor.settings().stop_grace_period,
            Duration::from_secs(86_400)
        );

        // settings() never turns an out-of-range value into zero
        let unchecked = ExecutorConfig {
            stop_grace_period_s: 1e20,
            ..Default::default()
        };
        assert_eq!(unchecked.settings().stop_grace_period, Duration::from_secs(86_400));
    }
}
