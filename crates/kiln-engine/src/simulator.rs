//! Synthetic trainer that produces plausible learning curves without a model.
//!
//! Useful for dry runs of a search configuration and for tests. Loss depends
//! on `training.learning_rate`, `training.epochs` and
//! `combiner.num_fc_layers`; noise is drawn from the trial seed.

use std::collections::BTreeSet;
use std::fs;
use std::time::Duration;

use anyhow::{bail, Context};
use kiln_types::config::{get_path, output_feature_names};
use kiln_types::stats::{COMBINED, LOSS, TRAINING, VALIDATION};
use kiln_types::{DatasetRef, MetricKey, Trainer, TrainingStats, TrialContext};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};

const DEFAULT_EPOCHS: u64 = 10;
const OPTIMAL_LEARNING_RATE: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct SimulatedTrainer {
    epoch_delay: Duration,
    noise: f64,
    fail_trials: BTreeSet<usize>,
}

impl Default for SimulatedTrainer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTrainer {
    pub fn new() -> Self {
        Self {
            epoch_delay: Duration::ZERO,
            noise: 0.01,
            fail_trials: BTreeSet::new(),
        }
    }

    /// Sleep this long after every simulated epoch.
    pub fn with_epoch_delay(mut self, delay: Duration) -> Self {
        self.epoch_delay = delay;
        self
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.max(0.0);
        self
    }

    /// Make the given trial numbers fail halfway through training.
    pub fn with_failures(mut self, trials: impl IntoIterator<Item = usize>) -> Self {
        self.fail_trials.extend(trials);
        self
    }

    /// Loss the curve converges to for `config`.
    pub fn final_loss(config: &Value) -> f64 {
        let lr = get_path(config, "training.learning_rate")
            .and_then(Value::as_f64)
            .unwrap_or(OPTIMAL_LEARNING_RATE)
            .max(f64::MIN_POSITIVE);
        let layers = get_path(config, "combiner.num_fc_layers")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        // distance from the optimum in log space, plus a mild capacity term
        let lr_penalty = (lr / OPTIMAL_LEARNING_RATE).ln().powi(2) * 0.05;
        0.1 + lr_penalty + (layers - 3.0).abs() * 0.02
    }
}

impl Trainer for SimulatedTrainer {
    fn train(
        &self,
        config: &Value,
        dataset: &DatasetRef,
        ctx: &TrialContext,
    ) -> anyhow::Result<TrainingStats> {
        let epochs = get_path(config, "training.epochs")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_EPOCHS)
            .max(1);
        let target = Self::final_loss(config);
        let features = output_feature_names(config);
        let mut rng = ChaCha8Rng::seed_from_u64(ctx.seed);

        tracing::debug!(
            trial = ctx.trial_number,
            epochs,
            rows = ?dataset.num_rows(),
            target,
            "Simulating training"
        );

        let mut stats = TrainingStats::new();
        for epoch in 1..=epochs {
            if self.fail_trials.contains(&ctx.trial_number) && epoch * 2 > epochs {
                bail!("simulated failure in trial {} at epoch {epoch}", ctx.trial_number);
            }

            let progress = (-(epoch as f64) / 2.0).exp();
            let jitter = rng.gen_range(-1.0..=1.0) * self.noise;
            let loss = (target + progress + jitter).max(0.0);
            for split in [TRAINING, VALIDATION] {
                let split_loss = if split == TRAINING { loss * 0.9 } else { loss };
                stats.push(split, COMBINED, LOSS, split_loss);
                for feature in &features {
                    stats.push(split, feature, LOSS, split_loss);
                }
            }

            if ctx.report(epoch, &stats).should_stop() {
                tracing::debug!(trial = ctx.trial_number, epoch, "Simulation stopped early");
                break;
            }
            if !self.epoch_delay.is_zero() {
                std::thread::sleep(self.epoch_delay);
            }
        }

        let checkpoint = ctx.trial_dir.join("model_weights.json");
        let weights = json!({
            "config": config,
            "epochs_trained": stats.epochs(&MetricKey::new(VALIDATION, COMBINED, LOSS)),
        });
        fs::write(&checkpoint, serde_json::to_vec_pretty(&weights)?)
            .with_context(|| format!("writing {}", checkpoint.display()))?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::{ProgressSink, TrainingControl};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[derive(Default)]
    struct StopAfter {
        limit: u64,
        seen: AtomicU64,
    }

    impl ProgressSink for StopAfter {
        fn report(&self, iteration: u64, _stats: &TrainingStats) -> TrainingControl {
            self.seen.store(iteration, Ordering::SeqCst);
            if self.limit > 0 && iteration >= self.limit {
                TrainingControl::Stop
            } else {
                TrainingControl::Continue
            }
        }
    }

    fn context(dir: &TempDir, trial_number: usize, progress: Arc<StopAfter>) -> TrialContext {
        TrialContext {
            trial_id: Uuid::new_v4(),
            trial_number,
            trial_dir: dir.path().to_path_buf(),
            seed: 7,
            progress,
        }
    }

    fn config(lr: f64, epochs: u64) -> Value {
        json!({
            "output_features": [{"name": "label", "type": "binary"}],
            "combiner": {"num_fc_layers": 3},
            "training": {"learning_rate": lr, "epochs": epochs}
        })
    }

    #[test]
    fn curves_reward_the_optimal_learning_rate() {
        assert!(SimulatedTrainer::final_loss(&config(0.01, 5)) < SimulatedTrainer::final_loss(&config(0.1, 5)));
        assert!(SimulatedTrainer::final_loss(&config(0.01, 5)) < SimulatedTrainer::final_loss(&config(0.001, 5)));
    }

    #[test]
    fn reports_every_epoch_and_writes_a_checkpoint() {
        let dir = TempDir::new().unwrap();
        let progress = Arc::new(StopAfter::default());
        let trainer = SimulatedTrainer::new().with_noise(0.0);
        let stats = trainer
            .train(&config(0.01, 4), &DatasetRef::path("x.csv"), &context(&dir, 0, progress.clone()))
            .unwrap();

        assert_eq!(progress.seen.load(Ordering::SeqCst), 4);
        let key = MetricKey::new(VALIDATION, COMBINED, LOSS);
        let history = stats.history(&key).unwrap();
        assert_eq!(history.len(), 4);
        assert!(history.windows(2).all(|w| w[1] < w[0]));
        assert_eq!(stats.history(&key.with_split(TRAINING)).unwrap().len(), 4);
        assert!(stats.last(&MetricKey::new(VALIDATION, "label", LOSS)).is_some());
        assert!(dir.path().join("model_weights.json").exists());
    }

    #[test]
    fn honours_stop_requests() {
        let dir = TempDir::new().unwrap();
        let progress = Arc::new(StopAfter {
            limit: 2,
            ..Default::default()
        });
        let stats = SimulatedTrainer::new()
            .train(&config(0.01, 10), &DatasetRef::path("x.csv"), &context(&dir, 0, progress))
            .unwrap();
        assert_eq!(stats.epochs(&MetricKey::new(VALIDATION, COMBINED, LOSS)), 2);
    }

    #[test]
    fn injected_failures_raise() {
        let dir = TempDir::new().unwrap();
        let trainer = SimulatedTrainer::new().with_failures([3]);
        let err = trainer
            .train(
                &config(0.01, 4),
                &DatasetRef::path("x.csv"),
                &context(&dir, 3, Arc::new(StopAfter::default())),
            )
            .unwrap_err();
        assert!(err.to_string().contains("simulated failure in trial 3"));
    }

    #[test]
    fn same_seed_same_curve() {
        let dir = TempDir::new().unwrap();
        let trainer = SimulatedTrainer::new().with_noise(0.05);
        let run = || {
            trainer
                .train(
                    &config(0.02, 3),
                    &DatasetRef::path("x.csv"),
                    &context(&dir, 0, Arc::new(StopAfter::default())),
                )
                .unwrap()
        };
        assert_eq!(run(), run());
    }
}
