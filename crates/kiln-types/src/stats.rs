//! Training statistics reported by the training subsystem.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const TRAINING: &str = "training";
pub const VALIDATION: &str = "validation";
pub const TEST: &str = "test";

/// Name of the pseudo output feature holding the aggregate loss.
pub const COMBINED: &str = "combined";
pub const LOSS: &str = "loss";

/// Per-epoch metric history for one output feature.
pub type MetricHistory = BTreeMap<String, Vec<f64>>;

/// Statistics for a full training run, indexed as
/// `split -> output feature -> metric -> per-epoch values`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainingStats {
    pub splits: BTreeMap<String, BTreeMap<String, MetricHistory>>,
}

impl TrainingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one epoch's value for `split.feature.metric`.
    pub fn push(&mut self, split: &str, feature: &str, metric: &str, value: f64) {
        self.splits
            .entry(split.to_string())
            .or_default()
            .entry(feature.to_string())
            .or_default()
            .entry(metric.to_string())
            .or_default()
            .push(value);
    }

    pub fn history(&self, key: &MetricKey) -> Option<&[f64]> {
        self.splits
            .get(&key.split)?
            .get(&key.output_feature)?
            .get(&key.metric)
            .map(Vec::as_slice)
    }

    /// Most recently reported value of the metric, if any epoch reported it.
    pub fn last(&self, key: &MetricKey) -> Option<f64> {
        self.history(key).and_then(|values| values.last().copied())
    }

    /// Number of epochs recorded for the metric.
    pub fn epochs(&self, key: &MetricKey) -> usize {
        self.history(key).map_or(0, <[f64]>::len)
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }
}

/// Discoverable key of a metric inside [`TrainingStats`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    pub split: String,
    pub output_feature: String,
    pub metric: String,
}

impl MetricKey {
    pub fn new(
        split: impl Into<String>,
        output_feature: impl Into<String>,
        metric: impl Into<String>,
    ) -> Self {
        Self {
            split: split.into(),
            output_feature: output_feature.into(),
            metric: metric.into(),
        }
    }

    /// Same feature and metric on a different split.
    pub fn with_split(&self, split: &str) -> Self {
        Self {
            split: split.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.split, self.output_feature, self.metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_read_back_history() {
        let mut stats = TrainingStats::new();
        stats.push(VALIDATION, COMBINED, LOSS, 0.9);
        stats.push(VALIDATION, COMBINED, LOSS, 0.7);
        stats.push(TRAINING, COMBINED, LOSS, 0.8);

        let key = MetricKey::new(VALIDATION, COMBINED, LOSS);
        assert_eq!(stats.history(&key), Some(&[0.9, 0.7][..]));
        assert_eq!(stats.last(&key), Some(0.7));
        assert_eq!(stats.epochs(&key), 2);
        assert_eq!(stats.last(&key.with_split(TRAINING)), Some(0.8));
    }

    #[test]
    fn missing_metric_is_none() {
        let stats = TrainingStats::new();
        let key = MetricKey::new(VALIDATION, "label", "accuracy");
        assert!(stats.last(&key).is_none());
        assert_eq!(stats.epochs(&key), 0);
        assert_eq!(key.to_string(), "validation.label.accuracy");
    }

    #[test]
    fn serializes_as_nested_maps() {
        let mut stats = TrainingStats::new();
        stats.push(VALIDATION, COMBINED, LOSS, 0.5);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["validation"]["combined"]["loss"][0], 0.5);

        let back: TrainingStats = serde_json::from_value(json).unwrap();
        assert_eq!(back, stats);
    }
}
