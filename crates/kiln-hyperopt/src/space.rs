//! Search space definitions: dotted parameter paths mapped to distributions.

use std::collections::BTreeMap;
use std::fmt;

use kiln_types::config::{get_path, set_path, validate_path};
use kiln_types::{HyperoptError, KilnError, KilnResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A concrete parameter value produced by a sampler.
///
/// Integers come first so that whole JSON numbers deserialize back as
/// `Int` rather than `Float`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(Value),
}

impl ParameterValue {
    /// Normalize a JSON value: numbers become `Int` or `Float`.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Self::Int(i),
                (None, Some(f)) => Self::Float(f),
                _ => Self::Json(value.clone()),
            },
            other => Self::Json(other.clone()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(v) => Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Json(v) => v.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Json(v) => v.as_f64(),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// One sampled value per parameter path.
pub type Assignment = BTreeMap<String, ParameterValue>;

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "space", rename_all = "snake_case")]
pub enum Distribution {
    /// Continuous uniform range [lower, upper].
    Uniform {
        lower: f64,
        upper: f64,
        /// Evenly spaced grid points used when the parameter is enumerated.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        steps: Option<usize>,
    },
    /// Log-uniform range (sampled in log-space then exponentiated).
    Loguniform {
        lower: f64,
        upper: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        steps: Option<usize>,
    },
    /// Integers in [lower, upper).
    Randint { lower: i64, upper: i64 },
    /// Categorical choices, sampled.
    Choice { categories: Vec<Value> },
    /// Enumerated values, always expanded exhaustively.
    GridSearch { values: Vec<Value> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    Uniform,
    Loguniform,
    Randint,
    Choice,
    GridSearch,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uniform => "uniform",
            Self::Loguniform => "loguniform",
            Self::Randint => "randint",
            Self::Choice => "choice",
            Self::GridSearch => "grid_search",
        };
        f.write_str(name)
    }
}

/// Largest number of combinations a grid is allowed to enumerate.
pub const MAX_GRID_POINTS: usize = 1_000_000;

fn linspace_at(lower: f64, upper: f64, steps: usize, index: usize) -> f64 {
    let t = index as f64 / (steps - 1) as f64;
    lower + t * (upper - lower)
}

impl Distribution {
    pub fn uniform(lower: f64, upper: f64) -> Self {
        Self::Uniform {
            lower,
            upper,
            steps: None,
        }
    }

    pub fn loguniform(lower: f64, upper: f64) -> Self {
        Self::Loguniform {
            lower,
            upper,
            steps: None,
        }
    }

    pub fn kind(&self) -> ParameterKind {
        match self {
            Self::Uniform { .. } => ParameterKind::Uniform,
            Self::Loguniform { .. } => ParameterKind::Loguniform,
            Self::Randint { .. } => ParameterKind::Randint,
            Self::Choice { .. } => ParameterKind::Choice,
            Self::GridSearch { .. } => ParameterKind::GridSearch,
        }
    }

    fn check(&self) -> Result<(), String> {
        match self {
            Self::Uniform {
                lower,
                upper,
                steps,
            } => {
                if !lower.is_finite() || !upper.is_finite() || lower >= upper {
                    return Err(format!("uniform bounds must satisfy lower < upper, got [{lower}, {upper}]"));
                }
                check_steps(*steps)
            }
            Self::Loguniform {
                lower,
                upper,
                steps,
            } => {
                if !(lower.is_finite() && upper.is_finite() && *lower > 0.0 && lower < upper) {
                    return Err(format!(
                        "loguniform bounds must satisfy 0 < lower < upper, got [{lower}, {upper}]"
                    ));
                }
                check_steps(*steps)
            }
            Self::Randint { lower, upper } => {
                if lower >= upper {
                    return Err(format!(
                        "randint upper bound is exclusive and must exceed lower, got [{lower}, {upper})"
                    ));
                }
                Ok(())
            }
            Self::Choice { categories } if categories.is_empty() => {
                Err("choice needs at least one category".to_string())
            }
            Self::GridSearch { values } if values.is_empty() => {
                Err("grid_search needs at least one value".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Every value this parameter takes when enumerated, or `None` for a
    /// continuous range without `steps`. Materializes `grid_len` values, so
    /// callers walking large ranges should use [`Distribution::grid_value`].
    pub fn grid_values(&self) -> Option<Vec<ParameterValue>> {
        (0..self.grid_len()?).map(|index| self.grid_value(index)).collect()
    }

    /// The `index`-th enumerated value, computed without building the list.
    pub fn grid_value(&self, index: usize) -> Option<ParameterValue> {
        if index >= self.grid_len()? {
            return None;
        }
        match self {
            Self::Uniform {
                lower,
                upper,
                steps: Some(steps),
            } => Some(ParameterValue::Float(linspace_at(*lower, *upper, *steps, index))),
            Self::Loguniform {
                lower,
                upper,
                steps: Some(steps),
            } => {
                let log_val = linspace_at(lower.ln(), upper.ln(), *steps, index);
                Some(ParameterValue::Float(log_val.exp().clamp(*lower, *upper)))
            }
            Self::Uniform { .. } | Self::Loguniform { .. } => None,
            Self::Randint { lower, .. } => i64::try_from(index)
                .ok()
                .and_then(|offset| lower.checked_add(offset))
                .map(ParameterValue::Int),
            Self::Choice { categories: values } | Self::GridSearch { values } => {
                values.get(index).map(ParameterValue::from_json)
            }
        }
    }

    /// Number of enumerated values, if the parameter is enumerable and the
    /// count fits in `usize`.
    pub fn grid_len(&self) -> Option<usize> {
        match self {
            Self::Uniform { steps, .. } | Self::Loguniform { steps, .. } => *steps,
            Self::Randint { lower, upper } => upper
                .checked_sub(*lower)
                .and_then(|span| usize::try_from(span).ok()),
            Self::Choice { categories } => Some(categories.len()),
            Self::GridSearch { values } => Some(values.len()),
        }
    }

    /// Draw one value.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match self {
            Self::Uniform { lower, upper, .. } => ParameterValue::Float(rng.gen_range(*lower..=*upper)),
            Self::Loguniform { lower, upper, .. } => {
                let log_val: f64 = rng.gen_range(lower.ln()..=upper.ln());
                ParameterValue::Float(log_val.exp().clamp(*lower, *upper))
            }
            Self::Randint { lower, upper } => ParameterValue::Int(rng.gen_range(*lower..*upper)),
            Self::Choice { categories: values } | Self::GridSearch { values } => {
                let idx = rng.gen_range(0..values.len());
                ParameterValue::from_json(&values[idx])
            }
        }
    }

    /// Whether `value` lies within this distribution's bounds or choices.
    pub fn contains(&self, value: &ParameterValue) -> bool {
        match (self, value) {
            (Self::Uniform { lower, upper, .. }, v) | (Self::Loguniform { lower, upper, .. }, v) => {
                match v {
                    ParameterValue::Int(_) | ParameterValue::Float(_) => v
                        .as_f64()
                        .map(|x| x >= *lower && x <= *upper)
                        .unwrap_or(false),
                    ParameterValue::Json(_) => false,
                }
            }
            (Self::Randint { lower, upper }, ParameterValue::Int(v)) => v >= lower && v < upper,
            (Self::Randint { .. }, _) => false,
            (Self::Choice { categories: values }, v) | (Self::GridSearch { values }, v) => values
                .iter()
                .any(|candidate| ParameterValue::from_json(candidate) == *v),
        }
    }
}

fn check_steps(steps: Option<usize>) -> Result<(), String> {
    match steps {
        Some(n) if n < 2 => Err(format!("steps must be at least 2, got {n}")),
        _ => Ok(()),
    }
}

fn invalid(path: &str, message: impl Into<String>) -> KilnError {
    HyperoptError::InvalidParameter {
        path: path.to_string(),
        message: message.into(),
    }
    .into()
}

/// The full search space, ordered by parameter path.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSpace {
    pub parameters: BTreeMap<String, Distribution>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `hyperopt.parameters` section of a configuration.
    pub fn from_json(value: &Value) -> KilnResult<Self> {
        let space: Self = serde_json::from_value(value.clone()).map_err(|e| {
            KilnError::from(HyperoptError::Configuration(format!(
                "invalid hyperopt parameters: {e}"
            )))
        })?;
        space.validate()?;
        Ok(space)
    }

    pub fn add(mut self, path: impl Into<String>, distribution: Distribution) -> Self {
        self.parameters.insert(path.into(), distribution);
        self
    }

    pub fn add_uniform(self, path: impl Into<String>, lower: f64, upper: f64) -> Self {
        self.add(path, Distribution::uniform(lower, upper))
    }

    pub fn add_loguniform(self, path: impl Into<String>, lower: f64, upper: f64) -> Self {
        self.add(path, Distribution::loguniform(lower, upper))
    }

    pub fn add_randint(self, path: impl Into<String>, lower: i64, upper: i64) -> Self {
        self.add(path, Distribution::Randint { lower, upper })
    }

    pub fn add_choice(self, path: impl Into<String>, categories: Vec<Value>) -> Self {
        self.add(path, Distribution::Choice { categories })
    }

    pub fn add_grid_search(self, path: impl Into<String>, values: Vec<Value>) -> Self {
        self.add(path, Distribution::GridSearch { values })
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Distribution)> {
        self.parameters.iter().map(|(path, dist)| (path.as_str(), dist))
    }

    /// Check the space on its own: at least one parameter, well-formed
    /// paths and sane bounds.
    pub fn validate(&self) -> KilnResult<()> {
        if self.parameters.is_empty() {
            return Err(HyperoptError::Configuration(
                "hyperopt parameters must not be empty".to_string(),
            )
            .into());
        }
        for (path, distribution) in &self.parameters {
            if path.split('.').count() < 2 || path.split('.').any(str::is_empty) {
                return Err(invalid(path, "expected a dotted path such as `training.learning_rate`"));
            }
            distribution.check().map_err(|message| invalid(path, message))?;
        }
        Ok(())
    }

    /// Check that every path resolves to a mutable location in the base
    /// training configuration.
    pub fn validate_against(&self, base_config: &Value) -> KilnResult<()> {
        self.parameters
            .keys()
            .try_for_each(|path| validate_path(base_config, path))
    }

    /// Check a sampled assignment: same paths as the space, every value in range.
    pub fn validate_assignment(&self, assignment: &Assignment) -> KilnResult<()> {
        if let Some(unknown) = assignment.keys().find(|p| !self.parameters.contains_key(*p)) {
            return Err(invalid(unknown, "not part of the search space"));
        }
        for (path, distribution) in &self.parameters {
            let value = assignment
                .get(path)
                .ok_or_else(|| invalid(path, "missing from sampled assignment"))?;
            if !distribution.contains(value) {
                return Err(invalid(
                    path,
                    format!("value {value} outside {} bounds", distribution.kind()),
                ));
            }
        }
        Ok(())
    }

    /// Total number of grid points (`None` if any parameter is continuous
    /// without `steps`, or the product overflows).
    pub fn grid_size(&self) -> Option<usize> {
        self.parameters
            .values()
            .try_fold(1usize, |total, dist| total.checked_mul(dist.grid_len()?))
    }

    /// Draw one value for every parameter.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Assignment {
        self.parameters
            .iter()
            .map(|(path, dist)| (path.clone(), dist.sample(rng)))
            .collect()
    }

    /// Paths whose distribution is of `kind`.
    pub fn paths_of_kind(&self, kind: ParameterKind) -> impl Iterator<Item = &str> {
        self.iter()
            .filter(move |(_, dist)| dist.kind() == kind)
            .map(|(path, _)| path)
    }
}

/// Reject parameters of kinds a strategy cannot handle.
pub(crate) fn ensure_supported(
    strategy: &str,
    space: &ParameterSpace,
    supports: impl Fn(&Distribution) -> bool,
) -> KilnResult<()> {
    match space.iter().find(|(_, dist)| !supports(dist)) {
        Some((path, dist)) => Err(HyperoptError::UnsupportedParameter {
            strategy: strategy.to_string(),
            path: path.to_string(),
            kind: dist.kind().to_string(),
        }
        .into()),
        None => Ok(()),
    }
}

/// Merge an assignment into a deep copy of the base configuration.
///
/// Object values (grouped parameters) are merged key by key into the object
/// already at their path; everything else replaces the value at its path.
pub fn apply_assignment(base_config: &Value, assignment: &Assignment) -> KilnResult<Value> {
    let mut config = base_config.clone();
    for (path, value) in assignment {
        let mut value = value.to_json();
        if value.is_object() {
            if let Some(current) = get_path(&config, path).filter(|v| v.is_object()) {
                let mut merged = current.clone();
                merge_json(&mut merged, value);
                value = merged;
            }
        }
        set_path(&mut config, path, value)?;
    }
    Ok(config)
}

fn merge_json(target: &mut Value, patch: Value) {
    match patch {
        Value::Object(patch) if target.is_object() => {
            if let Some(target) = target.as_object_mut() {
                for (key, value) in patch {
                    merge_json(target.entry(key).or_insert(Value::Null), value);
                }
            }
        }
        patch => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use serde_json::json;

    fn sample_space() -> ParameterSpace {
        ParameterSpace::new()
            .add_loguniform("training.learning_rate", 0.001, 0.1)
            .add_randint("combiner.num_fc_layers", 2, 6)
            .add_choice("utterance.cell_type", vec![json!("rnn"), json!("gru"), json!("lstm")])
    }

    #[test]
    fn parses_declarative_parameters() {
        let space = ParameterSpace::from_json(&json!({
            "training.learning_rate": {"space": "loguniform", "lower": 0.001, "upper": 0.1},
            "combiner.num_fc_layers": {"space": "randint", "lower": 2, "upper": 6},
            "training.batch_size": {"space": "grid_search", "values": [64, 128]},
            "training.dropout": {"space": "uniform", "lower": 0.0, "upper": 0.5, "steps": 3},
        }))
        .unwrap();

        assert_eq!(space.len(), 4);
        assert_eq!(
            space.parameters["combiner.num_fc_layers"],
            Distribution::Randint { lower: 2, upper: 6 }
        );
        // learning rate has no steps
        assert_eq!(space.grid_size(), None);
        let keys: Vec<&str> = space.iter().map(|(p, _)| p).collect();
        assert_eq!(keys[0], "combiner.num_fc_layers");
    }

    #[test]
    fn rejects_bad_distributions() {
        let bad = [
            json!({"training.lr": {"space": "loguniform", "lower": 0.0, "upper": 0.1}}),
            json!({"training.lr": {"space": "uniform", "lower": 1.0, "upper": 1.0}}),
            json!({"training.layers": {"space": "randint", "lower": 3, "upper": 3}}),
            json!({"training.cell": {"space": "choice", "categories": []}}),
            json!({"training.lr": {"space": "uniform", "lower": 0.0, "upper": 1.0, "steps": 1}}),
            json!({"lr": {"space": "uniform", "lower": 0.0, "upper": 1.0}}),
            json!({"training.lr": {"space": "normal", "mu": 0.0}}),
            json!({}),
        ];
        for parameters in bad {
            let err = ParameterSpace::from_json(&parameters).unwrap_err();
            assert!(err.is_configuration(), "{parameters} -> {err}");
        }
    }

    #[test]
    fn samples_respect_bounds() {
        let space = sample_space();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let assignment = space.sample(&mut rng);
            space.validate_assignment(&assignment).unwrap();
            match assignment["combiner.num_fc_layers"] {
                ParameterValue::Int(v) => assert!((2..6).contains(&v)),
                ref other => panic!("unexpected layer count {other:?}"),
            }
        }
    }

    #[test]
    fn same_seed_same_samples() {
        let space = sample_space();
        let a = space.sample(&mut ChaCha8Rng::seed_from_u64(42));
        let b = space.sample(&mut ChaCha8Rng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn validate_assignment_rejects_unknown_missing_and_out_of_range() {
        let space = sample_space();
        let mut assignment = space.sample(&mut ChaCha8Rng::seed_from_u64(1));

        let mut unknown = assignment.clone();
        unknown.insert("training.epochs".into(), ParameterValue::Int(3));
        assert!(space.validate_assignment(&unknown).is_err());

        let mut missing = assignment.clone();
        missing.remove("training.learning_rate");
        assert!(space.validate_assignment(&missing).is_err());

        assignment.insert("combiner.num_fc_layers".into(), ParameterValue::Int(6));
        assert!(space.validate_assignment(&assignment).is_err());
    }

    #[test]
    fn grid_values_for_enumerable_kinds() {
        let steps = Distribution::Loguniform {
            lower: 0.001,
            upper: 0.1,
            steps: Some(3),
        };
        let values = steps.grid_values().unwrap();
        assert_eq!(values.len(), 3);
        assert!((values[1].as_f64().unwrap() - 0.01).abs() < 1e-12);

        assert_eq!(Distribution::uniform(0.0, 1.0).grid_values(), None);
        assert_eq!(
            Distribution::Randint { lower: 1, upper: 4 }.grid_values().unwrap(),
            vec![ParameterValue::Int(1), ParameterValue::Int(2), ParameterValue::Int(3)]
        );
    }

    #[test]
    fn huge_integer_ranges_are_indexed_lazily() {
        let wide = Distribution::Randint { lower: -5, upper: 1 << 40 };
        assert_eq!(wide.grid_len(), Some((1usize << 40) + 5));
        assert_eq!(wide.grid_value(7), Some(ParameterValue::Int(2)));
        assert_eq!(wide.grid_value(usize::MAX), None);

        let full = Distribution::Randint { lower: i64::MIN, upper: i64::MAX };
        assert_eq!(full.grid_len(), None);
        assert_eq!(full.grid_value(0), None);
    }

    #[test]
    fn parameter_values_normalize_numbers() {
        assert_eq!(ParameterValue::from_json(&json!(3)), ParameterValue::Int(3));
        assert_eq!(ParameterValue::from_json(&json!(0.5)), ParameterValue::Float(0.5));
        assert_eq!(
            ParameterValue::from_json(&json!("gru")),
            ParameterValue::Json(json!("gru"))
        );
        let back: ParameterValue = serde_json::from_value(json!(128)).unwrap();
        assert_eq!(back, ParameterValue::Int(128));
    }

    #[test]
    fn apply_assignment_overrides_paths() {
        let base = json!({
            "input_features": [{"name": "utterance", "type": "text", "cell_type": "rnn"}],
            "output_features": [{"name": "intent", "type": "category"}],
            "combiner": {"type": "concat", "num_fc_layers": 1},
            "training": {"epochs": 10, "learning_rate": 0.001},
        });
        let space = sample_space();
        space.validate_against(&base).unwrap();

        let mut assignment = Assignment::new();
        assignment.insert("training.learning_rate".into(), ParameterValue::Float(0.05));
        assignment.insert("combiner.num_fc_layers".into(), ParameterValue::Int(4));
        assignment.insert("utterance.cell_type".into(), ParameterValue::Json(json!("gru")));

        let merged = apply_assignment(&base, &assignment).unwrap();
        assert_eq!(merged["training"]["learning_rate"], json!(0.05));
        assert_eq!(merged["training"]["epochs"], json!(10));
        assert_eq!(merged["combiner"]["num_fc_layers"], json!(4));
        assert_eq!(merged["input_features"][0]["cell_type"], json!("gru"));
        // base untouched
        assert_eq!(base["training"]["learning_rate"], json!(0.001));
    }

    #[test]
    fn grouped_choice_merges_into_its_section() {
        let base = json!({
            "combiner": {"type": "concat", "num_fc_layers": 1, "dropout": 0.1},
            "training": {"epochs": 10},
        });
        let space = ParameterSpace::new().add_choice(
            "combiner",
            vec![
                json!({"type": "concat", "num_fc_layers": 3}),
                json!({"type": "tabnet", "size": 32, "sparsity": {"lambda": 0.01}}),
            ],
        );
        space.validate_against(&base).unwrap();

        let mut assignment = Assignment::new();
        assignment.insert(
            "combiner".into(),
            ParameterValue::from_json(&json!({"type": "tabnet", "size": 32, "sparsity": {"lambda": 0.01}})),
        );
        space.validate_assignment(&assignment).unwrap();

        let merged = apply_assignment(&base, &assignment).unwrap();
        assert_eq!(merged["combiner"]["type"], json!("tabnet"));
        assert_eq!(merged["combiner"]["size"], json!(32));
        assert_eq!(merged["combiner"]["sparsity"]["lambda"], json!(0.01));
        // keys outside the chosen branch survive
        assert_eq!(merged["combiner"]["dropout"], json!(0.1));
        assert_eq!(merged["combiner"]["num_fc_layers"], json!(1));
    }

    #[test]
    fn validate_against_rejects_unknown_sections() {
        let base = json!({"training": {"epochs": 1}});
        let space = ParameterSpace::new().add_uniform("trainer.lr", 0.0, 1.0);
        let err = space.validate_against(&base).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn ensure_supported_names_the_offender() {
        let space = sample_space().add_grid_search("training.batch_size", vec![json!(32)]);
        let err = ensure_supported("random", &space, |d| d.kind() != ParameterKind::GridSearch)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("random"));
        assert!(message.contains("training.batch_size"));
        assert!(message.contains("grid_search"));
    }
}
