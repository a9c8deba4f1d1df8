//! Dotted-path access into declarative model configurations.
//!
//! A path such as `training.learning_rate` addresses the `learning_rate` key
//! of the top-level `training` section. When the first segment does not name
//! a section, it is looked up as the `name` of an entry in `input_features`
//! or `output_features`, so `label.fc_size` addresses the `fc_size` key of the
//! feature called `label`.
//!
//! The container of the final segment must already exist and be an object;
//! the final key itself may be absent, in which case setting it inserts it.
//! A bare section name such as `combiner` addresses the whole section.

use serde_json::{Map, Value};

use crate::errors::{HyperoptError, KilnError, KilnResult};

pub const INPUT_FEATURES: &str = "input_features";
pub const OUTPUT_FEATURES: &str = "output_features";
pub const HYPEROPT: &str = "hyperopt";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Feature { section: &'static str, index: usize },
}

fn invalid(path: &str, message: impl Into<String>) -> KilnError {
    HyperoptError::InvalidParameter {
        path: path.to_string(),
        message: message.into(),
    }
    .into()
}

fn feature_index(config: &Value, name: &str) -> Option<(&'static str, usize)> {
    [INPUT_FEATURES, OUTPUT_FEATURES].into_iter().find_map(|section| {
        config
            .get(section)?
            .as_array()?
            .iter()
            .position(|feature| feature.get("name").and_then(Value::as_str) == Some(name))
            .map(|index| (section, index))
    })
}

/// Resolve the steps leading to the container of `path` and return them with
/// the leaf key.
fn route(config: &Value, path: &str) -> KilnResult<(Vec<Step>, String)> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(invalid(
            path,
            "expected a dotted path such as `section.key`",
        ));
    }
    if !config.is_object() {
        return Err(invalid(path, "base configuration is not an object"));
    }
    // a bare section name addresses the whole section (grouped parameters)
    if let [section] = segments.as_slice() {
        return match config.get(*section) {
            Some(value) if value.is_object() => Ok((Vec::new(), section.to_string())),
            _ => Err(invalid(
                path,
                "expected a dotted path such as `section.key` or an existing section",
            )),
        };
    }

    let (containers, leaf) = segments.split_at(segments.len() - 1);
    let mut steps = Vec::with_capacity(containers.len());
    let mut cursor = config;

    for (depth, segment) in containers.iter().enumerate() {
        let next = match cursor.get(*segment) {
            Some(value) => {
                steps.push(Step::Key(segment.to_string()));
                value
            }
            None if depth == 0 => {
                let (section, index) = feature_index(config, segment).ok_or_else(|| {
                    invalid(
                        path,
                        format!("`{segment}` is neither a configuration section nor a feature name"),
                    )
                })?;
                steps.push(Step::Feature { section, index });
                &config[section][index]
            }
            None => {
                return Err(invalid(
                    path,
                    format!("`{segment}` not found in base configuration"),
                ))
            }
        };
        if !next.is_object() {
            return Err(invalid(
                path,
                format!("`{segment}` does not hold a configuration object"),
            ));
        }
        cursor = next;
    }

    Ok((steps, leaf[0].to_string()))
}

fn container_mut<'a>(config: &'a mut Value, steps: &[Step]) -> Option<&'a mut Map<String, Value>> {
    let mut cursor = config;
    for step in steps {
        cursor = match step {
            Step::Key(key) => cursor.get_mut(key.as_str())?,
            Step::Feature { section, index } => cursor.get_mut(*section)?.get_mut(*index)?,
        };
    }
    cursor.as_object_mut()
}

/// Check that `path` resolves to a mutable location in `config`.
pub fn validate_path(config: &Value, path: &str) -> KilnResult<()> {
    route(config, path).map(|_| ())
}

/// Read the value stored at `path`, if the location exists.
pub fn get_path<'a>(config: &'a Value, path: &str) -> Option<&'a Value> {
    let (steps, leaf) = route(config, path).ok()?;
    let mut cursor = config;
    for step in &steps {
        cursor = match step {
            Step::Key(key) => cursor.get(key.as_str())?,
            Step::Feature { section, index } => cursor.get(*section)?.get(*index)?,
        };
    }
    cursor.get(leaf.as_str())
}

/// Override the value at `path`, keeping every other key untouched.
pub fn set_path(config: &mut Value, path: &str, value: Value) -> KilnResult<()> {
    let (steps, leaf) = route(config, path)?;
    let container =
        container_mut(config, &steps).ok_or_else(|| invalid(path, "container vanished"))?;
    container.insert(leaf, value);
    Ok(())
}

/// Names of the configured output features.
pub fn output_feature_names(config: &Value) -> Vec<&str> {
    config
        .get(OUTPUT_FEATURES)
        .and_then(Value::as_array)
        .map(|features| {
            features
                .iter()
                .filter_map(|f| f.get("name").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}
