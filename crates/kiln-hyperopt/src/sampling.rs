//! Samplers turn a parameter space into a stream of assignments.

use kiln_types::{config_error, KilnResult};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::space::{
    ensure_supported, Assignment, Distribution, ParameterKind, ParameterSpace, ParameterValue,
    MAX_GRID_POINTS,
};
use crate::trial::Goal;

/// One batch of assignments from a sampler.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleBatch {
    pub assignments: Vec<Assignment>,
    /// True once the sampler has nothing left to propose.
    pub finished: bool,
}

/// Common trait for all sampling strategies.
pub trait Sampler: Send {
    fn name(&self) -> &str;

    /// Produce up to `max_count` assignments.
    fn next_batch(&mut self, max_count: usize) -> KilnResult<SampleBatch>;

    /// Feed back a finished trial so adaptive strategies can learn.
    fn report(&mut self, _assignment: &Assignment, _metric: Option<f64>) {}

    /// Total number of assignments this sampler will produce, if known.
    fn total_hint(&self) -> Option<usize>;
}

// ---- Grid ----

/// Enumerable parameters walked as a mixed-radix counter; values are
/// computed per combination rather than stored.
#[derive(Debug, Clone)]
struct GridAxes {
    axes: Vec<(String, Distribution, usize)>,
    size: usize,
}

impl GridAxes {
    fn new<'a>(axes: impl IntoIterator<Item = (&'a str, &'a Distribution)>) -> KilnResult<Self> {
        let mut collected = Vec::new();
        let mut size = 1usize;
        for (path, dist) in axes {
            let len = dist
                .grid_len()
                .ok_or_else(|| config_error!("`{path}` cannot be enumerated"))?;
            size = size
                .checked_mul(len)
                .filter(|total| *total <= MAX_GRID_POINTS)
                .ok_or_else(|| config_error!("grid exceeds {MAX_GRID_POINTS} combinations at `{path}`"))?;
            collected.push((path.to_string(), dist.clone(), len));
        }
        Ok(Self {
            axes: collected,
            size,
        })
    }

    /// Combination `index`; the last parameter varies fastest.
    fn combination(&self, mut index: usize) -> Assignment {
        let mut assignment = Assignment::new();
        for (path, dist, len) in self.axes.iter().rev() {
            if let Some(value) = dist.grid_value(index % len) {
                assignment.insert(path.clone(), value);
            }
            index /= len;
        }
        assignment
    }
}

/// Exhaustive Cartesian product over every parameter's enumerated values.
#[derive(Debug, Clone)]
pub struct GridSampler {
    grid: GridAxes,
    cursor: usize,
}

impl GridSampler {
    pub fn new(space: &ParameterSpace) -> KilnResult<Self> {
        space.validate()?;
        ensure_supported("grid", space, |dist| dist.grid_len().is_some())?;
        let grid = GridAxes::new(space.iter())?;
        Ok(Self { grid, cursor: 0 })
    }
}

impl Sampler for GridSampler {
    fn name(&self) -> &str {
        "grid"
    }

    fn next_batch(&mut self, max_count: usize) -> KilnResult<SampleBatch> {
        let end = (self.cursor + max_count).min(self.grid.size);
        let assignments = (self.cursor..end)
            .map(|index| self.grid.combination(index))
            .collect();
        self.cursor = end;
        Ok(SampleBatch {
            assignments,
            finished: self.cursor >= self.grid.size,
        })
    }

    fn total_hint(&self) -> Option<usize> {
        Some(self.grid.size)
    }
}

// ---- Random ----

/// Independent draws from every parameter's distribution.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    space: ParameterSpace,
    num_samples: usize,
    emitted: usize,
    rng: ChaCha8Rng,
}

impl RandomSampler {
    pub fn new(space: &ParameterSpace, num_samples: usize, seed: u64) -> KilnResult<Self> {
        space.validate()?;
        ensure_supported("random", space, |dist| dist.kind() != ParameterKind::GridSearch)?;
        if num_samples == 0 {
            return Err(config_error!("num_samples must be at least 1"));
        }
        Ok(Self {
            space: space.clone(),
            num_samples,
            emitted: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }
}

impl Sampler for RandomSampler {
    fn name(&self) -> &str {
        "random"
    }

    fn next_batch(&mut self, max_count: usize) -> KilnResult<SampleBatch> {
        let count = max_count.min(self.num_samples - self.emitted);
        let assignments = (0..count).map(|_| self.space.sample(&mut self.rng)).collect();
        self.emitted += count;
        Ok(SampleBatch {
            assignments,
            finished: self.emitted >= self.num_samples,
        })
    }

    fn total_hint(&self) -> Option<usize> {
        Some(self.num_samples)
    }
}

// ---- Delegated search algorithms ----

/// External proposal generator driven by [`DelegatedSampler`].
pub trait SearchAlgorithm: Send {
    fn name(&self) -> &str;

    /// Whether the algorithm can handle parameters of `kind`.
    fn supports(&self, kind: ParameterKind) -> bool;

    /// Number of proposals the algorithm will make in total.
    fn budget(&self) -> usize;

    /// Propose the next `count` assignments.
    fn suggest(&mut self, count: usize) -> Vec<Assignment>;

    /// Learn from a finished trial's metric.
    fn observe(&mut self, _assignment: &Assignment, _metric: f64) {}
}

/// Thin adapter from a [`SearchAlgorithm`] to the [`Sampler`] contract.
pub struct DelegatedSampler {
    algorithm: Box<dyn SearchAlgorithm>,
    emitted: usize,
}

impl DelegatedSampler {
    pub fn new(space: &ParameterSpace, algorithm: Box<dyn SearchAlgorithm>) -> KilnResult<Self> {
        space.validate()?;
        ensure_supported(algorithm.name(), space, |dist| algorithm.supports(dist.kind()))?;
        if algorithm.budget() == 0 {
            return Err(config_error!(
                "search algorithm {} has an empty sample budget",
                algorithm.name()
            ));
        }
        Ok(Self {
            algorithm,
            emitted: 0,
        })
    }

    pub fn algorithm_name(&self) -> &str {
        self.algorithm.name()
    }
}

impl std::fmt::Debug for DelegatedSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedSampler")
            .field("algorithm", &self.algorithm.name())
            .field("emitted", &self.emitted)
            .finish()
    }
}

impl Sampler for DelegatedSampler {
    fn name(&self) -> &str {
        "ray"
    }

    fn next_batch(&mut self, max_count: usize) -> KilnResult<SampleBatch> {
        let budget = self.algorithm.budget();
        let count = max_count.min(budget.saturating_sub(self.emitted));
        let assignments = self.algorithm.suggest(count);
        if assignments.len() > count {
            return Err(config_error!(
                "search algorithm {} proposed {} assignments, {} requested",
                self.algorithm.name(),
                assignments.len(),
                count
            ));
        }
        self.emitted += assignments.len();
        // an algorithm that runs dry before its budget is finished too
        let finished = self.emitted >= budget || (count > 0 && assignments.is_empty());
        Ok(SampleBatch {
            assignments,
            finished,
        })
    }

    fn report(&mut self, assignment: &Assignment, metric: Option<f64>) {
        if let Some(metric) = metric.filter(|m| m.is_finite()) {
            self.algorithm.observe(assignment, metric);
        }
    }

    fn total_hint(&self) -> Option<usize> {
        Some(self.algorithm.budget())
    }
}

/// Ray-Tune-style variant generation: every `grid_search` combination is
/// repeated `num_samples` times, with fresh random draws for the other
/// parameters each time.
#[derive(Debug, Clone)]
pub struct VariantGenerator {
    sampled: ParameterSpace,
    grid: GridAxes,
    num_samples: usize,
    cursor: usize,
    rng: ChaCha8Rng,
}

impl VariantGenerator {
    pub fn new(space: &ParameterSpace, num_samples: usize, seed: u64) -> KilnResult<Self> {
        let mut sampled = ParameterSpace::new();
        for (path, dist) in space.iter() {
            if dist.kind() != ParameterKind::GridSearch {
                sampled = sampled.add(path, dist.clone());
            }
        }
        let grid = GridAxes::new(
            space
                .iter()
                .filter(|(_, dist)| dist.kind() == ParameterKind::GridSearch),
        )?;
        Ok(Self {
            sampled,
            grid,
            num_samples,
            cursor: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }
}

impl SearchAlgorithm for VariantGenerator {
    fn name(&self) -> &str {
        "variant_generator"
    }

    fn supports(&self, _kind: ParameterKind) -> bool {
        true
    }

    fn budget(&self) -> usize {
        self.num_samples.saturating_mul(self.grid.size)
    }

    fn suggest(&mut self, count: usize) -> Vec<Assignment> {
        let end = (self.cursor + count).min(self.budget());
        let proposals = (self.cursor..end)
            .map(|index| {
                let mut assignment = self.grid.combination(index % self.grid.size);
                assignment.extend(self.sampled.sample(&mut self.rng));
                assignment
            })
            .collect();
        self.cursor = end;
        proposals
    }
}

/// Bayesian optimization using a simple surrogate model.
///
/// Tracks observed (assignment, metric) pairs and biases sampling toward
/// the best point seen so far. With probability `exploration_weight` a
/// proposal is a fresh random draw; otherwise it perturbs the incumbent.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    space: ParameterSpace,
    goal: Goal,
    num_samples: usize,
    observations: Vec<(Assignment, f64)>,
    exploration_weight: f64,
    rng: ChaCha8Rng,
}

impl BayesianSearch {
    pub fn new(
        space: &ParameterSpace,
        goal: Goal,
        num_samples: usize,
        exploration_weight: f64,
        seed: u64,
    ) -> Self {
        Self {
            space: space.clone(),
            goal,
            num_samples,
            observations: Vec::new(),
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn best(&self) -> Option<&Assignment> {
        self.observations
            .iter()
            .min_by(|a, b| self.goal.compare(a.1, b.1))
            .map(|(assignment, _)| assignment)
    }

    /// Exploitation: perturb the best-known point.
    fn exploit(&mut self, base: &Assignment) -> Assignment {
        let mut perturbed = Assignment::new();
        for (path, dist) in &self.space.parameters {
            let value = match (dist, base.get(path)) {
                (Distribution::Uniform { lower, upper, .. }, Some(ParameterValue::Float(v))) => {
                    let noise = self.rng.gen_range(-0.1..0.1) * (upper - lower);
                    ParameterValue::Float((v + noise).clamp(*lower, *upper))
                }
                (Distribution::Loguniform { lower, upper, .. }, Some(ParameterValue::Float(v))) => {
                    let noise = self.rng.gen_range(-0.1..0.1) * (upper.ln() - lower.ln());
                    ParameterValue::Float((v.ln() + noise).exp().clamp(*lower, *upper))
                }
                (Distribution::Randint { lower, upper }, Some(ParameterValue::Int(v))) => {
                    let delta: i64 = self.rng.gen_range(-2..=2);
                    ParameterValue::Int((v + delta).clamp(*lower, *upper - 1))
                }
                // categorical or missing base: resample
                _ => dist.sample(&mut self.rng),
            };
            perturbed.insert(path.clone(), value);
        }
        perturbed
    }
}

impl SearchAlgorithm for BayesianSearch {
    fn name(&self) -> &str {
        "bayesian"
    }

    fn supports(&self, kind: ParameterKind) -> bool {
        kind != ParameterKind::GridSearch
    }

    fn budget(&self) -> usize {
        self.num_samples
    }

    fn suggest(&mut self, count: usize) -> Vec<Assignment> {
        (0..count)
            .map(|_| {
                let explore = self.rng.gen::<f64>() < self.exploration_weight;
                match self.best().cloned() {
                    Some(best) if !explore => self.exploit(&best),
                    _ => self.space.sample(&mut self.rng),
                }
            })
            .collect()
    }

    fn observe(&mut self, assignment: &Assignment, metric: f64) {
        self.observations.push((assignment.clone(), metric));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn grid_space() -> ParameterSpace {
        ParameterSpace::new()
            .add_grid_search("training.batch_size", vec![json!(32), json!(64), json!(128)])
            .add_randint("combiner.num_fc_layers", 1, 3)
    }

    #[test]
    fn grid_emits_each_combination_once() {
        let space = grid_space();
        assert_eq!(space.grid_size(), Some(6));

        let mut sampler = GridSampler::new(&space).unwrap();
        assert_eq!(sampler.total_hint(), Some(6));

        let first = sampler.next_batch(4).unwrap();
        assert_eq!(first.assignments.len(), 4);
        assert!(!first.finished);
        let second = sampler.next_batch(4).unwrap();
        assert_eq!(second.assignments.len(), 2);
        assert!(second.finished);
        assert!(sampler.next_batch(4).unwrap().assignments.is_empty());

        let all: Vec<Assignment> = first.assignments.into_iter().chain(second.assignments).collect();
        let distinct: HashSet<String> = all
            .iter()
            .map(|a| serde_json::to_string(a).unwrap())
            .collect();
        assert_eq!(distinct.len(), 6);
        for assignment in &all {
            space.validate_assignment(assignment).unwrap();
        }
        // path order, last path varies fastest
        assert_eq!(all[0]["combiner.num_fc_layers"], ParameterValue::Int(1));
        assert_eq!(all[0]["training.batch_size"], ParameterValue::Int(32));
        assert_eq!(all[1]["training.batch_size"], ParameterValue::Int(64));
    }

    #[test]
    fn grid_finishes_exactly_on_last_combination() {
        let space = ParameterSpace::new().add_randint("training.epochs", 1, 4);
        let mut sampler = GridSampler::new(&space).unwrap();
        assert!(!sampler.next_batch(2).unwrap().finished);
        let last = sampler.next_batch(1).unwrap();
        assert_eq!(last.assignments.len(), 1);
        assert!(last.finished);
    }

    #[test]
    fn grid_rejects_continuous_without_steps() {
        let space = grid_space().add_uniform("training.dropout", 0.0, 0.5);
        let err = GridSampler::new(&space).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("training.dropout"));

        let stepped = grid_space().add(
            "training.dropout",
            Distribution::Uniform {
                lower: 0.0,
                upper: 0.5,
                steps: Some(3),
            },
        );
        assert_eq!(GridSampler::new(&stepped).unwrap().total_hint(), Some(18));
    }

    #[test]
    fn grid_rejects_oversized_ranges_without_allocating() {
        let wide = ParameterSpace::new().add_randint("training.batch_size", 0, 1 << 40);
        let err = GridSampler::new(&wide).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("training.batch_size"));

        let overflowing = ParameterSpace::new().add_randint("training.seed", i64::MIN, i64::MAX);
        assert!(GridSampler::new(&overflowing).unwrap_err().is_configuration());

        // each axis fits, the product does not
        let product = ParameterSpace::new()
            .add_randint("training.epochs", 0, 2_000)
            .add_randint("training.batch_size", 0, 2_000);
        assert!(GridSampler::new(&product).unwrap_err().is_configuration());

        let at_cap = ParameterSpace::new()
            .add_randint("training.epochs", 0, 1_000)
            .add_randint("training.batch_size", 0, 1_000);
        let mut sampler = GridSampler::new(&at_cap).unwrap();
        assert_eq!(sampler.total_hint(), Some(MAX_GRID_POINTS));
        let batch = sampler.next_batch(2).unwrap();
        assert_eq!(batch.assignments[1]["training.batch_size"], ParameterValue::Int(0));
        assert_eq!(batch.assignments[1]["training.epochs"], ParameterValue::Int(1));
    }

    #[test]
    fn random_respects_budget_and_bounds() {
        let space = ParameterSpace::new()
            .add_loguniform("training.learning_rate", 0.001, 0.1)
            .add_randint("combiner.num_fc_layers", 2, 6)
            .add_choice("combiner.activation", vec![json!("relu"), json!("tanh")]);
        let mut sampler = RandomSampler::new(&space, 5, 11).unwrap();

        let first = sampler.next_batch(3).unwrap();
        assert!(!first.finished);
        let second = sampler.next_batch(10).unwrap();
        assert_eq!(second.assignments.len(), 2);
        assert!(second.finished);

        for assignment in first.assignments.iter().chain(&second.assignments) {
            space.validate_assignment(assignment).unwrap();
        }
    }

    #[test]
    fn random_is_reproducible_from_seed() {
        let space = ParameterSpace::new().add_uniform("training.dropout", 0.0, 1.0);
        let a = RandomSampler::new(&space, 4, 3).unwrap().next_batch(4).unwrap();
        let b = RandomSampler::new(&space, 4, 3).unwrap().next_batch(4).unwrap();
        let c = RandomSampler::new(&space, 4, 4).unwrap().next_batch(4).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn random_rejects_grid_search_and_zero_budget() {
        let err = RandomSampler::new(&grid_space(), 3, 0).unwrap_err();
        assert!(err.to_string().contains("grid_search"));

        let space = ParameterSpace::new().add_uniform("training.dropout", 0.0, 1.0);
        assert!(RandomSampler::new(&space, 0, 0).is_err());
    }

    #[test]
    fn variant_generator_repeats_grid_per_sample() {
        let space = grid_space().add_uniform("training.dropout", 0.0, 0.5);
        let algorithm = VariantGenerator::new(&space, 2, 9).unwrap();
        let mut sampler = DelegatedSampler::new(&space, Box::new(algorithm)).unwrap();
        assert_eq!(sampler.total_hint(), Some(6));
        assert_eq!(sampler.algorithm_name(), "variant_generator");

        let batch = sampler.next_batch(100).unwrap();
        assert!(batch.finished);
        assert_eq!(batch.assignments.len(), 6);
        for assignment in &batch.assignments {
            space.validate_assignment(assignment).unwrap();
        }
        let sizes: Vec<_> = batch
            .assignments
            .iter()
            .map(|a| a["training.batch_size"].clone())
            .collect();
        assert_eq!(sizes[0], sizes[3]);
        assert_ne!(sizes[0], sizes[1]);
    }

    #[test]
    fn bayesian_rejects_grid_search() {
        let space = grid_space();
        let algorithm = BayesianSearch::new(&space, Goal::Minimize, 10, 0.3, 0);
        let err = DelegatedSampler::new(&space, Box::new(algorithm)).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("bayesian"));
    }

    #[test]
    fn bayesian_exploits_the_best_observation() {
        let space = ParameterSpace::new().add_uniform("training.learning_rate", 0.0, 1.0);
        let mut algorithm = BayesianSearch::new(&space, Goal::Minimize, 50, 0.0, 1);

        let at = |v: f64| {
            let mut a = Assignment::new();
            a.insert("training.learning_rate".to_string(), ParameterValue::Float(v));
            a
        };
        algorithm.observe(&at(0.9), 5.0);
        algorithm.observe(&at(0.2), 1.0);

        for proposal in algorithm.suggest(20) {
            let lr = proposal["training.learning_rate"].as_f64().unwrap();
            assert!((0.1..=0.3).contains(&lr), "{lr} not near the best point");
        }
    }

    #[test]
    fn delegated_sampler_reports_only_finite_metrics() {
        let space = ParameterSpace::new().add_uniform("training.learning_rate", 0.0, 1.0);
        let algorithm = BayesianSearch::new(&space, Goal::Maximize, 3, 0.3, 2);
        let mut sampler = DelegatedSampler::new(&space, Box::new(algorithm)).unwrap();

        let batch = sampler.next_batch(2).unwrap();
        sampler.report(&batch.assignments[0], Some(f64::NAN));
        sampler.report(&batch.assignments[1], None);
        sampler.report(&batch.assignments[1], Some(0.5));

        let last = sampler.next_batch(5).unwrap();
        assert_eq!(last.assignments.len(), 1);
        assert!(last.finished);
    }
}
