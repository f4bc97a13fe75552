//! Particles and resampling index providers.
use std::fmt::{self, Display};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::Pose2D;
use crate::tree::NodeId;

/// One filter hypothesis: a pose, its log weights, its own map and its current ancestry leaf.
#[derive(Clone, Debug)]
pub struct Particle<M> {
    pub pose: Pose2D,
    /// Log-likelihood accumulated since this particle was created (initialization or resampling).
    pub weight: f64,
    /// Log-likelihood accumulated over the whole lineage; never reset.
    pub weight_sum: f64,
    pub map: M,
    /// Current leaf of this particle in the ancestry tree.
    pub node: NodeId,
    /// Index in the particle set of the previous step this particle came from.
    pub previous_index: usize,
}
impl<M> Display for Particle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.pose.x)
            .field("y", &self.pose.y)
            .field("theta_deg", &self.pose.theta.to_degrees())
            .field("weight", &self.weight)
            .field("weight_sum", &self.weight_sum)
            .field("node", &self.node)
            .field("previous_index", &self.previous_index)
            .finish()
    }
}
impl<M> Particle<M> {
    pub fn new(pose: Pose2D, map: M, node: NodeId, previous_index: usize) -> Particle<M> {
        Particle {
            pose,
            weight: 0.0,
            weight_sum: 0.0,
            map,
            node,
            previous_index,
        }
    }
}

/// Index provider used when the filter resamples.
///
/// Every strategy returns `target` indexes into the weight vector in non-decreasing order, each index appearing
/// with an expected multiplicity proportional to its weight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingStrategy {
    /// Low-variance resampling with a single random offset.
    #[default]
    Systematic,
    /// One uniform draw per stratum.
    Stratified,
    /// Independent draws from the categorical distribution.
    Multinomial,
    /// Deterministic floor copies plus systematic resampling of the residuals.
    Residual,
}
impl Display for ResamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResamplingStrategy::Systematic => "systematic",
            ResamplingStrategy::Stratified => "stratified",
            ResamplingStrategy::Multinomial => "multinomial",
            ResamplingStrategy::Residual => "residual",
        };
        write!(f, "{name}")
    }
}
impl ResamplingStrategy {
    /// Draw `target` source indexes from normalized `weights`.
    pub fn indexes<G: Rng>(&self, weights: &[f64], target: usize, rng: &mut G) -> Vec<usize> {
        if weights.is_empty() || target == 0 {
            return Vec::new();
        }
        let mut indexes = match self {
            ResamplingStrategy::Systematic => systematic_resample(weights, target, rng),
            ResamplingStrategy::Stratified => stratified_resample(weights, target, rng),
            ResamplingStrategy::Multinomial => multinomial_resample(weights, target, rng),
            ResamplingStrategy::Residual => residual_resample(weights, target, rng),
        };
        // Multinomial and residual draws are not produced in order.
        indexes.sort_unstable();
        indexes
    }
}

/// Walk the cumulative weights with sorted positions in `[0, total)`.
fn select_sorted(weights: &[f64], positions: impl Iterator<Item = f64>) -> Vec<usize> {
    let last = weights.len() - 1;
    let mut indexes = Vec::new();
    let mut i = 0;
    let mut cumsum = weights[0];
    for u in positions {
        while u >= cumsum && i < last {
            i += 1;
            cumsum += weights[i];
        }
        indexes.push(i);
    }
    indexes
}

pub fn systematic_resample<G: Rng>(weights: &[f64], target: usize, rng: &mut G) -> Vec<usize> {
    let total: f64 = weights.iter().sum();
    let step = total / target as f64;
    let offset = rng.random::<f64>() * step;
    select_sorted(weights, (0..target).map(|m| offset + m as f64 * step))
}

pub fn stratified_resample<G: Rng>(weights: &[f64], target: usize, rng: &mut G) -> Vec<usize> {
    let total: f64 = weights.iter().sum();
    let step = total / target as f64;
    let positions: Vec<f64> = (0..target)
        .map(|m| (m as f64 + rng.random::<f64>()) * step)
        .collect();
    select_sorted(weights, positions.into_iter())
}

pub fn multinomial_resample<G: Rng>(weights: &[f64], target: usize, rng: &mut G) -> Vec<usize> {
    let total: f64 = weights.iter().sum();
    let mut positions: Vec<f64> = (0..target).map(|_| rng.random::<f64>() * total).collect();
    positions.sort_by(|a, b| a.total_cmp(b));
    select_sorted(weights, positions.into_iter())
}

pub fn residual_resample<G: Rng>(weights: &[f64], target: usize, rng: &mut G) -> Vec<usize> {
    let total: f64 = weights.iter().sum();
    let mut indexes = Vec::with_capacity(target);
    let mut residual: Vec<f64> = vec![0.0; weights.len()];
    for (i, &w) in weights.iter().enumerate() {
        let expected = w / total * target as f64;
        let copies = expected.floor() as usize;
        indexes.extend(std::iter::repeat_n(i, copies));
        residual[i] = expected - copies as f64;
    }
    let remaining = target.saturating_sub(indexes.len());
    if remaining > 0 {
        indexes.extend(systematic_resample(&residual, remaining, rng));
    }
    indexes.truncate(target);
    indexes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const ALL: [ResamplingStrategy; 4] = [
        ResamplingStrategy::Systematic,
        ResamplingStrategy::Stratified,
        ResamplingStrategy::Multinomial,
        ResamplingStrategy::Residual,
    ];

    fn multiplicity(indexes: &[usize], n: usize) -> Vec<usize> {
        let mut counts = vec![0; n];
        for &i in indexes {
            counts[i] += 1;
        }
        counts
    }

    #[test]
    fn indexes_have_target_length_and_are_sorted() {
        let mut rng = StdRng::seed_from_u64(3);
        let weights = [0.1, 0.4, 0.05, 0.3, 0.15];
        for strategy in ALL {
            for target in [1, 4, 5, 9, 50] {
                let indexes = strategy.indexes(&weights, target, &mut rng);
                assert_eq!(indexes.len(), target, "{strategy} target {target}");
                assert!(indexes.windows(2).all(|w| w[0] <= w[1]), "{strategy} not sorted");
                assert!(indexes.iter().all(|&i| i < weights.len()));
            }
        }
    }

    #[test]
    fn dominant_weight_dominates_selection() {
        let mut rng = StdRng::seed_from_u64(11);
        let weights = [0.97, 0.01, 0.01, 0.01];
        for strategy in [ResamplingStrategy::Systematic, ResamplingStrategy::Residual] {
            let counts = multiplicity(&strategy.indexes(&weights, 4, &mut rng), 4);
            assert!(counts[0] >= 3, "{strategy}: {counts:?}");
        }
    }

    #[test]
    fn systematic_multiplicity_tracks_weights() {
        let mut rng = StdRng::seed_from_u64(5);
        let weights = [0.5, 0.25, 0.125, 0.125];
        let counts = multiplicity(&systematic_resample(&weights, 8, &mut rng), 4);
        assert_eq!(counts, vec![4, 2, 1, 1]);
    }

    #[test]
    fn zero_weight_is_never_selected() {
        let mut rng = StdRng::seed_from_u64(9);
        let weights = [0.0, 0.5, 0.0, 0.5];
        for strategy in ALL {
            let counts = multiplicity(&strategy.indexes(&weights, 20, &mut rng), 4);
            assert_eq!(counts[0], 0, "{strategy}");
            assert_eq!(counts[2], 0, "{strategy}");
        }
    }

    #[test]
    fn empty_inputs_yield_no_indexes() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(ResamplingStrategy::Systematic.indexes(&[], 3, &mut rng).is_empty());
        assert!(ResamplingStrategy::Systematic.indexes(&[1.0], 0, &mut rng).is_empty());
    }
}
