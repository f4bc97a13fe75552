//! Log-domain weight normalization and effective sample size.
//!
//! Particle weights are accumulated as log-likelihoods. Exponentiating them directly overflows or underflows for any
//! realistic scan, so normalization is done in two passes: find the largest log weight $l_{max}$, then
//!
//! $$
//! u_i = \exp(g (l_i - l_{max})), \quad w_i = \frac{u_i}{\sum_j u_j}, \quad N_{eff} = \frac{1}{\sum_i w_i^2}
//! $$
//!
//! where $g$ is the observation gain. At least one $u_i$ equals 1, so the normalizer is always in $[1, N]$ for finite
//! input.
use crate::error::{Result, SlamError};

/// Normalized weights and the effective sample size they imply.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedWeights {
    pub weights: Vec<f64>,
    pub neff: f64,
}
impl NormalizedWeights {
    pub fn len(&self) -> usize {
        self.weights.len()
    }
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
    /// Whether the filter should resample at `threshold` (a fraction of the particle count).
    pub fn needs_resampling(&self, threshold: f64) -> bool {
        self.neff < threshold * self.weights.len() as f64
    }
}

/// Gain applied to log weights by the filter: `1 / (obs_sigma_gain * n)`.
pub fn observation_gain(obs_sigma_gain: f64, n: usize) -> f64 {
    1.0 / (obs_sigma_gain * n as f64)
}

/// Normalize log weights with the given gain.
///
/// # Errors
/// - [SlamError::EmptyParticleSet] when `log_weights` is empty.
/// - [SlamError::DegenerateWeights] when a weight is NaN, no weight is finite, or the gain is not a positive finite
///   number.
pub fn normalize_log_weights(log_weights: &[f64], gain: f64) -> Result<NormalizedWeights> {
    if log_weights.is_empty() {
        return Err(SlamError::EmptyParticleSet);
    }
    if !(gain.is_finite() && gain > 0.0) {
        return Err(SlamError::DegenerateWeights(format!("invalid gain {gain}")));
    }
    if log_weights.iter().any(|w| w.is_nan()) {
        return Err(SlamError::DegenerateWeights("NaN log weight".into()));
    }
    let lmax = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !lmax.is_finite() {
        return Err(SlamError::DegenerateWeights(format!(
            "maximum log weight is {lmax}"
        )));
    }

    let mut weights: Vec<f64> = log_weights
        .iter()
        .map(|w| (gain * (w - lmax)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(SlamError::DegenerateWeights(format!(
            "weight normalizer is {total}"
        )));
    }

    let mut sum_sq = 0.0;
    for w in weights.iter_mut() {
        *w /= total;
        sum_sq += *w * *w;
    }
    let n = weights.len() as f64;
    let neff = (1.0 / sum_sq).clamp(1.0, n);
    Ok(NormalizedWeights { weights, neff })
}

/// Effective sample size of an already normalized weight vector.
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    if sum_sq > 0.0 { 1.0 / sum_sq } else { 0.0 }
}
