//! Benchmark target distributions.
//!
//! Each target is a plain description (dimension, parameters) that implements
//! [`LogDensity`](crate::distributions::LogDensity) and
//! [`TargetDistribution`](crate::distributions::TargetDistribution) for every backend.
//! Energy-based targets are written as free energy functions so they can be injected into an
//! [`EnergyTarget`](crate::distributions::EnergyTarget) as well.

pub mod gmm;
pub mod many_well;
pub mod two_moons;

pub use gmm::GaussianMixture;
pub use many_well::{double_well_energy, many_well_energy, ManyWell};
pub use two_moons::{two_moons_energy, TwoMoons};

use crate::distributions::{sanitized_log_prob, LogDensity};
use burn::prelude::*;

/// Mean of `log_q` over a test set, evaluated in chunks of `batch_size` rows.
///
/// Rows that fail to evaluate count as `-inf`, so a model that misses a mode is not hidden.
pub fn mean_log_prob_in_batches<B: Backend>(
    log_q: &dyn LogDensity<B>,
    test_set: Tensor<B, 2>,
    batch_size: usize,
) -> f64 {
    let [n, d] = test_set.dims();
    if n == 0 {
        return f64::NAN;
    }
    let batch_size = batch_size.max(1);
    let mut sum = 0.0;
    let mut start = 0;
    while start < n {
        let end = (start + batch_size).min(n);
        let chunk = test_set.clone().slice([start..end, 0..d]);
        let (values, _) = sanitized_log_prob(log_q, chunk);
        sum += values.iter().sum::<f64>();
        start = end;
    }
    sum / n as f64
}
