//! Statistical checks of annealed importance sampling.
//!
//! 1. `test_log_normalizer_ratio`: the mean importance weight estimates `Z_target / Z_base`.
//! 2. `test_huge_log_densities_stay_finite`: weights far outside the `f64` exponent range are
//!    handled in log space.
//! 3. `test_gaussian_mixture_weighted_estimates`: starting from a standard 2D Gaussian, weighted
//!    AIS samples with five linear stages reproduce the mean and the mode weights of a
//!    two-component mixture, with either operator.

use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use fab_mcmc::ais::AnnealedImportanceSampler;
use fab_mcmc::distributions::{
    sanitized_log_prob, tensor_from_rows, tensor_to_vec, DiagGaussian, EnergyTarget,
};
use fab_mcmc::schedule::SpacingType;
use fab_mcmc::stats::{
    effective_sample_size_fraction, log_sum_exp, self_normalized_weights, weighted_mean,
};
use fab_mcmc::targets::GaussianMixture;
use fab_mcmc::transition::{
    HmcConfig, MetropolisConfig, StepTuningMethod, TransitionOperatorConfig,
};
use ndarray::prelude::*;
use std::f64::consts::PI;
use std::sync::Arc;

type B = Autodiff<NdArray<f64>>;

fn fixed_step_hmc(epsilon: f64) -> TransitionOperatorConfig {
    TransitionOperatorConfig::Hmc(HmcConfig {
        epsilon,
        step_tuning_method: StepTuningMethod::Fixed,
        ..HmcConfig::default()
    })
}

fn sampler(
    config: &TransitionOperatorConfig,
    k: usize,
    spacing: SpacingType,
    seed: u64,
) -> AnnealedImportanceSampler<B> {
    let operator = config.build::<B>(2, k, seed).unwrap();
    AnnealedImportanceSampler::new(operator, k, &spacing)
        .unwrap()
        .with_seed(seed)
}

/// Unnormalized `N(0, 4 I)` in 2D plus a constant: `Z = 8 pi exp(offset)`.
fn wide_gaussian(offset: f64) -> EnergyTarget<B> {
    EnergyTarget::new(
        2,
        Arc::new(move |x: Tensor<B, 2>| {
            x.powf_scalar(2.0)
                .sum_dim(1)
                .squeeze::<1>(1)
                .div_scalar(8.0)
                .sub_scalar(offset)
        }),
    )
}

/// Runs AIS with `n` samples and returns `(error of log Z, 4 standard errors)`. The standard
/// error of `log Z_hat` is `sqrt((1 / ess_fraction - 1) / n)` by the delta method.
fn log_normalizer_error(n: usize, seed: u64) -> (f64, f64) {
    B::seed(seed);
    let mut ais = sampler(&fixed_step_hmc(0.5), 10, SpacingType::Linear, seed);
    let base = DiagGaussian::standard(2);
    let target = wide_gaussian(0.0);
    let (_, log_w) = ais.sample_and_log_weights(&base, &target, n, true).unwrap();

    let diagnostics = ais.last_diagnostics().unwrap();
    assert_eq!(diagnostics.stages.len(), 10);
    assert_eq!(diagnostics.attempts, 1);
    assert!(diagnostics.stages.iter().all(|s| s.step_size == 0.5));

    let log_z = log_sum_exp(log_w.view()) - (n as f64).ln();
    let ess_fraction = effective_sample_size_fraction(log_w.view());
    let se = ((1.0 / ess_fraction - 1.0) / n as f64).sqrt();
    ((log_z - (8.0 * PI).ln()).abs(), 4.0 * se + 1e-3)
}

#[test]
fn test_log_normalizer_ratio() {
    let (small_err, small_bound) = log_normalizer_error(250, 7);
    let (large_err, large_bound) = log_normalizer_error(4000, 8);
    assert!(small_err < small_bound, "error {small_err} above {small_bound} at n = 250");
    assert!(large_err < large_bound, "error {large_err} above {large_bound} at n = 4000");
    // 16 times the samples: the tolerance shrinks roughly fourfold.
    assert!(large_bound < 0.5 * small_bound, "{large_bound} vs {small_bound}");
    assert!(large_bound < 0.15);
}

#[test]
fn test_huge_log_densities_stay_finite() {
    const N: usize = 200;
    B::seed(3);
    let mut ais = sampler(&fixed_step_hmc(0.5), 4, SpacingType::Geometric, 3);
    // Same shape as the base, shifted by 5000 nats: every weight is exp(5000).
    let target = EnergyTarget::new(
        2,
        Arc::new(|x: Tensor<B, 2>| {
            x.powf_scalar(2.0)
                .sum_dim(1)
                .squeeze::<1>(1)
                .div_scalar(2.0)
                .sub_scalar(5000.0)
        }),
    );
    let base = DiagGaussian::standard(2);
    let (x, log_w) = ais.sample_and_log_weights(&base, &target, N, false).unwrap();

    assert!(log_w.iter().all(|w| w.is_finite()));
    let expected = 5000.0 + (2.0 * PI).ln();
    assert!(log_w.iter().all(|w| (w - expected).abs() < 1e-6), "{log_w}");
    let weights = self_normalized_weights(log_w.view());
    assert!((weights.sum() - 1.0).abs() < 1e-12);
    assert!((effective_sample_size_fraction(log_w.view()) - 1.0).abs() < 1e-9);
    assert!(tensor_to_vec(x).iter().all(|v| v.is_finite()));
}

fn check_mixture(config: TransitionOperatorConfig, seed: u64) {
    const N: usize = 1000;
    B::seed(seed);
    let target = GaussianMixture::new(
        array![[-1.5, 0.0], [1.5, 0.0]],
        vec![0.7, 0.7],
        vec![0.3, 0.7],
    )
    .unwrap();
    let base = DiagGaussian::standard(2);
    let mut ais = sampler(&config, 5, SpacingType::Linear, seed);
    let (x, log_w) = ais.sample_and_log_weights(&base, &target, N, false).unwrap();
    let x = Array2::from_shape_vec((N, 2), tensor_to_vec(x)).unwrap();

    let mean = weighted_mean(x.view(), log_w.view());
    assert!((mean[0] - 0.6).abs() < 0.25, "weighted mean {mean}");
    assert!(mean[1].abs() < 0.25, "weighted mean {mean}");

    // Weighted mass of the right-hand mode.
    let weights = self_normalized_weights(log_w.view());
    let right: f64 = x
        .column(0)
        .iter()
        .zip(weights.iter())
        .filter(|(x0, _)| **x0 > 0.0)
        .map(|(_, w)| w)
        .sum();
    assert!((right - 0.7).abs() < 0.1, "right mode mass {right}");

    // The heavier mode against a point ten standard deviations to its right.
    let points = tensor_from_rows::<B>(&[1.5, 0.0, 8.5, 0.0], 2, 2, &Default::default());
    let (log_p, n_bad) = sanitized_log_prob(&target, points);
    assert_eq!(n_bad, 0);
    assert!(log_p[0] > log_p[1], "{log_p:?}");
}

#[test]
fn test_gaussian_mixture_weighted_estimates_hmc() {
    check_mixture(TransitionOperatorConfig::Hmc(HmcConfig::default()), 11);
}

#[test]
fn test_gaussian_mixture_weighted_estimates_metropolis() {
    check_mixture(
        TransitionOperatorConfig::Metropolis(MetropolisConfig::default()),
        12,
    );
}
