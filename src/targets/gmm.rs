//! Gaussian mixture target with isotropic components.

use crate::distributions::{log_sum_exp_rows, tensor_from_rows, LogDensity, TargetDistribution};
use crate::error::{EvaluationError, FabError, Result};
use burn::prelude::*;
use ndarray::prelude::*;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

/// Mixture of isotropic Gaussians `sum_k pi_k N(mean_k, scale_k^2 I)`.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMixture {
    /// `[n_components, dim]`
    means: Array2<f64>,
    scales: Array1<f64>,
    log_weights: Array1<f64>,
    /// Seed of the exact-sample test set.
    seed: u64,
}

impl GaussianMixture {
    /// Builds a mixture from explicit parameters. Weights are normalized.
    pub fn new(means: Array2<f64>, scales: Vec<f64>, weights: Vec<f64>) -> Result<Self> {
        let k = means.nrows();
        if k == 0 || means.ncols() == 0 {
            return Err(FabError::config("a mixture needs at least one component and dim > 0"));
        }
        if scales.len() != k || weights.len() != k {
            return Err(FabError::config(format!(
                "{k} components but {} scales and {} weights",
                scales.len(),
                weights.len()
            )));
        }
        if scales.iter().any(|s| !(*s > 0.0) || !s.is_finite()) {
            return Err(FabError::config("mixture scales must be positive"));
        }
        if weights.iter().any(|w| !(*w >= 0.0) || !w.is_finite()) {
            return Err(FabError::config("mixture weights must be non-negative"));
        }
        let total: f64 = weights.iter().sum();
        if !(total > 0.0) {
            return Err(FabError::config("mixture weights sum to zero"));
        }
        Ok(Self {
            means,
            scales: Array1::from(scales),
            log_weights: weights.iter().map(|w| (w / total).ln()).collect(),
            seed: 0,
        })
    }

    /// Random mixture as used by the GMM benchmark: equally weighted components with means
    /// uniform in `[-loc_scaling, loc_scaling]^dim` and variance `softplus(log_var_scaling)`.
    pub fn random(
        dim: usize,
        n_mixes: usize,
        loc_scaling: f64,
        log_var_scaling: f64,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let means = Array2::from_shape_fn((n_mixes, dim), |_| {
            rng.gen_range(-1.0..=1.0) * loc_scaling
        });
        let variance = softplus(log_var_scaling);
        let mut gmm = Self::new(means, vec![variance.sqrt(); n_mixes], vec![1.0; n_mixes])?;
        gmm.seed = seed;
        Ok(gmm)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn n_components(&self) -> usize {
        self.means.nrows()
    }

    pub fn means(&self) -> ArrayView2<'_, f64> {
        self.means.view()
    }

    /// Mean of the mixture, `sum_k pi_k mean_k`.
    pub fn mixture_mean(&self) -> Array1<f64> {
        let w = self.log_weights.mapv(f64::exp);
        self.means.t().dot(&w)
    }

    /// Exact samples, returned on the host.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Array2<f64>> {
        let component = WeightedIndex::new(self.log_weights.iter().map(|lw| lw.exp()))
            .map_err(|e| FabError::config(format!("invalid mixture weights: {e}")))?;
        let d = self.means.ncols();
        let mut out = Array2::<f64>::zeros((n, d));
        for mut row in out.rows_mut() {
            let k = component.sample(rng);
            for (j, v) in row.iter_mut().enumerate() {
                let z: f64 = rng.sample(StandardNormal);
                *v = self.means[[k, j]] + self.scales[k] * z;
            }
        }
        Ok(out)
    }
}

fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

impl<B: Backend> LogDensity<B> for GaussianMixture {
    fn dim(&self) -> usize {
        self.means.ncols()
    }

    fn log_prob(&self, x: Tensor<B, 2>) -> std::result::Result<Tensor<B, 1>, EvaluationError> {
        let [n, d] = x.dims();
        if d != self.means.ncols() {
            return Err(EvaluationError(format!(
                "expected {} columns, got {d}",
                self.means.ncols()
            )));
        }
        let k = self.means.nrows();
        let device = x.device();
        let means_host: Vec<f64> = self.means.iter().copied().collect();
        let means = tensor_from_rows::<B>(&means_host, k, d, &device);

        let inv_var: Vec<f64> = self.scales.iter().map(|s| 1.0 / (s * s)).collect();
        let log_norm: Vec<f64> = self
            .scales
            .iter()
            .zip(self.log_weights.iter())
            .map(|(s, lw)| lw - 0.5 * d as f64 * (2.0 * PI).ln() - d as f64 * s.ln())
            .collect();
        let inv_var = tensor_from_rows::<B>(&inv_var, 1, k, &device);
        let log_norm = tensor_from_rows::<B>(&log_norm, 1, k, &device);

        // [n, 1, d] - [1, k, d] -> [n, k]
        let sq_dist = (x.unsqueeze_dim::<3>(1) - means.unsqueeze_dim::<3>(0))
            .powf_scalar(2.0)
            .sum_dim(2)
            .reshape([n, k]);
        let per_component = sq_dist.mul(inv_var).mul_scalar(-0.5) + log_norm;
        Ok(log_sum_exp_rows(per_component))
    }
}

impl<B: Backend> TargetDistribution<B> for GaussianMixture {
    fn test_set(&self, n: usize, device: &B::Device) -> Option<Tensor<B, 2>> {
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let samples = self.sample(n, &mut rng).ok()?;
        let values: Vec<f64> = samples.iter().copied().collect();
        Some(tensor_from_rows::<B>(&values, n, self.means.ncols(), device))
    }
}
