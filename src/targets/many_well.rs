/*!
The many-well Boltzmann target: `dim / 2` independent copies of a 2D double-well energy.

Each pair `(d, v)` of coordinates contributes `a d + b d^2 + c d^4 + v^2 / 2`. With the
default `a = 0, b = -4, c = 1` every pair has two wells near `d = +-1.7`, so the full target
has `2^(dim / 2)` modes.
*/

use super::mean_log_prob_in_batches;
use crate::ais::AnnealedImportanceSampler;
use crate::distributions::{
    tensor_from_rows, tensor_to_vec, DiagGaussian, EnergyTarget, LogDensity, TargetDistribution,
};
use crate::error::{EvaluationError, FabError, Result};
use crate::schedule::SpacingType;
use crate::stats::resample_indices;
use crate::transition::TransitionOperatorConfig;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use ndarray::prelude::*;
use rand::prelude::*;
use std::sync::Arc;

/// Position of the wells along the `d` coordinates of the mode test set.
const CENTRE: f64 = 1.7;
/// Above this dimension the full mode grid is too large and a random subset is used.
const MAX_DIM_FOR_ALL_MODES: usize = 40;
const N_RANDOM_MODES: usize = 10_000;

/// Energy of a batch of 2D points `[n, 2]` under the double well.
pub fn double_well_energy<B: Backend>(x: Tensor<B, 2>, a: f64, b: f64, c: f64) -> Tensor<B, 1> {
    let n = x.dims()[0];
    let d = x.clone().slice([0..n, 0..1]);
    let v = x.slice([0..n, 1..2]);
    let e1 = d.clone().mul_scalar(a)
        + d.clone().powf_scalar(2.0).mul_scalar(b)
        + d.powf_scalar(4.0).mul_scalar(c);
    let e2 = v.powf_scalar(2.0).mul_scalar(0.5);
    (e1 + e2).squeeze::<1>(1)
}

/// Sum of [`double_well_energy`] over consecutive coordinate pairs of `x` (`[n, 2 m]`).
pub fn many_well_energy<B: Backend>(x: Tensor<B, 2>, a: f64, b: f64, c: f64) -> Tensor<B, 1> {
    let [n, dim] = x.dims();
    let mut energy = Tensor::<B, 1>::zeros([n], &x.device());
    for i in 0..dim / 2 {
        energy = energy + double_well_energy(x.clone().slice([0..n, 2 * i..2 * i + 2]), a, b, c);
    }
    energy
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManyWell {
    dim: usize,
    a: f64,
    b: f64,
    c: f64,
    seed: u64,
    /// Weighted 2D samples of a single double well, see [`ManyWell::with_ais_test_set`].
    ais_test_set: Option<(Array2<f64>, Array1<f64>)>,
}

impl ManyWell {
    pub fn new(dim: usize) -> Result<Self> {
        if dim == 0 || dim % 2 != 0 {
            return Err(FabError::config(format!(
                "many-well dimension must be even and positive, got {dim}"
            )));
        }
        Ok(Self {
            dim,
            a: 0.0,
            b: -4.0,
            c: 1.0,
            seed: 0,
            ais_test_set: None,
        })
    }

    pub fn with_coefficients(mut self, a: f64, b: f64, c: f64) -> Self {
        self.a = a;
        self.b = b;
        self.c = c;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn n_wells(&self) -> usize {
        self.dim / 2
    }

    /// The same target expressed as an [`EnergyTarget`] with the energy injected.
    pub fn energy_target<B: Backend>(&self) -> EnergyTarget<B> {
        let (a, b, c) = (self.a, self.b, self.c);
        EnergyTarget::new(
            self.dim,
            Arc::new(move |x: Tensor<B, 2>| many_well_energy(x, a, b, c)),
        )
    }

    /// A single 2D double well as an [`EnergyTarget`].
    pub fn double_well<B: Backend>(&self) -> EnergyTarget<B> {
        let (a, b, c) = (self.a, self.b, self.c);
        EnergyTarget::new(
            2,
            Arc::new(move |x: Tensor<B, 2>| double_well_energy(x, a, b, c)),
        )
    }

    /// Mode centres: `+-1.7` on the even coordinates, `0` on the odd ones.
    ///
    /// Every one of the `2^(dim/2)` combinations below dimension 40, otherwise a random
    /// subset of 10 000 of them.
    pub fn mode_test_set(&self) -> Array2<f64> {
        let n_wells = self.n_wells();
        if self.dim < MAX_DIM_FOR_ALL_MODES {
            let n_modes = 1usize << n_wells;
            Array2::from_shape_fn((n_modes, self.dim), |(m, j)| {
                if j % 2 == 1 {
                    0.0
                } else if (m >> (j / 2)) & 1 == 1 {
                    CENTRE
                } else {
                    -CENTRE
                }
            })
        } else {
            let mut rng = SmallRng::seed_from_u64(self.seed);
            Array2::from_shape_fn((N_RANDOM_MODES, self.dim), |(_, j)| {
                if j % 2 == 1 {
                    0.0
                } else if rng.gen::<bool>() {
                    CENTRE
                } else {
                    -CENTRE
                }
            })
        }
    }

    /// Runs HMC-driven AIS from `N(0, 5^2 I)` to a single 2D double well and returns the
    /// weighted samples.
    pub fn create_2d_test_set_with_ais<B: AutodiffBackend>(
        &self,
        n_intermediate_distributions: usize,
        test_set_size: usize,
        device: &B::Device,
    ) -> Result<(Array2<f64>, Array1<f64>)> {
        let operator = TransitionOperatorConfig::default().build::<B>(
            2,
            n_intermediate_distributions,
            self.seed,
        )?;
        let mut ais =
            AnnealedImportanceSampler::new(operator, n_intermediate_distributions, &SpacingType::Linear)?
                .with_device(device.clone())
                .with_seed(self.seed);
        let base = DiagGaussian::isotropic(2, 5.0);
        let target = self.double_well::<B>();
        let (x, log_w) = ais.sample_and_log_weights(&base, &target, test_set_size, false)?;
        let x = Array2::from_shape_vec((test_set_size, 2), tensor_to_vec(x))
            .map_err(|e| FabError::Tensor(e.to_string()))?;
        Ok((x, log_w))
    }

    /// Attaches a weighted 2D test set, e.g. from
    /// [`create_2d_test_set_with_ais`](Self::create_2d_test_set_with_ais).
    pub fn with_ais_test_set(mut self, x: Array2<f64>, log_w: Array1<f64>) -> Result<Self> {
        if x.ncols() != 2 || x.nrows() != log_w.len() {
            return Err(FabError::config(
                "AIS test set must be [n, 2] with one log-weight per row",
            ));
        }
        self.ais_test_set = Some((x, log_w));
        Ok(self)
    }

    /// `batch_size` points of the full dimension, assembled pair by pair from the AIS test
    /// set resampled in proportion to its weights.
    pub fn ais_test_set_samples<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        let (x, log_w) = self
            .ais_test_set
            .as_ref()
            .ok_or_else(|| FabError::config("no AIS test set attached to the many-well target"))?;
        let n_wells = self.n_wells();
        let indices = resample_indices(log_w.view(), batch_size * n_wells, rng)?;
        let mut out = Array2::<f64>::zeros((batch_size, self.dim));
        for (j, idx) in indices.into_iter().enumerate() {
            let (row, well) = (j / n_wells, j % n_wells);
            out[[row, 2 * well]] = x[[idx, 0]];
            out[[row, 2 * well + 1]] = x[[idx, 1]];
        }
        Ok(out)
    }
}

impl<B: Backend> LogDensity<B> for ManyWell {
    fn dim(&self) -> usize {
        self.dim
    }

    fn log_prob(&self, x: Tensor<B, 2>) -> std::result::Result<Tensor<B, 1>, EvaluationError> {
        if x.dims()[1] != self.dim {
            return Err(EvaluationError(format!(
                "expected {} columns, got {}",
                self.dim,
                x.dims()[1]
            )));
        }
        Ok(many_well_energy(x, self.a, self.b, self.c).neg())
    }
}

impl<B: Backend> TargetDistribution<B> for ManyWell {
    fn test_set(&self, _n: usize, device: &B::Device) -> Option<Tensor<B, 2>> {
        let modes = self.mode_test_set();
        let values: Vec<f64> = modes.iter().copied().collect();
        Some(tensor_from_rows::<B>(&values, modes.nrows(), self.dim, device))
    }

    fn performance_metrics(
        &self,
        log_q: &dyn LogDensity<B>,
        batch_size: usize,
        device: &B::Device,
    ) -> Vec<(String, f64)> {
        let mut metrics = Vec::with_capacity(2);
        if let Some(modes) = TargetDistribution::<B>::test_set(self, 0, device) {
            metrics.push((
                "test_set_modes_mean_log_prob".to_string(),
                mean_log_prob_in_batches(log_q, modes, batch_size),
            ));
        }
        let mut rng = SmallRng::seed_from_u64(self.seed);
        if let Ok(samples) = self.ais_test_set_samples(batch_size, &mut rng) {
            let values: Vec<f64> = samples.iter().copied().collect();
            let x = tensor_from_rows::<B>(&values, batch_size, self.dim, device);
            metrics.push((
                "test_set_ais_mean_log_prob".to_string(),
                mean_log_prob_in_batches(log_q, x, batch_size),
            ));
        }
        metrics
    }
}
