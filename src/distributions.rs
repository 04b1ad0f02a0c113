/*!
Distribution capabilities consumed by the samplers, plus the small set of concrete
distributions the core needs on its own (a diagonal Gaussian base and a closure-backed
energy target).

All densities are batched: a batch is a `[n, d]` tensor and a log-density evaluation
returns one scalar per row. A whole batch may fail to evaluate with an [`EvaluationError`];
individual rows signal failure with NaN. The samplers map both to `-inf`.

# Examples

```rust
use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use fab_mcmc::distributions::{BaseDistribution, DiagGaussian, LogDensity};

type B = Autodiff<NdArray<f64>>;

let device = Default::default();
let base = DiagGaussian::standard(2);
let (x, log_q) = BaseDistribution::<B>::sample_and_log_prob(&base, 4, &device);
assert_eq!(x.dims(), [4, 2]);
assert_eq!(log_q.dims(), [4]);
let lp = LogDensity::<B>::log_prob(&base, x).unwrap();
assert_eq!(lp.dims(), [4]);
```
*/

use crate::error::{EvaluationError, FabError};
use crate::stats::finite_or_neg_inf;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

/// A batched, possibly unnormalized log-density.
pub trait LogDensity<B: Backend> {
    /// Dimension of a single sample.
    fn dim(&self) -> usize;

    /// Log-density of every row of `x` (`[n, d]` -> `[n]`).
    fn log_prob(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>, EvaluationError>;
}

/// A distribution that can also be sampled from: the start of an AIS run.
pub trait BaseDistribution<B: Backend>: LogDensity<B> {
    /// Draws `n` samples together with their (normalized) log-density.
    fn sample_and_log_prob(&self, n: usize, device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 1>);
}

/// The distribution we want to learn. Only its log-density is required.
pub trait TargetDistribution<B: Backend>: LogDensity<B> {
    /// Optional held-out points used for evaluation metrics.
    fn test_set(&self, _n: usize, _device: &B::Device) -> Option<Tensor<B, 2>> {
        None
    }

    /// Target-specific metrics of a model density `log_q`, evaluated in batches of
    /// `batch_size`. Empty unless the target knows something useful about itself.
    fn performance_metrics(
        &self,
        _log_q: &dyn LogDensity<B>,
        _batch_size: usize,
        _device: &B::Device,
    ) -> Vec<(String, f64)> {
        Vec::new()
    }
}

impl<B: Backend, T: LogDensity<B> + ?Sized> LogDensity<B> for &T {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn log_prob(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>, EvaluationError> {
        (**self).log_prob(x)
    }
}

/// Evaluates `density` on `x` and returns host-side values with every failure mapped to
/// `-inf`, together with the number of rows that failed.
pub fn sanitized_log_prob<B: Backend>(
    density: &dyn LogDensity<B>,
    x: Tensor<B, 2>,
) -> (Vec<f64>, usize) {
    let n = x.dims()[0];
    match density.log_prob(x) {
        Ok(lp) => {
            let values: Vec<f64> = tensor_to_vec(lp.detach())
                .into_iter()
                .map(finite_or_neg_inf)
                .collect();
            let n_bad = values.iter().filter(|v| **v == f64::NEG_INFINITY).count();
            (values, n_bad)
        }
        Err(e) => {
            log::debug!("whole-batch evaluation failure mapped to -inf: {e}");
            (vec![f64::NEG_INFINITY; n], n)
        }
    }
}

/// Copies a tensor to the host as `f64` values in row-major order.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f64> {
    let data = tensor.into_data();
    data.iter::<f64>().collect()
}

/// Builds a `[n, d]` tensor from row-major `f64` values.
pub fn tensor_from_rows<B: Backend>(
    values: &[f64],
    n: usize,
    d: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let elems: Vec<B::FloatElem> = values.iter().map(|v| v.elem()).collect();
    Tensor::<B, 2>::from_data(TensorData::new(elems, [n, d]), device)
}

/// Builds a `[n]` tensor from `f64` values.
pub fn tensor_from_vec<B: Backend>(values: &[f64], device: &B::Device) -> Tensor<B, 1> {
    let elems: Vec<B::FloatElem> = values.iter().map(|v| v.elem()).collect();
    Tensor::<B, 1>::from_data(TensorData::new(elems, [values.len()]), device)
}

/// `log(sum(exp(x)))` along `dim` of a 2D tensor, returned as `[n]` when reducing dim 1.
pub fn log_sum_exp_rows<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 1> {
    let max = x.clone().max_dim(1).detach();
    let shifted = (x - max.clone()).exp().sum_dim(1).log();
    (shifted + max).squeeze(1)
}

/**
A Gaussian with diagonal covariance, parameterised by its location and per-coordinate scale.

This is the wrapped base distribution used to start AIS when no flow is involved, e.g.
when building reference test sets.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct DiagGaussian {
    pub loc: Vec<f64>,
    pub scale: Vec<f64>,
}

impl DiagGaussian {
    pub fn new(loc: Vec<f64>, scale: Vec<f64>) -> crate::error::Result<Self> {
        if loc.is_empty() || loc.len() != scale.len() {
            return Err(FabError::config(format!(
                "loc and scale need the same positive length, got {} and {}",
                loc.len(),
                scale.len()
            )));
        }
        if scale.iter().any(|s| !(*s > 0.0) || !s.is_finite()) {
            return Err(FabError::config("every scale must be positive and finite"));
        }
        Ok(Self { loc, scale })
    }

    /// Standard normal in `dim` dimensions.
    pub fn standard(dim: usize) -> Self {
        Self::isotropic(dim, 1.0)
    }

    pub fn isotropic(dim: usize, scale: f64) -> Self {
        Self {
            loc: vec![0.0; dim],
            scale: vec![scale; dim],
        }
    }

    fn log_normalizer(&self) -> f64 {
        let log_det: f64 = self.scale.iter().map(|s| s.ln()).sum();
        -0.5 * self.loc.len() as f64 * (2.0 * PI).ln() - log_det
    }
}

impl<B: Backend> LogDensity<B> for DiagGaussian {
    fn dim(&self) -> usize {
        self.loc.len()
    }

    fn log_prob(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>, EvaluationError> {
        let device = x.device();
        let d = self.loc.len();
        if x.dims()[1] != d {
            return Err(EvaluationError(format!(
                "expected {d} columns, got {}",
                x.dims()[1]
            )));
        }
        let loc = tensor_from_rows::<B>(&self.loc, 1, d, &device);
        let scale = tensor_from_rows::<B>(&self.scale, 1, d, &device);
        let z = (x - loc) / scale;
        Ok(z
            .powf_scalar(2.0)
            .sum_dim(1)
            .squeeze::<1>(1)
            .mul_scalar(-0.5)
            .add_scalar(self.log_normalizer()))
    }
}

impl<B: Backend> BaseDistribution<B> for DiagGaussian {
    fn sample_and_log_prob(&self, n: usize, device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let d = self.loc.len();
        let eps = Tensor::<B, 2>::random(
            [n, d],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            device,
        );
        let log_prob = eps
            .clone()
            .powf_scalar(2.0)
            .sum_dim(1)
            .squeeze::<1>(1)
            .mul_scalar(-0.5)
            .add_scalar(self.log_normalizer());
        let loc = tensor_from_rows::<B>(&self.loc, 1, d, device);
        let scale = tensor_from_rows::<B>(&self.scale, 1, d, device);
        (eps * scale + loc, log_prob)
    }
}

impl<B: Backend> TargetDistribution<B> for DiagGaussian {
    fn test_set(&self, n: usize, device: &B::Device) -> Option<Tensor<B, 2>> {
        Some(BaseDistribution::<B>::sample_and_log_prob(self, n, device).0)
    }
}

/// Batched energy function `[n, d] -> [n]`.
pub type EnergyFn<B> = Arc<dyn Fn(Tensor<B, 2>) -> Tensor<B, 1> + Send + Sync>;

/**
A target defined by an injected energy function: `log p(x) = -E(x) / temperature`.

Well-specific energies (double well, many well, two moons) are plain functions handed to
[`EnergyTarget::new`], so new targets are built by composition rather than by layering
types on top of each other.

```rust
use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use fab_mcmc::distributions::{EnergyTarget, LogDensity};
use std::sync::Arc;

type B = Autodiff<NdArray<f64>>;

let quadratic = EnergyTarget::<B>::new(2, Arc::new(|x: Tensor<B, 2>| {
    x.powf_scalar(2.0).sum_dim(1).squeeze::<1>(1).mul_scalar(0.5)
}));
let x = Tensor::<B, 2>::from_floats([[1.0, 1.0]], &Default::default());
let lp: f64 = quadratic.log_prob(x).unwrap().into_scalar();
assert!((lp + 1.0).abs() < 1e-12);
```
*/
#[derive(Clone)]
pub struct EnergyTarget<B: Backend> {
    dim: usize,
    temperature: f64,
    energy: EnergyFn<B>,
}

impl<B: Backend> fmt::Debug for EnergyTarget<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnergyTarget")
            .field("dim", &self.dim)
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> EnergyTarget<B> {
    pub fn new(dim: usize, energy: EnergyFn<B>) -> Self {
        Self {
            dim,
            temperature: 1.0,
            energy,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn energy(&self, x: Tensor<B, 2>) -> Tensor<B, 1> {
        (self.energy)(x).div_scalar(self.temperature)
    }
}

impl<B: AutodiffBackend> EnergyTarget<B> {
    /// `-dE/dx`, computed by automatic differentiation.
    pub fn force(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = x.detach().require_grad();
        let grads = self.energy(x.clone()).sum().backward();
        match x.grad(&grads) {
            Some(g) => Tensor::<B, 2>::from_inner(g).neg(),
            None => x.zeros_like().detach(),
        }
    }
}

impl<B: Backend> LogDensity<B> for EnergyTarget<B> {
    fn dim(&self) -> usize {
        self.dim
    }

    fn log_prob(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>, EvaluationError> {
        if x.dims()[1] != self.dim {
            return Err(EvaluationError(format!(
                "expected {} columns, got {}",
                self.dim,
                x.dims()[1]
            )));
        }
        Ok(self.energy(x).neg())
    }
}

impl<B: Backend> TargetDistribution<B> for EnergyTarget<B> {}

/// The geometric bridge `(1 - beta) * log_base(x) + beta * log_target(x)`.
///
/// At `beta = 0` only the base is evaluated and at `beta = 1` only the target, so a failing
/// target cannot poison the pure-base stage (and `0 * -inf` never appears).
pub struct IntermediateDensity<'a, B: Backend> {
    pub base: &'a dyn LogDensity<B>,
    pub target: &'a dyn LogDensity<B>,
    pub beta: f64,
}

impl<'a, B: Backend> IntermediateDensity<'a, B> {
    pub fn new(base: &'a dyn LogDensity<B>, target: &'a dyn LogDensity<B>, beta: f64) -> Self {
        Self { base, target, beta }
    }
}

impl<B: Backend> LogDensity<B> for IntermediateDensity<'_, B> {
    fn dim(&self) -> usize {
        self.target.dim()
    }

    fn log_prob(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>, EvaluationError> {
        if self.beta <= 0.0 {
            self.base.log_prob(x)
        } else if self.beta >= 1.0 {
            self.target.log_prob(x)
        } else {
            let log_base = self.base.log_prob(x.clone())?;
            let log_target = self.target.log_prob(x)?;
            Ok(log_base.mul_scalar(1.0 - self.beta) + log_target.mul_scalar(self.beta))
        }
    }
}
