/*!
MCMC transition operators used at each stage of annealed importance sampling.

An operator moves a whole batch of samples while leaving a given (unnormalized) log-density
invariant, and keeps one set of adaptive parameters per intermediate distribution. Two
operators are provided:

- [`HamiltonianMonteCarlo`]: gradient-based proposals via leapfrog integration, gradients
  obtained through `burn` autodiff.
- [`Metropolis`]: isotropic Gaussian random-walk proposals, no gradients required.

Operators are chosen through the closed [`TransitionOperatorConfig`] enum and resolved once
with [`TransitionOperatorConfig::build`].

```rust
use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use fab_mcmc::distributions::DiagGaussian;
use fab_mcmc::transition::{HmcConfig, TransitionOperatorConfig};

type B = Autodiff<NdArray<f64>>;

let config = TransitionOperatorConfig::Hmc(HmcConfig::default());
let mut operator = config.build::<B>(2, 3, 42).unwrap();
let density = DiagGaussian::standard(2);
let x = Tensor::<B, 2>::zeros([8, 2], &Default::default());
let (x_new, info) = operator.apply(x, &density, 0).unwrap();
assert_eq!(x_new.dims(), [8, 2]);
assert_eq!(info.stage, 0);
```
*/

pub mod hmc;
pub mod metropolis;
pub mod tuning;

pub use hmc::{HamiltonianMonteCarlo, HmcConfig, StepTuningMethod};
pub use metropolis::{Metropolis, MetropolisConfig};
pub use tuning::{StageState, StepSizeTuning};

use crate::distributions::{tensor_from_rows, tensor_to_vec, LogDensity};
use crate::error::{FabError, Result};
use crate::stats::finite_or_neg_inf;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::prelude::*;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Diagnostics of a single [`TransitionOperator::apply`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionInfo {
    pub stage: usize,
    /// Fraction of accepted proposals in this call; NaN when no row had a finite density.
    pub p_accept: f64,
    /// Step size in effect during this call (before any tuning update).
    pub step_size: f64,
    /// Proposals made from rows with a finite density.
    pub n_proposed: usize,
    pub n_non_finite: usize,
}

/// Acceptance bookkeeping of one or more moves. Only rows that started with a finite
/// density count as proposals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MoveCounts {
    pub accepted: usize,
    pub proposed: usize,
    pub non_finite: usize,
}

impl std::ops::AddAssign for MoveCounts {
    fn add_assign(&mut self, other: Self) {
        self.accepted += other.accepted;
        self.proposed += other.proposed;
        self.non_finite += other.non_finite;
    }
}

/// Everything an operator needs to resume exactly where it left off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionState {
    pub stages: Vec<StageState>,
}

/// A batched MCMC kernel that leaves `log_density` invariant.
pub trait TransitionOperator<B: AutodiffBackend> {
    /// Number of intermediate distributions this operator keeps tuning state for.
    fn n_stages(&self) -> usize;

    /// Moves every row of `x` with `log_density` as the invariant density, using (and
    /// possibly tuning) the parameters of `stage`.
    ///
    /// Rows whose proposals evaluate to NaN/Inf, or whose density fails to evaluate, are
    /// rejected and keep their current value.
    fn apply(
        &mut self,
        x: Tensor<B, 2>,
        log_density: &dyn LogDensity<B>,
        stage: usize,
    ) -> Result<(Tensor<B, 2>, TransitionInfo)>;

    fn state(&self) -> TransitionState;

    /// Replaces the tuning state, e.g. when resuming from a checkpoint.
    fn load_state(&mut self, state: TransitionState) -> Result<()>;

    /// Re-seeds the random number generator.
    fn reseed(&mut self, seed: u64);
}

/// The known operator kinds and their configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionOperatorConfig {
    Hmc(HmcConfig),
    Metropolis(MetropolisConfig),
}

impl Default for TransitionOperatorConfig {
    fn default() -> Self {
        TransitionOperatorConfig::Hmc(HmcConfig::default())
    }
}

impl TransitionOperatorConfig {
    /// Validates the configuration and instantiates the operator for `n_stages`
    /// intermediate distributions over `dim`-dimensional samples.
    pub fn build<B: AutodiffBackend>(
        &self,
        dim: usize,
        n_stages: usize,
        seed: u64,
    ) -> Result<Box<dyn TransitionOperator<B>>> {
        if dim == 0 || n_stages == 0 {
            return Err(FabError::config(
                "transition operator needs dim > 0 and at least one stage",
            ));
        }
        Ok(match self {
            TransitionOperatorConfig::Hmc(config) => {
                Box::new(HamiltonianMonteCarlo::new(config.clone(), dim, n_stages, seed)?)
            }
            TransitionOperatorConfig::Metropolis(config) => {
                Box::new(Metropolis::new(config.clone(), dim, n_stages, seed)?)
            }
        })
    }
}

pub(crate) fn check_stage(stages: &[StageState], stage: usize) -> Result<()> {
    if stage >= stages.len() {
        return Err(FabError::config(format!(
            "stage {stage} out of range: operator was built for {} stages",
            stages.len()
        )));
    }
    Ok(())
}

pub(crate) fn check_state(current: &[StageState], new: &TransitionState) -> Result<()> {
    if current.len() != new.stages.len() {
        return Err(FabError::config(format!(
            "tuning state has {} stages, operator has {}",
            new.stages.len(),
            current.len()
        )));
    }
    if new.stages.iter().any(|s| !(s.step_size > 0.0)) {
        return Err(FabError::config("tuning state contains a non-positive step size"));
    }
    Ok(())
}

/// `[n, d]` standard normal draws from the operator's own generator.
pub(crate) fn standard_normal<B: Backend>(
    rng: &mut SmallRng,
    n: usize,
    d: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let values: Vec<f64> = (0..n * d).map(|_| rng.sample(StandardNormal)).collect();
    tensor_from_rows::<B>(&values, n, d, device)
}

/// Log-density (host side, failures mapped to `-inf`) and its gradient with respect to `x`.
///
/// A whole-batch evaluation failure yields `-inf` everywhere and a zero gradient.
pub(crate) fn log_density_and_grad<B: AutodiffBackend>(
    log_density: &dyn LogDensity<B>,
    x: Tensor<B, 2>,
) -> (Vec<f64>, Tensor<B, 2>) {
    let n = x.dims()[0];
    let x = x.detach().require_grad();
    match log_density.log_prob(x.clone()) {
        Ok(logp) => {
            let grads = logp.clone().sum().backward();
            let grad = match x.grad(&grads) {
                Some(g) => Tensor::<B, 2>::from_inner(g),
                None => x.zeros_like().detach(),
            };
            let values = tensor_to_vec(logp.detach())
                .into_iter()
                .map(finite_or_neg_inf)
                .collect();
            (values, grad)
        }
        Err(e) => {
            log::debug!("gradient evaluation failed for the whole batch: {e}");
            (vec![f64::NEG_INFINITY; n], x.zeros_like().detach())
        }
    }
}

/// Metropolis decision for one row given the log acceptance ratio.
///
/// A NaN ratio is a rejection. `ln(u) < ratio` for `u ~ U(0, 1)`.
pub(crate) fn accept(rng: &mut SmallRng, log_accept_ratio: f64) -> bool {
    if log_accept_ratio.is_nan() {
        return false;
    }
    let u: f64 = rng.gen();
    u.ln() < log_accept_ratio
}

/// Keeps the rows of `current` where `mask` is false and takes `proposed` elsewhere.
pub(crate) fn select_rows<B: Backend>(
    current: Tensor<B, 2>,
    proposed: Tensor<B, 2>,
    mask: Vec<bool>,
) -> Tensor<B, 2> {
    let [n, d] = current.dims();
    let device = current.device();
    let mask = Tensor::<B, 1, Bool>::from_data(TensorData::new(mask, [n]), &device)
        .unsqueeze_dim::<2>(1)
        .expand([n, d]);
    current.mask_where(mask, proposed).detach()
}
