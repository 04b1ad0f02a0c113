/*!
Annealed importance sampling.

Samples drawn from a base distribution are carried through `K` intermediate densities
`log p_t = (1 - beta_t) log_base + beta_t log_target` by a [`TransitionOperator`]. Before
the move at stage `t` every sample picks up the log-weight increment
`log p_t(x) - log p_{t-1}(x)`, evaluated on the sample as it was *before* the move. The
final log-weights make `exp(log_w)` an unbiased estimator of `Z_target / Z_base`.

```rust
use burn::backend::{Autodiff, NdArray};
use fab_mcmc::ais::AnnealedImportanceSampler;
use fab_mcmc::distributions::DiagGaussian;
use fab_mcmc::schedule::SpacingType;
use fab_mcmc::transition::TransitionOperatorConfig;

type B = Autodiff<NdArray<f64>>;

let operator = TransitionOperatorConfig::default().build::<B>(2, 4, 0).unwrap();
let mut ais = AnnealedImportanceSampler::new(operator, 4, &SpacingType::Linear).unwrap();
let base = DiagGaussian::standard(2);
let target = DiagGaussian::new(vec![1.0, 1.0], vec![0.5, 0.5]).unwrap();
let (x, log_w) = ais.sample_and_log_weights(&base, &target, 64, false).unwrap();
assert_eq!(x.dims(), [64, 2]);
assert_eq!(log_w.len(), 64);
```
*/

use crate::distributions::{
    sanitized_log_prob, tensor_to_vec, BaseDistribution, IntermediateDensity, LogDensity,
};
use crate::error::{FabError, Result};
use crate::schedule::{beta_schedule, SpacingType};
use crate::stats::effective_sample_size;
use crate::transition::{TransitionOperator, TransitionState};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use ndarray::prelude::*;

/// A failing batch is tried this many times before giving up.
const MAX_ATTEMPTS: usize = 2;

/// What happened at one stage of an AIS call.
#[derive(Debug, Clone, PartialEq)]
pub struct AisStageDiagnostics {
    pub stage: usize,
    pub beta: f64,
    /// Mean of the finite log-weight increments of this stage.
    pub mean_increment: f64,
    /// Increments that were NaN/Inf and were turned into zero weight.
    pub n_non_finite_weights: usize,
    pub p_accept: f64,
    pub step_size: f64,
    /// Proposals rejected because they evaluated to NaN/Inf.
    pub n_non_finite_proposals: usize,
}

/// Trajectory record of the most recent logged [`AnnealedImportanceSampler`] call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AisDiagnostics {
    pub stages: Vec<AisStageDiagnostics>,
    pub n_samples: usize,
    pub attempts: usize,
    pub effective_sample_size: f64,
}

/// Drives samples from a base to a target distribution and accumulates their log-weights.
pub struct AnnealedImportanceSampler<B: AutodiffBackend> {
    operator: Box<dyn TransitionOperator<B>>,
    betas: Vec<f64>,
    device: B::Device,
    seed: u64,
    last_diagnostics: Option<AisDiagnostics>,
}

impl<B: AutodiffBackend> AnnealedImportanceSampler<B> {
    /// Creates a sampler with `n_intermediate_distributions` stages.
    ///
    /// The operator must have been built for the same number of stages.
    pub fn new(
        operator: Box<dyn TransitionOperator<B>>,
        n_intermediate_distributions: usize,
        spacing: &SpacingType,
    ) -> Result<Self> {
        let betas = beta_schedule(spacing, n_intermediate_distributions)?;
        if operator.n_stages() != n_intermediate_distributions {
            return Err(FabError::config(format!(
                "transition operator has {} stages but AIS uses {} intermediate distributions",
                operator.n_stages(),
                n_intermediate_distributions
            )));
        }
        Ok(Self {
            operator,
            betas,
            device: Default::default(),
            seed: 0,
            last_diagnostics: None,
        })
    }

    pub fn with_device(mut self, device: B::Device) -> Self {
        self.device = device;
        self
    }

    /// Seed used to derive a fresh operator seed when a batch has to be retried.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn n_intermediate_distributions(&self) -> usize {
        self.betas.len() - 1
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn transition_state(&self) -> TransitionState {
        self.operator.state()
    }

    pub fn load_transition_state(&mut self, state: TransitionState) -> Result<()> {
        self.operator.load_state(state)
    }

    pub fn last_diagnostics(&self) -> Option<&AisDiagnostics> {
        self.last_diagnostics.as_ref()
    }

    /// Runs AIS for `n_samples` samples and returns the final batch with its log-weights.
    ///
    /// Samples whose weight becomes NaN/Inf are kept with a weight of zero (`-inf`). If
    /// every sample ends up with zero weight the operator is reseeded and the batch is run
    /// once more before [`FabError::BatchEvaluation`] is returned. With `logging` set the
    /// per-stage trajectory is kept in [`last_diagnostics`](Self::last_diagnostics).
    pub fn sample_and_log_weights<D: BaseDistribution<B>>(
        &mut self,
        base: &D,
        target: &dyn LogDensity<B>,
        n_samples: usize,
        logging: bool,
    ) -> Result<(Tensor<B, 2>, Array1<f64>)> {
        if n_samples == 0 {
            return Err(FabError::config("AIS needs at least one sample"));
        }
        if base.dim() != target.dim() {
            return Err(FabError::config(format!(
                "base dimension {} does not match target dimension {}",
                base.dim(),
                target.dim()
            )));
        }

        for attempt in 1..=MAX_ATTEMPTS {
            let (x, log_w, stages) = self.run_once(base, target, n_samples, logging)?;
            if log_w.iter().any(|w| *w > f64::NEG_INFINITY) {
                if logging {
                    let diagnostics = AisDiagnostics {
                        stages,
                        n_samples,
                        attempts: attempt,
                        effective_sample_size: effective_sample_size(log_w.view()),
                    };
                    log::debug!(
                        "AIS finished after {attempt} attempt(s), ESS {:.2} of {n_samples}",
                        diagnostics.effective_sample_size
                    );
                    self.last_diagnostics = Some(diagnostics);
                }
                return Ok((x, log_w));
            }
            let retry_seed = self
                .seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(attempt as u64);
            log::warn!(
                "every AIS sample has zero weight (attempt {attempt}), reseeding with {retry_seed}"
            );
            self.operator.reseed(retry_seed);
            B::seed(retry_seed);
        }
        Err(FabError::BatchEvaluation {
            n_samples,
            attempts: MAX_ATTEMPTS,
        })
    }

    fn run_once<D: BaseDistribution<B>>(
        &mut self,
        base: &D,
        target: &dyn LogDensity<B>,
        n_samples: usize,
        logging: bool,
    ) -> Result<(Tensor<B, 2>, Array1<f64>, Vec<AisStageDiagnostics>)> {
        let base_density: &dyn LogDensity<B> = base;
        let (x, log_q) = base.sample_and_log_prob(n_samples, &self.device);
        let mut x = x.detach();
        let mut log_base = tensor_to_vec(log_q.detach());
        let (mut log_target, _) = sanitized_log_prob(target, x.clone());

        // beta_0 = 0: the base density cancels and every sample starts with weight one.
        let mut log_w = Array1::<f64>::zeros(n_samples);
        let mut stages = Vec::with_capacity(if logging { self.betas.len() - 1 } else { 0 });

        for t in 1..self.betas.len() {
            let delta = self.betas[t] - self.betas[t - 1];
            let mut n_bad = 0;
            let mut sum = 0.0;
            let mut n_finite = 0;
            for (i, w) in log_w.iter_mut().enumerate() {
                if *w == f64::NEG_INFINITY {
                    continue;
                }
                let increment = if delta == 0.0 {
                    0.0
                } else {
                    delta * (log_target[i] - log_base[i])
                };
                if increment.is_finite() {
                    *w += increment;
                    sum += increment;
                    n_finite += 1;
                } else {
                    *w = f64::NEG_INFINITY;
                    n_bad += 1;
                }
            }

            let density = IntermediateDensity::new(base_density, target, self.betas[t]);
            let (x_new, info) = self.operator.apply(x, &density, t - 1)?;
            x = x_new;

            // The last stage needs no further increments.
            if t + 1 < self.betas.len() {
                log_base = sanitized_log_prob(base_density, x.clone()).0;
                log_target = sanitized_log_prob(target, x.clone()).0;
            }

            if n_bad > 0 {
                log::debug!("AIS stage {t}: {n_bad} non-finite weight increments set to zero weight");
            }
            if logging {
                let mean_increment = if n_finite > 0 {
                    sum / n_finite as f64
                } else {
                    f64::NAN
                };
                log::debug!(
                    "AIS stage {t}: beta {:.4}, mean increment {mean_increment:.4}, p_accept {:.3}, step size {:.4}",
                    self.betas[t],
                    info.p_accept,
                    info.step_size
                );
                stages.push(AisStageDiagnostics {
                    stage: t,
                    beta: self.betas[t],
                    mean_increment,
                    n_non_finite_weights: n_bad,
                    p_accept: info.p_accept,
                    step_size: info.step_size,
                    n_non_finite_proposals: info.n_non_finite,
                });
            }
        }
        Ok((x, log_w, stages))
    }
}
