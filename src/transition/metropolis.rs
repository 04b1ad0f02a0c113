//! Random-walk Metropolis transition operator.
//!
//! Every row proposes `x' = x + step_size * z` with `z ~ N(0, I)` and is accepted with
//! probability `min(1, p(x') / p(x))`. The proposal is symmetric so no correction term is
//! needed. The log-density of the current state is tracked on the host between updates, so
//! each update costs a single density evaluation.

use super::{
    accept, check_stage, check_state, select_rows, standard_normal, MoveCounts, StageState,
    StepSizeTuning, TransitionInfo, TransitionOperator, TransitionState,
};
use crate::distributions::{sanitized_log_prob, LogDensity};
use crate::error::{FabError, Result};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// Configuration of [`Metropolis`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetropolisConfig {
    /// Accept/reject rounds per call.
    pub n_updates: usize,
    /// Initial proposal standard deviation.
    pub step_size: f64,
    pub adjust_step_size: bool,
    pub tuning: StepSizeTuning,
}

impl Default for MetropolisConfig {
    fn default() -> Self {
        Self {
            n_updates: 5,
            step_size: 1.0,
            adjust_step_size: true,
            tuning: StepSizeTuning::with_target(0.5),
        }
    }
}

/// Batched Gaussian random-walk Metropolis with one step size per stage.
#[derive(Debug, Clone)]
pub struct Metropolis {
    config: MetropolisConfig,
    dim: usize,
    stages: Vec<StageState>,
    rng: SmallRng,
}

impl Metropolis {
    pub fn new(config: MetropolisConfig, dim: usize, n_stages: usize, seed: u64) -> Result<Self> {
        if config.n_updates == 0 {
            return Err(FabError::config("Metropolis requires n_updates > 0"));
        }
        if !(config.step_size > 0.0) || !config.step_size.is_finite() {
            return Err(FabError::config(format!(
                "Metropolis step size must be positive, got {}",
                config.step_size
            )));
        }
        config.tuning.validate().map_err(FabError::Configuration)?;
        Ok(Self {
            stages: vec![StageState::new(config.step_size); n_stages],
            config,
            dim,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn config(&self) -> &MetropolisConfig {
        &self.config
    }

    pub fn step_size(&self, stage: usize) -> Option<f64> {
        self.stages.get(stage).map(|s| s.step_size)
    }
}

impl<B: AutodiffBackend> TransitionOperator<B> for Metropolis {
    fn n_stages(&self) -> usize {
        self.stages.len()
    }

    fn apply(
        &mut self,
        x: Tensor<B, 2>,
        log_density: &dyn LogDensity<B>,
        stage: usize,
    ) -> Result<(Tensor<B, 2>, TransitionInfo)> {
        check_stage(&self.stages, stage)?;
        let [n, d] = x.dims();
        if d != self.dim {
            return Err(FabError::config(format!(
                "Metropolis built for dimension {}, got batch of dimension {d}",
                self.dim
            )));
        }
        let device = x.device();
        let step_size = self.stages[stage].step_size;

        let mut x = x.detach();
        let (mut logp, _) = sanitized_log_prob(log_density, x.clone());
        let mut counts = MoveCounts::default();

        for _ in 0..self.config.n_updates {
            let noise = standard_normal::<B>(&mut self.rng, n, d, &device);
            let proposed = x.clone() + noise.mul_scalar(step_size);
            let (logp_proposed, _) = sanitized_log_prob(log_density, proposed.clone());

            let mut mask = Vec::with_capacity(n);
            for i in 0..n {
                // Rows without a density move to any valid proposal but are not counted.
                let live = logp[i] != f64::NEG_INFINITY;
                let log_accept_ratio = if logp_proposed[i] == f64::NEG_INFINITY {
                    counts.non_finite += 1;
                    f64::NEG_INFINITY
                } else if !live {
                    f64::INFINITY
                } else {
                    logp_proposed[i] - logp[i]
                };
                let accepted = accept(&mut self.rng, log_accept_ratio);
                if live {
                    counts.proposed += 1;
                    counts.accepted += usize::from(accepted);
                }
                if accepted {
                    logp[i] = logp_proposed[i];
                }
                mask.push(accepted);
            }
            x = select_rows(x, proposed, mask);
        }

        let MoveCounts {
            accepted: n_accepted,
            proposed: n_proposed,
            non_finite: n_non_finite,
        } = counts;
        let state = &mut self.stages[stage];
        let p_accept = state.record(n_accepted, n_proposed, n_non_finite);
        if self.config.adjust_step_size {
            self.config.tuning.update(state, p_accept);
        }

        Ok((
            x,
            TransitionInfo {
                stage,
                p_accept,
                step_size,
                n_proposed,
                n_non_finite,
            },
        ))
    }

    fn state(&self) -> TransitionState {
        TransitionState {
            stages: self.stages.clone(),
        }
    }

    fn load_state(&mut self, state: TransitionState) -> Result<()> {
        check_state(&self.stages, &state)?;
        self.stages = state.stages;
        Ok(())
    }

    fn reseed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }
}
