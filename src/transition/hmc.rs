//! Batched Hamiltonian Monte Carlo transition operator using the `burn` crate for autodiff.
//!
//! Every row of the batch is an independent chain. One move draws a standard normal momentum,
//! simulates Hamiltonian dynamics with the leapfrog integrator using the gradient of the
//! current intermediate log-density, and accepts or rejects each row with the Metropolis
//! criterion on the joint Hamiltonian `-log p(x) + |p|^2 / 2`. The criterion makes the
//! operator exact for any step size and number of leapfrog steps; those only affect how far
//! the chains travel.
//!
//! Each intermediate distribution keeps its own step size, tuned towards a target
//! acceptance probability (the `p_accept` method). Every row integrates with the stage step
//! size scaled by an independent uniform factor in `[1 - step_jitter, 1 + step_jitter]`,
//! which keeps the acceptance rate from spiking right below the leapfrog stability limit.

use super::{
    accept, check_stage, check_state, log_density_and_grad, select_rows, standard_normal,
    MoveCounts, StageState, StepSizeTuning, TransitionInfo, TransitionOperator,
    TransitionState,
};
use crate::distributions::{tensor_from_rows, tensor_to_vec, LogDensity};
use crate::error::{FabError, Result};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// How the leapfrog step size is adapted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepTuningMethod {
    /// Move the step size towards a target acceptance probability after every call.
    #[default]
    PAccept,
    /// Keep the initial step size.
    Fixed,
}

/// Configuration of [`HamiltonianMonteCarlo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HmcConfig {
    /// Number of full HMC moves per call.
    pub n_outer: usize,
    /// Initial leapfrog step size.
    pub epsilon: f64,
    /// Leapfrog steps per move.
    #[serde(alias = "L")]
    pub n_leapfrog: usize,
    /// Relative half-width of the per-row step-size jitter, in `[0, 1)`.
    pub step_jitter: f64,
    pub step_tuning_method: StepTuningMethod,
    pub tuning: StepSizeTuning,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            n_outer: 1,
            epsilon: 1.0,
            n_leapfrog: 5,
            step_jitter: 0.2,
            step_tuning_method: StepTuningMethod::PAccept,
            tuning: StepSizeTuning::with_target(0.65),
        }
    }
}

/// A data-parallel Hamiltonian Monte Carlo transition operator.
#[derive(Debug, Clone)]
pub struct HamiltonianMonteCarlo {
    config: HmcConfig,
    dim: usize,
    stages: Vec<StageState>,
    rng: SmallRng,
}

impl HamiltonianMonteCarlo {
    /// Creates an operator for `n_stages` intermediate distributions over `dim` dimensions.
    pub fn new(config: HmcConfig, dim: usize, n_stages: usize, seed: u64) -> Result<Self> {
        if config.n_outer == 0 || config.n_leapfrog == 0 {
            return Err(FabError::config(
                "HMC requires n_outer > 0 and n_leapfrog > 0",
            ));
        }
        if !(config.epsilon > 0.0) || !config.epsilon.is_finite() {
            return Err(FabError::config(format!(
                "HMC step size must be positive, got {}",
                config.epsilon
            )));
        }
        if !(0.0..1.0).contains(&config.step_jitter) {
            return Err(FabError::config(format!(
                "HMC step_jitter must be in [0, 1), got {}",
                config.step_jitter
            )));
        }
        config.tuning.validate().map_err(FabError::Configuration)?;
        let stages = vec![StageState::new(config.epsilon); n_stages];
        Ok(Self {
            config,
            dim,
            stages,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn config(&self) -> &HmcConfig {
        &self.config
    }

    pub fn step_size(&self, stage: usize) -> Option<f64> {
        self.stages.get(stage).map(|s| s.step_size)
    }

    /// One HMC move for every row.
    ///
    /// Rows whose current log-density is `-inf` move to any finite proposal but are left out
    /// of the acceptance counts, so they cannot bias the step-size tuning.
    fn step<B: AutodiffBackend>(
        &mut self,
        x: Tensor<B, 2>,
        log_density: &dyn LogDensity<B>,
        step_size: f64,
    ) -> (Tensor<B, 2>, MoveCounts) {
        let [n, d] = x.dims();
        let device = x.device();

        // 1) Sample momenta: shape [n, d]
        let momentum_0 = standard_normal::<B>(&mut self.rng, n, d, &device);

        let (logp_current, grad_current) = log_density_and_grad(log_density, x.clone());
        let ke_current = kinetic_energy(momentum_0.clone());

        // 2) Run the leapfrog integrator with a jittered step size per row.
        let jitter = self.config.step_jitter;
        let row_steps: Vec<f64> = (0..n)
            .map(|_| step_size * (1.0 + jitter * self.rng.gen_range(-1.0..=1.0)))
            .collect();
        let step = tensor_from_rows::<B>(&row_steps, n, 1, &device).repeat_dim(1, d);
        let (proposed, momentum, logp_proposed) =
            self.leapfrog(x.clone(), momentum_0, grad_current, log_density, step);
        let ke_proposed = kinetic_energy(momentum);

        // 3) Accept/reject each row on the joint Hamiltonian.
        let mut counts = MoveCounts::default();
        let mut mask = Vec::with_capacity(n);
        for i in 0..n {
            let h_current = -logp_current[i] + ke_current[i];
            let h_proposed = -logp_proposed[i] + ke_proposed[i];
            let live = h_current.is_finite();
            let log_accept_ratio = if !h_proposed.is_finite() {
                counts.non_finite += 1;
                f64::NEG_INFINITY
            } else if !live {
                f64::INFINITY
            } else {
                h_current - h_proposed
            };
            let accepted = accept(&mut self.rng, log_accept_ratio);
            if live {
                counts.proposed += 1;
                counts.accepted += usize::from(accepted);
            }
            mask.push(accepted);
        }

        (select_rows(x, proposed, mask), counts)
    }

    /// Leapfrog integration of `n_leapfrog` steps, starting from a known gradient. `step`
    /// holds the step size of every entry and has the shape of `pos`.
    ///
    /// Returns the final position, final momentum and the log-density at the final position.
    fn leapfrog<B: AutodiffBackend>(
        &self,
        mut pos: Tensor<B, 2>,
        mut mom: Tensor<B, 2>,
        mut grad: Tensor<B, 2>,
        log_density: &dyn LogDensity<B>,
        step: Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>, Vec<f64>) {
        let half = step.clone().mul_scalar(0.5);
        let mut logp = Vec::new();
        for _ in 0..self.config.n_leapfrog {
            mom = mom + grad.mul(half.clone());
            pos = (pos + mom.clone().mul(step.clone())).detach();
            let (new_logp, new_grad) = log_density_and_grad(log_density, pos.clone());
            mom = (mom + new_grad.clone().mul(half.clone())).detach();
            logp = new_logp;
            grad = new_grad;
        }
        (pos, mom, logp)
    }
}

/// `0.5 * |p|^2` per row, on the host.
fn kinetic_energy<B: Backend>(momentum: Tensor<B, 2>) -> Vec<f64> {
    tensor_to_vec(
        momentum
            .powf_scalar(2.0)
            .sum_dim(1)
            .squeeze::<1>(1)
            .mul_scalar(0.5),
    )
}

impl<B: AutodiffBackend> TransitionOperator<B> for HamiltonianMonteCarlo {
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
        let d = x.dims()[1];
        if d != self.dim {
            return Err(FabError::config(format!(
                "HMC built for dimension {}, got batch of dimension {d}",
                self.dim
            )));
        }
        let step_size = self.stages[stage].step_size;

        let mut x = x.detach();
        let mut counts = MoveCounts::default();
        for _ in 0..self.config.n_outer {
            let (x_new, step_counts) = self.step(x, log_density, step_size);
            x = x_new;
            counts += step_counts;
        }
        let MoveCounts {
            accepted: n_accepted,
            proposed: n_proposed,
            non_finite: n_non_finite,
        } = counts;

        let state = &mut self.stages[stage];
        let p_accept = state.record(n_accepted, n_proposed, n_non_finite);
        if self.config.step_tuning_method == StepTuningMethod::PAccept {
            self.config.tuning.update(state, p_accept);
        }
        if n_non_finite > 0 {
            log::debug!("HMC stage {stage}: rejected {n_non_finite} non-finite proposals");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{DiagGaussian, EnergyTarget};
    use crate::error::EvaluationError;
    use burn::backend::{Autodiff, NdArray};
    use std::sync::Arc;

    type B = Autodiff<NdArray<f64>>;

    fn fixed(epsilon: f64, n_leapfrog: usize) -> HmcConfig {
        HmcConfig {
            epsilon,
            n_leapfrog,
            step_tuning_method: StepTuningMethod::Fixed,
            ..HmcConfig::default()
        }
    }

    #[test]
    fn test_tiny_step_accepts_almost_everything() {
        let mut hmc = HamiltonianMonteCarlo::new(fixed(1e-3, 3), 2, 1, 42).unwrap();
        let density = DiagGaussian::standard(2);
        let x = Tensor::<B, 2>::ones([200, 2], &Default::default());
        let (_, info) = TransitionOperator::<B>::apply(&mut hmc, x, &density, 0).unwrap();
        assert!(info.p_accept > 0.99, "p_accept = {}", info.p_accept);
        assert_eq!(info.n_proposed, 200);
    }

    #[test]
    fn test_rejected_rows_keep_their_values() {
        // The density is -inf everywhere except near the origin, so every move away fails.
        let wall = EnergyTarget::<B>::new(
            1,
            Arc::new(|x: Tensor<B, 2>| {
                let r = x.abs().squeeze::<1>(1);
                let inside = r.clone().lower_elem(1e-9);
                r.zeros_like().mask_fill(inside.bool_not(), f64::INFINITY)
            }),
        );
        let mut hmc = HamiltonianMonteCarlo::new(fixed(0.5, 2), 1, 1, 7).unwrap();
        let x = Tensor::<B, 2>::zeros([10, 1], &Default::default());
        let (x_new, info) = TransitionOperator::<B>::apply(&mut hmc, x, &wall, 0).unwrap();
        assert_eq!(info.p_accept, 0.0);
        assert!(tensor_to_vec(x_new).iter().all(|v| *v == 0.0));
    }

    struct AlwaysFails;

    impl LogDensity<B> for AlwaysFails {
        fn dim(&self) -> usize {
            2
        }

        fn log_prob(&self, _x: Tensor<B, 2>) -> std::result::Result<Tensor<B, 1>, EvaluationError> {
            Err(EvaluationError("boom".into()))
        }
    }

    #[test]
    fn test_failing_density_does_not_corrupt_batch() {
        let mut hmc = HamiltonianMonteCarlo::new(HmcConfig::default(), 2, 1, 3).unwrap();
        let x = Tensor::<B, 2>::from_floats([[1.0, 2.0], [3.0, 4.0]], &Default::default());
        let (x_new, info) =
            TransitionOperator::<B>::apply(&mut hmc, x, &AlwaysFails, 0).unwrap();
        assert_eq!(tensor_to_vec(x_new), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(info.n_non_finite, 2);
        // Rows without a density are not counted, so there is no rate and no tuning.
        assert_eq!(info.n_proposed, 0);
        assert!(info.p_accept.is_nan());
        assert_eq!(hmc.step_size(0), Some(1.0));
        assert_eq!(TransitionOperator::<B>::state(&hmc).stages[0].p_accept, None);
    }

    #[test]
    fn test_rows_without_density_are_not_counted() {
        // Finite density on x > 0 only. Rows starting at x < 0 are dead and either move into
        // the support or stay put, without counting as acceptances.
        let half_line = EnergyTarget::<B>::new(
            1,
            Arc::new(|x: Tensor<B, 2>| {
                let x = x.squeeze::<1>(1);
                let outside = x.clone().lower_equal_elem(0.0);
                x.powf_scalar(2.0).mul_scalar(0.5).mask_fill(outside, f64::INFINITY)
            }),
        );
        let mut hmc = HamiltonianMonteCarlo::new(fixed(0.5, 3), 1, 1, 9).unwrap();
        let x = Tensor::<B, 2>::from_floats([[-5.0], [-6.0], [-7.0], [-8.0]], &Default::default());
        let (_, info) = TransitionOperator::<B>::apply(&mut hmc, x, &half_line, 0).unwrap();
        assert_eq!(info.n_proposed, 0);
        assert!(info.p_accept.is_nan());
        assert_eq!(TransitionOperator::<B>::state(&hmc).stages[0].n_accepted, 0);
    }

    #[test]
    fn test_fresh_state_roundtrip() {
        let hmc = HamiltonianMonteCarlo::new(HmcConfig::default(), 2, 2, 5).unwrap();
        let state = TransitionOperator::<B>::state(&hmc);
        let json = serde_json::to_string(&state).unwrap();
        let restored: TransitionState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
        let mut other = HamiltonianMonteCarlo::new(HmcConfig::default(), 2, 2, 6).unwrap();
        TransitionOperator::<B>::load_state(&mut other, restored).unwrap();
        assert_eq!(TransitionOperator::<B>::state(&other), state);
    }

    #[test]
    fn test_step_sizes_are_tuned_per_stage() {
        let mut hmc = HamiltonianMonteCarlo::new(HmcConfig::default(), 2, 2, 11).unwrap();
        let density = DiagGaussian::standard(2);
        let x = Tensor::<B, 2>::zeros([100, 2], &Default::default());
        let _ = TransitionOperator::<B>::apply(&mut hmc, x, &density, 1).unwrap();
        assert_eq!(hmc.step_size(0), Some(1.0));
        assert_ne!(hmc.step_size(1), Some(1.0));
    }

    #[test]
    fn test_invalid_config_and_stage() {
        assert!(HamiltonianMonteCarlo::new(fixed(0.0, 5), 2, 1, 0).is_err());
        assert!(HamiltonianMonteCarlo::new(fixed(1.0, 0), 2, 1, 0).is_err());
        for step_jitter in [-0.1, 1.0, f64::NAN] {
            let config = HmcConfig {
                step_jitter,
                ..HmcConfig::default()
            };
            assert!(HamiltonianMonteCarlo::new(config, 2, 1, 0).is_err());
        }
        let mut hmc = HamiltonianMonteCarlo::new(HmcConfig::default(), 2, 1, 0).unwrap();
        let x = Tensor::<B, 2>::zeros([4, 2], &Default::default());
        let density = DiagGaussian::standard(2);
        assert!(TransitionOperator::<B>::apply(&mut hmc, x, &density, 1).is_err());
    }

    #[test]
    fn test_state_roundtrip() {
        let mut hmc = HamiltonianMonteCarlo::new(HmcConfig::default(), 2, 3, 5).unwrap();
        let density = DiagGaussian::standard(2);
        let x = Tensor::<B, 2>::zeros([50, 2], &Default::default());
        let _ = TransitionOperator::<B>::apply(&mut hmc, x, &density, 2).unwrap();
        let state = TransitionOperator::<B>::state(&hmc);

        let mut fresh = HamiltonianMonteCarlo::new(HmcConfig::default(), 2, 3, 5).unwrap();
        TransitionOperator::<B>::load_state(&mut fresh, state.clone()).unwrap();
        assert_eq!(TransitionOperator::<B>::state(&fresh), state);

        let wrong = TransitionState {
            stages: state.stages[..1].to_vec(),
        };
        assert!(TransitionOperator::<B>::load_state(&mut fresh, wrong).is_err());
    }
}
