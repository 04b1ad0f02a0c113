//! Per-stage step-size state and the acceptance-rate targeting rule shared by the HMC and
//! Metropolis operators.

use serde::{Deserialize, Serialize};

/// Weight of the newest batch in the smoothed acceptance estimate.
const P_ACCEPT_SMOOTHING: f64 = 0.1;

/// Multiplicative step-size controller.
///
/// After every call the step size is multiplied by
/// `clamp(exp(adaptation_rate * (p_hat - target_p_accept)), 1 / max_factor, max_factor)` and
/// then clamped into `[min_step_size, max_step_size]`: too many acceptances grow the step,
/// too few shrink it. Working on the log scale keeps the update symmetric, the clamp keeps a
/// single bad batch from throwing the step size far away.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSizeTuning {
    pub target_p_accept: f64,
    pub adaptation_rate: f64,
    pub max_factor: f64,
    pub min_step_size: f64,
    pub max_step_size: f64,
}

impl Default for StepSizeTuning {
    fn default() -> Self {
        Self {
            target_p_accept: 0.65,
            adaptation_rate: 0.5,
            max_factor: 2.0,
            min_step_size: 1e-6,
            max_step_size: 1e3,
        }
    }
}

impl StepSizeTuning {
    pub fn with_target(target_p_accept: f64) -> Self {
        Self {
            target_p_accept,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if !(self.target_p_accept > 0.0 && self.target_p_accept < 1.0) {
            return Err(format!(
                "target_p_accept must be in (0, 1), got {}",
                self.target_p_accept
            ));
        }
        if !(self.adaptation_rate > 0.0) || !(self.max_factor > 1.0) {
            return Err("adaptation_rate must be positive and max_factor above 1".into());
        }
        if !(self.min_step_size > 0.0 && self.min_step_size < self.max_step_size) {
            return Err("require 0 < min_step_size < max_step_size".into());
        }
        Ok(())
    }

    /// Applies one update to `stage` given the acceptance rate of the latest batch.
    pub fn update(&self, stage: &mut StageState, batch_p_accept: f64) {
        if !batch_p_accept.is_finite() {
            return;
        }
        let factor = (self.adaptation_rate * (batch_p_accept - self.target_p_accept))
            .exp()
            .clamp(1.0 / self.max_factor, self.max_factor);
        stage.step_size = (stage.step_size * factor).clamp(self.min_step_size, self.max_step_size);
    }
}

/// Adaptive state of one intermediate distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub step_size: f64,
    /// Exponential moving average of the per-call acceptance rate, `None` until the first
    /// call with at least one counted proposal.
    pub p_accept: Option<f64>,
    pub n_accepted: u64,
    pub n_proposed: u64,
    /// Proposals rejected because their log-density or Hamiltonian was not finite.
    pub n_non_finite: u64,
}

impl StageState {
    pub fn new(step_size: f64) -> Self {
        Self {
            step_size,
            p_accept: None,
            n_accepted: 0,
            n_proposed: 0,
            n_non_finite: 0,
        }
    }

    /// Folds one call's counts into the running statistics and returns that call's rate
    /// (NaN when nothing was proposed).
    pub fn record(&mut self, accepted: usize, proposed: usize, non_finite: usize) -> f64 {
        self.n_accepted += accepted as u64;
        self.n_proposed += proposed as u64;
        self.n_non_finite += non_finite as u64;
        let rate = if proposed == 0 {
            f64::NAN
        } else {
            accepted as f64 / proposed as f64
        };
        if rate.is_finite() {
            self.p_accept = Some(match self.p_accept {
                Some(p) => (1.0 - P_ACCEPT_SMOOTHING) * p + P_ACCEPT_SMOOTHING * rate,
                None => rate,
            });
        }
        rate
    }

    /// Acceptance rate over the whole lifetime of this stage.
    pub fn lifetime_p_accept(&self) -> f64 {
        if self.n_proposed == 0 {
            f64::NAN
        } else {
            self.n_accepted as f64 / self.n_proposed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_update_direction() {
        let tuning = StepSizeTuning::with_target(0.65);
        let mut stage = StageState::new(1.0);
        tuning.update(&mut stage, 0.9);
        assert!(stage.step_size > 1.0);
        let grown = stage.step_size;
        tuning.update(&mut stage, 0.1);
        assert!(stage.step_size < grown);
    }

    #[test]
    fn test_update_is_clamped() {
        let tuning = StepSizeTuning {
            adaptation_rate: 100.0,
            ..StepSizeTuning::default()
        };
        let mut stage = StageState::new(1.0);
        tuning.update(&mut stage, 0.0);
        assert_abs_diff_eq!(stage.step_size, 0.5, epsilon = 1e-12);
        tuning.update(&mut stage, f64::NAN);
        assert_abs_diff_eq!(stage.step_size, 0.5, epsilon = 1e-12);

        let mut tiny = StageState::new(1e-6);
        tuning.update(&mut tiny, 0.0);
        assert_abs_diff_eq!(tiny.step_size, 1e-6, epsilon = 1e-18);
    }

    #[test]
    fn test_record_smooths() {
        let mut stage = StageState::new(1.0);
        assert!(stage.record(0, 0, 3).is_nan());
        assert_eq!(stage.p_accept, None);
        assert_eq!(stage.record(5, 10, 0), 0.5);
        assert_abs_diff_eq!(stage.p_accept.unwrap(), 0.5);
        stage.record(10, 10, 0);
        assert_abs_diff_eq!(stage.p_accept.unwrap(), 0.55, epsilon = 1e-12);
        assert_abs_diff_eq!(stage.lifetime_p_accept(), 0.75, epsilon = 1e-12);
        assert!(stage.record(0, 0, 0).is_nan());
        assert_abs_diff_eq!(stage.p_accept.unwrap(), 0.55, epsilon = 1e-12);
    }

    #[test]
    fn test_stage_state_json_is_exact() {
        let fresh = StageState::new(1.0);
        let json = serde_json::to_string(&fresh).unwrap();
        assert_eq!(serde_json::from_str::<StageState>(&json).unwrap(), fresh);

        let mut tuned = StageState::new(1.0479910020166323);
        tuned.p_accept = Some(0.4918093750000001);
        tuned.n_accepted = 17;
        let json = serde_json::to_string(&tuned).unwrap();
        let restored: StageState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.step_size.to_bits(), tuned.step_size.to_bits());
        assert_eq!(restored, tuned);
    }

    #[test]
    fn test_damped_default_rate() {
        // One call far below the target must not halve the step size.
        let tuning = StepSizeTuning::default();
        let mut stage = StageState::new(1.0);
        tuning.update(&mut stage, 0.0);
        assert_abs_diff_eq!(stage.step_size, (-0.5f64 * 0.65).exp(), epsilon = 1e-12);
        assert!(stage.step_size > 0.7);
    }

    #[test]
    fn test_validate() {
        assert!(StepSizeTuning::default().validate().is_ok());
        assert!(StepSizeTuning::with_target(1.0).validate().is_err());
        let bad = StepSizeTuning {
            max_factor: 1.0,
            ..StepSizeTuning::default()
        };
        assert!(bad.validate().is_err());
    }
}
