//! The 2D two-moons density used in the small training demo.

use crate::distributions::{EnergyTarget, LogDensity, TargetDistribution};
use crate::error::EvaluationError;
use burn::prelude::*;
use std::sync::Arc;

/// Two-moons energy of a batch of 2D points:
/// `0.5 ((|x| - 2) / 0.2)^2 + 0.5 ((|x_0| - 2) / 0.3)^2 - log(1 + exp(-4 |x_0| / 0.09))`.
pub fn two_moons_energy<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 1> {
    let n = x.dims()[0];
    let a = x.clone().slice([0..n, 0..1]).squeeze::<1>(1).abs();
    let radius = x.powf_scalar(2.0).sum_dim(1).squeeze::<1>(1).sqrt();
    let ring = radius.sub_scalar(2.0).div_scalar(0.2).powf_scalar(2.0).mul_scalar(0.5);
    let split = a.clone().sub_scalar(2.0).div_scalar(0.3).powf_scalar(2.0).mul_scalar(0.5);
    // a >= 0, so the exponent is never positive.
    let join = a.mul_scalar(-4.0 / 0.09).exp().add_scalar(1.0).log();
    ring + split - join
}

/// Bimodal 2D target shaped like two crescents.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TwoMoons;

impl TwoMoons {
    pub fn energy_target<B: Backend>(&self) -> EnergyTarget<B> {
        EnergyTarget::new(2, Arc::new(two_moons_energy::<B>))
    }
}

impl<B: Backend> LogDensity<B> for TwoMoons {
    fn dim(&self) -> usize {
        2
    }

    fn log_prob(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>, EvaluationError> {
        if x.dims()[1] != 2 {
            return Err(EvaluationError(format!(
                "two moons is 2D, got {} columns",
                x.dims()[1]
            )));
        }
        Ok(two_moons_energy(x).neg())
    }
}

impl<B: Backend> TargetDistribution<B> for TwoMoons {}
