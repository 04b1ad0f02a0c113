/*!
The trainable flow consumed by the FAB objective.

The samplers only see a flow through [`Flow::sample_and_log_prob`] and [`Flow::log_prob`];
its parameters are updated by the training loop through `burn`'s module machinery.
[`RealNvp`] is a small affine-coupling flow that fills that role in the binaries and tests.

```rust
use burn::backend::{Autodiff, NdArray};
use fab_mcmc::flow::{Flow, FlowConfig};

type B = Autodiff<NdArray<f64>>;

let device = Default::default();
let flow = FlowConfig::default().init::<B>(2, &device).unwrap();
let (x, log_q) = flow.sample_and_log_prob(16, &device);
assert_eq!(x.dims(), [16, 2]);
assert_eq!(log_q.dims(), [16]);
```
*/

use crate::distributions::{tensor_from_rows, BaseDistribution, LogDensity};
use crate::error::{EvaluationError, FabError, Result};
use burn::module::Module;
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// A normalizing flow: exact samples together with their exact log-density.
pub trait Flow<B: Backend>: Module<B> {
    fn dim(&self) -> usize;

    /// Draws `n` samples and returns `log q` of each of them, differentiable with respect to
    /// the flow parameters.
    fn sample_and_log_prob(&self, n: usize, device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 1>);

    fn log_prob(&self, x: Tensor<B, 2>) -> Tensor<B, 1>;

    fn sample(&self, n: usize, device: &B::Device) -> Tensor<B, 2> {
        self.sample_and_log_prob(n, device).0
    }
}

/// Borrows a [`Flow`] as the base distribution of an AIS run.
pub struct FlowBase<'a, F>(pub &'a F);

impl<B: Backend, F: Flow<B>> LogDensity<B> for FlowBase<'_, F> {
    fn dim(&self) -> usize {
        self.0.dim()
    }

    fn log_prob(&self, x: Tensor<B, 2>) -> std::result::Result<Tensor<B, 1>, EvaluationError> {
        if x.dims()[1] != self.0.dim() {
            return Err(EvaluationError(format!(
                "flow has dimension {}, got {} columns",
                self.0.dim(),
                x.dims()[1]
            )));
        }
        Ok(self.0.log_prob(x))
    }
}

impl<B: Backend, F: Flow<B>> BaseDistribution<B> for FlowBase<'_, F> {
    fn sample_and_log_prob(&self, n: usize, device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 1>) {
        self.0.sample_and_log_prob(n, device)
    }
}

/// Architecture of [`RealNvp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub n_layers: usize,
    pub hidden_dim: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            n_layers: 8,
            hidden_dim: 64,
        }
    }
}

impl FlowConfig {
    pub fn validate(&self, dim: usize) -> Result<()> {
        if dim < 2 {
            return Err(FabError::config(format!(
                "coupling flows need dim >= 2, got {dim}"
            )));
        }
        if self.n_layers == 0 || self.hidden_dim == 0 {
            return Err(FabError::config("flow needs n_layers > 0 and hidden_dim > 0"));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, dim: usize, device: &B::Device) -> Result<RealNvp<B>> {
        self.validate(dim)?;
        let layers = (0..self.n_layers)
            .map(|i| AffineCoupling::new(dim, self.hidden_dim, i % 2, device))
            .collect();
        Ok(RealNvp { layers, dim })
    }
}

/// One affine coupling layer: half of the coordinates pass through unchanged and condition
/// a shift and a bounded log-scale for the other half.
#[derive(Module, Debug)]
pub struct AffineCoupling<B: Backend> {
    hidden_in: Linear<B>,
    hidden_mid: Linear<B>,
    out: Linear<B>,
    dim: usize,
    parity: usize,
}

impl<B: Backend> AffineCoupling<B> {
    fn new(dim: usize, hidden_dim: usize, parity: usize, device: &B::Device) -> Self {
        Self {
            hidden_in: LinearConfig::new(dim, hidden_dim).init(device),
            hidden_mid: LinearConfig::new(hidden_dim, hidden_dim).init(device),
            // Zero output layer: the layer starts as the identity.
            out: LinearConfig::new(hidden_dim, 2 * dim)
                .with_initializer(Initializer::Zeros)
                .init(device),
            dim,
            parity,
        }
    }

    /// `[1, d]` with ones on the coordinates that pass through unchanged.
    fn mask(&self, device: &B::Device) -> Tensor<B, 2> {
        let half = self.dim / 2;
        let values: Vec<f64> = (0..self.dim)
            .map(|j| if (j < half) == (self.parity == 0) { 1.0 } else { 0.0 })
            .collect();
        tensor_from_rows::<B>(&values, 1, self.dim, device)
    }

    /// Shift and log-scale for the transformed coordinates, zero on the passive ones.
    fn shift_and_log_scale(
        &self,
        x: Tensor<B, 2>,
        mask: Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let n = x.dims()[0];
        let active = mask.clone().neg().add_scalar(1.0);
        let h = relu(self.hidden_in.forward(x * mask));
        let h = relu(self.hidden_mid.forward(h));
        let h = self.out.forward(h);
        let shift = h.clone().slice([0..n, 0..self.dim]) * active.clone();
        let log_scale = h.slice([0..n, self.dim..2 * self.dim]).tanh() * active;
        (shift, log_scale)
    }

    /// Latent to data direction. Returns `y` and `log |det dy/dx|`.
    fn forward(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let mask = self.mask(&x.device());
        let (shift, log_scale) = self.shift_and_log_scale(x.clone(), mask);
        let log_det = log_scale.clone().sum_dim(1).squeeze::<1>(1);
        (x * log_scale.exp() + shift, log_det)
    }

    /// Data to latent direction. Returns `x` and `log |det dx/dy|`.
    fn inverse(&self, y: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let mask = self.mask(&y.device());
        let (shift, log_scale) = self.shift_and_log_scale(y.clone(), mask);
        let log_det = log_scale.clone().sum_dim(1).squeeze::<1>(1).neg();
        ((y - shift) * log_scale.neg().exp(), log_det)
    }
}

/// Real NVP: a stack of [`AffineCoupling`] layers with alternating halves over a standard
/// normal base.
#[derive(Module, Debug)]
pub struct RealNvp<B: Backend> {
    layers: Vec<AffineCoupling<B>>,
    dim: usize,
}

impl<B: Backend> RealNvp<B> {
    fn standard_normal_log_prob(&self, z: Tensor<B, 2>) -> Tensor<B, 1> {
        z.powf_scalar(2.0)
            .sum_dim(1)
            .squeeze::<1>(1)
            .mul_scalar(-0.5)
            .sub_scalar(0.5 * self.dim as f64 * (2.0 * PI).ln())
    }
}

impl<B: Backend> Flow<B> for RealNvp<B> {
    fn dim(&self) -> usize {
        self.dim
    }

    fn sample_and_log_prob(&self, n: usize, device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let mut x = Tensor::<B, 2>::random(
            [n, self.dim],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            device,
        );
        let mut log_q = self.standard_normal_log_prob(x.clone());
        for layer in &self.layers {
            let (y, log_det) = layer.forward(x);
            x = y;
            log_q = log_q - log_det;
        }
        (x, log_q)
    }

    fn log_prob(&self, x: Tensor<B, 2>) -> Tensor<B, 1> {
        let mut z = x;
        let mut log_det_sum = Tensor::<B, 1>::zeros([z.dims()[0]], &z.device());
        for layer in self.layers.iter().rev() {
            let (prev, log_det) = layer.inverse(z);
            z = prev;
            log_det_sum = log_det_sum + log_det;
        }
        self.standard_normal_log_prob(z) + log_det_sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::tensor_to_vec;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};

    type B = Autodiff<NdArray<f64>>;

    #[test]
    fn test_identity_at_initialization() {
        let device = Default::default();
        let flow = FlowConfig::default().init::<B>(3, &device).unwrap();
        let x = Tensor::<B, 2>::from_floats([[0.5, -1.0, 2.0]], &device);
        let lp = tensor_to_vec(flow.log_prob(x))[0];
        let expected = -0.5 * (0.25 + 1.0 + 4.0) - 1.5 * (2.0 * PI).ln();
        assert_abs_diff_eq!(lp, expected, epsilon = 1e-10);
    }

    #[test]
    fn test_sample_log_prob_matches_log_prob() {
        let device = Default::default();
        let flow = FlowConfig {
            n_layers: 4,
            hidden_dim: 8,
        }
        .init::<B>(2, &device)
        .unwrap();
        // Move the output layers away from zero so the flow is not the identity.
        let flow = perturb(flow);
        let (x, log_q) = flow.sample_and_log_prob(32, &device);
        let lp = flow.log_prob(x);
        for (a, b) in tensor_to_vec(log_q).iter().zip(tensor_to_vec(lp)) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-8);
        }
    }

    fn perturb(mut flow: RealNvp<B>) -> RealNvp<B> {
        let device = Default::default();
        for layer in flow.layers.iter_mut() {
            let hidden = layer.out.weight.dims()[0];
            let dim = layer.dim;
            layer.out = LinearConfig::new(hidden, 2 * dim)
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: 0.3,
                })
                .init(&device);
        }
        flow
    }

    #[test]
    fn test_gradients_reach_parameters() {
        let device = Default::default();
        let flow = perturb(FlowConfig::default().init::<B>(2, &device).unwrap());
        let x = Tensor::<B, 2>::from_floats([[0.1, 0.2], [1.0, -1.0]], &device);
        let grads = flow.log_prob(x).sum().backward();
        let grad = flow.layers[0].out.weight.grad(&grads);
        assert!(grad.is_some());
    }

    #[test]
    fn test_flow_base_dimension_check() {
        let device = Default::default();
        let flow = FlowConfig::default().init::<B>(2, &device).unwrap();
        let base = FlowBase(&flow);
        let x = Tensor::<B, 2>::zeros([1, 3], &device);
        assert!(LogDensity::<B>::log_prob(&base, x).is_err());
        assert!(FlowConfig::default().init::<B>(1, &device).is_err());
    }
}
