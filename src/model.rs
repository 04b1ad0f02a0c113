/*!
The FAB objective: a flow trained with AIS samples drawn from a density that is easier to
estimate with the flow as proposal.

With the default [`LossType::Fab`] the AIS run starts at the flow `q` and anneals towards
`p^alpha q^(1 - alpha)` (alpha = 2 minimizes the variance of the importance weights for the
alpha-divergence). The loss is the self-normalized weighted negative log-likelihood
`-sum_i w_i log q(x_i)` of the AIS samples. Self-normalization makes the gradient estimator
consistent without the normalizing constant of `p`.
*/

use crate::ais::AnnealedImportanceSampler;
use crate::distributions::{
    sanitized_log_prob, tensor_from_rows, tensor_from_vec, tensor_to_vec, LogDensity,
    TargetDistribution,
};
use crate::error::{EvaluationError, FabError, Result};
use crate::flow::{Flow, FlowBase};
use crate::logger::Metrics;
use crate::stats::{
    effective_sample_size, effective_sample_size_fraction, finite_or_neg_inf, log_sum_exp,
    self_normalized_weights,
};
use crate::targets::mean_log_prob_in_batches;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

/// Absolute effective sample size below which the weights are reported as degenerate.
const DEGENERATE_ESS: f64 = 2.0;

/// Flow batches drawn before a batch without a single finite weight becomes an error.
const FLOW_ATTEMPTS: usize = 2;

/// Training objective.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossType {
    /// AIS-corrected weighted maximum likelihood.
    Fab { alpha: f64 },
    /// Self-normalized importance sampling with the flow as proposal, no AIS.
    FlowForwardKl,
    /// Reparameterized `E_q[log q - log p]`.
    FlowReverseKl,
}

impl Default for LossType {
    fn default() -> Self {
        LossType::Fab { alpha: 2.0 }
    }
}

/// The final density of the AIS run used in the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AisTarget {
    /// The target `p` itself.
    Target,
    /// `p^alpha q^(1 - alpha)`.
    #[default]
    MinimumVariance,
}

/// Diagnostics of one loss evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct LossInfo {
    pub loss: f64,
    pub ess_ais: f64,
    pub mean_log_w_ais: f64,
    pub n_non_finite: usize,
    pub degenerate_weights: bool,
    /// Unweighted flow-sample forward KL term, when it is part of the FAB loss.
    pub flow_sample_loss: Option<f64>,
}

impl LossInfo {
    pub fn metrics(&self) -> Metrics {
        let mut m = Metrics::new();
        m.insert("loss".into(), self.loss);
        m.insert("ess_ais".into(), self.ess_ais);
        m.insert("mean_log_w_ais".into(), self.mean_log_w_ais);
        m.insert("n_non_finite".into(), self.n_non_finite as f64);
        m.insert(
            "degenerate_weights".into(),
            if self.degenerate_weights { 1.0 } else { 0.0 },
        );
        if let Some(flow_loss) = self.flow_sample_loss {
            m.insert("flow_sample_loss".into(), flow_loss);
        }
        m
    }
}

/// Host-side AIS batch for the replay buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct AisBatch {
    pub x: Array2<f64>,
    pub log_w: Array1<f64>,
    /// Flow log-density of every sample at generation time.
    pub log_q: Array1<f64>,
}

/// `alpha log p + (1 - alpha) log q`, the AIS target of the FAB loss.
struct AlphaDivergenceTarget<'a, B: Backend, F> {
    flow: &'a F,
    target: &'a dyn LogDensity<B>,
    alpha: f64,
}

impl<B: Backend, F: Flow<B>> LogDensity<B> for AlphaDivergenceTarget<'_, B, F> {
    fn dim(&self) -> usize {
        self.target.dim()
    }

    fn log_prob(&self, x: Tensor<B, 2>) -> std::result::Result<Tensor<B, 1>, EvaluationError> {
        let log_p = self.target.log_prob(x.clone())?;
        let log_q = self.flow.log_prob(x);
        Ok(log_p.mul_scalar(self.alpha) + log_q.mul_scalar(1.0 - self.alpha))
    }
}

/// Flow, target and annealed importance sampler wired together.
pub struct FabModel<B: AutodiffBackend, F: Flow<B>, T: TargetDistribution<B>> {
    pub flow: F,
    pub target: T,
    ais: AnnealedImportanceSampler<B>,
    loss_type: LossType,
    ais_target: AisTarget,
    flow_sample_weight: f64,
}

impl<B: AutodiffBackend, F: Flow<B>, T: TargetDistribution<B>> FabModel<B, F, T> {
    pub fn new(
        flow: F,
        target: T,
        ais: AnnealedImportanceSampler<B>,
        loss_type: LossType,
    ) -> Result<Self> {
        if flow.dim() != target.dim() {
            return Err(FabError::config(format!(
                "flow dimension {} does not match target dimension {}",
                flow.dim(),
                target.dim()
            )));
        }
        if let LossType::Fab { alpha } = loss_type {
            if !alpha.is_finite() || alpha <= 0.0 {
                return Err(FabError::config(format!("alpha must be positive, got {alpha}")));
            }
        }
        Ok(Self {
            flow,
            target,
            ais,
            loss_type,
            ais_target: AisTarget::MinimumVariance,
            flow_sample_weight: 0.0,
        })
    }

    /// Adds `weight` times the flow-sample forward KL term to the FAB loss.
    pub fn with_flow_sample_weight(mut self, weight: f64) -> Result<Self> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(FabError::config(format!(
                "flow_sample_weight must be non-negative, got {weight}"
            )));
        }
        self.flow_sample_weight = weight;
        Ok(self)
    }

    pub fn flow_sample_weight(&self) -> f64 {
        self.flow_sample_weight
    }

    pub fn set_ais_target(&mut self, ais_target: AisTarget) {
        self.ais_target = ais_target;
    }

    pub fn ais_target(&self) -> AisTarget {
        self.ais_target
    }

    pub fn loss_type(&self) -> LossType {
        self.loss_type
    }

    pub fn ais(&self) -> &AnnealedImportanceSampler<B> {
        &self.ais
    }

    pub fn ais_mut(&mut self) -> &mut AnnealedImportanceSampler<B> {
        &mut self.ais
    }

    pub fn device(&self) -> B::Device {
        self.ais.device().clone()
    }

    /// Exponent used to carry stored AIS weights over to a new flow.
    pub fn alpha(&self) -> f64 {
        match (self.loss_type, self.ais_target) {
            (LossType::Fab { alpha }, AisTarget::MinimumVariance) => alpha,
            _ => 1.0,
        }
    }

    /// Runs AIS from the current flow to the configured AIS target.
    pub fn sample_ais(&mut self, n: usize, logging: bool) -> Result<(Tensor<B, 2>, Array1<f64>)> {
        let base = FlowBase(&self.flow);
        let alpha = self.alpha();
        if alpha == 1.0 {
            return self
                .ais
                .sample_and_log_weights(&base, &self.target, n, logging);
        }
        let density = AlphaDivergenceTarget {
            flow: &self.flow,
            target: &self.target,
            alpha,
        };
        self.ais
            .sample_and_log_weights(&base, &density, n, logging)
    }

    /// AIS samples with their flow log-density, copied to the host for the replay buffer.
    pub fn ais_batch(&mut self, n: usize) -> Result<(AisBatch, LossInfo)> {
        let (x, log_w) = self.sample_ais(n, false)?;
        let d = x.dims()[1];
        let log_q = tensor_to_vec(self.flow.log_prob(x.clone()).detach());
        let x = Array2::from_shape_vec((n, d), tensor_to_vec(x))
            .map_err(|e| FabError::Tensor(e.to_string()))?;
        let info = weight_info(log_w.view(), f64::NAN);
        Ok((
            AisBatch {
                x,
                log_w,
                log_q: Array1::from(log_q),
            },
            info,
        ))
    }

    /// `-sum_i weights_i log q(x_i)` with `x` treated as data. Also returns the (detached)
    /// `log q` values, needed to re-weight buffer entries.
    pub fn weighted_nll(&self, x: Tensor<B, 2>, weights: ArrayView1<f64>) -> (Tensor<B, 1>, Vec<f64>) {
        let device = x.device();
        let log_q = self.flow.log_prob(x.detach());
        let log_q_host = tensor_to_vec(log_q.clone().detach());
        // Zero weights must not meet a -inf log q.
        let safe: Vec<f64> = weights
            .iter()
            .zip(&log_q_host)
            .map(|(w, q)| if q.is_finite() { *w } else { 0.0 })
            .collect();
        let non_finite: Vec<bool> = log_q_host.iter().map(|q| !q.is_finite()).collect();
        let mask = Tensor::<B, 1, Bool>::from_data(
            TensorData::new(non_finite, [log_q_host.len()]),
            &device,
        );
        let log_q = log_q.mask_fill(mask, 0.0);
        let loss = (log_q * tensor_from_vec::<B>(&safe, &device)).sum().neg();
        (loss, log_q_host)
    }

    /// Loss for one gradient step on a fresh batch of `batch_size` samples.
    pub fn loss(&mut self, batch_size: usize) -> Result<(Tensor<B, 1>, LossInfo)> {
        match self.loss_type {
            LossType::Fab { .. } => {
                let (x, log_w) = self.sample_ais(batch_size, false)?;
                let weights = self_normalized_weights(log_w.view());
                let (mut loss, _) = self.weighted_nll(x, weights.view());
                let mut flow_sample_loss = None;
                if self.flow_sample_weight > 0.0 {
                    let (flow_loss, _) = self.flow_forward_kl(batch_size)?;
                    flow_sample_loss = Some(scalar(&flow_loss));
                    loss = loss + flow_loss.mul_scalar(self.flow_sample_weight);
                }
                let mut info = weight_info(log_w.view(), scalar(&loss));
                info.flow_sample_loss = flow_sample_loss;
                Ok((loss, info))
            }
            LossType::FlowForwardKl => {
                let (loss, log_w) = self.flow_forward_kl(batch_size)?;
                let info = weight_info(log_w.view(), scalar(&loss));
                Ok((loss, info))
            }
            LossType::FlowReverseKl => self.flow_reverse_kl(batch_size),
        }
    }

    /// Self-normalized importance sampling with fresh flow samples. A batch in which no
    /// sample has a finite weight is drawn once more before giving up.
    fn flow_forward_kl(&self, batch_size: usize) -> Result<(Tensor<B, 1>, Array1<f64>)> {
        let device = self.device();
        for attempt in 1..=FLOW_ATTEMPTS {
            let (x, log_q) = self.flow.sample_and_log_prob(batch_size, &device);
            let x = x.detach();
            let log_q = tensor_to_vec(log_q.detach());
            let (log_p, _) = sanitized_log_prob(&self.target, x.clone());
            let log_w: Array1<f64> = log_p
                .iter()
                .zip(&log_q)
                .map(|(p, q)| finite_or_neg_inf(p - q))
                .collect();
            if log_sum_exp(log_w.view()) == f64::NEG_INFINITY {
                log::warn!("no flow sample has a finite weight (attempt {attempt})");
                continue;
            }
            let weights = self_normalized_weights(log_w.view());
            let (loss, _) = self.weighted_nll(x, weights.view());
            return Ok((loss, log_w));
        }
        Err(FabError::BatchEvaluation {
            n_samples: batch_size,
            attempts: FLOW_ATTEMPTS,
        })
    }

    /// Reparameterized `E_q[log q - log p]` over the rows where both densities are finite.
    fn flow_reverse_kl(&self, batch_size: usize) -> Result<(Tensor<B, 1>, LossInfo)> {
        let device = self.device();
        for attempt in 1..=FLOW_ATTEMPTS {
            let (x, log_q) = self.flow.sample_and_log_prob(batch_size, &device);
            let log_p = match self.target.log_prob(x) {
                Ok(log_p) => log_p,
                Err(e) => {
                    log::warn!("target evaluation failed for the whole batch (attempt {attempt}): {e}");
                    continue;
                }
            };
            let diff = log_q - log_p;
            let host = tensor_to_vec(diff.clone().detach());
            let bad: Vec<bool> = host.iter().map(|v| !v.is_finite()).collect();
            let n_bad = bad.iter().filter(|b| **b).count();
            if n_bad == batch_size {
                log::warn!("no flow sample has a finite log-ratio (attempt {attempt})");
                continue;
            }
            let mask = Tensor::<B, 1, Bool>::from_data(TensorData::new(bad, [batch_size]), &device);
            let loss = diff
                .mask_fill(mask, 0.0)
                .sum()
                .div_scalar((batch_size - n_bad) as f64);
            let log_w: Array1<f64> = host.iter().map(|v| finite_or_neg_inf(-v)).collect();
            let mut info = weight_info(log_w.view(), scalar(&loss));
            info.n_non_finite = n_bad;
            return Ok((loss, info));
        }
        Err(FabError::BatchEvaluation {
            n_samples: batch_size,
            attempts: FLOW_ATTEMPTS,
        })
    }

    /// Evaluation metrics over `outer_batch_size` samples, processed `inner_batch_size` at a
    /// time: ESS of the flow and of AIS towards `p`, and test-set metrics when the target
    /// provides a test set.
    ///
    /// The AIS runs reuse the training operator; its tuning state is put back afterwards, so
    /// evaluating never changes the step sizes or counts used for training.
    pub fn get_eval_info(
        &mut self,
        outer_batch_size: usize,
        inner_batch_size: usize,
    ) -> Result<Metrics> {
        let snapshot = self.ais.transition_state();
        let metrics = self.eval_metrics(outer_batch_size, inner_batch_size);
        self.ais.load_transition_state(snapshot)?;
        metrics
    }

    fn eval_metrics(&mut self, outer_batch_size: usize, inner_batch_size: usize) -> Result<Metrics> {
        if outer_batch_size == 0 || inner_batch_size == 0 {
            return Err(FabError::config("evaluation batch sizes must be positive"));
        }
        let device = self.device();
        let mut log_w_flow = Vec::with_capacity(outer_batch_size);
        let mut log_w_ais = Vec::with_capacity(outer_batch_size);
        let mut remaining = outer_batch_size;
        while remaining > 0 {
            let n = remaining.min(inner_batch_size);
            let (x, log_q) = self.flow.sample_and_log_prob(n, &device);
            let (log_p, _) = sanitized_log_prob(&self.target, x.detach());
            let log_q = tensor_to_vec(log_q.detach());
            log_w_flow.extend(log_p.iter().zip(&log_q).map(|(p, q)| p - q));

            let base = FlowBase(&self.flow);
            let (_, lw) = self.ais.sample_and_log_weights(&base, &self.target, n, false)?;
            log_w_ais.extend(lw.iter().copied());
            remaining -= n;
        }
        let log_w_flow = Array1::from(log_w_flow);
        let log_w_ais = Array1::from(log_w_ais);

        let mut metrics = Metrics::new();
        metrics.insert(
            "eval_ess_flow".into(),
            effective_sample_size_fraction(log_w_flow.view()),
        );
        metrics.insert(
            "eval_ess_ais".into(),
            effective_sample_size_fraction(log_w_ais.view()),
        );
        if let Some(test_set) = self.target.test_set(outer_batch_size, &device) {
            let base = FlowBase(&self.flow);
            let mean_log_q = mean_log_prob_in_batches(&base, test_set.clone(), inner_batch_size);
            let mean_log_p = mean_log_prob_in_batches(&self.target, test_set, inner_batch_size);
            metrics.insert("test_set_mean_log_prob".into(), mean_log_q);
            metrics.insert("kl_forward".into(), mean_log_p - mean_log_q);
        }
        let base = FlowBase(&self.flow);
        metrics.extend(
            self.target
                .performance_metrics(&base, inner_batch_size, &device),
        );
        Ok(metrics)
    }
}

/// Weights turned into [`LossInfo`]; degenerate weights are reported, never raised.
fn weight_info(log_w: ArrayView1<f64>, loss: f64) -> LossInfo {
    let finite: Vec<f64> = log_w.iter().copied().filter(|w| w.is_finite()).collect();
    let ess = effective_sample_size(log_w);
    let degenerate = ess < DEGENERATE_ESS;
    if degenerate {
        log::warn!(
            "degenerate importance weights: effective sample size {ess:.3} of {}",
            log_w.len()
        );
    }
    LossInfo {
        loss,
        ess_ais: effective_sample_size_fraction(log_w),
        mean_log_w_ais: if finite.is_empty() {
            f64::NAN
        } else {
            finite.iter().sum::<f64>() / finite.len() as f64
        },
        n_non_finite: log_w.len() - finite.len(),
        degenerate_weights: degenerate,
        flow_sample_loss: None,
    }
}

fn scalar<B: Backend>(loss: &Tensor<B, 1>) -> f64 {
    tensor_to_vec(loss.clone().detach())
        .first()
        .copied()
        .unwrap_or(f64::NAN)
}

/// Copies a host batch to the device.
pub fn to_tensor<B: Backend>(x: ArrayView2<f64>, device: &B::Device) -> Tensor<B, 2> {
    let values: Vec<f64> = x.iter().copied().collect();
    tensor_from_rows::<B>(&values, x.nrows(), x.ncols(), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::DiagGaussian;
    use crate::flow::{FlowConfig, RealNvp};
    use crate::schedule::SpacingType;
    use crate::transition::{HmcConfig, TransitionOperatorConfig};
    use burn::backend::{Autodiff, NdArray};

    type B = Autodiff<NdArray<f64>>;

    fn model(loss_type: LossType) -> FabModel<B, RealNvp<B>, DiagGaussian> {
        let device = Default::default();
        let flow = FlowConfig {
            n_layers: 2,
            hidden_dim: 8,
        }
        .init::<B>(2, &device)
        .unwrap();
        let operator = TransitionOperatorConfig::Hmc(HmcConfig::default())
            .build::<B>(2, 2, 0)
            .unwrap();
        let ais = AnnealedImportanceSampler::new(operator, 2, &SpacingType::Linear).unwrap();
        let target = DiagGaussian::new(vec![1.0, -1.0], vec![1.0, 1.0]).unwrap();
        FabModel::new(flow, target, ais, loss_type).unwrap()
    }

    #[test]
    fn test_every_loss_type_is_finite_and_differentiable() {
        for loss_type in [
            LossType::default(),
            LossType::FlowForwardKl,
            LossType::FlowReverseKl,
        ] {
            let mut m = model(loss_type);
            let (loss, info) = m.loss(64).unwrap();
            assert!(info.loss.is_finite(), "{loss_type:?}: {info:?}");
            assert!(info.ess_ais > 0.0 && info.ess_ais <= 1.0);
            let grads = loss.backward();
            let params = burn::optim::GradientsParams::from_grads(grads, &m.flow);
            assert!(!params.is_empty(), "{loss_type:?} produced no gradients");
        }
    }

    #[test]
    fn test_weighted_nll_ignores_zero_weight_infinite_rows() {
        let m = model(LossType::default());
        let x = Tensor::<B, 2>::from_floats([[0.0, 0.0], [1.0, 1.0]], &Default::default());
        let (loss, log_q) = m.weighted_nll(x, array![1.0, 0.0].view());
        assert_eq!(log_q.len(), 2);
        let value = scalar(&loss);
        assert!((value + log_q[0]).abs() < 1e-12);
    }

    #[test]
    fn test_alpha_depends_on_ais_target() {
        let mut m = model(LossType::Fab { alpha: 2.0 });
        assert_eq!(m.alpha(), 2.0);
        m.set_ais_target(AisTarget::Target);
        assert_eq!(m.alpha(), 1.0);
    }

    #[test]
    fn test_eval_info_keys() {
        let mut m = model(LossType::default());
        let info = m.get_eval_info(200, 100).unwrap();
        for key in ["eval_ess_flow", "eval_ess_ais", "test_set_mean_log_prob", "kl_forward"] {
            assert!(info.contains_key(key), "missing {key}");
        }
        // The flow is the identity at initialization: KL(N(m, I) || N(0, I)) = |m|^2 / 2 = 1.
        assert!((info["kl_forward"] - 1.0).abs() < 0.5, "{info:?}");
    }

    #[test]
    fn test_eval_info_leaves_tuning_state_unchanged() {
        let mut m = model(LossType::default());
        let _ = m.loss(32).unwrap();
        let before = m.ais().transition_state();
        m.get_eval_info(200, 50).unwrap();
        assert_eq!(m.ais().transition_state(), before);
    }

    #[test]
    fn test_flow_sample_weight_adds_forward_kl_term() {
        let mut plain = model(LossType::default());
        let (_, info) = plain.loss(64).unwrap();
        assert_eq!(info.flow_sample_loss, None);
        assert!(!info.metrics().contains_key("flow_sample_loss"));

        let mut m = model(LossType::default()).with_flow_sample_weight(0.5).unwrap();
        assert_eq!(m.flow_sample_weight(), 0.5);
        let (loss, info) = m.loss(256).unwrap();
        // Identity flow N(0, I) against N((1, -1), I): E_p[-log q] = ln(2 pi) + 2.
        let flow_loss = info.flow_sample_loss.unwrap();
        assert!((flow_loss - (2.0 * std::f64::consts::PI).ln() - 2.0).abs() < 1.5, "{info:?}");
        assert_eq!(info.metrics()["flow_sample_loss"], flow_loss);
        let grads = loss.backward();
        assert!(!burn::optim::GradientsParams::from_grads(grads, &m.flow).is_empty());

        assert!(model(LossType::default()).with_flow_sample_weight(-1.0).is_err());
    }

    struct Unreachable;

    impl LogDensity<B> for Unreachable {
        fn dim(&self) -> usize {
            2
        }

        fn log_prob(&self, x: Tensor<B, 2>) -> std::result::Result<Tensor<B, 1>, EvaluationError> {
            Ok(x.sum_dim(1).squeeze::<1>(1).mul_scalar(f64::NAN))
        }
    }

    impl TargetDistribution<B> for Unreachable {}

    #[test]
    fn test_flow_losses_retry_then_fail_on_non_finite_target() {
        for loss_type in [LossType::FlowForwardKl, LossType::FlowReverseKl] {
            let device = Default::default();
            let flow = FlowConfig {
                n_layers: 2,
                hidden_dim: 4,
            }
            .init::<B>(2, &device)
            .unwrap();
            let operator = TransitionOperatorConfig::default().build::<B>(2, 1, 0).unwrap();
            let ais = AnnealedImportanceSampler::new(operator, 1, &SpacingType::Linear).unwrap();
            let mut m = FabModel::new(flow, Unreachable, ais, loss_type).unwrap();
            match m.loss(16) {
                Err(FabError::BatchEvaluation { attempts, .. }) => {
                    assert_eq!(attempts, FLOW_ATTEMPTS)
                }
                other => panic!("{loss_type:?}: expected a batch failure, got {:?}", other.map(|(_, i)| i)),
            }
        }
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let device = Default::default();
        let flow = FlowConfig::default().init::<B>(3, &device).unwrap();
        let operator = TransitionOperatorConfig::default().build::<B>(3, 1, 0).unwrap();
        let ais = AnnealedImportanceSampler::new(operator, 1, &SpacingType::Linear).unwrap();
        let target = DiagGaussian::standard(2);
        assert!(FabModel::new(flow, target, ais, LossType::default()).is_err());
    }
}
