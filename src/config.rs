/*!
Run configuration, read from JSON and validated once at setup.

Every field has a default, so a configuration file only needs to list what differs:

```rust
use fab_mcmc::config::FabConfig;

let config: FabConfig = serde_json::from_str(
    r#"{ "dim": 2, "n_intermediate_distributions": 4, "spacing": "geometric" }"#,
)
.unwrap();
config.validate().unwrap();
assert_eq!(config.batch_size, 128);
```
*/

use crate::ais::AnnealedImportanceSampler;
use crate::distributions::TargetDistribution;
use crate::error::{FabError, Result};
use crate::flow::{Flow, FlowConfig};
use crate::model::{FabModel, LossType};
use crate::replay_buffer::{ReplayBuffer, ReplayBufferConfig};
use crate::schedule::{beta_schedule, SpacingType};
use crate::trainer::TrainerConfig;
use crate::transition::TransitionOperatorConfig;
use burn::grad_clipping::GradientClippingConfig;
use burn::optim::AdamConfig;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Everything needed to set up a FAB training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabConfig {
    pub dim: usize,
    pub batch_size: usize,
    pub n_intermediate_distributions: usize,
    pub spacing: SpacingType,
    pub lr: f64,
    /// Gradient norm clipping threshold; `None` disables clipping.
    pub max_gradient_norm: Option<f64>,
    pub transition_operator: TransitionOperatorConfig,
    pub loss: LossType,
    /// Weight of the flow-sample forward KL term added to the FAB loss (0 disables it).
    pub flow_sample_weight: f64,
    pub n_iterations: usize,
    pub seed: u64,
    pub flow: FlowConfig,
    /// Train from a replay buffer instead of fresh AIS samples every step.
    pub replay_buffer: Option<ReplayBufferConfig>,
    pub n_updates_per_ais: usize,
    pub n_eval: usize,
    pub eval_batch_size: usize,
    pub eval_inner_batch_size: usize,
    pub n_plot: usize,
    pub n_checkpoints: usize,
}

impl Default for FabConfig {
    fn default() -> Self {
        Self {
            dim: 2,
            batch_size: 128,
            n_intermediate_distributions: 2,
            spacing: SpacingType::Linear,
            lr: 1e-4,
            max_gradient_norm: Some(100.0),
            transition_operator: TransitionOperatorConfig::default(),
            loss: LossType::default(),
            flow_sample_weight: 0.0,
            n_iterations: 1000,
            seed: 0,
            flow: FlowConfig::default(),
            replay_buffer: None,
            n_updates_per_ais: 4,
            n_eval: 0,
            eval_batch_size: 1000,
            eval_inner_batch_size: 100,
            n_plot: 0,
            n_checkpoints: 0,
        }
    }
}

impl FabConfig {
    /// Reads and validates a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(FabError::config("dim must be positive"));
        }
        beta_schedule(&self.spacing, self.n_intermediate_distributions)?;
        if let Some(norm) = self.max_gradient_norm {
            if !(norm > 0.0) || !norm.is_finite() {
                return Err(FabError::config(format!(
                    "max_gradient_norm must be positive, got {norm}"
                )));
            }
        }
        if let LossType::Fab { alpha } = self.loss {
            if !(alpha > 0.0) || !alpha.is_finite() {
                return Err(FabError::config(format!("alpha must be positive, got {alpha}")));
            }
        }
        if !(self.flow_sample_weight >= 0.0) || !self.flow_sample_weight.is_finite() {
            return Err(FabError::config(format!(
                "flow_sample_weight must be non-negative, got {}",
                self.flow_sample_weight
            )));
        }
        self.flow.validate(self.dim)?;
        if let Some(buffer) = &self.replay_buffer {
            buffer.validate()?;
            if buffer.min_length < self.batch_size {
                log::warn!(
                    "replay buffer min_length {} is smaller than the batch size {}",
                    buffer.min_length,
                    self.batch_size
                );
            }
        }
        // The checkpoint directory is supplied at run time.
        TrainerConfig {
            n_checkpoints: 0,
            ..self.trainer_config(None)
        }
        .validate()?;
        // Operator parameters are checked by building a throwaway instance.
        self.transition_operator
            .build::<burn::backend::Autodiff<burn::backend::NdArray>>(
                self.dim,
                self.n_intermediate_distributions,
                self.seed,
            )
            .map(|_| ())
    }

    /// The annealed importance sampler described by this configuration.
    pub fn build_ais<B: AutodiffBackend>(
        &self,
        device: &B::Device,
    ) -> Result<AnnealedImportanceSampler<B>> {
        let operator = self.transition_operator.build::<B>(
            self.dim,
            self.n_intermediate_distributions,
            self.seed,
        )?;
        Ok(
            AnnealedImportanceSampler::new(operator, self.n_intermediate_distributions, &self.spacing)?
                .with_device(device.clone())
                .with_seed(self.seed),
        )
    }

    /// Flow, target and the configured sampler and loss wired into a [`FabModel`].
    pub fn build_model<B, F, T>(&self, flow: F, target: T, device: &B::Device) -> Result<FabModel<B, F, T>>
    where
        B: AutodiffBackend,
        F: Flow<B>,
        T: TargetDistribution<B>,
    {
        let ais = self.build_ais::<B>(device)?;
        FabModel::new(flow, target, ais, self.loss)?.with_flow_sample_weight(self.flow_sample_weight)
    }

    /// Adam with the configured gradient clipping.
    pub fn optimizer(&self) -> AdamConfig {
        AdamConfig::new().with_grad_clipping(
            self.max_gradient_norm
                .map(|norm| GradientClippingConfig::Norm(norm as f32)),
        )
    }

    pub fn replay_buffer(&self) -> Result<Option<ReplayBuffer>> {
        self.replay_buffer
            .as_ref()
            .map(|config| ReplayBuffer::new(config.clone(), self.dim, self.seed))
            .transpose()
    }

    pub fn trainer_config(&self, save_path: Option<PathBuf>) -> TrainerConfig {
        TrainerConfig {
            n_iterations: self.n_iterations,
            batch_size: self.batch_size,
            lr: self.lr,
            n_eval: self.n_eval,
            eval_batch_size: self.eval_batch_size,
            eval_inner_batch_size: self.eval_inner_batch_size,
            n_plot: self.n_plot,
            n_checkpoints: self.n_checkpoints,
            save_path,
            n_updates_per_ais: self.n_updates_per_ais,
            ..TrainerConfig::default()
        }
    }
}

/// Batch evaluation of trained models.
///
/// Model `name` with seed `s` is expected at `model_dir/<name>_seed<s>`; the aggregated
/// results go to `results_csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    pub model_dir: PathBuf,
    pub model_names: Vec<String>,
    pub seeds: Vec<u64>,
    pub n_samples: usize,
    pub batch_size: usize,
    pub results_csv: PathBuf,
}

impl EvalConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_names.is_empty() || self.seeds.is_empty() {
            return Err(FabError::config("evaluation needs at least one model and one seed"));
        }
        if self.n_samples == 0 || self.batch_size == 0 {
            return Err(FabError::config("n_samples and batch_size must be positive"));
        }
        Ok(())
    }

    pub fn model_path(&self, model_name: &str, seed: u64) -> PathBuf {
        self.model_dir.join(format!("{model_name}_seed{seed}"))
    }
}
