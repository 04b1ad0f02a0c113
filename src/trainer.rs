/*!
The training loop: sample a batch, compute the loss, back-propagate, step the optimizer, and
periodically evaluate, plot, log and checkpoint.

Each iteration is atomic with respect to the persisted state. The flow and the optimizer
only change in the final optimizer step, and the transition-operator tuning state is restored
to its value at the start of the iteration if anything fails. The loop can be interrupted
between iterations through the flag returned by [`Trainer::stop_handle`].
*/

use crate::checkpoint::{checkpoint_dir, load_checkpoint, save_checkpoint, CheckpointState};
use crate::distributions::{tensor_to_vec, TargetDistribution};
use crate::error::{FabError, Result};
use crate::flow::Flow;
use crate::logger::Logger;
use crate::model::{to_tensor, FabModel, LossInfo};
use crate::replay_buffer::ReplayBuffer;
use crate::stats::AcceptanceWindow;
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub n_iterations: usize,
    pub batch_size: usize,
    pub lr: f64,
    /// Number of evaluations spread evenly over the run (0 disables evaluation).
    pub n_eval: usize,
    pub eval_batch_size: usize,
    pub eval_inner_batch_size: usize,
    pub n_plot: usize,
    pub n_checkpoints: usize,
    /// Directory for checkpoints; required when `n_checkpoints > 0`.
    pub save_path: Option<PathBuf>,
    /// Gradient steps per AIS batch when training from a replay buffer.
    pub n_updates_per_ais: usize,
    pub show_progress: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            n_iterations: 1000,
            batch_size: 128,
            lr: 1e-4,
            n_eval: 0,
            eval_batch_size: 1000,
            eval_inner_batch_size: 100,
            n_plot: 0,
            n_checkpoints: 0,
            save_path: None,
            n_updates_per_ais: 4,
            show_progress: true,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(FabError::config("batch_size must be positive"));
        }
        if !(self.lr > 0.0) || !self.lr.is_finite() {
            return Err(FabError::config(format!("learning rate must be positive, got {}", self.lr)));
        }
        if self.n_eval > 0 && (self.eval_batch_size == 0 || self.eval_inner_batch_size == 0) {
            return Err(FabError::config("evaluation batch sizes must be positive"));
        }
        if self.n_checkpoints > 0 && self.save_path.is_none() {
            return Err(FabError::config("n_checkpoints > 0 requires a save_path"));
        }
        if self.n_updates_per_ais == 0 {
            return Err(FabError::config("n_updates_per_ais must be positive"));
        }
        Ok(())
    }
}

/// How a call to [`Trainer::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Completed iterations, counting those of a resumed run.
    pub iterations_completed: usize,
    /// Iterations whose update was skipped because the loss was not finite.
    pub n_skipped_updates: usize,
    pub interrupted: bool,
}

/// Called every `n_iterations / n_plot` iterations with the model and the iteration count.
/// The model is borrowed immutably so plotting cannot touch the sampler state.
pub type PlotFn<'a, M> = dyn FnMut(&M, usize) + 'a;

pub struct Trainer<B, F, T, O, L>
where
    B: AutodiffBackend,
    F: Flow<B> + AutodiffModule<B>,
    T: TargetDistribution<B>,
    O: Optimizer<F, B>,
    L: Logger,
{
    model: FabModel<B, F, T>,
    optimizer: O,
    logger: L,
    config: TrainerConfig,
    replay_buffer: Option<ReplayBuffer>,
    stop: Arc<AtomicBool>,
    iteration: usize,
    n_skipped: usize,
}

impl<B, F, T, O, L> Trainer<B, F, T, O, L>
where
    B: AutodiffBackend,
    F: Flow<B> + AutodiffModule<B>,
    T: TargetDistribution<B>,
    O: Optimizer<F, B>,
    L: Logger,
{
    pub fn new(model: FabModel<B, F, T>, optimizer: O, logger: L, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            optimizer,
            logger,
            config,
            replay_buffer: None,
            stop: Arc::new(AtomicBool::new(false)),
            iteration: 0,
            n_skipped: 0,
        })
    }

    /// Trains from a replay buffer instead of fresh AIS batches.
    pub fn with_replay_buffer(mut self, buffer: ReplayBuffer) -> Self {
        self.replay_buffer = Some(buffer);
        self
    }

    /// Setting the returned flag stops the run before the next iteration starts.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn model(&self) -> &FabModel<B, F, T> {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut FabModel<B, F, T> {
        &mut self.model
    }

    pub fn logger(&self) -> &L {
        &self.logger
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn into_parts(self) -> (FabModel<B, F, T>, O, L) {
        (self.model, self.optimizer, self.logger)
    }

    /// Writes a checkpoint of the current state into `dir`.
    pub fn save_checkpoint(&self, dir: &Path) -> Result<()> {
        let state = CheckpointState {
            iteration: self.iteration,
            transition_state: self.model.ais().transition_state(),
        };
        save_checkpoint::<B, F, O>(dir, &self.model.flow, &self.optimizer, &state)
    }

    /// Restores flow, optimizer, tuning state and iteration counter from `dir`.
    pub fn resume(mut self, dir: &Path) -> Result<Self> {
        let device = self.model.device();
        let (flow, optimizer, state) =
            load_checkpoint::<B, F, O>(dir, self.model.flow.clone(), self.optimizer, &device)?;
        self.model.flow = flow;
        self.optimizer = optimizer;
        self.model
            .ais_mut()
            .load_transition_state(state.transition_state)?;
        self.iteration = state.iteration;
        log::info!("resumed from {} at iteration {}", dir.display(), self.iteration);
        Ok(self)
    }

    /// Runs until `n_iterations` iterations are complete or the stop flag is raised.
    ///
    /// A failing iteration aborts the run; the flow, optimizer and tuning state are left as
    /// they were after the last completed iteration.
    pub fn run(&mut self, mut plot: Option<&mut PlotFn<'_, FabModel<B, F, T>>>) -> Result<TrainingSummary> {
        let n_iterations = self.config.n_iterations;
        let pb = if self.config.show_progress {
            ProgressBar::new(n_iterations as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.set_prefix("FAB");
        pb.set_position(self.iteration as u64);

        self.fill_replay_buffer()?;

        let mut accept_window = AcceptanceWindow::new(100);
        let mut interrupted = false;
        while self.iteration < n_iterations {
            if self.stop.load(Ordering::SeqCst) {
                log::info!("training interrupted after {} iterations", self.iteration);
                interrupted = true;
                break;
            }
            let snapshot = self.model.ais().transition_state();
            let info = match self.step() {
                Ok(info) => info,
                Err(e) => {
                    self.model.ais_mut().load_transition_state(snapshot)?;
                    pb.abandon_with_message(format!("failed at iteration {}", self.iteration));
                    self.logger.flush()?;
                    return Err(e);
                }
            };
            self.iteration += 1;
            let i = self.iteration;

            let mut metrics = info.metrics();
            let stages = self.model.ais().transition_state().stages;
            let p_accept: Vec<f64> = stages.iter().filter_map(|s| s.p_accept).collect();
            if !p_accept.is_empty() {
                let mean = p_accept.iter().sum::<f64>() / p_accept.len() as f64;
                metrics.insert("p_accept".into(), mean);
                accept_window.push(mean);
            }

            if is_due(i, n_iterations, self.config.n_eval) {
                match self
                    .model
                    .get_eval_info(self.config.eval_batch_size, self.config.eval_inner_batch_size)
                {
                    Ok(eval) => metrics.extend(eval),
                    Err(e) => log::warn!("evaluation at iteration {i} failed: {e}"),
                }
            }
            self.logger.write(i, &metrics);

            if is_due(i, n_iterations, self.config.n_plot) {
                if let Some(plot) = plot.as_deref_mut() {
                    plot(&self.model, i);
                }
            }
            if is_due(i, n_iterations, self.config.n_checkpoints) {
                if let Some(root) = self.config.save_path.clone() {
                    self.save_checkpoint(&checkpoint_dir(&root, i))?;
                }
            }

            pb.inc(1);
            pb.set_message(format!(
                "loss≈{:.3} ess≈{:.3} p(accept)≈{:.2}",
                info.loss,
                info.ess_ais,
                accept_window.mean().unwrap_or(f64::NAN)
            ));
        }
        if interrupted {
            pb.abandon_with_message("Interrupted");
        } else {
            pb.finish_with_message("Done!");
        }
        self.logger.flush()?;
        Ok(TrainingSummary {
            iterations_completed: self.iteration,
            n_skipped_updates: self.n_skipped,
            interrupted,
        })
    }

    fn fill_replay_buffer(&mut self) -> Result<()> {
        let batch_size = self.config.batch_size;
        let Some(buffer) = self.replay_buffer.as_mut() else {
            return Ok(());
        };
        while !buffer.is_ready() {
            let (batch, _) = self.model.ais_batch(batch_size)?;
            buffer.add(batch.x.view(), batch.log_w.view(), batch.log_q.view())?;
        }
        log::info!("replay buffer filled with {} samples", buffer.len());
        Ok(())
    }

    fn step(&mut self) -> Result<LossInfo> {
        if self.replay_buffer.is_some() {
            return self.step_with_buffer();
        }
        let (loss, info) = self.model.loss(self.config.batch_size)?;
        if !apply_gradients(&mut self.model, &mut self.optimizer, self.config.lr, loss, info.loss) {
            self.n_skipped += 1;
        }
        Ok(info)
    }

    /// One AIS batch into the buffer, then `n_updates_per_ais` gradient steps on buffer
    /// minibatches. Nothing after the first gradient step can fail: a draw that fails later
    /// ends the iteration with the updates completed so far.
    fn step_with_buffer(&mut self) -> Result<LossInfo> {
        let batch_size = self.config.batch_size;
        let (batch, mut info) = self.model.ais_batch(batch_size)?;
        let alpha = self.model.alpha();
        let device = self.model.device();
        let Some(buffer) = self.replay_buffer.as_mut() else {
            return Ok(info);
        };
        let before = buffer.clone();
        buffer.add(batch.x.view(), batch.log_w.view(), batch.log_q.view())?;

        let mut losses = Vec::with_capacity(self.config.n_updates_per_ais);
        for update in 0..self.config.n_updates_per_ais {
            let minibatch = match buffer.sample(batch_size) {
                Ok(minibatch) => minibatch,
                Err(e) if update == 0 => {
                    *buffer = before;
                    return Err(e);
                }
                Err(e) => {
                    log::warn!("stopping after {update} buffer updates: {e}");
                    break;
                }
            };
            let x = to_tensor::<B>(minibatch.x.view(), &device);
            let (loss, _) = self.model.weighted_nll(x.clone(), minibatch.loss_weights.view());
            let value = tensor_to_vec(loss.clone().detach())[0];
            if !apply_gradients(&mut self.model, &mut self.optimizer, self.config.lr, loss, value) {
                self.n_skipped += 1;
            }
            let log_q_new = tensor_to_vec(self.model.flow.log_prob(x).detach());
            buffer.reweight(&minibatch.indices, &log_q_new, alpha);
            losses.push(value);
        }
        info.loss = losses.iter().sum::<f64>() / losses.len() as f64;
        Ok(info)
    }
}

/// Backward pass and optimizer step. Returns `false` (and leaves the flow untouched) when
/// the loss is not finite.
fn apply_gradients<B, F, T, O>(
    model: &mut FabModel<B, F, T>,
    optimizer: &mut O,
    lr: f64,
    loss: Tensor<B, 1>,
    value: f64,
) -> bool
where
    B: AutodiffBackend,
    F: Flow<B> + AutodiffModule<B>,
    T: TargetDistribution<B>,
    O: Optimizer<F, B>,
{
    if !value.is_finite() {
        log::warn!("non-finite loss {value}, skipping the update");
        return false;
    }
    let grads = loss.backward();
    let grads = GradientsParams::from_grads(grads, &model.flow);
    model.flow = optimizer.step(lr, model.flow.clone(), grads);
    true
}

/// Whether iteration `i` (1-based) is one of `n_events` evenly spaced events.
fn is_due(i: usize, n_iterations: usize, n_events: usize) -> bool {
    if n_events == 0 || n_iterations == 0 {
        return false;
    }
    let every = (n_iterations / n_events).max(1);
    i % every == 0 || i == n_iterations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ais::AnnealedImportanceSampler;
    use crate::flow::{FlowConfig, RealNvp};
    use crate::logger::ListLogger;
    use crate::model::LossType;
    use crate::replay_buffer::ReplayBufferConfig;
    use crate::schedule::SpacingType;
    use crate::targets::GaussianMixture;
    use crate::transition::{MetropolisConfig, TransitionOperatorConfig};
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;
    use ndarray::array;

    type TestBackend = Autodiff<NdArray<f64>>;

    #[test]
    fn test_is_due() {
        let due: Vec<usize> = (1..=10).filter(|i| is_due(*i, 10, 3)).collect();
        assert_eq!(due, vec![3, 6, 9, 10]);
        assert!(!is_due(5, 10, 0));
        let all: Vec<usize> = (1..=3).filter(|i| is_due(*i, 3, 10)).collect();
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[test]
    fn test_config_validation() {
        assert!(TrainerConfig::default().validate().is_ok());
        let no_path = TrainerConfig {
            n_checkpoints: 2,
            ..TrainerConfig::default()
        };
        assert!(no_path.validate().is_err());
        let bad_lr = TrainerConfig {
            lr: 0.0,
            ..TrainerConfig::default()
        };
        assert!(bad_lr.validate().is_err());
    }

    #[test]
    fn test_failed_first_draw_leaves_buffer_unchanged() {
        let device = Default::default();
        let flow = FlowConfig {
            n_layers: 2,
            hidden_dim: 8,
        }
        .init::<TestBackend>(2, &device)
        .unwrap();
        let target = GaussianMixture::new(
            array![[-1.5, 0.0], [1.5, 0.0]],
            vec![0.7, 0.7],
            vec![0.5, 0.5],
        )
        .unwrap();
        let operator = TransitionOperatorConfig::Metropolis(MetropolisConfig::default())
            .build::<TestBackend>(2, 2, 3)
            .unwrap();
        let ais = AnnealedImportanceSampler::new(operator, 2, &SpacingType::Linear)
            .unwrap()
            .with_seed(3);
        let model = FabModel::new(flow, target, ais, LossType::default()).unwrap();
        // One AIS batch of 64 never reaches min_length, so the first draw fails.
        let buffer = ReplayBuffer::new(
            ReplayBufferConfig {
                capacity: 512,
                min_length: 256,
                ..ReplayBufferConfig::default()
            },
            2,
            3,
        )
        .unwrap();
        let config = TrainerConfig {
            batch_size: 64,
            show_progress: false,
            ..TrainerConfig::default()
        };
        let optimizer = AdamConfig::new().init::<TestBackend, RealNvp<TestBackend>>();
        let mut trainer = Trainer::new(model, optimizer, ListLogger::new(), config)
            .unwrap()
            .with_replay_buffer(buffer);

        assert!(trainer.step_with_buffer().is_err());
        assert_eq!(trainer.replay_buffer.as_ref().map(|b| b.len()), Some(0));
    }
}
