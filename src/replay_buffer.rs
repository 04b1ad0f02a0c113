/*!
Bounded store of AIS samples that decouples sample generation from gradient steps.

Each entry keeps the sample, its raw AIS log-weight and the flow log-density at the time the
weight was valid. Weights are normalized only when a minibatch is read, and after every
gradient step the entries that were used are re-weighted for the new flow:
`log_w += (1 - alpha) (log q_new - log q_old)`. Storage is pre-allocated; once full the
oldest entries are overwritten.
*/

use crate::error::{FabError, Result};
use crate::stats::{resample_indices, self_normalized_weights};
use ndarray::prelude::*;
use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// How minibatches are drawn and weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BufferSampling {
    /// Uniform draws; the loss uses the self-normalized stored weights of the minibatch.
    #[default]
    SelfNormalized,
    /// Draws proportional to the stored weights; the loss is an unweighted mean.
    Prioritized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayBufferConfig {
    pub capacity: usize,
    /// Entries required before the first minibatch can be drawn.
    pub min_length: usize,
    pub sampling: BufferSampling,
}

impl Default for ReplayBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            min_length: 1_000,
            sampling: BufferSampling::SelfNormalized,
        }
    }
}

impl ReplayBufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || self.min_length == 0 || self.min_length > self.capacity {
            return Err(FabError::config(format!(
                "replay buffer needs 0 < min_length ({}) <= capacity ({})",
                self.min_length, self.capacity
            )));
        }
        Ok(())
    }
}

/// A minibatch read from the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferBatch {
    pub x: Array2<f64>,
    /// Weight of every row in the loss; sums to one unless every weight is zero.
    pub loss_weights: Array1<f64>,
    /// Buffer slots the rows came from, for [`ReplayBuffer::adjust`].
    pub indices: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    config: ReplayBufferConfig,
    x: Array2<f64>,
    log_w: Array1<f64>,
    log_q: Array1<f64>,
    len: usize,
    cursor: usize,
    rng: SmallRng,
}

impl ReplayBuffer {
    pub fn new(config: ReplayBufferConfig, dim: usize, seed: u64) -> Result<Self> {
        config.validate()?;
        if dim == 0 {
            return Err(FabError::config("replay buffer needs dim > 0"));
        }
        let capacity = config.capacity;
        Ok(Self {
            config,
            x: Array2::zeros((capacity, dim)),
            log_w: Array1::from_elem(capacity, f64::NEG_INFINITY),
            log_q: Array1::zeros(capacity),
            len: 0,
            cursor: 0,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn is_ready(&self) -> bool {
        self.len >= self.config.min_length
    }

    pub fn log_weights(&self) -> ArrayView1<'_, f64> {
        self.log_w.slice(s![..self.len])
    }

    /// Inserts a batch, overwriting the oldest entries once the buffer is full.
    pub fn add(
        &mut self,
        x: ArrayView2<f64>,
        log_w: ArrayView1<f64>,
        log_q: ArrayView1<f64>,
    ) -> Result<()> {
        if x.ncols() != self.x.ncols() || x.nrows() != log_w.len() || x.nrows() != log_q.len() {
            return Err(FabError::config(format!(
                "replay buffer stores [n, {}] samples with one log-weight and log q each",
                self.x.ncols()
            )));
        }
        for ((row, w), q) in x.rows().into_iter().zip(log_w.iter()).zip(log_q.iter()) {
            self.x.row_mut(self.cursor).assign(&row);
            self.log_w[self.cursor] = if w.is_nan() { f64::NEG_INFINITY } else { *w };
            self.log_q[self.cursor] = *q;
            self.cursor = (self.cursor + 1) % self.config.capacity;
            self.len = (self.len + 1).min(self.config.capacity);
        }
        Ok(())
    }

    /// Draws `batch_size` entries (with replacement) under the configured policy.
    pub fn sample(&mut self, batch_size: usize) -> Result<BufferBatch> {
        if !self.is_ready() {
            return Err(FabError::config(format!(
                "replay buffer holds {} entries, {} required before sampling",
                self.len, self.config.min_length
            )));
        }
        let (indices, loss_weights) = match self.config.sampling {
            BufferSampling::SelfNormalized => {
                let indices: Vec<usize> = (0..batch_size)
                    .map(|_| self.rng.gen_range(0..self.len))
                    .collect();
                let log_w: Array1<f64> = indices.iter().map(|&i| self.log_w[i]).collect();
                (indices, self_normalized_weights(log_w.view()))
            }
            BufferSampling::Prioritized => {
                let indices =
                    resample_indices(self.log_w.slice(s![..self.len]), batch_size, &mut self.rng)?;
                let uniform = Array1::from_elem(batch_size, 1.0 / batch_size.max(1) as f64);
                (indices, uniform)
            }
        };
        let x = self.x.select(Axis(0), &indices);
        Ok(BufferBatch {
            x,
            loss_weights,
            indices,
        })
    }

    /// Re-weights the entries at `indices` after the flow changed.
    ///
    /// Repeated indices are harmless: once an entry has been updated its stored `log q`
    /// equals the new one and further updates add nothing. The inputs are checked before
    /// any entry is touched.
    pub fn adjust(&mut self, indices: &[usize], log_q_new: &[f64], alpha: f64) -> Result<()> {
        if indices.len() != log_q_new.len() {
            return Err(FabError::config("one new log q per index is required"));
        }
        if let Some(i) = indices.iter().find(|&&i| i >= self.len) {
            return Err(FabError::config(format!("buffer index {i} out of range")));
        }
        self.reweight(indices, log_q_new, alpha);
        Ok(())
    }

    /// [`ReplayBuffer::adjust`] for indices returned by [`ReplayBuffer::sample`]; pairs
    /// past the end of either slice or outside the buffer are ignored.
    pub(crate) fn reweight(&mut self, indices: &[usize], log_q_new: &[f64], alpha: f64) {
        for (&i, &q_new) in indices.iter().zip(log_q_new) {
            if i >= self.len {
                continue;
            }
            let delta = (1.0 - alpha) * (q_new - self.log_q[i]);
            self.log_w[i] = if delta.is_finite() {
                self.log_w[i] + delta
            } else if alpha == 1.0 {
                self.log_w[i]
            } else {
                f64::NEG_INFINITY
            };
            self.log_q[i] = q_new;
        }
    }
}
