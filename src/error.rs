//! Error types shared across the crate.
//!
//! Per-sample numerical problems (NaN/Inf log-densities, gradients or weights) are never
//! errors: they are absorbed where they occur by rejecting the offending proposal or giving
//! the sample zero weight, and they are counted in the diagnostics. Only setup problems and
//! a batch in which *every* sample failed escalate to the caller.

use thiserror::Error;

/// Raised by a target or flow collaborator when a batch cannot be evaluated at all.
///
/// The samplers convert this into a log-density of `-inf` for every row of the batch.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("log-density evaluation failed: {0}")]
pub struct EvaluationError(pub String);

#[derive(Error, Debug)]
pub enum FabError {
    /// Invalid setup: unknown operator parameters, a malformed schedule, mismatched dimensions.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Every sample of a batch evaluated to `-inf`, even after one retry with a fresh seed.
    #[error("every one of the {n_samples} samples failed to evaluate (after {attempts} attempts)")]
    BatchEvaluation { n_samples: usize, attempts: usize },

    #[error("tensor data error: {0}")]
    Tensor(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "csv")]
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, FabError>;

impl FabError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        FabError::Configuration(msg.into())
    }
}
