//! Checkpoints for exact resumption of a training run.
//!
//! A checkpoint is a directory `iter_<n>/` holding the flow parameters (`flow.mpk`) and the
//! optimizer state (`optimizer.mpk`), both written with `burn`'s named MessagePack
//! recorder, plus `state.json` with the iteration counter and the transition-operator
//! tuning state.

use crate::error::{FabError, Result};
use crate::transition::TransitionState;
use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::record::{DoublePrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const FLOW_FILE: &str = "flow";
const OPTIMIZER_FILE: &str = "optimizer";
const STATE_FILE: &str = "state.json";

/// The non-tensor part of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Number of completed training iterations.
    pub iteration: usize,
    pub transition_state: TransitionState,
}

/// `root/iter_<iteration>`
pub fn checkpoint_dir(root: &Path, iteration: usize) -> PathBuf {
    root.join(format!("iter_{iteration}"))
}

/// The checkpoint directory under `root` with the highest iteration, if any.
pub fn latest_checkpoint(root: &Path) -> Result<Option<PathBuf>> {
    if !root.exists() {
        return Ok(None);
    }
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        let iteration = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("iter_"))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(iteration) = iteration {
            if path.join(STATE_FILE).exists() && best.as_ref().map_or(true, |(b, _)| iteration > *b)
            {
                best = Some((iteration, path));
            }
        }
    }
    Ok(best.map(|(_, p)| p))
}

fn recorder() -> NamedMpkFileRecorder<DoublePrecisionSettings> {
    NamedMpkFileRecorder::<DoublePrecisionSettings>::new()
}

/// Writes flow, optimizer and tuning state into `dir`, creating it if needed.
pub fn save_checkpoint<B, M, O>(
    dir: &Path,
    flow: &M,
    optimizer: &O,
    state: &CheckpointState,
) -> Result<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    fs::create_dir_all(dir)?;
    let recorder = recorder();
    flow.clone()
        .save_file(dir.join(FLOW_FILE), &recorder)
        .map_err(|e| FabError::Checkpoint(format!("saving flow: {e}")))?;
    Recorder::<B>::record(&recorder, optimizer.to_record(), dir.join(OPTIMIZER_FILE))
        .map_err(|e| FabError::Checkpoint(format!("saving optimizer: {e}")))?;
    fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(state)?)?;
    log::info!("saved checkpoint at iteration {} to {}", state.iteration, dir.display());
    Ok(())
}

/// Restores what [`save_checkpoint`] wrote. `flow` and `optimizer` must have the same
/// structure as the saved ones.
pub fn load_checkpoint<B, M, O>(
    dir: &Path,
    flow: M,
    optimizer: O,
    device: &B::Device,
) -> Result<(M, O, CheckpointState)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let state_path = dir.join(STATE_FILE);
    if !state_path.exists() {
        return Err(FabError::Checkpoint(format!(
            "{} is not a checkpoint directory",
            dir.display()
        )));
    }
    let recorder = recorder();
    let flow = flow
        .load_file(dir.join(FLOW_FILE), &recorder, device)
        .map_err(|e| FabError::Checkpoint(format!("loading flow: {e}")))?;
    let record = Recorder::<B>::load(&recorder, dir.join(OPTIMIZER_FILE), device)
        .map_err(|e| FabError::Checkpoint(format!("loading optimizer: {e}")))?;
    let optimizer = optimizer.load_record(record);
    let state: CheckpointState = serde_json::from_str(&fs::read_to_string(state_path)?)?;
    Ok((flow, optimizer, state))
}
