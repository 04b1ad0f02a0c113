//! Trains a RealNVP flow with FAB on one of the built-in targets.
//!
//! Writes `history.csv` (one row per iteration), `checkpoints/iter_<n>/` and, at the end,
//! `samples.csv` with AIS samples towards the target and their log-weights.
//!
//! ```text
//! RUST_LOG=info fab-train --config gmm.json --target gmm --output-dir runs/gmm
//! ```

use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use clap::{Parser, ValueEnum};
use fab_mcmc::checkpoint::latest_checkpoint;
use fab_mcmc::config::FabConfig;
use fab_mcmc::distributions::{tensor_to_vec, TargetDistribution};
use fab_mcmc::flow::RealNvp;
use fab_mcmc::io::csv::{save_weighted_samples, CsvLogger};
use fab_mcmc::model::{AisTarget, FabModel};
use fab_mcmc::targets::{GaussianMixture, ManyWell, TwoMoons};
use fab_mcmc::trainer::Trainer;
use ndarray::Array2;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

type B = Autodiff<NdArray<f64>>;

/// Benchmark mixture of the GMM problem.
const GMM_N_MIXES: usize = 40;
const GMM_LOC_SCALING: f64 = 40.0;
const GMM_LOG_VAR_SCALING: f64 = 1.0;

#[derive(ValueEnum, Clone, Copy, Debug)]
#[clap(rename_all = "kebab-case")]
enum Target {
    Gmm,
    ManyWell,
    TwoMoons,
}

#[derive(Parser)]
#[command(version, about, long_about=None)]
/// Train a normalizing flow with Flow Annealed Importance Sampling Bootstrap
struct Cli {
    /// JSON run configuration; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// target distribution
    #[arg(short, long, value_enum, default_value = "gmm")]
    target: Target,

    /// directory for the history, checkpoints and final samples
    #[arg(short, long, default_value = "fab_output")]
    output_dir: PathBuf,

    /// continue from the latest checkpoint in the output directory
    #[arg(long)]
    resume: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => FabConfig::from_json_file(path)?,
        None => FabConfig::default(),
    };
    fs::create_dir_all(&cli.output_dir)?;
    fs::write(
        cli.output_dir.join("config.json"),
        serde_json::to_string_pretty(&config)?,
    )?;
    B::seed(config.seed);

    match cli.target {
        Target::Gmm => {
            let target = GaussianMixture::random(
                config.dim,
                GMM_N_MIXES,
                GMM_LOC_SCALING,
                GMM_LOG_VAR_SCALING,
                config.seed,
            )?;
            train(target, &config, &cli)
        }
        Target::ManyWell => train(ManyWell::new(config.dim)?.with_seed(config.seed), &config, &cli),
        Target::TwoMoons => {
            if config.dim != 2 {
                return Err(format!("two moons is two-dimensional, config has dim {}", config.dim).into());
            }
            train(TwoMoons, &config, &cli)
        }
    }
}

fn train<T: TargetDistribution<B>>(target: T, config: &FabConfig, cli: &Cli) -> Result<(), Box<dyn Error>> {
    let device = Default::default();
    let flow = config.flow.init::<B>(config.dim, &device)?;
    let model: FabModel<B, RealNvp<B>, T> = config.build_model(flow, target, &device)?;
    let optimizer = config.optimizer().init::<B, RealNvp<B>>();
    let logger = CsvLogger::new(cli.output_dir.join("history.csv"));
    let checkpoints = cli.output_dir.join("checkpoints");

    let mut trainer = Trainer::new(
        model,
        optimizer,
        logger,
        config.trainer_config(Some(checkpoints.clone())),
    )?;
    if let Some(buffer) = config.replay_buffer()? {
        trainer = trainer.with_replay_buffer(buffer);
    }
    if cli.resume {
        match latest_checkpoint(&checkpoints)? {
            Some(dir) => trainer = trainer.resume(&dir)?,
            None => log::warn!("no checkpoint found in {}, starting from scratch", checkpoints.display()),
        }
    }

    let summary = trainer.run(None)?;
    log::info!(
        "finished after {} iterations ({} updates skipped)",
        summary.iterations_completed,
        summary.n_skipped_updates
    );

    let model = trainer.model_mut();
    model.set_ais_target(AisTarget::Target);
    let (x, log_w) = model.sample_ais(config.eval_batch_size, true)?;
    let x = Array2::from_shape_vec((config.eval_batch_size, config.dim), tensor_to_vec(x))?;
    save_weighted_samples(x.view(), log_w.view(), cli.output_dir.join("samples.csv"))?;
    Ok(())
}
