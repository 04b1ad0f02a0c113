//! Evaluation of several trained models over several seeds.
//!
//! Every (model, seed) pair is evaluated on its own rayon task with a freshly built model,
//! so no sampler or operator state is shared between tasks. The AIS target of each model is
//! set to `p` before evaluating.

pub use crate::config::EvalConfig;
use crate::distributions::TargetDistribution;
use crate::error::Result;
use crate::flow::Flow;
use crate::logger::Metrics;
use crate::model::{AisTarget, FabModel};
use burn::tensor::backend::AutodiffBackend;
use ndarray::Array1;
use rayon::prelude::*;
use std::path::Path;

/// Metrics aggregated by [`summarize`].
pub const SUMMARY_KEYS: [&str; 4] = [
    "eval_ess_flow",
    "eval_ess_ais",
    "test_set_mean_log_prob",
    "kl_forward",
];

/// Evaluation metrics of one trained model.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalRecord {
    pub model_name: String,
    pub seed: u64,
    pub metrics: Metrics,
}

/// Mean and standard error of [`SUMMARY_KEYS`] over the seeds of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub model_name: String,
    pub n_seeds: usize,
    pub mean: Metrics,
    pub sem: Metrics,
}

/// Evaluates every model in `config` for every seed in parallel.
///
/// `build` receives the model name, the seed and the directory the model is stored in, and
/// returns the ready-to-evaluate model. Records come back in the order of
/// `config.model_names` then `config.seeds`.
pub fn evaluate_models<B, F, T, Build>(config: &EvalConfig, build: Build) -> Result<Vec<EvalRecord>>
where
    B: AutodiffBackend,
    F: Flow<B>,
    T: TargetDistribution<B>,
    Build: Fn(&str, u64, &Path) -> Result<FabModel<B, F, T>> + Sync,
{
    config.validate()?;
    let jobs: Vec<(&str, u64)> = config
        .model_names
        .iter()
        .flat_map(|name| config.seeds.iter().map(move |seed| (name.as_str(), *seed)))
        .collect();

    jobs.into_par_iter()
        .map(|(name, seed)| {
            let mut model = build(name, seed, &config.model_path(name, seed))?;
            model.set_ais_target(AisTarget::Target);
            let metrics = model.get_eval_info(config.n_samples, config.batch_size)?;
            log::info!(
                "{name} (seed {seed}): ess flow {:.4}, ess ais {:.4}",
                metrics.get("eval_ess_flow").copied().unwrap_or(f64::NAN),
                metrics.get("eval_ess_ais").copied().unwrap_or(f64::NAN)
            );
            Ok(EvalRecord {
                model_name: name.to_string(),
                seed,
                metrics,
            })
        })
        .collect()
}

/// Groups records by model (first-appearance order) and aggregates [`SUMMARY_KEYS`].
///
/// The standard error uses the population standard deviation, `std / sqrt(n)`. Keys a model
/// never reported are left out of its summary.
pub fn summarize(records: &[EvalRecord]) -> Vec<ModelSummary> {
    let mut names: Vec<&str> = Vec::new();
    for record in records {
        if !names.contains(&record.model_name.as_str()) {
            names.push(&record.model_name);
        }
    }
    names
        .into_iter()
        .map(|name| {
            let group: Vec<&EvalRecord> =
                records.iter().filter(|r| r.model_name == name).collect();
            let mut mean = Metrics::new();
            let mut sem = Metrics::new();
            for key in SUMMARY_KEYS {
                let values: Array1<f64> = group
                    .iter()
                    .filter_map(|r| r.metrics.get(key).copied())
                    .collect();
                if let Some(m) = values.mean() {
                    mean.insert(key.to_string(), m);
                    sem.insert(key.to_string(), values.std(0.0) / (values.len() as f64).sqrt());
                }
            }
            ModelSummary {
                model_name: name.to_string(),
                n_seeds: group.len(),
                mean,
                sem,
            }
        })
        .collect()
}

/// Writes one row per record: model name, seed, then every metric any record reported.
#[cfg(feature = "csv")]
pub fn write_results(records: &[EvalRecord], path: impl AsRef<Path>) -> Result<()> {
    let keys: std::collections::BTreeSet<&String> =
        records.iter().flat_map(|r| r.metrics.keys()).collect();
    let mut wtr = csv::Writer::from_path(path)?;
    let mut header = vec!["model_name".to_string(), "seed".to_string()];
    header.extend(keys.iter().map(|k| k.to_string()));
    wtr.write_record(&header)?;
    for record in records {
        let mut row = Vec::with_capacity(header.len());
        row.push(record.model_name.clone());
        row.push(record.seed.to_string());
        row.extend(keys.iter().map(|k| {
            record
                .metrics
                .get(*k)
                .map(|v| v.to_string())
                .unwrap_or_default()
        }));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ais::AnnealedImportanceSampler;
    use crate::distributions::DiagGaussian;
    use crate::flow::{FlowConfig, RealNvp};
    use crate::model::LossType;
    use crate::schedule::SpacingType;
    use crate::transition::{MetropolisConfig, TransitionOperatorConfig};
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use std::path::PathBuf;

    type B = Autodiff<NdArray<f64>>;

    fn record(name: &str, seed: u64, ess: f64) -> EvalRecord {
        let mut metrics = Metrics::new();
        metrics.insert("eval_ess_flow".into(), ess);
        metrics.insert("other".into(), 1.0);
        EvalRecord {
            model_name: name.into(),
            seed,
            metrics,
        }
    }

    #[test]
    fn test_summarize_mean_and_sem() {
        let records = vec![
            record("b", 0, 0.2),
            record("a", 0, 0.5),
            record("b", 1, 0.4),
        ];
        let summary = summarize(&records);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].model_name, "b");
        assert_eq!(summary[0].n_seeds, 2);
        assert_abs_diff_eq!(summary[0].mean["eval_ess_flow"], 0.3, epsilon = 1e-12);
        // population std of {0.2, 0.4} is 0.1
        assert_abs_diff_eq!(
            summary[0].sem["eval_ess_flow"],
            0.1 / 2f64.sqrt(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(summary[1].sem["eval_ess_flow"], 0.0);
        assert!(!summary[0].mean.contains_key("other"));
        assert!(!summary[0].mean.contains_key("kl_forward"));
    }

    #[test]
    fn test_evaluate_models_in_parallel() {
        let config = EvalConfig {
            model_dir: PathBuf::from("unused"),
            model_names: vec!["identity".into(), "other".into()],
            seeds: vec![0, 1],
            n_samples: 64,
            batch_size: 32,
            results_csv: PathBuf::from("unused.csv"),
        };
        let build = |_: &str, seed: u64, path: &Path| -> Result<FabModel<B, RealNvp<B>, DiagGaussian>> {
            assert!(path.to_string_lossy().ends_with(&format!("_seed{seed}")));
            let device = Default::default();
            let flow = FlowConfig {
                n_layers: 2,
                hidden_dim: 4,
            }
            .init::<B>(2, &device)?;
            let operator = TransitionOperatorConfig::Metropolis(MetropolisConfig::default())
                .build::<B>(2, 2, seed)?;
            let ais = AnnealedImportanceSampler::new(operator, 2, &SpacingType::Linear)?;
            FabModel::new(flow, DiagGaussian::standard(2), ais, LossType::default())
        };
        let records = evaluate_models(&config, build).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(
            records
                .iter()
                .map(|r| (r.model_name.as_str(), r.seed))
                .collect::<Vec<_>>(),
            vec![("identity", 0), ("identity", 1), ("other", 0), ("other", 1)]
        );
        for r in &records {
            // The flow starts as the standard normal, which is exactly the target.
            assert_abs_diff_eq!(r.metrics["eval_ess_flow"], 1.0, epsilon = 1e-9);
        }
    }

    #[cfg(feature = "csv")]
    #[test]
    fn test_write_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        write_results(&[record("a", 0, 0.5), record("a", 1, 0.25)], &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("model_name,seed,eval_ess_flow,other"));
        assert_eq!(lines.next(), Some("a,0,0.5,1"));
        assert_eq!(lines.next(), Some("a,1,0.25,1"));
    }
}
