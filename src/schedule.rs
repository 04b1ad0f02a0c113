//! Interpolation schedules (`beta` sequences) for annealed importance sampling.
//!
//! A schedule for `K` intermediate distributions has `K + 1` points, starts at exactly `0`,
//! ends at exactly `1` and never decreases.

use crate::error::{FabError, Result};
use serde::{Deserialize, Serialize};

/// Point where the geometric schedule switches from linear to geometric spacing.
const GEOMETRIC_SWITCH: f64 = 0.01;

/// How the `beta` values between base (`0`) and target (`1`) are spaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpacingType {
    /// Evenly spaced points.
    #[default]
    Linear,
    /// A short linear ramp on `[0, 0.01)` followed by geometric spacing up to `1`, which puts
    /// more stages close to the base where the first increments are largest.
    Geometric,
    /// User-provided points, validated on construction.
    Custom(Vec<f64>),
}

/// Builds the `K + 1` beta values for `n_intermediate_distributions = K`.
pub fn beta_schedule(spacing: &SpacingType, n_intermediate_distributions: usize) -> Result<Vec<f64>> {
    let k = n_intermediate_distributions;
    if k == 0 {
        return Err(FabError::config(
            "at least one intermediate distribution is required",
        ));
    }
    let betas = match spacing {
        SpacingType::Linear => linspace(0.0, 1.0, k + 1),
        SpacingType::Geometric => geometric(k),
        SpacingType::Custom(points) => {
            if points.len() != k + 1 {
                return Err(FabError::config(format!(
                    "custom schedule has {} points, expected {}",
                    points.len(),
                    k + 1
                )));
            }
            points.clone()
        }
    };
    validate_schedule(&betas)?;
    Ok(betas)
}

/// Checks the schedule invariants: finite, inside `[0, 1]`, monotone, endpoints `0` and `1`.
pub fn validate_schedule(betas: &[f64]) -> Result<()> {
    if betas.len() < 2 {
        return Err(FabError::config("a schedule needs at least two points"));
    }
    if let Some(b) = betas.iter().find(|b| !b.is_finite() || **b < 0.0 || **b > 1.0) {
        return Err(FabError::config(format!("beta {b} is outside [0, 1]")));
    }
    if betas[0] != 0.0 || betas[betas.len() - 1] != 1.0 {
        return Err(FabError::config("schedule must start at 0 and end at 1"));
    }
    if let Some(w) = betas.windows(2).find(|w| w[1] < w[0]) {
        return Err(FabError::config(format!(
            "schedule is not monotone: {} follows {}",
            w[1], w[0]
        )));
    }
    Ok(())
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![end];
    }
    let step = (end - start) / (n - 1) as f64;
    let mut out: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
    // Pin the endpoint so that floating error cannot leave it at 0.9999...
    out[n - 1] = end;
    out
}

fn geomspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    linspace(start.ln(), end.ln(), n)
        .into_iter()
        .map(f64::exp)
        .enumerate()
        .map(|(i, v)| if i == n - 1 { end } else { v })
        .collect()
}

fn geometric(k: usize) -> Vec<f64> {
    let n_points = k + 1;
    let n_linear = (k / 5).max(1);
    let mut betas = linspace(0.0, GEOMETRIC_SWITCH, n_linear + 1);
    betas.truncate(n_linear);
    betas.extend(geomspace(GEOMETRIC_SWITCH, 1.0, n_points - n_linear));
    betas
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn check_invariants(betas: &[f64], k: usize) {
        assert_eq!(betas.len(), k + 1);
        assert_eq!(betas[0], 0.0);
        assert_eq!(betas[k], 1.0);
        assert!(betas.windows(2).all(|w| w[0] <= w[1]), "{betas:?}");
    }

    #[test]
    fn test_linear_schedule() {
        let betas = beta_schedule(&SpacingType::Linear, 4).unwrap();
        assert_abs_diff_eq!(betas[1], 0.25, epsilon = 1e-15);
        check_invariants(&betas, 4);
    }

    #[test]
    fn test_monotone_for_every_k() {
        for k in 1..200 {
            check_invariants(&beta_schedule(&SpacingType::Linear, k).unwrap(), k);
            check_invariants(&beta_schedule(&SpacingType::Geometric, k).unwrap(), k);
        }
    }

    #[test]
    fn test_geometric_front_loads_stages() {
        let betas = beta_schedule(&SpacingType::Geometric, 20).unwrap();
        let below_half = betas.iter().filter(|b| **b < 0.5).count();
        assert!(below_half > 10, "{betas:?}");
    }

    #[test]
    fn test_zero_stages_rejected() {
        assert!(matches!(
            beta_schedule(&SpacingType::Linear, 0),
            Err(FabError::Configuration(_))
        ));
    }

    #[test]
    fn test_custom_schedule_validation() {
        assert!(beta_schedule(&SpacingType::Custom(vec![0.0, 0.3, 1.0]), 2).is_ok());
        for bad in [
            vec![0.0, 0.6, 0.4, 1.0],
            vec![0.1, 0.5, 0.7, 1.0],
            vec![0.0, 0.5, 0.7, 0.9],
            vec![0.0, f64::NAN, 0.7, 1.0],
        ] {
            assert!(beta_schedule(&SpacingType::Custom(bad), 3).is_err());
        }
        assert!(beta_schedule(&SpacingType::Custom(vec![0.0, 1.0]), 3).is_err());
    }
}
