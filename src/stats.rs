//! Log-space weight arithmetic and sampler statistics.
//!
//! Importance log-weights are kept in log-space everywhere; the functions here are the only
//! places where they are exponentiated, always after subtracting the maximum.

use crate::error::{FabError, Result};
use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use num_traits::Float;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::collections::VecDeque;

/// Maps NaN and `+inf` to `-inf`, leaves every other value untouched.
///
/// Used wherever a log-density or log-weight leaves a collaborator: a value that is not a
/// proper log-density contributes zero probability mass.
pub fn finite_or_neg_inf<T: Float>(x: T) -> T {
    if x.is_nan() || x == T::infinity() {
        T::neg_infinity()
    } else {
        x
    }
}

/// Numerically stable `log(sum(exp(log_w)))`. NaN entries are treated as `-inf`.
pub fn log_sum_exp(log_w: ArrayView1<f64>) -> f64 {
    if log_w.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max = *log_w.max_skipnan();
    if max.is_nan() || max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    let sum: f64 = log_w
        .iter()
        .filter(|x| !x.is_nan())
        .map(|&x| (x - max).exp())
        .sum();
    max + sum.ln()
}

/// Self-normalized importance weights `w_i / sum_j w_j`.
///
/// The weights are exponentiated relative to the largest one and then divided by their sum,
/// so the result sums to one to machine precision however large the log-weights are, unless
/// every weight is zero, in which case all entries are zero (a fully degenerate batch).
pub fn self_normalized_weights(log_w: ArrayView1<f64>) -> Array1<f64> {
    let clean = log_w.mapv(finite_or_neg_inf);
    let max = clean.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return Array1::zeros(log_w.len());
    }
    let w = clean.mapv(|x| (x - max).exp());
    let total = w.sum();
    if !(total > 0.0) || !total.is_finite() {
        return Array1::zeros(log_w.len());
    }
    w / total
}

/// Kish effective sample size `(sum w)^2 / sum w^2`, computed in log-space.
///
/// Returns `0.0` when every weight is zero.
pub fn effective_sample_size(log_w: ArrayView1<f64>) -> f64 {
    let lse = log_sum_exp(log_w);
    if !lse.is_finite() {
        return 0.0;
    }
    let doubled = log_w.mapv(|x| 2.0 * finite_or_neg_inf(x));
    (2.0 * lse - log_sum_exp(doubled.view())).exp()
}

/// Effective sample size divided by the number of samples, in `[0, 1]`.
pub fn effective_sample_size_fraction(log_w: ArrayView1<f64>) -> f64 {
    if log_w.is_empty() {
        return 0.0;
    }
    effective_sample_size(log_w) / log_w.len() as f64
}

/// Self-normalized weighted mean of the rows of `x`.
pub fn weighted_mean(x: ArrayView2<f64>, log_w: ArrayView1<f64>) -> Array1<f64> {
    let w = self_normalized_weights(log_w);
    x.t().dot(&w)
}

/// Multinomial resampling: draws `n` row indices with probability proportional to the weights.
pub fn resample_indices<R: Rng + ?Sized>(
    log_w: ArrayView1<f64>,
    n: usize,
    rng: &mut R,
) -> Result<Vec<usize>> {
    let w = self_normalized_weights(log_w);
    let dist = WeightedIndex::new(w.iter())
        .map_err(|e| FabError::Tensor(format!("cannot resample from weights: {e}")))?;
    Ok((0..n).map(|_| dist.sample(rng)).collect())
}

/// Sliding-window estimate of the acceptance probability.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptanceWindow {
    window_size: usize,
    window: VecDeque<f64>,
}

impl AcceptanceWindow {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            window: VecDeque::with_capacity(window_size.max(1)),
        }
    }

    pub fn push(&mut self, p_accept: f64) {
        if !p_accept.is_finite() {
            return;
        }
        self.window.push_front(p_accept);
        if self.window.len() > self.window_size {
            self.window.pop_back();
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.window.is_empty() {
            None
        } else {
            Some(self.window.iter().sum::<f64>() / self.window.len() as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_log_sum_exp_matches_naive() {
        let x = array![0.1, -2.0, 3.5];
        let naive = x.mapv(f64::exp).sum().ln();
        assert_abs_diff_eq!(log_sum_exp(x.view()), naive, epsilon = 1e-12);
    }

    #[test]
    fn test_log_sum_exp_extreme_values() {
        let x = array![1e6, 1e6 - 1.0, -1e7];
        let expected = 1e6 + (1.0 + (-1.0f64).exp()).ln();
        assert_abs_diff_eq!(log_sum_exp(x.view()), expected, epsilon = 1e-6);

        let all_neg_inf = array![f64::NEG_INFINITY, f64::NEG_INFINITY];
        assert_eq!(log_sum_exp(all_neg_inf.view()), f64::NEG_INFINITY);

        let with_nan = array![f64::NAN, 0.0];
        assert_abs_diff_eq!(log_sum_exp(with_nan.view()), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_self_normalized_weights_sum_to_one_for_huge_log_weights() {
        let log_w = array![-2e6, 5e6, 5e6 - 3.0, f64::NEG_INFINITY, f64::NAN, 1.2e6];
        let w = self_normalized_weights(log_w.view());
        assert!(w.iter().all(|x| x.is_finite() && *x >= 0.0));
        assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-12);
        assert_eq!(w[3], 0.0);
        assert_eq!(w[4], 0.0);

        // Many comparable weights around |log w| = 1e6.
        let spread = Array1::from_shape_fn(200, |i| -1e6 + 0.37 * i as f64);
        let w = self_normalized_weights(spread.view());
        assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-12);
        assert!(w[199] > w[0]);
    }

    #[test]
    fn test_self_normalized_weights_all_zero() {
        let log_w = array![f64::NEG_INFINITY, f64::NAN];
        let w = self_normalized_weights(log_w.view());
        assert_eq!(w, array![0.0, 0.0]);
        assert_eq!(effective_sample_size(log_w.view()), 0.0);
    }

    #[test]
    fn test_effective_sample_size() {
        let uniform = Array1::<f64>::from_elem(100, -3.0);
        assert_abs_diff_eq!(effective_sample_size(uniform.view()), 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(
            effective_sample_size_fraction(uniform.view()),
            1.0,
            epsilon = 1e-11
        );

        let mut collapsed = Array1::<f64>::from_elem(100, -1e4);
        collapsed[7] = 0.0;
        assert_abs_diff_eq!(effective_sample_size(collapsed.view()), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_weighted_mean() {
        let x = array![[0.0, 1.0], [2.0, 3.0]];
        let log_w = array![0.0, (3.0f64).ln()];
        assert_abs_diff_eq!(
            weighted_mean(x.view(), log_w.view()),
            array![1.5, 2.5],
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_resample_indices_skips_zero_weights() {
        let mut rng = SmallRng::seed_from_u64(42);
        let log_w = array![f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY];
        let idx = resample_indices(log_w.view(), 50, &mut rng).unwrap();
        assert!(idx.iter().all(|&i| i == 1));

        let none = array![f64::NEG_INFINITY];
        assert!(resample_indices(none.view(), 1, &mut rng).is_err());
    }

    #[test]
    fn test_acceptance_window() {
        let mut window = AcceptanceWindow::new(2);
        assert_eq!(window.mean(), None);
        window.push(1.0);
        window.push(0.0);
        window.push(0.5);
        window.push(f64::NAN);
        assert_abs_diff_eq!(window.mean().unwrap(), 0.25, epsilon = 1e-12);
    }
}
