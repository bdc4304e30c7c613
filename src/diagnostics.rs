// Hotelling T2 and Q-residual (SPE) diagnostics on a fitted PCA model.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, FisherSnedecor, Normal};

use log::{debug, info, warn};

use crate::error::{MvspcError, Result};
use crate::pca::PcaModel;

/// Floor applied to per-component score variances before they are used as
/// divisors, so a zero-variance component cannot blow up T2.
pub(crate) const VARIANCE_FLOOR: f64 = 1e-10;

/// Below this second residual moment, Box's limit approximation is
/// numerically meaningless and empirical percentiles are used instead.
const THETA2_FLOOR: f64 = 1e-10;

/// Per-sample multivariate control statistics and their limits.
///
/// All index sets are sorted ascending. `combined_outliers` is the
/// intersection of the two 95% sets: samples that are simultaneously
/// high-leverage (T2) and poorly modeled (Q).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsResult {
    /// Hotelling T2 per sample. Shape: `(n_samples)`
    pub t2: Array1<f64>,
    /// Q residual (squared prediction error) per sample. Shape: `(n_samples)`
    pub q: Array1<f64>,
    pub t2_limit_95: f64,
    pub t2_limit_99: f64,
    pub q_limit_95: f64,
    pub q_limit_99: f64,
    pub t2_outliers_95: Vec<usize>,
    pub t2_outliers_99: Vec<usize>,
    pub q_outliers_95: Vec<usize>,
    pub q_outliers_99: Vec<usize>,
    pub combined_outliers: Vec<usize>,
}

/// Aggregate numbers consumed by report generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsSummary {
    pub t2_mean: f64,
    pub t2_max: f64,
    pub q_mean: f64,
    pub q_max: f64,
    pub n_outliers_t2_95: usize,
    pub n_outliers_q_95: usize,
    pub n_combined_outliers: usize,
}

impl DiagnosticsResult {
    pub fn summary(&self) -> DiagnosticsSummary {
        DiagnosticsSummary {
            t2_mean: self.t2.mean().unwrap_or(0.0),
            t2_max: self.t2.iter().cloned().fold(0.0, f64::max),
            q_mean: self.q.mean().unwrap_or(0.0),
            q_max: self.q.iter().cloned().fold(0.0, f64::max),
            n_outliers_t2_95: self.t2_outliers_95.len(),
            n_outliers_q_95: self.q_outliers_95.len(),
            n_combined_outliers: self.combined_outliers.len(),
        }
    }
}

/// Sample variance (ddof = 1) of each score column, floored at
/// [`VARIANCE_FLOOR`].
pub(crate) fn score_variances(model: &PcaModel) -> Array1<f64> {
    model
        .scores
        .map_axis(Axis(0), |col| col.var(1.0).max(VARIANCE_FLOOR))
}

/// Hotelling T2 per sample: the squared Mahalanobis-style distance in score
/// space, `Σ_a scores[i,a]² / var_a`.
pub(crate) fn hotelling_t2(model: &PcaModel, variances: &Array1<f64>) -> Array1<f64> {
    let squared = &model.scores * &model.scores;
    (squared / variances).sum_axis(Axis(1))
}

/// Per-sample squared reconstruction error and the residual matrix it sums.
pub(crate) fn q_residuals(
    x: ArrayView2<f64>,
    model: &PcaModel,
) -> (Array1<f64>, Array2<f64>) {
    let residual = &x - &model.reconstruct();
    let q = residual.map_axis(Axis(1), |row| row.iter().map(|&e| e * e).sum());
    (q, residual)
}

/// T2 control limit via the scaled F-distribution:
/// `(k·(n-1)·(n+1)) / (n·(n-k)) · F_{1-α}(k, n-k)`.
///
/// Returns `None` when `n <= k` (the F denominator degrees of freedom
/// vanish), in which case the caller falls back to empirical percentiles.
fn t2_limit(n_samples: usize, n_components: usize, alpha: f64) -> Option<f64> {
    if n_samples <= n_components {
        return None;
    }
    let n = n_samples as f64;
    let k = n_components as f64;
    let f_dist = FisherSnedecor::new(k, n - k).ok()?;
    let quantile = f_dist.inverse_cdf(1.0 - alpha);
    Some(k * (n - 1.0) * (n + 1.0) / (n * (n - k)) * quantile)
}

/// Q control limit via Box's chi-square approximation from the first three
/// moments of the Q distribution.
///
/// Returns `None` when θ2 is numerically negligible or the bracket turns
/// non-positive; the caller then uses empirical percentiles.
fn q_limit(theta1: f64, theta2: f64, theta3: f64, alpha: f64) -> Option<f64> {
    if theta2 < THETA2_FLOOR || theta1 < THETA2_FLOOR {
        return None;
    }
    // Exponent term; floored so a pathological moment ratio cannot drive the
    // 1/h0 power to infinity.
    let h0 = (1.0 - (2.0 * theta1 * theta3) / (3.0 * theta2 * theta2)).max(0.001);
    let normal = Normal::new(0.0, 1.0).ok()?;
    let c_alpha = normal.inverse_cdf(1.0 - alpha);
    let bracket = c_alpha * (2.0 * theta2 * h0 * h0).sqrt() / theta1
        + 1.0
        + theta2 * h0 * (h0 - 1.0) / (theta1 * theta1);
    if bracket <= 0.0 {
        return None;
    }
    let limit = theta1 * bracket.powf(1.0 / h0);
    limit.is_finite().then_some(limit)
}

/// Linearly interpolated percentile (`pct` in 0..=100) of a sample.
fn percentile(values: &Array1<f64>, pct: f64) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

fn indices_above(values: &Array1<f64>, limit: f64) -> Vec<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, &v)| v > limit)
        .map(|(i, _)| i)
        .collect()
}

/// Intersection of two ascending index lists.
fn intersect_sorted(a: &[usize], b: &[usize]) -> Vec<usize> {
    a.iter().filter(|i| b.binary_search(i).is_ok()).copied().collect()
}

/// Computes T2/Q diagnostics and control limits for a fitted model against
/// the matrix it was fitted on.
///
/// Both statistics are pure functions of `(x, model)`; nothing is cached.
/// Degenerate limit formulas (too few samples for the F limit, vanishing
/// residual moments for Box's approximation) fall back to empirical 95th
/// and 99th percentiles of the statistic, with a warning logged.
///
/// # Errors
/// `Input` if the matrix shape does not match the model's dimensions.
pub fn compute_diagnostics(
    x: ArrayView2<f64>,
    model: &PcaModel,
) -> Result<DiagnosticsResult> {
    if x.nrows() != model.n_samples() || x.ncols() != model.n_features() {
        return Err(MvspcError::Input(format!(
            "matrix shape ({}, {}) does not match model dimensions ({}, {})",
            x.nrows(),
            x.ncols(),
            model.n_samples(),
            model.n_features()
        )));
    }

    let n = model.n_samples();
    let k = model.n_components();
    info!("Computing T2/Q diagnostics for {} samples, {} components.", n, k);

    let variances = score_variances(model);
    let t2 = hotelling_t2(model, &variances);
    let (q, _residual) = q_residuals(x, model);

    let t2_limit_95 = t2_limit(n, k, 0.05).unwrap_or_else(|| {
        warn!("F-distribution T2 limit undefined (n={}, k={}); using 95th percentile.", n, k);
        percentile(&t2, 95.0)
    });
    let t2_limit_99 = t2_limit(n, k, 0.01).unwrap_or_else(|| {
        warn!("F-distribution T2 limit undefined (n={}, k={}); using 99th percentile.", n, k);
        percentile(&t2, 99.0)
    });

    let theta1 = q.mean().unwrap_or(0.0);
    let theta2 = q.mapv(|v| v * v).mean().unwrap_or(0.0);
    let theta3 = q.mapv(|v| v * v * v).mean().unwrap_or(0.0);
    debug!("Q residual moments: theta1={:.6e}, theta2={:.6e}, theta3={:.6e}", theta1, theta2, theta3);

    let q_limit_95 = q_limit(theta1, theta2, theta3, 0.05).unwrap_or_else(|| {
        warn!("Box approximation degenerate for Q limit; using 95th percentile.");
        percentile(&q, 95.0)
    });
    // The bracket term depends on the quantile, so one confidence level can
    // degenerate while the other does not; keep the limits ordered.
    let q_limit_99 = q_limit(theta1, theta2, theta3, 0.01)
        .unwrap_or_else(|| {
            warn!("Box approximation degenerate for Q limit; using 99th percentile.");
            percentile(&q, 99.0)
        })
        .max(q_limit_95);

    let t2_outliers_95 = indices_above(&t2, t2_limit_95);
    let t2_outliers_99 = indices_above(&t2, t2_limit_99);
    let q_outliers_95 = indices_above(&q, q_limit_95);
    let q_outliers_99 = indices_above(&q, q_limit_99);
    let combined_outliers = intersect_sorted(&t2_outliers_95, &q_outliers_95);

    Ok(DiagnosticsResult {
        t2,
        q,
        t2_limit_95,
        t2_limit_99,
        q_limit_95,
        q_limit_99,
        t2_outliers_95,
        t2_outliers_99,
        q_outliers_95,
        q_outliers_99,
        combined_outliers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pca::fit_pca;
    use crate::testing::standardized_random_matrix;
    use approx::assert_abs_diff_eq;

    #[test]
    fn statistics_are_non_negative() {
        let x = standardized_random_matrix(40, 6, 17);
        let model = fit_pca(x.view(), Some(3)).unwrap();
        let diag = compute_diagnostics(x.view(), &model).unwrap();
        assert!(diag.t2.iter().all(|&v| v >= 0.0));
        assert!(diag.q.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn limits_are_ordered_and_outliers_nested() {
        let x = standardized_random_matrix(60, 8, 4);
        let model = fit_pca(x.view(), Some(3)).unwrap();
        let diag = compute_diagnostics(x.view(), &model).unwrap();

        assert!(diag.t2_limit_99 >= diag.t2_limit_95);
        assert!(diag.q_limit_99 >= diag.q_limit_95);

        for i in &diag.t2_outliers_99 {
            assert!(diag.t2_outliers_95.contains(i));
        }
        for i in &diag.q_outliers_99 {
            assert!(diag.q_outliers_95.contains(i));
        }
    }

    #[test]
    fn t2_limit_matches_scaled_f_formula() {
        // n=50, k=2: the scaling factor is known in closed form, and the F
        // quantile must be strictly positive.
        let limit = t2_limit(50, 2, 0.05).unwrap();
        let factor = 2.0 * 49.0 * 51.0 / (50.0 * 48.0);
        assert!(limit > factor); // F_{0.95}(2, 48) > 1
        assert!(limit < factor * 10.0);
    }

    #[test]
    fn full_rank_model_falls_back_to_percentile_q_limits() {
        // With k = min(n, p) the reconstruction is exact, so all Q are ~0 and
        // theta2 vanishes; the percentile fallback keeps limits at ~0 rather
        // than producing NaN.
        let x = standardized_random_matrix(10, 4, 42);
        let model = fit_pca(x.view(), None).unwrap();
        let diag = compute_diagnostics(x.view(), &model).unwrap();
        assert!(diag.q_limit_95.is_finite());
        assert!(diag.q_limit_95.abs() < 1e-10);
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let values = Array1::from(vec![0.0, 10.0, 20.0, 30.0, 40.0]);
        assert_abs_diff_eq!(percentile(&values, 50.0), 20.0, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&values, 95.0), 38.0, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&values, 0.0), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&values, 100.0), 40.0, epsilon = 1e-12);
    }

    #[test]
    fn shape_mismatch_is_an_input_error() {
        let x = standardized_random_matrix(20, 5, 9);
        let model = fit_pca(x.view(), Some(2)).unwrap();
        let other = standardized_random_matrix(20, 4, 9);
        assert!(matches!(
            compute_diagnostics(other.view(), &model),
            Err(MvspcError::Input(_))
        ));
    }

    #[test]
    fn summary_counts_match_sets() {
        let x = standardized_random_matrix(50, 6, 23);
        let model = fit_pca(x.view(), Some(2)).unwrap();
        let diag = compute_diagnostics(x.view(), &model).unwrap();
        let summary = diag.summary();
        assert_eq!(summary.n_outliers_t2_95, diag.t2_outliers_95.len());
        assert_eq!(summary.n_outliers_q_95, diag.q_outliers_95.len());
        assert!(summary.t2_max >= summary.t2_mean);
    }
}
