// Recommends how many principal components to retain, by blending a
// variance-threshold criterion, an elbow criterion on the reconstruction
// error curve, and a per-component significance criterion.

use ndarray::{s, ArrayView2};
use serde::{Deserialize, Serialize};

use log::{debug, info, warn};

use crate::error::Result;
use crate::pca::fit_pca;

/// Cumulative variance fraction a retained set of components should reach.
pub const DEFAULT_VARIANCE_THRESHOLD: f64 = 0.90;

/// Components with an individual variance ratio below this are not counted
/// as significant.
const SIGNIFICANCE_RATIO: f64 = 0.05;

/// Hard cap on how many candidate component counts are evaluated.
const MAX_COMPONENTS_EVALUATED: usize = 15;

/// The recommendation never goes below this many components.
const RECOMMENDATION_FLOOR: usize = 2;

/// Metrics for one candidate component count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentEvaluation {
    pub n_components: usize,
    /// Individual variance of this component, in percent.
    pub variance_pct: f64,
    /// Cumulative variance through this component, in percent.
    pub cumulative_variance_pct: f64,
    /// Mean squared reconstruction error using the first `n_components`
    /// components.
    pub reconstruction_mse: f64,
    /// `reconstruction_mse` as a percentage of the single-component MSE.
    /// Exactly 100.0 at k = 1, non-increasing in k.
    pub normalized_error_pct: f64,
}

/// The evaluated curve plus the three criteria and the blended outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub evaluations: Vec<ComponentEvaluation>,
    /// Smallest k reaching the cumulative variance threshold (k_max if none).
    pub k_by_variance: usize,
    /// Maximum-perpendicular-distance elbow of the error curve.
    pub k_by_elbow: usize,
    /// Count of leading components with individual variance >= 5%.
    pub k_by_significance: usize,
    pub recommended: usize,
    pub justification: String,
}

/// Elbow of a decreasing curve: the 1-indexed point with the greatest
/// perpendicular distance to the chord connecting the curve's endpoints.
/// Ties resolve to the first such point; curves with fewer than 3 points
/// have no interior and return 1.
fn elbow_index(errors: &[f64]) -> usize {
    if errors.len() < 3 {
        return 1;
    }
    let n = errors.len();
    let (x0, y0) = (0.0, errors[0]);
    let (x1, y1) = ((n - 1) as f64, errors[n - 1]);
    let dx = x1 - x0;
    let dy = y1 - y0;
    let chord_len = (dx * dx + dy * dy).sqrt();
    if chord_len < 1e-12 {
        return 1;
    }

    let mut best_index = 0;
    let mut best_distance = f64::NEG_INFINITY;
    for (i, &err) in errors.iter().enumerate() {
        let distance = (dy * (i as f64 - x0) - dx * (err - y0)).abs() / chord_len;
        if distance > best_distance {
            best_distance = distance;
            best_index = i;
        }
    }
    best_index + 1
}

/// Evaluates reconstruction error and variance for every candidate component
/// count and recommends one.
///
/// A single PCA fit at `k_max` supplies the variance ratios and the
/// scores/loadings from which every truncated reconstruction is formed; no
/// per-k refitting happens. `k_max` defaults to `min(n - 1, p, 15)`.
///
/// The final recommendation is `min(k_by_variance, max(k_by_elbow,
/// k_by_significance))`, floored at 2. When `k_max` itself is below 2 the
/// floor is not applied (the recommendation is clamped to `k_max` instead),
/// so the recommendation never names components that were not evaluated.
///
/// # Errors
/// Propagates `Input` from the underlying fit (empty matrix, fewer than 2
/// samples).
pub fn optimize_components(
    x: ArrayView2<f64>,
    variance_threshold: Option<f64>,
    k_max: Option<usize>,
) -> Result<OptimizationResult> {
    let n_samples = x.nrows();
    let n_features = x.ncols();
    let threshold = variance_threshold.unwrap_or(DEFAULT_VARIANCE_THRESHOLD);

    let auto_k_max = n_samples
        .saturating_sub(1)
        .min(n_features)
        .min(MAX_COMPONENTS_EVALUATED)
        .max(1);
    let k_max = k_max.map_or(auto_k_max, |k| k.min(auto_k_max).max(1));

    info!(
        "Optimizing component count: {} samples x {} features, evaluating k in [1, {}].",
        n_samples, n_features, k_max
    );

    let model = fit_pca(x, Some(k_max))?;
    let k_max = model.n_components(); // fit may cap further
    let cumulative = model.cumulative_variance_ratio();

    // Reconstruction MSE for each truncated model.
    let total_elements = (n_samples * n_features) as f64;
    let mut mse = Vec::with_capacity(k_max);
    for k in 1..=k_max {
        let partial_scores = model.scores.slice(s![.., ..k]);
        let partial_loadings = model.loadings.slice(s![.., ..k]);
        let reconstructed = partial_scores.dot(&partial_loadings.t());
        let sse: f64 = (&x - &reconstructed).iter().map(|&e| e * e).sum();
        mse.push(sse / total_elements);
    }

    let mse_1 = mse[0];
    let normalized: Vec<f64> = if mse_1 > 1e-15 {
        mse.iter().map(|&m| m / mse_1 * 100.0).collect()
    } else {
        // A rank-1 dataset reconstructs exactly at k = 1; the curve is flat.
        debug!("k=1 reconstruction is already exact; normalized error curve is degenerate.");
        mse.iter()
            .enumerate()
            .map(|(i, _)| if i == 0 { 100.0 } else { 0.0 })
            .collect()
    };

    let evaluations: Vec<ComponentEvaluation> = (1..=k_max)
        .map(|k| ComponentEvaluation {
            n_components: k,
            variance_pct: model.explained_variance_ratio[k - 1] * 100.0,
            cumulative_variance_pct: cumulative[k - 1] * 100.0,
            reconstruction_mse: mse[k - 1],
            normalized_error_pct: normalized[k - 1],
        })
        .collect();

    let k_by_variance = cumulative
        .iter()
        .position(|&c| c >= threshold)
        .map(|i| i + 1)
        .unwrap_or(k_max);

    let k_by_elbow = elbow_index(&normalized);

    let k_by_significance = model
        .explained_variance_ratio
        .iter()
        .take_while(|&&r| r >= SIGNIFICANCE_RATIO)
        .count();

    let blended = k_by_variance.min(k_by_elbow.max(k_by_significance));
    let recommended = if k_max < RECOMMENDATION_FLOOR {
        warn!(
            "Only {} component(s) evaluable; recommendation clamped to {} instead of the usual floor of {}.",
            k_max, k_max, RECOMMENDATION_FLOOR
        );
        k_max
    } else {
        blended.max(RECOMMENDATION_FLOOR).min(k_max)
    };

    // Variance-threshold justification wins ties, then elbow, then
    // significance.
    let justification = if recommended == k_by_variance {
        format!(
            "{} components reach {:.0}% cumulative explained variance",
            recommended,
            threshold * 100.0
        )
    } else if recommended == k_by_elbow {
        format!(
            "{} components sit at the elbow of the reconstruction error curve",
            recommended
        )
    } else if recommended == k_by_significance {
        format!(
            "{} components each explain at least {:.0}% of the variance",
            recommended,
            SIGNIFICANCE_RATIO * 100.0
        )
    } else {
        format!(
            "{} components (minimum retained count; criteria suggested variance={}, elbow={}, significance={})",
            recommended, k_by_variance, k_by_elbow, k_by_significance
        )
    };
    debug!(
        "Criteria: variance={}, elbow={}, significance={} -> recommended={}",
        k_by_variance, k_by_elbow, k_by_significance, recommended
    );

    Ok(OptimizationResult {
        evaluations,
        k_by_variance,
        k_by_elbow,
        k_by_significance,
        recommended,
        justification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{low_rank_matrix, standardized_random_matrix};
    use approx::assert_abs_diff_eq;

    #[test]
    fn normalized_error_starts_at_100_and_never_increases() {
        let x = standardized_random_matrix(40, 8, 13);
        let result = optimize_components(x.view(), None, None).unwrap();
        assert_abs_diff_eq!(
            result.evaluations[0].normalized_error_pct,
            100.0,
            epsilon = 1e-12
        );
        for pair in result.evaluations.windows(2) {
            assert!(pair[1].normalized_error_pct <= pair[0].normalized_error_pct + 1e-9);
        }
    }

    #[test]
    fn evaluates_a_single_fit_up_to_k_max() {
        let x = standardized_random_matrix(40, 8, 13);
        let result = optimize_components(x.view(), None, Some(5)).unwrap();
        assert_eq!(result.evaluations.len(), 5);
        assert_eq!(result.evaluations[4].n_components, 5);
        // Cumulative variance is non-decreasing across the table.
        for pair in result.evaluations.windows(2) {
            assert!(
                pair[1].cumulative_variance_pct >= pair[0].cumulative_variance_pct - 1e-9
            );
        }
    }

    #[test]
    fn variance_criterion_picks_smallest_sufficient_k() {
        // Rank-2 structure plus noise: two components dominate the variance.
        let x = low_rank_matrix(50, 10, 2, 0.01, 5);
        let result = optimize_components(x.view(), Some(0.90), None).unwrap();
        assert!(result.k_by_variance <= 3);
        let eval = &result.evaluations[result.k_by_variance - 1];
        assert!(eval.cumulative_variance_pct >= 90.0 - 1e-9);
        if result.k_by_variance > 1 {
            let prev = &result.evaluations[result.k_by_variance - 2];
            assert!(prev.cumulative_variance_pct < 90.0);
        }
    }

    #[test]
    fn elbow_on_linear_curve_ties_to_first_index() {
        // A perfectly linear decay has zero perpendicular distance everywhere;
        // the first index wins the tie.
        let errors = [100.0, 80.0, 60.0, 40.0, 20.0, 0.0];
        assert_eq!(elbow_index(&errors), 1);
    }

    #[test]
    fn elbow_finds_the_knee_of_a_convex_curve() {
        let errors = [100.0, 30.0, 12.0, 8.0, 6.0, 5.0];
        assert_eq!(elbow_index(&errors), 2);
    }

    #[test]
    fn elbow_degenerates_to_one_for_short_curves() {
        assert_eq!(elbow_index(&[100.0]), 1);
        assert_eq!(elbow_index(&[100.0, 40.0]), 1);
    }

    #[test]
    fn recommendation_is_floored_at_two() {
        // Strong rank-1 structure: every criterion individually points at 1,
        // but the recommendation still retains 2 components.
        let x = low_rank_matrix(30, 6, 1, 0.001, 3);
        let result = optimize_components(x.view(), None, None).unwrap();
        assert!(result.recommended >= 2);
        assert!(result.recommended <= result.evaluations.len());
    }

    #[test]
    fn recommendation_blends_the_three_criteria() {
        let x = standardized_random_matrix(60, 10, 19);
        let result = optimize_components(x.view(), None, None).unwrap();
        let expected = result
            .k_by_variance
            .min(result.k_by_elbow.max(result.k_by_significance))
            .max(2)
            .min(result.evaluations.len());
        assert_eq!(result.recommended, expected);
        assert!(!result.justification.is_empty());
    }

    #[test]
    fn tiny_k_max_clamps_instead_of_flooring() {
        // Two samples, one feature: only k = 1 is evaluable.
        let x = standardized_random_matrix(2, 1, 1);
        let result = optimize_components(x.view(), None, None).unwrap();
        assert_eq!(result.evaluations.len(), 1);
        assert_eq!(result.recommended, 1);
    }
}
