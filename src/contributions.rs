// Per-variable decomposition of a single sample's T2 or Q statistic.

use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use log::debug;

use crate::diagnostics::{q_residuals, score_variances};
use crate::error::{MvspcError, Result};
use crate::pca::PcaModel;

/// Which diagnostic statistic to decompose.
///
/// A closed enum rather than a free-form string: invalid kinds are rejected
/// at construction (`FromStr` is case-insensitive, accepting e.g. "t2",
/// "T2", "q").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    T2,
    Q,
}

impl FromStr for MetricKind {
    type Err = MvspcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "t2" => Ok(MetricKind::T2),
            "q" => Ok(MetricKind::Q),
            other => Err(MvspcError::Input(format!(
                "unknown metric kind '{}' (expected 'T2' or 'Q')",
                other
            ))),
        }
    }
}

/// One variable's share of the decomposed statistic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableContribution {
    pub variable: String,
    pub value: f64,
    /// Share of the total contribution, in percent. Zero when the total
    /// contribution itself is zero.
    pub percentage: f64,
}

/// Ranked per-variable contributions for one sample and one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionResult {
    pub sample_index: usize,
    pub metric: MetricKind,
    /// All variables, sorted by contribution descending.
    pub contributions: Vec<VariableContribution>,
    /// Names of the top 5 contributors (fewer if there are fewer variables).
    pub top_variables: Vec<String>,
}

/// Decomposes one sample's T2 or Q value into per-variable contributions.
///
/// For Q the decomposition is exact: variable j contributes its squared
/// reconstruction residual `E[i,j]²`, and these sum to Q_i by definition.
///
/// For T2 the conventional chemometric heuristic is used: the sample's
/// scores are normalized by per-component standard deviation and
/// back-projected through the loadings, and each variable's projection is
/// squared. This apportions T2 across variables but is not an algebraically
/// exact decomposition; the formula is kept as-is for compatibility with
/// established practice.
///
/// Percentages are normalized to sum to 100 when the total contribution is
/// positive, and left at zero otherwise.
///
/// # Errors
/// `SampleOutOfRange` if `sample_index >= n_samples`; `Input` if
/// `variable_names` does not match the model's feature count.
pub fn analyze_contributions(
    x: ArrayView2<f64>,
    model: &PcaModel,
    variable_names: &[String],
    sample_index: usize,
    metric: MetricKind,
) -> Result<ContributionResult> {
    let n_samples = model.n_samples();
    if sample_index >= n_samples {
        return Err(MvspcError::SampleOutOfRange {
            index: sample_index,
            n_samples,
        });
    }
    if variable_names.len() != model.n_features() {
        return Err(MvspcError::Input(format!(
            "{} variable names given for {} features",
            variable_names.len(),
            model.n_features()
        )));
    }
    if x.nrows() != n_samples || x.ncols() != model.n_features() {
        return Err(MvspcError::Input(format!(
            "matrix shape ({}, {}) does not match model dimensions ({}, {})",
            x.nrows(),
            x.ncols(),
            n_samples,
            model.n_features()
        )));
    }

    let raw: Array1<f64> = match metric {
        MetricKind::Q => {
            let (_, residual) = q_residuals(x, model);
            residual.row(sample_index).mapv(|e| e * e)
        }
        MetricKind::T2 => {
            let variances = score_variances(model);
            let std_devs = variances.mapv(f64::sqrt);
            let t_norm = &model.scores.row(sample_index) / &std_devs;
            // Back-project the normalized score vector through the loadings;
            // each variable's squared projection is its T2 share.
            let projected = model.loadings.dot(&t_norm);
            projected.mapv(|v| v * v)
        }
    };

    let total: f64 = raw.sum();
    debug!(
        "Sample {} {:?} contribution total: {:.6e}",
        sample_index, metric, total
    );

    let mut contributions: Vec<VariableContribution> = variable_names
        .iter()
        .zip(raw.iter())
        .map(|(name, &value)| VariableContribution {
            variable: name.clone(),
            value,
            percentage: if total > 0.0 { value / total * 100.0 } else { 0.0 },
        })
        .collect();
    contributions.sort_by(|a, b| {
        b.value
            .partial_cmp(&a.value)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let top_variables = contributions
        .iter()
        .take(5)
        .map(|c| c.variable.clone())
        .collect();

    Ok(ContributionResult {
        sample_index,
        metric,
        contributions,
        top_variables,
    })
}
