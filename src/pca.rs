// Principal component decomposition of a standardized data matrix.

use ndarray::{Array1, Array2, ArrayView2};
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};

use log::{debug, info};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{MvspcError, Result};

/// A fitted principal component model.
///
/// The model is a pure value derived from one matrix: it holds no reference
/// to whatever session produced it, and a re-run with a different component
/// count supersedes it wholesale rather than mutating it.
///
/// Invariants established by [`fit_pca`]:
/// - `scores` has shape `(n_samples, k)` and satisfies `scores = X · loadings`.
/// - `loadings` has shape `(n_features, k)` with unit-norm, mutually
///   orthogonal columns (sign is implementation-defined but consistent
///   between scores and loadings, so `X ≈ scores · loadingsᵀ` always holds).
/// - `explained_variance_ratio` is non-increasing, each element in `[0, 1]`,
///   and sums to at most 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaModel {
    /// Sample projections onto the principal components.
    /// Shape: `(n_samples, k_components)`
    pub scores: Array2<f64>,
    /// Variable-to-component weights (eigenvectors of the covariance).
    /// Shape: `(n_features, k_components)`
    pub loadings: Array2<f64>,
    /// Eigenvalues of the covariance matrix, descending.
    /// Shape: `(k_components)`
    pub explained_variance: Array1<f64>,
    /// Eigenvalues normalized by the total variance, descending.
    /// Shape: `(k_components)`
    pub explained_variance_ratio: Array1<f64>,
    /// Component labels "PC1".."PCk", in order.
    pub component_names: Vec<String>,
}

/// One row of the per-component variance table shown to report consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentVariance {
    pub component: String,
    pub explained_pct: f64,
    pub cumulative_pct: f64,
}

impl PcaModel {
    pub fn n_samples(&self) -> usize {
        self.scores.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.loadings.nrows()
    }

    pub fn n_components(&self) -> usize {
        self.loadings.ncols()
    }

    /// Running sum of `explained_variance_ratio`.
    pub fn cumulative_variance_ratio(&self) -> Array1<f64> {
        let mut acc = 0.0;
        self.explained_variance_ratio.mapv(|v| {
            acc += v;
            acc
        })
    }

    /// Per-component variance table (name, individual %, cumulative %).
    pub fn variance_table(&self) -> Vec<ComponentVariance> {
        let cumulative = self.cumulative_variance_ratio();
        self.component_names
            .iter()
            .zip(self.explained_variance_ratio.iter())
            .zip(cumulative.iter())
            .map(|((name, &ratio), &cum)| ComponentVariance {
                component: name.clone(),
                explained_pct: ratio * 100.0,
                cumulative_pct: cum * 100.0,
            })
            .collect()
    }

    /// Reconstructs the data from the retained components: `scores · loadingsᵀ`.
    pub fn reconstruct(&self) -> Array2<f64> {
        self.scores.dot(&self.loadings.t())
    }

    /// Saves the model to a file with bincode.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref()).map_err(|e| {
            MvspcError::Input(format!("failed to create {:?}: {}", path.as_ref(), e))
        })?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| MvspcError::Input(format!("failed to serialize PCA model: {}", e)))?;
        Ok(())
    }

    /// Loads a model previously written by [`PcaModel::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            MvspcError::Input(format!("failed to open {:?}: {}", path.as_ref(), e))
        })?;
        let mut reader = BufReader::new(file);
        let model: PcaModel =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| {
                    MvspcError::Input(format!("failed to deserialize PCA model: {}", e))
                })?;
        if model.scores.ncols() != model.loadings.ncols()
            || model.explained_variance_ratio.len() != model.loadings.ncols()
            || model.component_names.len() != model.loadings.ncols()
        {
            return Err(MvspcError::Input(
                "loaded PCA model has inconsistent component dimensions".to_string(),
            ));
        }
        Ok(model)
    }
}

/// Eigenvalue/eigenvector pairs of a symmetric matrix, sorted descending
/// by eigenvalue. Eigenvalues are clamped at zero (the covariance is
/// positive semi-definite; small negative values are rounding noise).
fn sorted_eig_pairs(symmetric: Array2<f64>) -> Result<Vec<(f64, Array1<f64>)>> {
    let (vals, vecs) = symmetric
        .eigh(UPLO::Upper)
        .map_err(|e| MvspcError::Linalg(format!("eigendecomposition failed: {}", e)))?;
    let mut pairs: Vec<(f64, Array1<f64>)> = vals
        .into_iter()
        .map(|v| v.max(0.0))
        .zip(vecs.columns().into_iter().map(|col| col.to_owned()))
        .collect();
    pairs.sort_by(|(a, _), (b, _)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    Ok(pairs)
}

/// Fits a PCA model to a column-standardized matrix.
///
/// The matrix is assumed to already have zero-mean, unit-variance columns;
/// no centering or scaling is applied here. The retained component count is
/// `min(n_components, n_samples, n_features)` when `n_components` is given,
/// else `min(n_samples, n_features)`.
///
/// The decomposition is exact and deterministic: an eigendecomposition of
/// the p×p covariance matrix when `n_features <= n_samples`, or of the n×n
/// Gram matrix (with eigenvectors mapped back to feature space) when
/// `n_features > n_samples`.
///
/// # Errors
/// `Input` if the matrix is empty, has fewer than 2 samples, or
/// `n_components` is `Some(0)`; `Linalg` if the decomposition fails.
pub fn fit_pca(x: ArrayView2<f64>, n_components: Option<usize>) -> Result<PcaModel> {
    let n_samples = x.nrows();
    let n_features = x.ncols();

    if n_samples == 0 || n_features == 0 {
        return Err(MvspcError::Input(
            "input matrix has zero samples or zero features".to_string(),
        ));
    }
    if n_samples < 2 {
        return Err(MvspcError::Input(
            "input matrix must have at least 2 samples".to_string(),
        ));
    }
    if n_components == Some(0) {
        return Err(MvspcError::Input(
            "number of components must be greater than 0".to_string(),
        ));
    }

    let max_rank = n_samples.min(n_features);
    let k = n_components.map_or(max_rank, |req| req.min(max_rank));

    info!(
        "Fitting PCA: {} samples x {} features, retaining {} components.",
        n_samples, n_features, k
    );

    // Total variance is the trace of the covariance matrix; computing it from
    // the raw entries keeps the ratio denominator identical in both paths.
    let total_variance: f64 =
        x.iter().map(|&v| v * v).sum::<f64>() / (n_samples - 1) as f64;

    let denom = (n_samples - 1) as f64;
    let mut loadings = Array2::<f64>::zeros((n_features, k));
    let mut eigenvalues = Array1::<f64>::zeros(k);

    if n_features <= n_samples {
        let mut cov = x.t().dot(&x);
        cov /= denom;
        let pairs = sorted_eig_pairs(cov)?;
        for (i, (val, vec)) in pairs.into_iter().take(k).enumerate() {
            eigenvalues[i] = val;
            let mut axis = vec;
            let norm = axis.dot(&axis).sqrt();
            if norm > 1e-9 {
                axis.mapv_inplace(|v| v / norm);
            } else {
                axis.fill(0.0);
            }
            loadings.column_mut(i).assign(&axis);
        }
    } else {
        // Gram trick: eigenvectors u of X·Xᵀ/(n-1) map to feature-space axes
        // via Xᵀ·u / sqrt(λ·(n-1)).
        let mut gram = x.dot(&x.t());
        gram /= denom;
        let pairs = sorted_eig_pairs(gram)?;
        for (i, (val, u_col)) in pairs.into_iter().take(k).enumerate() {
            eigenvalues[i] = val;
            let mut axis = x.t().dot(&u_col);
            let scale = val.max(1e-12).sqrt() * denom.sqrt();
            axis.mapv_inplace(|v| v / scale);
            // Re-normalize to unit length; near-zero axes carry no variance.
            let norm = axis.dot(&axis).sqrt();
            if norm > 1e-9 {
                axis.mapv_inplace(|v| v / norm);
            } else {
                axis.fill(0.0);
            }
            loadings.column_mut(i).assign(&axis);
        }
    }

    let ratio = if total_variance > 1e-12 {
        eigenvalues.mapv(|v| (v / total_variance).clamp(0.0, 1.0))
    } else {
        debug!("Total variance is numerically zero; variance ratios set to 0.");
        Array1::zeros(k)
    };

    let scores = x.dot(&loadings);
    let component_names = (1..=k).map(|i| format!("PC{}", i)).collect();

    Ok(PcaModel {
        scores,
        loadings,
        explained_variance: eigenvalues,
        explained_variance_ratio: ratio,
        component_names,
    })
}
