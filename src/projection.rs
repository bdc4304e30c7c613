// 2D/3D map coordinates for visualization, annotated with cluster and
// outlier metadata. PCA is always available; other manifold backends are
// optional capabilities that degrade gracefully to PCA.

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use log::{info, warn};

use crate::diagnostics::DiagnosticsResult;
use crate::error::{MvspcError, Result};
use crate::pca::{fit_pca, PcaModel};

/// Dimensionality-reduction method selector.
///
/// A closed enum: an unknown method name is rejected when parsed, instead of
/// silently falling through a string match at projection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionMethod {
    Pca,
    Umap,
    Tsne,
}

impl FromStr for ReductionMethod {
    type Err = MvspcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pca" => Ok(ReductionMethod::Pca),
            "umap" => Ok(ReductionMethod::Umap),
            "tsne" | "t-sne" => Ok(ReductionMethod::Tsne),
            other => Err(MvspcError::Input(format!(
                "unknown reduction method '{}' (expected 'pca', 'umap' or 'tsne')",
                other
            ))),
        }
    }
}

/// A backend able to produce low-dimensional map coordinates.
///
/// Implementations for external manifold-learning libraries are registered
/// with [`ProjectionBuilder::register`]; the PCA implementation is always
/// present as the fallback.
pub trait Project2D {
    fn name(&self) -> &'static str;

    /// Projects `x` to `dims` coordinates (2 or 3). Shape of the result:
    /// `(n_samples, dims)`.
    fn project(&self, x: ArrayView2<f64>, dims: usize) -> Result<Array2<f64>>;
}

/// The always-available PCA projection backend.
pub struct PcaProjector;

impl Project2D for PcaProjector {
    fn name(&self) -> &'static str {
        "pca"
    }

    fn project(&self, x: ArrayView2<f64>, dims: usize) -> Result<Array2<f64>> {
        let model = fit_pca(x, Some(dims))?;
        Ok(model.scores)
    }
}

/// One annotated map point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionPoint {
    pub sample_index: usize,
    /// 2 or 3 coordinates, depending on the requested dimensionality.
    pub coords: Vec<f64>,
    pub cluster: Option<i32>,
    /// Whether the sample exceeds either 95% diagnostic limit.
    pub outlier: bool,
}

/// A complete projection, tagged with the backend that actually produced it
/// (which may be "pca" even when another method was requested).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionMap {
    pub method: String,
    pub points: Vec<ProjectionPoint>,
}

/// Registry of projection backends.
pub struct ProjectionBuilder {
    backends: HashMap<ReductionMethod, Box<dyn Project2D>>,
}

impl Default for ProjectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectionBuilder {
    /// Creates a builder with only the PCA backend registered.
    pub fn new() -> Self {
        let mut backends: HashMap<ReductionMethod, Box<dyn Project2D>> = HashMap::new();
        backends.insert(ReductionMethod::Pca, Box::new(PcaProjector));
        Self { backends }
    }

    /// Registers an optional backend for a method. Registering over an
    /// existing method replaces it.
    pub fn register(&mut self, method: ReductionMethod, backend: Box<dyn Project2D>) {
        self.backends.insert(method, backend);
    }

    pub fn is_registered(&self, method: ReductionMethod) -> bool {
        self.backends.contains_key(&method)
    }

    /// Builds an annotated 2D/3D map of the samples.
    ///
    /// For [`ReductionMethod::Pca`] with a fitted model already at hand, the
    /// first `dims` score columns are reused instead of refitting. Requested
    /// methods without a registered backend, and registered backends that
    /// fail, both degrade to the PCA projection with a warning.
    ///
    /// # Errors
    /// `Input` if `dims` is not 2 or 3, or a metadata slice length does not
    /// match the sample count.
    pub fn build_map(
        &self,
        x: ArrayView2<f64>,
        method: ReductionMethod,
        dims: usize,
        model: Option<&PcaModel>,
        clusters: Option<&[i32]>,
        diagnostics: Option<&DiagnosticsResult>,
    ) -> Result<ProjectionMap> {
        if dims != 2 && dims != 3 {
            return Err(MvspcError::Input(format!(
                "projection dimensionality must be 2 or 3, got {}",
                dims
            )));
        }
        let n_samples = x.nrows();
        if let Some(labels) = clusters {
            if labels.len() != n_samples {
                return Err(MvspcError::Input(format!(
                    "{} cluster labels given for {} samples",
                    labels.len(),
                    n_samples
                )));
            }
        }

        let (coords, method_used) = self.coordinates(x, method, dims, model)?;

        let points = (0..n_samples)
            .map(|i| {
                let outlier = diagnostics.is_some_and(|d| {
                    d.t2_outliers_95.binary_search(&i).is_ok()
                        || d.q_outliers_95.binary_search(&i).is_ok()
                });
                ProjectionPoint {
                    sample_index: i,
                    coords: coords.row(i).to_vec(),
                    cluster: clusters.map(|labels| labels[i]),
                    outlier,
                }
            })
            .collect();

        Ok(ProjectionMap {
            method: method_used,
            points,
        })
    }

    fn coordinates(
        &self,
        x: ArrayView2<f64>,
        method: ReductionMethod,
        dims: usize,
        model: Option<&PcaModel>,
    ) -> Result<(Array2<f64>, String)> {
        if method == ReductionMethod::Pca {
            if let Some(m) = model {
                if m.n_components() >= dims && m.n_samples() == x.nrows() {
                    info!("Reusing first {} score columns of the fitted PCA model.", dims);
                    return Ok((m.scores.slice(s![.., ..dims]).to_owned(), "pca".to_string()));
                }
            }
            let coords = PcaProjector.project(x, dims)?;
            return Ok((coords, "pca".to_string()));
        }

        match self.backends.get(&method) {
            Some(backend) => match backend.project(x, dims) {
                Ok(coords) => Ok((coords, backend.name().to_string())),
                Err(e) => {
                    warn!(
                        "Projection backend '{}' failed ({}); falling back to PCA.",
                        backend.name(),
                        e
                    );
                    Ok((PcaProjector.project(x, dims)?, "pca".to_string()))
                }
            },
            None => {
                warn!("No backend registered for {:?}; falling back to PCA.", method);
                Ok((PcaProjector.project(x, dims)?, "pca".to_string()))
            }
        }
    }
}
