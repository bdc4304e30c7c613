#![doc = include_str!("../README.md")]

pub mod contributions;
pub mod diagnostics;
pub mod error;
pub mod optimizer;
pub mod pca;
pub mod projection;
pub mod store;

pub use contributions::{analyze_contributions, ContributionResult, MetricKind, VariableContribution};
pub use diagnostics::{compute_diagnostics, DiagnosticsResult, DiagnosticsSummary};
pub use error::{MvspcError, Result};
pub use optimizer::{optimize_components, ComponentEvaluation, OptimizationResult};
pub use pca::{fit_pca, ComponentVariance, PcaModel};
pub use projection::{
    Project2D, ProjectionBuilder, ProjectionMap, ProjectionPoint, ReductionMethod,
};
pub use store::{SessionId, SessionStore};

/// Seeded data generators shared by the unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use ndarray::{Array2, Axis};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    /// Centers and scales every column to zero mean and unit variance
    /// (ddof = 1). Constant columns are left at zero.
    pub fn standardize_columns(mut x: Array2<f64>) -> Array2<f64> {
        for mut col in x.axis_iter_mut(Axis(1)) {
            let mean = col.mean().unwrap_or(0.0);
            col.mapv_inplace(|v| v - mean);
            let std = col.std(1.0);
            if std > 1e-12 {
                col.mapv_inplace(|v| v / std);
            } else {
                col.fill(0.0);
            }
        }
        x
    }

    /// An i.i.d. standard-normal matrix, column-standardized.
    pub fn standardized_random_matrix(
        n_samples: usize,
        n_features: usize,
        seed: u64,
    ) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let x = Array2::from_shape_fn((n_samples, n_features), |_| normal.sample(&mut rng));
        standardize_columns(x)
    }

    /// A matrix with `rank` dominant latent directions plus Gaussian noise of
    /// the given scale, column-standardized.
    pub fn low_rank_matrix(
        n_samples: usize,
        n_features: usize,
        rank: usize,
        noise: f64,
        seed: u64,
    ) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let latent = Array2::from_shape_fn((n_samples, rank), |_| normal.sample(&mut rng));
        let weights = Array2::from_shape_fn((n_features, rank), |_| normal.sample(&mut rng));
        let mut x = latent.dot(&weights.t());
        x.mapv_inplace(|v| v + noise * normal.sample(&mut rng));
        standardize_columns(x)
    }

    /// "Var1".."VarN" labels.
    pub fn variable_names(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("Var{}", i)).collect()
    }
}
