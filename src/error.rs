use std::error::Error;
use std::fmt;

/// Errors produced by the PCA / diagnostics core.
///
/// Numeric degeneracies (zero score variance, vanishing residual moments)
/// are deliberately *not* represented here: those are compensated locally
/// with documented fallbacks (variance floors, percentile-based limits)
/// and logged, never surfaced as failures.
#[derive(Debug)]
pub enum MvspcError {
    /// Malformed or out-of-range parameters: empty matrix, zero requested
    /// components, unknown metric kind, mismatched variable-name list.
    Input(String),
    /// A prior pipeline stage has not run yet (no preprocessed matrix,
    /// no fitted PCA model for the session).
    PrecursorMissing(String),
    /// A sample index outside `[0, n_samples)`.
    SampleOutOfRange { index: usize, n_samples: usize },
    /// A linear-algebra backend operation (eigendecomposition) failed.
    Linalg(String),
}

impl fmt::Display for MvspcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MvspcError::Input(msg) => write!(f, "invalid input: {}", msg),
            MvspcError::PrecursorMissing(msg) => {
                write!(f, "missing precursor stage: {}", msg)
            }
            MvspcError::SampleOutOfRange { index, n_samples } => write!(
                f,
                "sample index {} is out of range for {} samples",
                index, n_samples
            ),
            MvspcError::Linalg(msg) => write!(f, "linear algebra failure: {}", msg),
        }
    }
}

impl Error for MvspcError {}

pub type Result<T> = std::result::Result<T, MvspcError>;
