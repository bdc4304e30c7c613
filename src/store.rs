// Session arena. The numerical core stays a pure function of its inputs;
// this store is the single place that fetches precursors and records
// superseding results, keyed by opaque handles.

use ndarray::Array2;
use std::collections::HashMap;

use log::info;

use crate::contributions::{analyze_contributions, ContributionResult, MetricKind};
use crate::diagnostics::{compute_diagnostics, DiagnosticsResult};
use crate::error::{MvspcError, Result};
use crate::optimizer::{optimize_components, OptimizationResult};
use crate::pca::{fit_pca, PcaModel};

/// Opaque handle to one analysis session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

/// Per-session pipeline state. Each stage's result supersedes the previous
/// one wholesale; results derived from a stale model are dropped when the
/// model is refitted.
#[derive(Debug, Default)]
struct Session {
    matrix: Option<Array2<f64>>,
    variable_names: Vec<String>,
    pca: Option<PcaModel>,
    diagnostics: Option<DiagnosticsResult>,
}

/// Owns all sessions. Callers needing concurrent access wrap the store in
/// their own lock; per-session recompute races resolve as last-writer-wins.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<u64, Session>,
    next_id: u64,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_session(&mut self) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.insert(id, Session::default());
        info!("Created session {}.", id);
        SessionId(id)
    }

    /// Destroys a session and every result derived from it.
    pub fn remove_session(&mut self, id: SessionId) -> bool {
        self.sessions.remove(&id.0).is_some()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id.0)
    }

    fn session(&self, id: SessionId) -> Result<&Session> {
        self.sessions
            .get(&id.0)
            .ok_or_else(|| MvspcError::PrecursorMissing(format!("session {} not found", id.0)))
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut Session> {
        self.sessions
            .get_mut(&id.0)
            .ok_or_else(|| MvspcError::PrecursorMissing(format!("session {} not found", id.0)))
    }

    /// Stores the preprocessed (column-standardized) matrix and its variable
    /// names. Any previously fitted model and diagnostics are discarded.
    pub fn set_matrix(
        &mut self,
        id: SessionId,
        matrix: Array2<f64>,
        variable_names: Vec<String>,
    ) -> Result<()> {
        if variable_names.len() != matrix.ncols() {
            return Err(MvspcError::Input(format!(
                "{} variable names given for {} columns",
                variable_names.len(),
                matrix.ncols()
            )));
        }
        let session = self.session_mut(id)?;
        session.matrix = Some(matrix);
        session.variable_names = variable_names;
        session.pca = None;
        session.diagnostics = None;
        Ok(())
    }

    pub fn matrix(&self, id: SessionId) -> Result<&Array2<f64>> {
        self.session(id)?.matrix.as_ref().ok_or_else(|| {
            MvspcError::PrecursorMissing("no preprocessed matrix in session".to_string())
        })
    }

    pub fn variable_names(&self, id: SessionId) -> Result<&[String]> {
        Ok(&self.session(id)?.variable_names)
    }

    pub fn pca_model(&self, id: SessionId) -> Result<&PcaModel> {
        self.session(id)?.pca.as_ref().ok_or_else(|| {
            MvspcError::PrecursorMissing("no PCA model in session; run PCA first".to_string())
        })
    }

    pub fn diagnostics(&self, id: SessionId) -> Result<&DiagnosticsResult> {
        self.session(id)?.diagnostics.as_ref().ok_or_else(|| {
            MvspcError::PrecursorMissing(
                "no diagnostics in session; run diagnostics first".to_string(),
            )
        })
    }

    /// Fits PCA on the session's matrix and stores the model, superseding
    /// any previous model and invalidating stale diagnostics.
    pub fn run_pca(&mut self, id: SessionId, n_components: Option<usize>) -> Result<&PcaModel> {
        let matrix = self.matrix(id)?;
        let model = fit_pca(matrix.view(), n_components)?;
        let session = self.session_mut(id)?;
        session.diagnostics = None;
        Ok(session.pca.insert(model))
    }

    /// Computes and stores T2/Q diagnostics for the session's fitted model.
    pub fn run_diagnostics(&mut self, id: SessionId) -> Result<&DiagnosticsResult> {
        let matrix = self.matrix(id)?;
        let model = self.pca_model(id)?;
        let diagnostics = compute_diagnostics(matrix.view(), model)?;
        let session = self.session_mut(id)?;
        Ok(session.diagnostics.insert(diagnostics))
    }

    /// Decomposes one sample's statistic into per-variable contributions.
    pub fn sample_contributions(
        &self,
        id: SessionId,
        sample_index: usize,
        metric: MetricKind,
    ) -> Result<ContributionResult> {
        let matrix = self.matrix(id)?;
        let model = self.pca_model(id)?;
        let names = self.variable_names(id)?;
        analyze_contributions(matrix.view(), model, names, sample_index, metric)
    }

    /// Evaluates candidate component counts on the session's matrix.
    pub fn optimize(
        &self,
        id: SessionId,
        variance_threshold: Option<f64>,
        k_max: Option<usize>,
    ) -> Result<OptimizationResult> {
        let matrix = self.matrix(id)?;
        optimize_components(matrix.view(), variance_threshold, k_max)
    }

    /// Feature space handed to downstream clustering/classification: PCA
    /// scores when requested and available, else the preprocessed matrix.
    pub fn downstream_features(&self, id: SessionId, use_pca: bool) -> Result<&Array2<f64>> {
        if use_pca {
            Ok(&self.pca_model(id)?.scores)
        } else {
            self.matrix(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{standardized_random_matrix, variable_names};

    fn seeded_store() -> (SessionStore, SessionId) {
        let mut store = SessionStore::new();
        let id = store.create_session();
        let x = standardized_random_matrix(20, 5, 33);
        store.set_matrix(id, x, variable_names(5)).unwrap();
        (store, id)
    }

    #[test]
    fn pipeline_runs_end_to_end() {
        let (mut store, id) = seeded_store();
        store.run_pca(id, Some(3)).unwrap();
        assert_eq!(store.pca_model(id).unwrap().n_components(), 3);
        store.run_diagnostics(id).unwrap();
        assert_eq!(store.diagnostics(id).unwrap().t2.len(), 20);
        let contributions = store
            .sample_contributions(id, 0, MetricKind::Q)
            .unwrap();
        assert_eq!(contributions.contributions.len(), 5);
        let optimization = store.optimize(id, None, None).unwrap();
        assert!(optimization.recommended >= 2);
    }

    #[test]
    fn missing_stages_yield_precursor_errors() {
        let mut store = SessionStore::new();
        let id = store.create_session();
        assert!(matches!(
            store.run_pca(id, None),
            Err(MvspcError::PrecursorMissing(_))
        ));

        let x = standardized_random_matrix(10, 4, 1);
        store.set_matrix(id, x, variable_names(4)).unwrap();
        assert!(matches!(
            store.diagnostics(id),
            Err(MvspcError::PrecursorMissing(_))
        ));
        assert!(matches!(
            store.sample_contributions(id, 0, MetricKind::T2),
            Err(MvspcError::PrecursorMissing(_))
        ));
    }

    #[test]
    fn unknown_session_yields_precursor_error() {
        let mut store = SessionStore::new();
        let id = store.create_session();
        store.remove_session(id);
        assert!(!store.contains(id));
        assert!(matches!(
            store.matrix(id),
            Err(MvspcError::PrecursorMissing(_))
        ));
    }

    #[test]
    fn refitting_supersedes_model_and_drops_stale_diagnostics() {
        let (mut store, id) = seeded_store();
        store.run_pca(id, Some(4)).unwrap();
        store.run_diagnostics(id).unwrap();

        store.run_pca(id, Some(2)).unwrap();
        assert_eq!(store.pca_model(id).unwrap().n_components(), 2);
        assert!(matches!(
            store.diagnostics(id),
            Err(MvspcError::PrecursorMissing(_))
        ));
    }

    #[test]
    fn downstream_features_select_scores_or_matrix() {
        let (mut store, id) = seeded_store();
        assert!(matches!(
            store.downstream_features(id, true),
            Err(MvspcError::PrecursorMissing(_))
        ));
        assert_eq!(store.downstream_features(id, false).unwrap().ncols(), 5);

        store.run_pca(id, Some(2)).unwrap();
        assert_eq!(store.downstream_features(id, true).unwrap().ncols(), 2);
    }

    #[test]
    fn mismatched_variable_names_are_rejected() {
        let mut store = SessionStore::new();
        let id = store.create_session();
        let x = standardized_random_matrix(10, 4, 9);
        assert!(matches!(
            store.set_matrix(id, x, variable_names(3)),
            Err(MvspcError::Input(_))
        ));
    }
}
