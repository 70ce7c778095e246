//! Binds one regression specification to one estimator and persists the outcome.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::bundle::ResultBundle;
use crate::data::ReplicationData;
use crate::error::{ReplicationError, Result};
use crate::estimation::LinearEstimator;
use crate::estimator::{CovarianceSpec, Estimator, EstimatorSpec, FittedModel};
use crate::metadata::{Metadata, MetadataDocument};
use crate::options::{
    CovarianceType, EstimatorOptions, FitOptions, OlsOptions, PpmlOptions, DEFAULT_COVARIANCE,
};
use crate::selection::{ColumnRef, ColumnSelection};

/// Everything a caller supplies to reproduce one published regression.
#[derive(Clone, Debug)]
pub struct ReplicationRequest {
    pub metadata: Metadata,
    pub data: ReplicationData,
    pub interest: ColumnSelection,
    /// Fixed-effect columns already present in `X`. Categorical effects
    /// expanded by the data builder are added automatically.
    pub fixed_effects: Option<ColumnSelection>,
    pub endogenous: Option<ColumnSelection>,
    pub elasticity: bool,
    /// Marks the fit as an accepted replication; required for persistence.
    pub replicated: bool,
    pub estimator_options: EstimatorOptions,
    pub ols_options: OlsOptions,
    pub ppml_options: PpmlOptions,
    /// Options for the estimator's full-model fit.
    pub fit_options: FitOptions,
}

impl ReplicationRequest {
    pub fn new(
        metadata: Metadata,
        data: ReplicationData,
        interest: impl Into<ColumnSelection>,
    ) -> Self {
        Self {
            metadata,
            data,
            interest: interest.into(),
            fixed_effects: None,
            endogenous: None,
            elasticity: false,
            replicated: false,
            estimator_options: EstimatorOptions::default(),
            ols_options: OlsOptions::default(),
            ppml_options: PpmlOptions::default(),
            fit_options: FitOptions::default(),
        }
    }

    pub fn fixed_effects(mut self, columns: impl Into<ColumnSelection>) -> Self {
        self.fixed_effects = Some(columns.into());
        self
    }

    /// Marks regressors as endogenous; the data must carry instruments.
    pub fn endogenous(mut self, columns: impl Into<ColumnSelection>) -> Self {
        self.endogenous = Some(columns.into());
        self
    }

    pub fn elasticity(mut self, elasticity: bool) -> Self {
        self.elasticity = elasticity;
        self
    }

    pub fn replicated(mut self, replicated: bool) -> Self {
        self.replicated = replicated;
        self
    }

    pub fn estimator_options(mut self, options: EstimatorOptions) -> Self {
        self.estimator_options = options;
        self
    }

    pub fn ols_options(mut self, options: OlsOptions) -> Self {
        self.ols_options = options;
        self
    }

    pub fn ppml_options(mut self, options: PpmlOptions) -> Self {
        self.ppml_options = options;
        self
    }

    pub fn fit_options(mut self, options: FitOptions) -> Self {
        self.fit_options = options;
        self
    }
}

/// Lifecycle of a [`Replicator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicatorState {
    Constructed,
    Fitted,
    Persisted,
    /// A save failed; the caller may retry, e.g. with overwrite.
    SaveFailed,
}

/// A degraded-feature condition surfaced to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// Cluster groups were supplied but the estimator cannot cluster.
    ClusteringNotHonoured { fallback: CovarianceType },
    /// PPML was fitted with fixed effects present.
    PpmlWithFixedEffects,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::ClusteringNotHonoured { fallback } => write!(
                f,
                "clustering was requested but is not supported by this estimator; \
                 standard errors use {fallback} instead"
            ),
            Notice::PpmlWithFixedEffects => {
                f.write_str("PPML results are currently inaccurate with fixed effects")
            }
        }
    }
}

/// Owns one regression and the estimator bound to it.
#[derive(Debug)]
pub struct Replicator<E: Estimator = LinearEstimator> {
    request: ReplicationRequest,
    /// The data as fitted: identifier columns named as fixed effects are
    /// replaced by dummies.
    design: ReplicationData,
    estimator: E,
    interest: Vec<usize>,
    fixed_effects: Vec<usize>,
    endogenous: Vec<usize>,
    ols: Option<FittedModel>,
    ppml: Option<FittedModel>,
    full: Option<FittedModel>,
    applied_ols: OlsOptions,
    applied_ppml: PpmlOptions,
    notices: Vec<Notice>,
    state: ReplicatorState,
}

impl Replicator<LinearEstimator> {
    /// Resolves column references and constructs the built-in estimator.
    pub fn new(request: ReplicationRequest) -> Result<Self> {
        Self::with_estimator(request)
    }
}

impl<E: Estimator> Replicator<E> {
    /// Resolves column references and constructs an estimator of type `E`.
    pub fn with_estimator(request: ReplicationRequest) -> Result<Self> {
        let data = &request.data;
        let labels = data.x_labels();

        match (&request.endogenous, data.instruments()) {
            (Some(_), None) => {
                return Err(ReplicationError::InstrumentMismatch {
                    detail: "endogenous regressors given without instruments",
                })
            }
            (None, Some(_)) => {
                return Err(ReplicationError::InstrumentMismatch {
                    detail: "instruments given without endogenous regressors",
                })
            }
            _ => {}
        }

        let interest = request.interest.resolve("interest", labels)?;
        let endogenous = match &request.endogenous {
            Some(selection) => selection.resolve("endogenous regressors", labels)?,
            None => Vec::new(),
        };
        let requested_fe = match &request.fixed_effects {
            Some(selection) => selection.resolve("fixed effects", labels)?,
            None => Vec::new(),
        };

        // Named fixed effects are identifier columns; dummies from the data
        // builder are already expanded.
        let absorbed: Vec<usize> = requested_fe
            .into_iter()
            .filter(|col| !data.fixed_effect_columns().contains(col))
            .collect();
        let estimated = [("interest", &interest), ("an endogenous regressor", &endogenous)];
        for (context, columns) in estimated {
            if let Some(&col) = columns.iter().find(|&&col| absorbed.contains(&col)) {
                return Err(ReplicationError::AbsorbedColumn {
                    context,
                    label: labels[col].clone(),
                });
            }
        }
        let (design, positions) = data.absorb_fixed_effects(&absorbed)?;
        let remap = |columns: &[usize]| -> Vec<usize> {
            columns.iter().filter_map(|&col| positions[col]).collect()
        };
        let interest = remap(&interest);
        let endogenous = remap(&endogenous);
        let fixed_effects = design.fixed_effect_columns().to_vec();
        log::debug!(
            "resolved columns: interest={interest:?}, fe={} columns ({} absorbed identifiers), endogenous={endogenous:?}",
            fixed_effects.len(),
            absorbed.len()
        );

        let estimator = E::new(EstimatorSpec {
            y: design.y().clone(),
            x: design.x().clone(),
            endogenous: endogenous.clone(),
            interest: interest.clone(),
            fixed_effects: fixed_effects.clone(),
            instruments: design.instruments().cloned(),
            elasticity: request.elasticity,
            options: request.estimator_options.clone(),
        })?;

        let applied_ols = request.ols_options.clone();
        let applied_ppml = request.ppml_options.clone();
        Ok(Self {
            request,
            design,
            estimator,
            interest,
            fixed_effects,
            endogenous,
            ols: None,
            ppml: None,
            full: None,
            applied_ols,
            applied_ppml,
            notices: Vec::new(),
            state: ReplicatorState::Constructed,
        })
    }

    pub fn state(&self) -> ReplicatorState {
        self.state
    }

    /// Degraded-feature notices raised so far, oldest first.
    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn request(&self) -> &ReplicationRequest {
        &self.request
    }

    /// The data as supplied; this is what a bundle persists.
    pub fn data(&self) -> &ReplicationData {
        &self.request.data
    }

    /// The data as fitted, whose columns line up with the fitted coefficients.
    pub fn design(&self) -> &ReplicationData {
        &self.design
    }

    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    /// Positions of the interest regressors in the fitted design.
    pub fn interest_columns(&self) -> &[usize] {
        &self.interest
    }

    pub fn fixed_effect_columns(&self) -> &[usize] {
        &self.fixed_effects
    }

    pub fn endogenous_columns(&self) -> &[usize] {
        &self.endogenous
    }

    pub fn ols(&self) -> Option<&FittedModel> {
        self.ols.as_ref()
    }

    pub fn ppml(&self) -> Option<&FittedModel> {
        self.ppml.as_ref()
    }

    pub fn full(&self) -> Option<&FittedModel> {
        self.full.as_ref()
    }

    /// Fits by least squares using the request's OLS options.
    pub fn fit_ols(&mut self) -> Result<&FittedModel> {
        let requested = self.request.ols_options.cov_type;
        let (cov_type, clustered) = self.effective_covariance(requested)?;
        let spec = self.covariance_spec(cov_type, clustered);
        let model = self
            .estimator
            .fit_ols(self.design.weights(), &spec)?;
        self.applied_ols = self.request.ols_options.clone().with_cov_type(cov_type);
        self.state = ReplicatorState::Fitted;
        Ok(self.ols.insert(model))
    }

    /// Fits by Poisson pseudo-maximum-likelihood using the request's PPML options.
    pub fn fit_ppml(&mut self) -> Result<&FittedModel> {
        if !self.fixed_effects.is_empty() {
            self.notify(Notice::PpmlWithFixedEffects);
        }
        let requested = self.request.ppml_options.cov_type;
        let (cov_type, clustered) = self.effective_covariance(requested)?;
        let spec = self.covariance_spec(cov_type, clustered);
        let model = self.estimator.fit_ppml(
            self.design.weights(),
            &spec,
            &self.request.ppml_options,
        )?;
        self.applied_ppml = self.request.ppml_options.clone().with_cov_type(cov_type);
        self.state = ReplicatorState::Fitted;
        Ok(self.ppml.insert(model))
    }

    /// Runs the estimator's full-model fit with the request's fit options.
    pub fn fit_full(&mut self) -> Result<&FittedModel> {
        let model = self
            .estimator
            .fit_full(self.design.weights(), &self.request.fit_options)?;
        self.state = ReplicatorState::Fitted;
        Ok(self.full.insert(model))
    }

    /// Saves metadata and data under `root`, keyed by paper, table and panel.
    ///
    /// Fails without touching the filesystem when the result is not marked
    /// replicated, metadata keys are missing, or nothing has been fitted.
    pub fn persist(&mut self, root: impl AsRef<Path>, overwrite: bool) -> Result<PathBuf> {
        match self.try_persist(root.as_ref(), overwrite) {
            Ok(path) => {
                self.state = ReplicatorState::Persisted;
                Ok(path)
            }
            Err(err) => {
                if self.state != ReplicatorState::Constructed {
                    self.state = ReplicatorState::SaveFailed;
                }
                Err(err)
            }
        }
    }

    /// The metadata document that [`persist`](Self::persist) would write.
    pub fn metadata_document(&self) -> Result<MetadataDocument> {
        let metadata = self.request.metadata.validate()?;
        let data = &self.request.data;
        let mut fe: Vec<ColumnRef> = self
            .request
            .fixed_effects
            .as_ref()
            .map(ColumnSelection::to_list)
            .unwrap_or_default();
        fe.extend(
            data.fixed_effect_columns()
                .iter()
                .map(|&col| ColumnRef::Label(data.x_labels()[col].clone())),
        );

        Ok(MetadataDocument {
            paper_id: metadata.paper_id,
            table_id: metadata.table_id,
            panel_identifier: metadata.panel_identifier,
            model_type: metadata.model_type,
            elasticity: self.request.elasticity,
            interest: self.request.interest.to_list(),
            comments: metadata.comments,
            kwargs_estimator: self.request.estimator_options.clone(),
            kwargs_ols: self.applied_ols.clone(),
            kwargs_ppml: self.applied_ppml.clone(),
            kwargs_fit: self.request.fit_options.clone(),
            time: Utc::now().to_rfc3339(),
            nobs: data.observation_count(),
            fe: (!fe.is_empty()).then_some(fe),
            endogenous_regressors: self.request.endogenous.as_ref().map(ColumnSelection::to_list),
            cluster: data.cluster().map(|groups| groups.distinct()),
        })
    }

    fn try_persist(&self, root: &Path, overwrite: bool) -> Result<PathBuf> {
        if !self.request.replicated {
            return Err(ReplicationError::NotReplicated);
        }
        let metadata = self.request.metadata.validate()?;
        if self.ols.is_none() && self.ppml.is_none() && self.full.is_none() {
            return Err(ReplicationError::NotFitted);
        }
        let document = self.metadata_document()?;
        ResultBundle::write(root, &metadata, &document, &self.request.data, overwrite)
    }

    /// Chooses the covariance estimator actually used for a fit.
    fn effective_covariance(&mut self, requested: CovarianceType) -> Result<(CovarianceType, bool)> {
        let has_groups = self.request.data.cluster().is_some();
        match (has_groups, self.estimator.supports_clustering()) {
            (true, true) => Ok((CovarianceType::Cluster, true)),
            (true, false) => {
                let fallback = if requested == CovarianceType::Cluster {
                    DEFAULT_COVARIANCE
                } else {
                    requested
                };
                self.notify(Notice::ClusteringNotHonoured { fallback });
                Ok((fallback, false))
            }
            (false, _) if requested == CovarianceType::Cluster => {
                Err(ReplicationError::MissingClusterGroups)
            }
            (false, _) => Ok((requested, false)),
        }
    }

    fn covariance_spec(&self, cov_type: CovarianceType, clustered: bool) -> CovarianceSpec<'_> {
        match self.request.data.cluster() {
            Some(groups) if clustered => CovarianceSpec::clustered(groups.codes()),
            _ => CovarianceSpec::new(cov_type),
        }
    }

    fn notify(&mut self, notice: Notice) {
        log::warn!("{notice}");
        self.notices.push(notice);
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{DMatrix, DVector};

    use super::*;
    use crate::data::ReplicationDataBuilder;

    fn data() -> ReplicationData {
        let y = DVector::from_vec(vec![1.0, 2.5, 2.0, 4.5, 3.5, 6.0]);
        let x = DMatrix::from_row_slice(
            6,
            2,
            &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0, 1.0, 4.0, 1.0, 5.0],
        );
        ReplicationDataBuilder::new(y, x)
            .labels(["const", "dist"])
            .build()
            .unwrap()
    }

    fn metadata() -> Metadata {
        Metadata::new()
            .paper_id("066")
            .table_id("3")
            .panel_identifier("A_1")
            .model_type("log-linear")
    }

    /// Estimator that cannot cluster, to exercise the degraded path.
    #[derive(Debug)]
    struct NoClusterEstimator(LinearEstimator);

    impl Estimator for NoClusterEstimator {
        fn new(spec: EstimatorSpec) -> Result<Self> {
            LinearEstimator::new(spec).map(Self)
        }

        fn fit_ols(
            &self,
            weights: Option<&DVector<f64>>,
            covariance: &CovarianceSpec<'_>,
        ) -> Result<FittedModel> {
            self.0.fit_ols(weights, covariance)
        }

        fn fit_ppml(
            &self,
            weights: Option<&DVector<f64>>,
            covariance: &CovarianceSpec<'_>,
            options: &PpmlOptions,
        ) -> Result<FittedModel> {
            self.0.fit_ppml(weights, covariance, options)
        }
    }

    #[test]
    fn label_interest_resolves_to_position() {
        let request = ReplicationRequest::new(metadata(), data(), "dist");
        let replicator = Replicator::new(request).unwrap();
        assert_eq!(replicator.interest_columns(), &[1]);
        assert_eq!(replicator.state(), ReplicatorState::Constructed);
    }

    #[test]
    fn unknown_interest_fails_construction() {
        let request = ReplicationRequest::new(metadata(), data(), "price");
        assert!(matches!(
            Replicator::new(request),
            Err(ReplicationError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn interest_cannot_be_an_absorbed_identifier() {
        let request = ReplicationRequest::new(metadata(), data(), "dist").fixed_effects("dist");
        assert!(matches!(
            Replicator::new(request),
            Err(ReplicationError::AbsorbedColumn { context: "interest", .. })
        ));
    }

    #[test]
    fn endogenous_without_instruments_fails_construction() {
        let request = ReplicationRequest::new(metadata(), data(), 1usize).endogenous("dist");
        assert!(matches!(
            Replicator::new(request),
            Err(ReplicationError::InstrumentMismatch { .. })
        ));
    }

    #[test]
    fn fitting_moves_to_fitted_and_records_options() {
        let request = ReplicationRequest::new(metadata(), data(), 1usize)
            .ols_options(OlsOptions::default().with_cov_type(CovarianceType::HC1));
        let mut replicator = Replicator::new(request).unwrap();
        let fit = replicator.fit_ols().unwrap();
        assert_eq!(fit.params.len(), 2);
        assert_eq!(replicator.state(), ReplicatorState::Fitted);
        assert_eq!(replicator.applied_ols.cov_type, CovarianceType::HC1);
        assert!(replicator.notices().is_empty());
    }

    #[test]
    fn unsupported_clustering_degrades_with_notice() {
        let clustered = ReplicationDataBuilder::new(data().y().clone(), data().x().clone())
            .cluster(["a", "a", "b", "b", "c", "c"])
            .build()
            .unwrap();
        let request = ReplicationRequest::new(metadata(), clustered, 1usize);
        let mut replicator = Replicator::<NoClusterEstimator>::with_estimator(request).unwrap();
        let fit = replicator.fit_ols().unwrap();
        assert_eq!(fit.cov_type, DEFAULT_COVARIANCE);
        assert_eq!(
            replicator.notices(),
            &[Notice::ClusteringNotHonoured {
                fallback: DEFAULT_COVARIANCE
            }]
        );

        let document = replicator.metadata_document().unwrap();
        assert_eq!(
            document.cluster,
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn supported_clustering_is_applied() {
        let clustered = ReplicationDataBuilder::new(data().y().clone(), data().x().clone())
            .cluster([1, 1, 2, 2, 3, 3])
            .build()
            .unwrap();
        let request = ReplicationRequest::new(metadata(), clustered, 1usize);
        let mut replicator = Replicator::new(request).unwrap();
        assert_eq!(replicator.fit_ols().unwrap().cov_type, CovarianceType::Cluster);
        assert_eq!(replicator.applied_ols.cov_type, CovarianceType::Cluster);
        assert!(replicator.notices().is_empty());
    }

    #[test]
    fn ppml_with_fixed_effects_warns_every_time() {
        let with_fe = ReplicationDataBuilder::new(data().y().clone(), data().x().clone())
            .labels(["const", "dist"])
            .categorical_fixed_effect("region", ["n", "s", "n", "s", "n", "s"])
            .build()
            .unwrap();
        let request = ReplicationRequest::new(metadata(), with_fe, "dist");
        let mut replicator = Replicator::new(request).unwrap();
        replicator.fit_ppml().unwrap();
        replicator.fit_ppml().unwrap();
        assert_eq!(
            replicator.notices(),
            &[Notice::PpmlWithFixedEffects, Notice::PpmlWithFixedEffects]
        );
    }

    #[test]
    fn persist_requires_replicated_flag() {
        let dir = tempfile::tempdir().unwrap();
        let request = ReplicationRequest::new(metadata(), data(), 1usize);
        let mut replicator = Replicator::new(request).unwrap();
        replicator.fit_ols().unwrap();
        let result = replicator.persist(dir.path(), true);
        assert!(matches!(result, Err(ReplicationError::NotReplicated)));
        assert_eq!(replicator.state(), ReplicatorState::SaveFailed);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn persist_requires_a_fit() {
        let dir = tempfile::tempdir().unwrap();
        let request = ReplicationRequest::new(metadata(), data(), 1usize).replicated(true);
        let mut replicator = Replicator::new(request).unwrap();
        assert!(matches!(
            replicator.persist(dir.path(), false),
            Err(ReplicationError::NotFitted)
        ));
        assert_eq!(replicator.state(), ReplicatorState::Constructed);
    }
}
