// Fitted common principal components model

use crate::cpc::{CpcConfig, CpcEngine, CpcError, CpcWarning, GroupCovariance};
use crate::groups::{group_covariances, CovarianceOptions};
use log::info;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Per-group preprocessing and variance summary stored in a fitted model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct GroupSummary {
    label: String,
    /// Mean of the group's training data. Shape: (n_features)
    mean: Array1<f64>,
    /// Positive scale factors applied after centering. Shape: (n_features)
    scale: Array1<f64>,
    weight: f64,
}

/// Common principal components (CPC) model.
///
/// Holds one orthogonal loading matrix shared by all groups, together with each
/// group's variances along the shared components. The model can be fitted from
/// grouped observations or from precomputed covariance matrices, used to project
/// new observations of a known group, and saved to / loaded from disk.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct CPC {
    /// Common loading matrix. Shape: (n_features, n_features)
    loadings: Option<Array2<f64>>,
    groups: Vec<GroupSummary>,
    /// Shape: (n_groups, n_features)
    group_variances: Option<Array2<f64>>,
    /// Shape: (n_groups, n_features)
    explained_variance_percent: Option<Array2<f64>>,
    converged: bool,
    sweeps_performed: usize,
    warnings: Vec<CpcWarning>,
}

impl CPC {
    /// Creates a new, empty model. Fit it with `fit` / `fit_covariances` or
    /// load one with `load_model`.
    ///
    /// # Examples
    ///
    /// ```
    /// use common_pca::CPC;
    /// let cpc = CPC::new();
    /// assert!(cpc.loadings().is_none());
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the common loading matrix, if fitted.
    pub fn loadings(&self) -> Option<&Array2<f64>> {
        self.loadings.as_ref()
    }

    /// Group labels in model order (rows of `group_variances`).
    pub fn group_labels(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.label.as_str()).collect()
    }

    /// Group weights used in the CPC criterion, in model order.
    pub fn group_weights(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.weight).collect()
    }

    /// Variance of each group along each common component, shape (n_groups, n_features).
    pub fn group_variances(&self) -> Option<&Array2<f64>> {
        self.group_variances.as_ref()
    }

    /// Percentage of each group's total variance per component, shape (n_groups, n_features).
    pub fn explained_variance_percent(&self) -> Option<&Array2<f64>> {
        self.explained_variance_percent.as_ref()
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn sweeps_performed(&self) -> usize {
        self.sweeps_performed
    }

    /// Warnings raised by the engine during the fit.
    pub fn warnings(&self) -> &[CpcWarning] {
        &self.warnings
    }

    /// Fits the model to grouped observations.
    ///
    /// Each group is centered (and scaled if `options.scale`) with its own statistics,
    /// its sample covariance is computed, and the CPC engine is run on the result.
    ///
    /// * `data` - Observations, shape (n_samples, n_features).
    /// * `labels` - Group label of each observation.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ndarray::array;
    /// use common_pca::{CPC, CovarianceOptions, CpcConfig};
    ///
    /// let data = array![[1.0, 2.0], [2.0, 1.5], [3.0, 4.0], [0.5, 0.2], [0.1, 0.9], [0.7, 0.4]];
    /// let labels = ["a", "a", "a", "b", "b", "b"];
    /// let mut cpc = CPC::new();
    /// cpc.fit(data.view(), &labels, &CovarianceOptions::default(), &CpcConfig::default()).unwrap();
    /// ```
    pub fn fit<S: AsRef<str>>(
        &mut self,
        data: ArrayView2<f64>,
        labels: &[S],
        options: &CovarianceOptions,
        config: &CpcConfig,
    ) -> Result<(), CpcError> {
        let labeled = group_covariances(data, labels, options)?;
        let covariances: Vec<GroupCovariance> = labeled.iter().map(|g| g.covariance.clone()).collect();
        let groups = labeled
            .into_iter()
            .map(|g| GroupSummary {
                label: g.label,
                mean: g.mean,
                scale: g.scale,
                weight: g.covariance.weight,
            })
            .collect();
        self.fit_summaries(groups, &covariances, config)
    }

    /// Fits the model directly from covariance matrices.
    ///
    /// The resulting model has zero means and unit scales, so `transform` projects
    /// observations as given.
    pub fn fit_covariances<S: AsRef<str>>(
        &mut self,
        labels: &[S],
        covariances: &[GroupCovariance],
        config: &CpcConfig,
    ) -> Result<(), CpcError> {
        if labels.len() != covariances.len() {
            return Err(CpcError::InvalidInput(format!(
                "Got {} labels for {} covariance matrices.",
                labels.len(),
                covariances.len()
            )));
        }
        let groups = labels
            .iter()
            .zip(covariances)
            .map(|(label, cov)| GroupSummary {
                label: label.as_ref().to_string(),
                mean: Array1::zeros(cov.matrix.nrows()),
                scale: Array1::ones(cov.matrix.nrows()),
                weight: cov.weight,
            })
            .collect();
        self.fit_summaries(groups, covariances, config)
    }

    fn fit_summaries(
        &mut self,
        groups: Vec<GroupSummary>,
        covariances: &[GroupCovariance],
        config: &CpcConfig,
    ) -> Result<(), CpcError> {
        let solution = CpcEngine::new(config.clone()).solve(covariances)?;
        let decomposition = solution.decompose(covariances)?;
        info!(
            "Fitted CPC model on {} group(s): converged={}, sweeps={}",
            groups.len(),
            solution.converged,
            solution.sweeps_performed
        );

        self.loadings = Some(solution.loadings);
        self.groups = groups;
        self.group_variances = Some(decomposition.group_variances);
        self.explained_variance_percent = Some(decomposition.explained_variance_percent);
        self.converged = solution.converged;
        self.sweeps_performed = solution.sweeps_performed;
        self.warnings = solution.warnings;
        Ok(())
    }

    /// Projects observations of group `label` onto the common components.
    ///
    /// The data is centered and scaled with that group's stored statistics.
    ///
    /// * `x` - Observations, shape (m_samples, n_features). Modified in place.
    ///
    /// # Errors
    /// Returns an error if the model is not fitted, the label is unknown, or the
    /// feature dimension does not match.
    pub fn transform(&self, label: &str, mut x: Array2<f64>) -> Result<Array2<f64>, CpcError> {
        let loadings = self.loadings.as_ref().ok_or_else(|| {
            CpcError::InvalidInput("CPC model: loadings not set. Fit or load a model first.".into())
        })?;
        let group = self
            .groups
            .iter()
            .find(|g| g.label == label)
            .ok_or_else(|| CpcError::InvalidInput(format!("CPC model has no group '{}'.", label)))?;

        if x.ncols() != loadings.nrows() {
            return Err(CpcError::InvalidInput(format!(
                "Input data feature dimension ({}) does not match model's feature dimension ({}).",
                x.ncols(),
                loadings.nrows()
            )));
        }
        if x.nrows() == 0 {
            return Ok(Array2::zeros((0, loadings.ncols())));
        }

        for mut row in x.axis_iter_mut(Axis(0)) {
            ndarray::Zip::from(row.view_mut())
                .and(&group.mean)
                .and(&group.scale)
                .for_each(|val_ref, &m_val, &s_val| {
                    *val_ref = (*val_ref - m_val) / s_val;
                });
        }
        Ok(x.dot(loadings))
    }

    /// Saves the model to a file using bincode.
    ///
    /// # Errors
    /// Returns an error if the model is not fitted, or if file I/O or serialization fails.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<(), CpcError> {
        if self.loadings.is_none() || self.group_variances.is_none() {
            return Err(CpcError::InvalidInput(
                "Cannot save a CPC model that has not been fitted.".into(),
            ));
        }
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| CpcError::Serialization(format!("Failed to serialize CPC model: {}", e)))?;
        Ok(())
    }

    /// Loads a model previously saved with `save_model`, checking that its parts
    /// are consistent with each other.
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Self, CpcError> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let model: CPC = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| CpcError::Serialization(format!("Failed to deserialize CPC model: {}", e)))?;
        model.check_consistency()?;
        Ok(model)
    }

    fn check_consistency(&self) -> Result<(), CpcError> {
        let bad = |msg: String| Err(CpcError::Serialization(msg));
        let loadings = match self.loadings.as_ref() {
            Some(l) => l,
            None => return bad("Loaded CPC model is missing its loading matrix.".into()),
        };
        let (p, k) = loadings.dim();
        if p != k {
            return bad(format!("Loaded CPC loading matrix is not square ({}x{}).", p, k));
        }
        let expected = (self.groups.len(), p);
        for (name, matrix) in [
            ("group variances", self.group_variances.as_ref()),
            ("explained variance", self.explained_variance_percent.as_ref()),
        ] {
            match matrix {
                Some(m) if m.dim() == expected => {}
                Some(m) => {
                    return bad(format!(
                        "Loaded CPC {} have shape {:?}, expected {:?}.",
                        name,
                        m.dim(),
                        expected
                    ))
                }
                None => return bad(format!("Loaded CPC model is missing {}.", name)),
            }
        }
        for group in &self.groups {
            if group.mean.len() != p || group.scale.len() != p {
                return bad(format!(
                    "Loaded CPC group '{}' has statistics of the wrong length.",
                    group.label
                ));
            }
            if group.scale.iter().any(|&s| !s.is_finite() || s <= 0.0) {
                return bad(format!(
                    "Loaded CPC group '{}' has non-positive or non-finite scale factors.",
                    group.label
                ));
            }
        }
        Ok(())
    }
}
