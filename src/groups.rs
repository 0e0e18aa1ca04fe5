// Per-group covariance estimation feeding the CPC engine

use crate::cpc::{CpcError, GroupCovariance};
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// How each group's weight in the CPC criterion is derived from its sample count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GroupWeighting {
    /// Weight = number of observations in the group.
    #[default]
    SampleCount,
    /// Weight = group observations / total observations.
    SampleFraction,
    /// Every group gets weight 1.
    Equal,
}

/// Options for turning grouped observations into covariance matrices.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CovarianceOptions {
    /// Divide each variable by its within-group standard deviation, giving
    /// correlation matrices.
    pub scale: bool,
    pub weighting: GroupWeighting,
}

/// A group's covariance matrix along with the statistics used to build it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledCovariance {
    pub label: String,
    pub num_samples: usize,
    /// Within-group mean, shape (P).
    pub mean: Array1<f64>,
    /// Within-group scale factors, shape (P). All ones when not scaling;
    /// zero standard deviations are replaced by 1.0.
    pub scale: Array1<f64>,
    pub covariance: GroupCovariance,
}

/// Splits the rows of `data` by `labels` and computes one sample covariance
/// matrix (divisor n - 1) per group, after centering (and optionally scaling)
/// within the group.
///
/// Groups are returned in order of first appearance of their label.
///
/// * `data` - Observations, shape (n_samples, n_variables).
/// * `labels` - Group label of each row, length n_samples.
///
/// # Errors
/// `CpcError::InvalidInput` if the label count does not match the number of rows,
/// the data has no columns or contains non-finite values, or any group has fewer
/// than 2 observations.
pub fn group_covariances<S: AsRef<str>>(
    data: ArrayView2<f64>,
    labels: &[S],
    options: &CovarianceOptions,
) -> Result<Vec<LabeledCovariance>, CpcError> {
    let (n_samples, n_variables) = data.dim();
    if labels.len() != n_samples {
        return Err(CpcError::InvalidInput(format!(
            "Got {} group labels for {} observations.",
            labels.len(),
            n_samples
        )));
    }
    if n_variables == 0 {
        return Err(CpcError::InvalidInput("Data has zero variables.".into()));
    }
    if data.iter().any(|v| !v.is_finite()) {
        return Err(CpcError::InvalidInput("Data contains non-finite (NaN or infinity) values.".into()));
    }

    let mut group_names: Vec<&str> = Vec::new();
    let mut group_rows: Vec<Vec<usize>> = Vec::new();
    for (row_idx, label) in labels.iter().enumerate() {
        let label = label.as_ref();
        match group_names.iter().position(|&name| name == label) {
            Some(g) => group_rows[g].push(row_idx),
            None => {
                group_names.push(label);
                group_rows.push(vec![row_idx]);
            }
        }
    }

    info!(
        "Estimating covariance matrices for {} group(s) over {} variables ({} observations, scale={}).",
        group_names.len(),
        n_variables,
        n_samples,
        options.scale
    );

    let mut result = Vec::with_capacity(group_names.len());
    for (name, rows) in group_names.iter().zip(group_rows.iter()) {
        let n_group = rows.len();
        if n_group < 2 {
            return Err(CpcError::InvalidInput(format!(
                "Group '{}' has {} observation(s); at least 2 are required.",
                name, n_group
            )));
        }

        let mut group_data = data.select(Axis(0), rows);
        let mean = group_data
            .mean_axis(Axis(0))
            .ok_or_else(|| CpcError::InvalidInput(format!("Group '{}' is empty.", name)))?;
        group_data -= &mean;

        let scale = if options.scale {
            let std_dev = group_data.map_axis(Axis(0), |column| column.std(1.0));
            let sanitized = std_dev.mapv(|val| if val.abs() < 1e-9 { 1.0 } else { val });
            group_data /= &sanitized;
            sanitized
        } else {
            Array1::ones(n_variables)
        };

        let mut cov_matrix: Array2<f64> = group_data.t().dot(&group_data);
        cov_matrix /= (n_group - 1) as f64;
        symmetrize(&mut cov_matrix);

        let weight = match options.weighting {
            GroupWeighting::SampleCount => n_group as f64,
            GroupWeighting::SampleFraction => n_group as f64 / n_samples as f64,
            GroupWeighting::Equal => 1.0,
        };
        debug!("Group '{}': {} observations, weight {}.", name, n_group, weight);

        result.push(LabeledCovariance {
            label: name.to_string(),
            num_samples: n_group,
            mean,
            scale,
            covariance: GroupCovariance::new(cov_matrix, weight),
        });
    }
    Ok(result)
}

/// Replaces a square matrix by (A + Aᵀ) / 2.
pub fn symmetrize(matrix: &mut Array2<f64>) {
    let n = matrix.nrows().min(matrix.ncols());
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (matrix[[i, j]] + matrix[[j, i]]);
            matrix[[i, j]] = avg;
            matrix[[j, i]] = avg;
        }
    }
}
