// Common principal components (CPC) rotation engine

use crate::diagnostics::{
    compute_orthogonality_error_f64, off_diagonal_sum_of_squares, CpcRunDiagnostics,
    SweepDiagnostics,
};
use crate::linalg_backends::{sorted_eigh_descending, BackendEigh, BackendQR, LinAlgBackendProvider};
use log::{debug, info, trace, warn};
use ndarray::{Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_4;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Number of sweeps used when no budget is given.
pub const DEFAULT_MAX_ITERATIONS: usize = 15;
/// Largest rotation angle (radians) in a sweep below which the engine reports convergence.
pub const DEFAULT_CONVERGENCE_TOLERANCE: f64 = 1e-6;
/// Relative size of the pair-angle moments below which a pair is skipped.
pub const DEFAULT_DEGENERACY_TOLERANCE: f64 = 1e-12;
/// Sweeps between QR corrections of the loading matrix.
pub const DEFAULT_REORTHONORMALIZE_EVERY: usize = 5;
/// Group count from which per-pair reductions run on the rayon pool.
pub const DEFAULT_PARALLEL_GROUP_THRESHOLD: usize = 64;

/// An input variance below this fraction of the group's total variance is reported.
const NEAR_ZERO_VARIANCE_RATIO: f64 = 1e-12;
/// Allowed asymmetry, relative to the largest absolute entry of a matrix.
const SYMMETRY_TOLERANCE: f64 = 1e-8;

/// Errors raised by the CPC engine and the layers built on it.
#[derive(Debug, Error)]
pub enum CpcError {
    /// Structurally invalid input; nothing was computed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// The linear algebra backend failed (eigendecomposition or QR).
    #[error("Linear algebra backend failure: {0}")]
    Backend(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn invalid<T>(msg: impl Into<String>) -> Result<T, CpcError> {
    Err(CpcError::InvalidInput(msg.into()))
}

/// One group's covariance matrix together with its weight (typically the sample count).
///
/// The engine only ever reads these; working copies are made internally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCovariance {
    /// Symmetric positive-semidefinite matrix, shape (P, P).
    pub matrix: Array2<f64>,
    /// Non-negative weight of the group in the criterion.
    pub weight: f64,
}

impl GroupCovariance {
    pub fn new(matrix: Array2<f64>, weight: f64) -> Self {
        Self { matrix, weight }
    }

    /// Number of variables (P).
    pub fn num_variables(&self) -> usize {
        self.matrix.nrows()
    }

    /// Total variance of the group, trace(Σ).
    pub fn trace(&self) -> f64 {
        self.matrix.diag().sum()
    }
}

/// How the loading matrix is seeded before the first sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Initialization {
    /// Start from the identity matrix.
    #[default]
    Identity,
    /// Start from the eigenvectors of the weighted pooled covariance,
    /// ordered by descending eigenvalue.
    PooledEigenvectors,
}

/// Configuration for the CPC rotation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpcConfig {
    /// Maximum number of sweeps over all axis pairs. Must be at least 1.
    pub max_iterations: usize,
    /// Convergence is declared once a sweep's largest |angle| falls below this (radians).
    pub convergence_tolerance: f64,
    /// A pair is skipped when the magnitude of its angle moments is at most this
    /// fraction of the pair's total weighted spread, or when the spread itself is at
    /// rounding level relative to the size of the pair's blocks.
    pub degeneracy_tolerance: f64,
    /// Re-orthonormalize W every this many sweeps. 0 disables the periodic
    /// correction; a final correction is always applied.
    pub reorthonormalize_every: usize,
    pub initialization: Initialization,
    /// Groups count at or above which the per-group work runs in parallel.
    pub parallel_group_threshold: usize,
    /// Record a `SweepDiagnostics` entry per sweep.
    pub record_diagnostics: bool,
}

impl Default for CpcConfig {
    fn default() -> Self {
        CpcConfig {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            convergence_tolerance: DEFAULT_CONVERGENCE_TOLERANCE,
            degeneracy_tolerance: DEFAULT_DEGENERACY_TOLERANCE,
            reorthonormalize_every: DEFAULT_REORTHONORMALIZE_EVERY,
            initialization: Initialization::Identity,
            parallel_group_threshold: DEFAULT_PARALLEL_GROUP_THRESHOLD,
            record_diagnostics: false,
        }
    }
}

impl CpcConfig {
    /// Default configuration with a different sweep budget.
    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Self { max_iterations, ..Self::default() }
    }

    fn validate(&self) -> Result<(), CpcError> {
        if self.max_iterations == 0 {
            return invalid("max_iterations must be at least 1.");
        }
        if !self.convergence_tolerance.is_finite() || self.convergence_tolerance < 0.0 {
            return invalid(format!(
                "convergence_tolerance must be finite and non-negative, got {}.",
                self.convergence_tolerance
            ));
        }
        if !self.degeneracy_tolerance.is_finite() || self.degeneracy_tolerance < 0.0 {
            return invalid(format!(
                "degeneracy_tolerance must be finite and non-negative, got {}.",
                self.degeneracy_tolerance
            ));
        }
        Ok(())
    }
}

/// Non-fatal conditions met while solving. Each one is also logged at `warn` level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CpcWarning {
    /// Pairs whose angle solve had a vanishing denominator were left unrotated in this sweep.
    NumericDegeneracy { sweep: usize, skipped_pairs: usize },
    /// An input variance is negligible relative to the group's total variance.
    NearZeroVariance { group: usize, axis: usize, variance: f64 },
    /// The sweep budget ran out (or the run was cancelled) before the angle tolerance was met.
    NonConvergence { sweeps: usize, max_angle: f64 },
}

impl fmt::Display for CpcWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpcWarning::NumericDegeneracy { sweep, skipped_pairs } => write!(
                f,
                "sweep {}: skipped {} degenerate axis pair(s)",
                sweep, skipped_pairs
            ),
            CpcWarning::NearZeroVariance { group, axis, variance } => write!(
                f,
                "group {} has near-zero variance {:e} on variable {}",
                group, variance, axis
            ),
            CpcWarning::NonConvergence { sweeps, max_angle } => write!(
                f,
                "not converged after {} sweep(s); last max rotation angle {:e} rad",
                sweeps, max_angle
            ),
        }
    }
}

/// Result of a CPC solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpcSolution {
    /// Common loading matrix W, shape (P, P), orthonormal columns.
    pub loadings: Array2<f64>,
    pub sweeps_performed: usize,
    /// True when a sweep's largest |angle| fell below the convergence tolerance.
    pub converged: bool,
    /// True when the run was stopped through the cancellation flag.
    pub cancelled: bool,
    /// Largest |angle| of the last sweep performed (infinite if no sweep ran).
    pub final_max_angle: f64,
    pub warnings: Vec<CpcWarning>,
    pub diagnostics: Option<CpcRunDiagnostics>,
}

impl CpcSolution {
    /// Whether the solution carries a `NonConvergence` warning.
    pub fn has_non_convergence(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, CpcWarning::NonConvergence { .. }))
    }

    /// Per-group variances and explained-variance percentages along the loadings.
    pub fn decompose(&self, covariances: &[GroupCovariance]) -> Result<VarianceDecomposition, CpcError> {
        decompose(&self.loadings, covariances)
    }
}

/// Checks the group list and returns the common number of variables P.
pub fn validate_covariances(covariances: &[GroupCovariance]) -> Result<usize, CpcError> {
    let first = match covariances.first() {
        Some(c) => c,
        None => return invalid("At least one group covariance matrix is required."),
    };
    let p = first.matrix.nrows();
    if p < 2 {
        return invalid(format!("At least 2 variables are required, got {}.", p));
    }

    let mut total_weight = 0.0;
    for (group_idx, cov) in covariances.iter().enumerate() {
        let (rows, cols) = cov.matrix.dim();
        if rows != cols {
            return invalid(format!(
                "Covariance matrix of group {} is not square ({}x{}).",
                group_idx, rows, cols
            ));
        }
        if rows != p {
            return invalid(format!(
                "Covariance matrix of group {} is {}x{}, expected {}x{}.",
                group_idx, rows, cols, p, p
            ));
        }
        if cov.matrix.iter().any(|v| !v.is_finite()) {
            return invalid(format!(
                "Covariance matrix of group {} contains non-finite values.",
                group_idx
            ));
        }
        let max_abs = cov.matrix.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let allowed_asymmetry = SYMMETRY_TOLERANCE * max_abs;
        for i in 0..p {
            for j in (i + 1)..p {
                if (cov.matrix[[i, j]] - cov.matrix[[j, i]]).abs() > allowed_asymmetry {
                    return invalid(format!(
                        "Covariance matrix of group {} is not symmetric at ({}, {}).",
                        group_idx, i, j
                    ));
                }
            }
        }
        if !cov.weight.is_finite() || cov.weight < 0.0 {
            return invalid(format!(
                "Weight of group {} must be finite and non-negative, got {}.",
                group_idx, cov.weight
            ));
        }
        total_weight += cov.weight;
    }
    if total_weight <= 0.0 {
        return invalid("Group weights must not all be zero.");
    }
    Ok(p)
}

/// Unordered axis pairs (i, j), i < j, in lexicographic order.
pub fn pair_sequence(p: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::with_capacity(p * p.saturating_sub(1) / 2);
    for i in 0..p {
        for j in (i + 1)..p {
            pairs.push((i, j));
        }
    }
    pairs
}

/// Weighted trigonometric moments of one axis pair, summed over groups.
///
/// With `d = a - b` and `e = 2c` per group, `cos_moment = Σ w (d² - e²)`,
/// `sin_moment = Σ w 2de` and `spread = Σ w (d² + e²)`. `level = Σ w (a + b)²`
/// is the absolute size of the blocks, against which a rounding-level spread is judged.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PairMoments {
    pub cos_moment: f64,
    pub sin_moment: f64,
    pub spread: f64,
    pub level: f64,
}

impl PairMoments {
    /// Sum of the moments of two disjoint sets of groups.
    pub fn accumulate(self, other: PairMoments) -> PairMoments {
        PairMoments {
            cos_moment: self.cos_moment + other.cos_moment,
            sin_moment: self.sin_moment + other.sin_moment,
            spread: self.spread + other.spread,
            level: self.level + other.level,
        }
    }

    /// Moments of a single group from the entries of its rotated 2x2 block.
    pub fn from_block(a: f64, b: f64, c: f64, weight: f64) -> PairMoments {
        let d = a - b;
        let e = 2.0 * c;
        PairMoments {
            cos_moment: weight * (d * d - e * e),
            sin_moment: weight * 2.0 * d * e,
            spread: weight * (d * d + e * e),
            level: weight * (a + b) * (a + b),
        }
    }

    /// Weighted sum over groups of the squared variance difference along the
    /// pair's axes after rotating them by `theta`.
    pub fn criterion(&self, theta: f64) -> f64 {
        let four_theta = 4.0 * theta;
        0.5 * (self.spread + self.cos_moment * four_theta.cos() + self.sin_moment * four_theta.sin())
    }
}

/// Outcome of the closed-form angle solve for one pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PairAngle {
    Rotate(f64),
    Degenerate,
}

/// Optimal rotation angle for one pair, in (-π/4, π/4].
///
/// The pair is degenerate when `spread ≤ tol · level` (every group's block is isotropic
/// up to rounding, so any angle would be fitted to noise) or when
/// `hypot(A, B) ≤ tol · spread` (the groups' moments cancel).
///
/// The stationary points of the criterion are `θ* = ¼·atan2(B, A)` and its companion
/// `θ* ± π/4`; the one with the larger criterion value is returned.
pub fn solve_pair_angle(moments: &PairMoments, degeneracy_tolerance: f64) -> PairAngle {
    let magnitude = moments.cos_moment.hypot(moments.sin_moment);
    if !moments.spread.is_normal()
        || moments.spread <= 0.0
        || moments.spread <= degeneracy_tolerance * moments.level
        || !magnitude.is_finite()
        || magnitude <= degeneracy_tolerance * moments.spread
    {
        return PairAngle::Degenerate;
    }

    let candidate = 0.25 * moments.sin_moment.atan2(moments.cos_moment);
    let companion = if candidate > 0.0 {
        candidate - FRAC_PI_4
    } else {
        candidate + FRAC_PI_4
    };
    if moments.criterion(candidate) >= moments.criterion(companion) {
        PairAngle::Rotate(candidate)
    } else {
        PairAngle::Rotate(companion)
    }
}

/// Rotates columns `i` and `j` of `matrix` in place:
/// `col_i ← c·col_i + s·col_j`, `col_j ← −s·col_i + c·col_j`.
pub fn apply_givens_to_columns(matrix: &mut Array2<f64>, i: usize, j: usize, cos: f64, sin: f64) {
    for mut row in matrix.axis_iter_mut(Axis(0)) {
        let x_i = row[i];
        let x_j = row[j];
        row[i] = cos * x_i + sin * x_j;
        row[j] = -sin * x_i + cos * x_j;
    }
}

/// `S ← GᵀSG` for the Givens rotation G acting on axes `i` and `j`.
fn apply_givens_similarity(matrix: &mut Array2<f64>, i: usize, j: usize, cos: f64, sin: f64) {
    apply_givens_to_columns(matrix, i, j, cos, sin);
    for k in 0..matrix.ncols() {
        let x_i = matrix[[i, k]];
        let x_j = matrix[[j, k]];
        matrix[[i, k]] = cos * x_i + sin * x_j;
        matrix[[j, k]] = -sin * x_i + cos * x_j;
    }
}

fn group_pair_moments(rotated: &Array2<f64>, weight: f64, i: usize, j: usize) -> PairMoments {
    let off_diagonal = 0.5 * (rotated[[i, j]] + rotated[[j, i]]);
    PairMoments::from_block(rotated[[i, i]], rotated[[j, j]], off_diagonal, weight)
}

/// The CPC rotation engine (Flury–Gautschi style pairwise rotations).
///
/// The engine seeds an orthogonal loading matrix W and then sweeps over every axis
/// pair (i, j), i < j, in a fixed order. For each pair it rotates the (i, j) plane of W
/// by the angle maximizing the weighted sum over groups of the squared variance
/// difference along the two rotated axes, which is the same as minimizing the weighted
/// off-diagonal leakage of WᵀΣ_mW. Pairs inside a sweep are applied strictly in
/// sequence; only the per-group reduction of a pair may run in parallel.
///
/// Per group, the engine keeps `S_m = WᵀΣ_mW` and updates it together with W, so a
/// rotation costs O(M·P). `S_m` is rebuilt from the untouched inputs after every
/// QR correction of W.
#[derive(Debug, Clone, Default)]
pub struct CpcEngine {
    config: CpcConfig,
}

impl CpcEngine {
    pub fn new(config: CpcConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CpcConfig {
        &self.config
    }

    /// Computes the common loading matrix for the given groups.
    ///
    /// # Errors
    /// `CpcError::InvalidInput` for structurally invalid input (checked before any
    /// iteration), `CpcError::Backend` if the initial eigendecomposition or a QR
    /// correction fails.
    pub fn solve(&self, covariances: &[GroupCovariance]) -> Result<CpcSolution, CpcError> {
        self.run(covariances, None)
    }

    /// Like `solve`, but checks `cancel` between sweeps and returns the current
    /// loadings as soon as it is set.
    pub fn solve_cancellable(
        &self,
        covariances: &[GroupCovariance],
        cancel: &AtomicBool,
    ) -> Result<CpcSolution, CpcError> {
        self.run(covariances, Some(cancel))
    }

    fn run(
        &self,
        covariances: &[GroupCovariance],
        cancel: Option<&AtomicBool>,
    ) -> Result<CpcSolution, CpcError> {
        self.config.validate()?;
        let num_variables = validate_covariances(covariances)?;
        let num_groups = covariances.len();
        let backend = LinAlgBackendProvider::new();
        let use_parallel = num_groups >= self.config.parallel_group_threshold;

        info!(
            "Starting CPC solve. Variables={}, Groups={}, Max sweeps={}, Init={:?}, Parallel={}",
            num_variables, num_groups, self.config.max_iterations, self.config.initialization, use_parallel
        );
        let overall_start_time = std::time::Instant::now();

        let mut warnings = near_zero_variance_warnings(covariances);
        for warning in &warnings {
            warn!("{}", warning);
        }

        let weights: Vec<f64> = covariances.iter().map(|c| c.weight).collect();
        let pairs = pair_sequence(num_variables);
        let mut loadings = self.initial_loadings(covariances, &backend)?;
        let mut rotated = project_covariances(covariances, &loadings, use_parallel);

        let mut run_diagnostics = if self.config.record_diagnostics {
            Some(CpcRunDiagnostics::default())
        } else {
            None
        };

        let mut converged = false;
        let mut cancelled = false;
        let mut sweeps_performed = 0;
        let mut final_max_angle = f64::INFINITY;

        for sweep in 1..=self.config.max_iterations {
            if cancel.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
                info!("CPC solve cancelled before sweep {}.", sweep);
                cancelled = true;
                break;
            }

            let mut max_abs_angle = 0.0_f64;
            let mut rotated_pairs = 0;
            let mut skipped_pairs = 0;

            for &(i, j) in &pairs {
                let moments = if use_parallel {
                    rotated
                        .par_iter()
                        .zip(weights.par_iter())
                        .map(|(s, &w)| group_pair_moments(s, w, i, j))
                        .reduce(PairMoments::default, PairMoments::accumulate)
                } else {
                    rotated
                        .iter()
                        .zip(weights.iter())
                        .map(|(s, &w)| group_pair_moments(s, w, i, j))
                        .fold(PairMoments::default(), PairMoments::accumulate)
                };

                let theta = match solve_pair_angle(&moments, self.config.degeneracy_tolerance) {
                    PairAngle::Degenerate => {
                        trace!("Sweep {}: pair ({}, {}) is degenerate, skipped.", sweep, i, j);
                        skipped_pairs += 1;
                        continue;
                    }
                    PairAngle::Rotate(theta) => theta,
                };
                if theta == 0.0 {
                    continue;
                }

                let (sin, cos) = theta.sin_cos();
                apply_givens_to_columns(&mut loadings, i, j, cos, sin);
                if use_parallel {
                    rotated
                        .par_iter_mut()
                        .for_each(|s| apply_givens_similarity(s, i, j, cos, sin));
                } else {
                    for s in rotated.iter_mut() {
                        apply_givens_similarity(s, i, j, cos, sin);
                    }
                }
                trace!("Sweep {}: rotated pair ({}, {}) by {:e} rad.", sweep, i, j, theta);
                max_abs_angle = max_abs_angle.max(theta.abs());
                rotated_pairs += 1;
            }

            sweeps_performed = sweep;
            final_max_angle = max_abs_angle;

            if skipped_pairs > 0 {
                let warning = CpcWarning::NumericDegeneracy { sweep, skipped_pairs };
                warn!("{}", warning);
                warnings.push(warning);
            }

            let reorthonormalized = self.config.reorthonormalize_every > 0
                && sweep % self.config.reorthonormalize_every == 0;
            if reorthonormalized {
                reorthonormalize(&mut loadings, &backend)?;
                rotated = project_covariances(covariances, &loadings, use_parallel);
            }

            debug!(
                "Sweep {}: max |angle| = {:e}, rotated pairs = {}, skipped pairs = {}{}",
                sweep,
                max_abs_angle,
                rotated_pairs,
                skipped_pairs,
                if reorthonormalized { ", re-orthonormalized" } else { "" }
            );

            if let Some(diag) = run_diagnostics.as_mut() {
                diag.sweeps.push(SweepDiagnostics {
                    sweep_num: sweep,
                    max_abs_angle,
                    rotated_pairs,
                    skipped_degenerate_pairs: skipped_pairs,
                    orthogonality_error: compute_orthogonality_error_f64(&loadings.view()),
                    reorthonormalized,
                    weighted_off_diagonal_leakage: weighted_leakage(&rotated, &weights),
                });
            }

            if max_abs_angle < self.config.convergence_tolerance {
                converged = true;
                break;
            }
        }

        reorthonormalize(&mut loadings, &backend)?;

        if !converged {
            let warning = CpcWarning::NonConvergence {
                sweeps: sweeps_performed,
                max_angle: final_max_angle,
            };
            warn!("{}", warning);
            warnings.push(warning);
        }

        if let Some(diag) = run_diagnostics.as_mut() {
            diag.total_runtime_seconds = Some(overall_start_time.elapsed().as_secs_f64());
        }

        info!(
            "CPC solve finished in {:?}: {} sweep(s), converged={}, last max |angle|={:e}",
            overall_start_time.elapsed(),
            sweeps_performed,
            converged,
            final_max_angle
        );

        Ok(CpcSolution {
            loadings,
            sweeps_performed,
            converged,
            cancelled,
            final_max_angle,
            warnings,
            diagnostics: run_diagnostics,
        })
    }

    fn initial_loadings<B: BackendEigh>(
        &self,
        covariances: &[GroupCovariance],
        backend: &B,
    ) -> Result<Array2<f64>, CpcError> {
        let p = covariances[0].num_variables();
        match self.config.initialization {
            Initialization::Identity => Ok(Array2::eye(p)),
            Initialization::PooledEigenvectors => {
                let pooled = pooled_covariance(covariances)?;
                let eig = sorted_eigh_descending(backend, &pooled).map_err(|e| {
                    CpcError::Backend(format!("Eigendecomposition of pooled covariance failed: {}", e))
                })?;
                debug!("Pooled covariance eigenvalues (descending): {:?}", eig.eigenvalues.to_vec());
                Ok(eig.eigenvectors)
            }
        }
    }
}

/// Solves with the default configuration and the given sweep budget.
pub fn solve(covariances: &[GroupCovariance], max_iterations: usize) -> Result<CpcSolution, CpcError> {
    CpcEngine::new(CpcConfig::with_max_iterations(max_iterations)).solve(covariances)
}

/// Weighted average Σ_m w_m·Σ_m / Σ_m w_m.
pub fn pooled_covariance(covariances: &[GroupCovariance]) -> Result<Array2<f64>, CpcError> {
    let p = validate_covariances(covariances)?;
    let total_weight: f64 = covariances.iter().map(|c| c.weight).sum();
    let mut pooled = Array2::<f64>::zeros((p, p));
    for cov in covariances {
        pooled.scaled_add(cov.weight / total_weight, &cov.matrix);
    }
    Ok(pooled)
}

fn project_covariances(
    covariances: &[GroupCovariance],
    loadings: &Array2<f64>,
    use_parallel: bool,
) -> Vec<Array2<f64>> {
    let project = |cov: &GroupCovariance| loadings.t().dot(&cov.matrix).dot(loadings);
    if use_parallel {
        covariances.par_iter().map(project).collect()
    } else {
        covariances.iter().map(project).collect()
    }
}

/// Replaces W by the Q factor of its QR decomposition, with Q's column signs aligned
/// to W so that no component is flipped.
fn reorthonormalize<B: BackendQR>(loadings: &mut Array2<f64>, backend: &B) -> Result<(), CpcError> {
    let mut q_factor = backend
        .qr_q_factor(loadings)
        .map_err(|e| CpcError::Backend(format!("QR re-orthonormalization failed: {}", e)))?;
    if q_factor.dim() != loadings.dim() {
        return Err(CpcError::Backend(format!(
            "QR re-orthonormalization returned a {:?} factor for a {:?} matrix.",
            q_factor.dim(),
            loadings.dim()
        )));
    }
    for k in 0..q_factor.ncols() {
        if q_factor.column(k).dot(&loadings.column(k)) < 0.0 {
            q_factor.column_mut(k).mapv_inplace(|x| -x);
        }
    }
    *loadings = q_factor;
    Ok(())
}

fn weighted_leakage(rotated: &[Array2<f64>], weights: &[f64]) -> f64 {
    rotated
        .iter()
        .zip(weights)
        .map(|(s, &w)| w * off_diagonal_sum_of_squares(&s.view()))
        .sum()
}

fn near_zero_variance_warnings(covariances: &[GroupCovariance]) -> Vec<CpcWarning> {
    let mut warnings = Vec::new();
    for (group, cov) in covariances.iter().enumerate() {
        let threshold = NEAR_ZERO_VARIANCE_RATIO * cov.trace();
        for (axis, &variance) in cov.matrix.diag().iter().enumerate() {
            if variance <= threshold {
                warnings.push(CpcWarning::NearZeroVariance { group, axis, variance });
            }
        }
    }
    warnings
}

// --- Variance decomposition ---

/// Per-group variances along the common components and their share of each
/// group's total variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceDecomposition {
    /// Λ, shape (M, P): `group_variances[[m, k]] = w_kᵀ Σ_m w_k`.
    pub group_variances: Array2<f64>,
    /// Shape (M, P): `100 · Λ[m][k] / trace(Σ_m)`; 0 for groups with zero total variance.
    pub explained_variance_percent: Array2<f64>,
}

impl VarianceDecomposition {
    pub fn num_groups(&self) -> usize {
        self.group_variances.nrows()
    }

    pub fn num_components(&self) -> usize {
        self.group_variances.ncols()
    }
}

/// Computes the diagonal of WᵀΣ_mW for every group, and the matching
/// explained-variance percentages.
///
/// # Errors
/// `CpcError::InvalidInput` when W is not square or a covariance matrix does not
/// match W's shape.
pub fn decompose(
    loadings: &Array2<f64>,
    covariances: &[GroupCovariance],
) -> Result<VarianceDecomposition, CpcError> {
    let (p, k) = loadings.dim();
    if p != k {
        return invalid(format!("Loading matrix must be square, got {}x{}.", p, k));
    }
    let num_groups = covariances.len();
    let mut group_variances = Array2::<f64>::zeros((num_groups, p));
    let mut explained_variance_percent = Array2::<f64>::zeros((num_groups, p));

    for (m, cov) in covariances.iter().enumerate() {
        if cov.matrix.dim() != (p, p) {
            return invalid(format!(
                "Covariance matrix of group {} has shape {:?}, expected ({}, {}).",
                m,
                cov.matrix.dim(),
                p,
                p
            ));
        }
        let sigma_w = cov.matrix.dot(loadings);
        let total_variance = cov.trace();
        for axis in 0..p {
            let variance = loadings.column(axis).dot(&sigma_w.column(axis));
            group_variances[[m, axis]] = variance;
            explained_variance_percent[[m, axis]] = if total_variance != 0.0 {
                100.0 * variance / total_variance
            } else {
                0.0
            };
        }
    }

    Ok(VarianceDecomposition {
        group_variances,
        explained_variance_percent,
    })
}
