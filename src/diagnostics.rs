// src/diagnostics.rs

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Diagnostics for a single rotation sweep of the CPC engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepDiagnostics {
    pub sweep_num: usize,                       // 1-based
    pub max_abs_angle: f64,                     // Largest |theta| applied in this sweep (radians)
    pub rotated_pairs: usize,                   // Pairs that received a non-zero rotation
    pub skipped_degenerate_pairs: usize,        // Pairs skipped because the angle solve was degenerate

    // --- Orthogonality of W after the sweep (and after correction, if one ran) ---
    pub orthogonality_error: Option<f64>,       // ||I - W^T W||_F
    pub reorthonormalized: bool,

    // Weighted sum over groups of squared off-diagonal entries of W^T S_m W.
    pub weighted_off_diagonal_leakage: f64,
}

/// Summary of a full CPC solve, built from the per-sweep records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpcRunDiagnostics {
    pub sweeps: Vec<SweepDiagnostics>,
    pub total_runtime_seconds: Option<f64>,
}

impl CpcRunDiagnostics {
    /// Leakage after the last recorded sweep, if any sweep was recorded.
    pub fn final_leakage(&self) -> Option<f64> {
        self.sweeps.last().map(|s| s.weighted_off_diagonal_leakage)
    }

    /// Whether the off-diagonal leakage never increased from one sweep to the next
    /// (up to `slack`).
    pub fn leakage_is_non_increasing(&self, slack: f64) -> bool {
        self.sweeps
            .windows(2)
            .all(|w| w[1].weighted_off_diagonal_leakage <= w[0].weighted_off_diagonal_leakage + slack)
    }
}

// --- Utility Functions for Metrics ---

/// Computes Frobenius norm for an f64 matrix.
pub fn compute_frob_norm_f64(matrix: &ArrayView2<f64>) -> f64 {
    if matrix.is_empty() {
        return 0.0;
    }
    matrix.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

/// Computes orthogonality error ||I - Q^T Q||_F for an f64 matrix.
pub fn compute_orthogonality_error_f64(q_matrix: &ArrayView2<f64>) -> Option<f64> {
    if q_matrix.nrows() == 0 || q_matrix.ncols() == 0 {
        return None;
    }
    let qtq = q_matrix.t().dot(q_matrix);
    let identity = Array2::<f64>::eye(qtq.nrows());
    let diff = identity - qtq;

    Some(compute_frob_norm_f64(&diff.view()))
}

/// Sum of squared off-diagonal entries of a square matrix.
pub fn off_diagonal_sum_of_squares(matrix: &ArrayView2<f64>) -> f64 {
    let mut total = 0.0;
    for ((row, col), &value) in matrix.indexed_iter() {
        if row != col {
            total += value * value;
        }
    }
    total
}
