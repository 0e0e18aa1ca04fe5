// In tests/cpc_properties_tests.rs

use common_pca::{decompose, solve, CpcConfig, CpcEngine, CpcWarning, GroupCovariance, Initialization};
use ndarray::{array, Array1, Array2, ArrayView2};
use ndarray_linalg::{Eigh, QR, UPLO};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const ORTHOGONALITY_TOLERANCE: f64 = 1e-8;

fn random_orthogonal(p: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
    let a = Array2::from_shape_fn((p, p), |_| rng.gen_range(-1.0..1.0));
    let (q, _r) = a.qr().expect("QR of random matrix failed");
    q
}

fn random_spd(p: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
    let a = Array2::random_using((p, p + 2), Uniform::new(-1.0, 1.0), rng);
    let mut spd = a.dot(&a.t());
    for i in 0..p {
        for j in (i + 1)..p {
            let avg = 0.5 * (spd[[i, j]] + spd[[j, i]]);
            spd[[i, j]] = avg;
            spd[[j, i]] = avg;
        }
    }
    spd
}

/// Σ_m = Q diag(λ_m) Qᵀ for every group, so Q is an exact common basis.
fn common_basis_groups(
    q: &Array2<f64>,
    spectra: &[Vec<f64>],
    weights: &[f64],
) -> Vec<GroupCovariance> {
    spectra
        .iter()
        .zip(weights)
        .map(|(lambda, &w)| {
            let diag = Array2::from_diag(&Array1::from(lambda.clone()));
            let mut sigma = q.dot(&diag).dot(&q.t());
            for i in 0..sigma.nrows() {
                for j in (i + 1)..sigma.ncols() {
                    let avg = 0.5 * (sigma[[i, j]] + sigma[[j, i]]);
                    sigma[[i, j]] = avg;
                    sigma[[j, i]] = avg;
                }
            }
            GroupCovariance::new(sigma, w)
        })
        .collect()
}

fn orthogonality_error(w: &Array2<f64>) -> f64 {
    let diff = w.t().dot(w) - Array2::<f64>::eye(w.ncols());
    diff.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Matches every column of `expected` to a distinct column of `actual` up to sign.
/// Returns `mapping[k]` = column of `actual` matched to expected column k.
fn match_columns_up_to_sign_and_permutation(
    actual: ArrayView2<f64>,
    expected: ArrayView2<f64>,
    tolerance: f64,
    context: &str,
) -> Vec<usize> {
    assert_eq!(actual.dim(), expected.dim(), "Dimension mismatch for {}", context);
    let mut used = vec![false; actual.ncols()];
    let mut mapping = Vec::with_capacity(expected.ncols());
    for k in 0..expected.ncols() {
        let (best_col, best_dot) = (0..actual.ncols())
            .filter(|&c| !used[c])
            .map(|c| (c, actual.column(c).dot(&expected.column(k)).abs()))
            .fold((usize::MAX, -1.0), |acc, cand| if cand.1 > acc.1 { cand } else { acc });
        assert!(
            best_col != usize::MAX && (1.0 - best_dot).abs() < tolerance,
            "{}: expected column {} has no match (best |dot| = {})",
            context,
            k,
            best_dot
        );
        used[best_col] = true;
        mapping.push(best_col);
    }
    mapping
}

#[test]
fn test_orthogonality_for_random_inputs() {
    let mut rng = ChaCha8Rng::seed_from_u64(2025);
    for &(p, m) in &[(2, 1), (3, 2), (5, 4), (8, 3), (10, 6)] {
        let groups: Vec<GroupCovariance> = (0..m)
            .map(|_| GroupCovariance::new(random_spd(p, &mut rng), rng.gen_range(1.0..50.0)))
            .collect();
        let solution = solve(&groups, 15).unwrap();
        let err = orthogonality_error(&solution.loadings);
        assert!(err < ORTHOGONALITY_TOLERANCE, "P={}, M={}: ||WᵀW - I|| = {}", p, m, err);
    }
}

#[test]
fn test_variance_conservation() {
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let groups: Vec<GroupCovariance> =
        (0..5).map(|_| GroupCovariance::new(random_spd(6, &mut rng), 1.0)).collect();
    let solution = solve(&groups, 15).unwrap();
    let decomposition = decompose(&solution.loadings, &groups).unwrap();
    for (m, group) in groups.iter().enumerate() {
        let rotated_trace: f64 = decomposition.group_variances.row(m).sum();
        let trace = group.trace();
        assert!(
            (rotated_trace - trace).abs() < 1e-9 * trace.max(1.0),
            "group {}: trace(WᵀΣW) = {} vs trace(Σ) = {}",
            m,
            rotated_trace,
            trace
        );
    }
}

#[test]
fn test_single_group_reduces_to_eigendecomposition() {
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    for &p in &[2, 4, 6] {
        let sigma = random_spd(p, &mut rng);
        let groups = vec![GroupCovariance::new(sigma.clone(), 10.0)];
        let solution = solve(&groups, 15).unwrap();
        assert!(solution.converged, "P={}: single-group solve did not converge", p);

        let (eigenvalues, eigenvectors) = sigma.eigh(UPLO::Upper).unwrap();
        let mapping = match_columns_up_to_sign_and_permutation(
            solution.loadings.view(),
            eigenvectors.view(),
            1e-8,
            "single group eigenvectors",
        );
        let decomposition = solution.decompose(&groups).unwrap();
        for (k, &col) in mapping.iter().enumerate() {
            let lambda = decomposition.group_variances[[0, col]];
            assert!(
                (lambda - eigenvalues[k]).abs() < 1e-9 * eigenvalues[k].abs().max(1.0),
                "P={}: variance {} does not match eigenvalue {}",
                p,
                lambda,
                eigenvalues[k]
            );
        }
    }
}

#[test]
fn test_exact_common_basis_recovery_diagonal() {
    let groups = vec![
        GroupCovariance::new(array![[2.0, 0.0], [0.0, 1.0]], 1.0),
        GroupCovariance::new(array![[1.0, 0.0], [0.0, 3.0]], 1.0),
    ];
    let solution = solve(&groups, 15).unwrap();
    assert!(solution.converged);
    let mapping = match_columns_up_to_sign_and_permutation(
        solution.loadings.view(),
        Array2::<f64>::eye(2).view(),
        1e-12,
        "diagonal groups",
    );
    let decomposition = solution.decompose(&groups).unwrap();
    let expected = [[2.0, 1.0], [1.0, 3.0]];
    for m in 0..2 {
        for k in 0..2 {
            let got = decomposition.group_variances[[m, mapping[k]]];
            assert!((got - expected[m][k]).abs() < 1e-12, "Λ_{}[{}] = {}", m, k, got);
        }
    }
}

#[test]
fn test_exact_common_basis_recovery_rotated() {
    let mut rng = ChaCha8Rng::seed_from_u64(31);
    let p = 5;
    let q = random_orthogonal(p, &mut rng);
    let spectra: Vec<Vec<f64>> = (0..3)
        .map(|_| (0..p).map(|_| rng.gen_range(0.5..10.0)).collect())
        .collect();
    let groups = common_basis_groups(&q, &spectra, &[30.0, 20.0, 50.0]);

    for init in [Initialization::Identity, Initialization::PooledEigenvectors] {
        let config = CpcConfig {
            max_iterations: 100,
            initialization: init,
            ..CpcConfig::default()
        };
        let solution = CpcEngine::new(config).solve(&groups).unwrap();
        assert!(solution.converged, "{:?}: did not converge", init);
        let mapping = match_columns_up_to_sign_and_permutation(
            solution.loadings.view(),
            q.view(),
            1e-8,
            "rotated common basis",
        );
        let decomposition = solution.decompose(&groups).unwrap();
        for (m, lambda) in spectra.iter().enumerate() {
            for k in 0..p {
                let got = decomposition.group_variances[[m, mapping[k]]];
                assert!(
                    (got - lambda[k]).abs() < 1e-7,
                    "{:?}: Λ_{}[{}] = {}, expected {}",
                    init,
                    m,
                    k,
                    got,
                    lambda[k]
                );
            }
        }
    }
}

#[test]
fn test_shared_tied_eigenvalues_converge_within_default_budget() {
    let mut rng = ChaCha8Rng::seed_from_u64(404);
    for trial in 0..30 {
        let p = 3 + trial % 6;
        let q = random_orthogonal(p, &mut rng);
        // Both groups share a tie on Q's first two columns; the rest are distinct.
        let spectra: Vec<Vec<f64>> = [4.0, 2.0]
            .iter()
            .map(|&tied| {
                let mut lambda = vec![tied, tied];
                lambda.extend((2..p).map(|k| 5.0 + 1.5 * k as f64 + rng.gen_range(0.0..1.0)));
                lambda
            })
            .collect();
        let groups = common_basis_groups(&q, &spectra, &[30.0, 20.0]);

        let solution = solve(&groups, 15).unwrap();
        assert!(
            solution.converged,
            "trial {} (P={}): not converged, last max angle {:e}",
            trial,
            p,
            solution.final_max_angle
        );
        assert!(solution
            .warnings
            .iter()
            .any(|w| matches!(w, CpcWarning::NumericDegeneracy { .. })));

        let w = &solution.loadings;
        let mut matched = vec![false; p];
        for k in 2..p {
            let (best_col, best_dot) = (0..p)
                .map(|c| (c, w.column(c).dot(&q.column(k)).abs()))
                .fold((0, -1.0), |acc, cand| if cand.1 > acc.1 { cand } else { acc });
            assert!(
                (1.0 - best_dot).abs() < 1e-8,
                "trial {} (P={}): column {} of the common basis not recovered (|dot| = {})",
                trial,
                p,
                k,
                best_dot
            );
            matched[best_col] = true;
        }
        // The two remaining loadings span the tied plane.
        for c in (0..p).filter(|&c| !matched[c]) {
            let in_plane = w.column(c).dot(&q.column(0)).powi(2) + w.column(c).dot(&q.column(1)).powi(2);
            assert!((in_plane - 1.0).abs() < 1e-8, "trial {}: loading {} leaves the tied plane", trial, c);
        }
    }
}

#[test]
fn test_group_relabeling_does_not_change_loadings() {
    let mut rng = ChaCha8Rng::seed_from_u64(77);
    let groups: Vec<GroupCovariance> = (0..4)
        .map(|_| GroupCovariance::new(random_spd(4, &mut rng), rng.gen_range(1.0..20.0)))
        .collect();
    let mut permuted = groups.clone();
    permuted.reverse();
    permuted.swap(0, 1);

    let original = solve(&groups, 15).unwrap();
    let relabeled = solve(&permuted, 15).unwrap();
    for k in 0..4 {
        let dot = original.loadings.column(k).dot(&relabeled.loadings.column(k));
        assert!((dot.abs() - 1.0).abs() < 1e-8, "column {} differs: |dot| = {}", k, dot.abs());
    }
}

#[test]
fn test_explained_variance_bounds() {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let groups: Vec<GroupCovariance> =
        (0..3).map(|_| GroupCovariance::new(random_spd(5, &mut rng), 1.0)).collect();
    let solution = solve(&groups, 15).unwrap();
    let decomposition = solution.decompose(&groups).unwrap();
    for m in 0..groups.len() {
        let row = decomposition.explained_variance_percent.row(m);
        for &pct in row.iter() {
            assert!(pct >= -1e-9 && pct <= 100.0 + 1e-9, "percentage {} out of bounds", pct);
        }
        assert!((row.sum() - 100.0).abs() < 1e-9, "percentages sum to {}", row.sum());
    }
}

#[test]
fn test_non_convergence_is_flagged() {
    let base = array![[2.0, 0.5], [0.5, 1.0]];
    let mut nearly_same = base.clone();
    nearly_same[[0, 0]] += 1e-9;
    let groups = vec![GroupCovariance::new(base, 1.0), GroupCovariance::new(nearly_same, 1.0)];

    let solution = solve(&groups, 1).unwrap();
    assert!(!solution.converged);
    assert_eq!(solution.sweeps_performed, 1);
    assert!(solution.has_non_convergence());
    assert!(solution
        .warnings
        .iter()
        .any(|w| matches!(w, CpcWarning::NonConvergence { sweeps: 1, .. })));
    assert!(orthogonality_error(&solution.loadings) < ORTHOGONALITY_TOLERANCE);

    // With the default budget the same input converges.
    let solution = solve(&groups, 15).unwrap();
    assert!(solution.converged);
    assert!(!solution.has_non_convergence());
}

#[test]
fn test_inputs_are_not_mutated() {
    let mut rng = ChaCha8Rng::seed_from_u64(8);
    let groups: Vec<GroupCovariance> =
        (0..3).map(|_| GroupCovariance::new(random_spd(4, &mut rng), 2.0)).collect();
    let snapshot = groups.clone();
    let _ = solve(&groups, 15).unwrap();
    assert_eq!(groups, snapshot);
}

#[test]
fn test_concurrent_independent_solves() {
    let mut rng = ChaCha8Rng::seed_from_u64(123);
    let inputs: Vec<Vec<GroupCovariance>> = (0..4)
        .map(|_| (0..3).map(|_| GroupCovariance::new(random_spd(4, &mut rng), 1.0)).collect())
        .collect();
    let sequential: Vec<Array2<f64>> = inputs.iter().map(|g| solve(g, 15).unwrap().loadings).collect();

    let handles: Vec<_> = inputs
        .into_iter()
        .map(|groups| std::thread::spawn(move || solve(&groups, 15).unwrap().loadings))
        .collect();
    for (handle, expected) in handles.into_iter().zip(sequential) {
        let got = handle.join().expect("solver thread panicked");
        assert_eq!(got, expected);
    }
}
