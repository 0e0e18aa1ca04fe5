use common_pca::{solve, GroupCovariance};
use ndarray::array;

fn main() {
    // Two correlated groups whose principal axes nearly coincide
    let groups = vec![
        GroupCovariance::new(array![[2.0, 0.3], [0.3, 1.0]], 40.0),
        GroupCovariance::new(array![[1.0, 0.2], [0.2, 3.0]], 25.0),
    ];

    let solution = solve(&groups, 15).expect("CPC solve failed");
    let decomposition = solution.decompose(&groups).expect("variance decomposition failed");

    println!("Common principal components for {} groups:", groups.len());
    println!("Converged: {} after {} sweep(s)", solution.converged, solution.sweeps_performed);
    println!("Loadings:\n{:.4}", solution.loadings);
    println!("Group variances:\n{:.4}", decomposition.group_variances);
    println!("Explained variance (%):\n{:.2}", decomposition.explained_variance_percent);
    for warning in &solution.warnings {
        println!("warning: {}", warning);
    }
}
