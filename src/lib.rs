// Common principal components (CPC)

#![doc = include_str!("../README.md")]

pub mod cpc;
pub mod diagnostics;
pub mod groups;
pub mod linalg_backends;
pub mod model;

pub use cpc::{
    decompose, solve, CpcConfig, CpcEngine, CpcError, CpcSolution, CpcWarning, GroupCovariance,
    Initialization, VarianceDecomposition,
};
pub use groups::{group_covariances, CovarianceOptions, GroupWeighting, LabeledCovariance};
pub use model::CPC;
