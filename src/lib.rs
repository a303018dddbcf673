//! # screenlm
//!
//! Statistical inference for matrix linear models (MLMs) fitted to
//! high-throughput genetic-screen plate data.
//!
//! A screen measures a response (typically colony size) over a grid of
//! experimental conditions (response rows) and mutant clones (response
//! columns). The bilinear model `Y = X B Z' + E` relates the response to
//! row-side predictors `X` and column-side predictors `Z`. This crate
//! provides:
//!
//! - [`fit::mlm`]: the least-squares fit, with optional per-column response
//!   weights and shrinkage estimation of the error covariance;
//! - [`backest::backest_sum`]: reconstruction of the sum-contrast level that
//!   an over-parameterized encoding omits, with its sampling variance
//!   propagated through the Kronecker-structured covariance of `B`;
//! - [`perm::perm_pvals`]: empirical p-values for any derived statistic
//!   under row/column reshuffling of the response;
//! - [`sscore::s_score`]: Collins-style interaction scores with a
//!   variance floor driven by nonparametric mean-variance smoothing.
//!
//! Categorical-to-contrast encoding and file ingestion are out of scope:
//! callers hand the crate ready-made numeric matrices.

pub mod backest;
pub mod data;
pub mod fit;
pub mod kron;
pub mod perm;
pub mod smooth;
pub mod sscore;

pub use backest::{backest_sum, mlm_backest_sum, mlm_backest_sum_perms};
pub use data::{Design, ScreenData, median_iqr_standardize};
pub use fit::{DesignSide, Diagnostic, FitOptions, Mlm, ShrinkageTarget, mlm, mlm_with};
pub use kron::{kron_diag, quad_diag};
pub use perm::{PermPvals, perm_pvals, shuffle_cols, shuffle_rows};
pub use smooth::LocalLinear;
pub use sscore::{s_score, s_score_perms};

use thiserror::Error;

/// Errors raised by the fitting, back-estimation, permutation, and scoring
/// routines. Calls either fully succeed with a result of the documented
/// shape or fail with one of these; no partial state is produced.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("linear algebra error: {0}")]
    LinAlg(String),
    #[error("dimension mismatch: {0}")]
    Dimensions(String),
    #[error("invalid weights: {0}")]
    Weights(String),
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
    #[error("back-estimation of the {0} side requires a {0} intercept")]
    MissingIntercept(&'static str),
    #[error("the {0} side already carries a back-estimated level")]
    AlreadyAugmented(&'static str),
    #[error("design is not a treatment-contrast indicator: {0}")]
    NotIndicator(String),
    #[error("condition {condition} x clone {clone} has no measured replicates")]
    EmptyCell { condition: usize, clone: usize },
    #[error("degenerate data: {0}")]
    Degenerate(String),
}
