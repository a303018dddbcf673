//! Back-estimation of sum-contrast levels omitted from the fit.
//!
//! A sum-contrast encoding of a categorical factor with an intercept never
//! estimates the last level directly: its indicator is the negative sum of
//! all the others. The omitted level's coefficients are recovered after
//! the fit by applying the contrast `[0, -1, ..., -1]` to the estimated
//! rows (or columns), and their sampling variance follows from the same
//! contrast applied to the Kronecker-structured covariance of `B`.
use ndarray::{Array2, s};
use ndarray_linalg::Inverse;
use rand::rngs::StdRng;

use crate::ModelError;
use crate::data::ScreenData;
use crate::fit::{FitOptions, Mlm, mlm, scale_rows};
use crate::kron::{kron_diag, quad_diag};
use crate::perm::{PermPvals, perm_pvals};

/// Reconstructs the omitted sum-contrast level on the X and/or Z side of a
/// fitted model. Pure: returns a new result whose coefficient and variance
/// matrices carry one extra trailing row and/or column; the input is never
/// mutated, so permutation trials can share nothing.
pub fn backest_sum(fit: &Mlm, x_side: bool, z_side: bool) -> Result<Mlm, ModelError> {
    if x_side && !fit.data.design().x_intercept {
        return Err(ModelError::MissingIntercept("X"));
    }
    if z_side && !fit.data.design().z_intercept {
        return Err(ModelError::MissingIntercept("Z"));
    }
    if !x_side && !z_side {
        return Ok(fit.clone());
    }
    // The contrast algebra below assumes an unaugmented coefficient block.
    if fit.x_augmented {
        return Err(ModelError::AlreadyAugmented("X"));
    }
    if fit.z_augmented {
        return Err(ModelError::AlreadyAugmented("Z"));
    }

    let x = fit.data.x();
    let zw = match &fit.weights {
        Some(w) => scale_rows(fit.data.z(), w),
        None => fit.data.z().clone(),
    };

    // varLeft = (X'X)^-1; varRight = (Z'Z)^-1 Z' sigma Z (Z'Z)^-1, the
    // column-side stand-in for the sampling covariance.
    let var_left = x
        .t()
        .dot(x)
        .inv()
        .map_err(|e| ModelError::LinAlg(format!("X'X is not invertible: {e}")))?;
    let ztz_inv = zw
        .t()
        .dot(&zw)
        .inv()
        .map_err(|e| ModelError::LinAlg(format!("Z'Z is not invertible: {e}")))?;
    let var_right = ztz_inv.dot(&zw.t()).dot(&fit.sigma).dot(&zw).dot(&ztz_inv);

    let p = fit.b.nrows();
    let q = fit.b.ncols();
    let c = contrast(p);
    let d = contrast(q);
    let c_quad = Array2::from_elem((1, 1), quad_diag(&c, &var_left)[0]);
    let d_quad = Array2::from_elem((1, 1), quad_diag(&d, &var_right)[0]);

    let mut b = Array2::zeros((p + usize::from(x_side), q + usize::from(z_side)));
    let mut var_b = Array2::zeros(b.dim());
    b.slice_mut(s![..p, ..q]).assign(&fit.b);
    var_b.slice_mut(s![..p, ..q]).assign(&fit.var_b);

    if x_side {
        let new_row = c.dot(&fit.b);
        let new_var = kron_diag(&c_quad, &var_right);
        b.slice_mut(s![p, ..q]).assign(&new_row.row(0));
        var_b.slice_mut(s![p, ..q]).assign(&new_var.row(0));
    }
    if z_side {
        let new_col = fit.b.dot(&d.t());
        let new_var = kron_diag(&var_left, &d_quad);
        b.slice_mut(s![..p, q]).assign(&new_col.column(0));
        var_b.slice_mut(s![..p, q]).assign(&new_var.column(0));
    }
    if x_side && z_side {
        b[[p, q]] = c.dot(&fit.b).dot(&d.t())[[0, 0]];
        var_b[[p, q]] = kron_diag(&c_quad, &d_quad)[[0, 0]];
    }

    Ok(Mlm {
        b,
        var_b,
        sigma: fit.sigma.clone(),
        data: fit.data.clone(),
        weights: fit.weights.clone(),
        x_augmented: x_side,
        z_augmented: z_side,
    })
}

/// Fits the model with the caller's options, then reconstructs the omitted
/// sum-contrast levels. Returns the augmented fit.
pub fn mlm_backest_sum(
    data: &ScreenData,
    opts: &FitOptions,
    x_side: bool,
    z_side: bool,
) -> Result<Mlm, ModelError> {
    let fit = mlm(data, opts)?;
    backest_sum(&fit, x_side, z_side)
}

/// Empirical p-values for the back-estimated t-statistics under response
/// reshuffling: each trial refits the permuted data, back-estimates, and
/// recomputes `t_stat(is_main_eff)`.
#[allow(clippy::too_many_arguments)]
pub fn mlm_backest_sum_perms<P>(
    data: &ScreenData,
    opts: &FitOptions,
    x_side: bool,
    z_side: bool,
    is_main_eff: bool,
    n_perms: usize,
    perm_fn: P,
    seed: u64,
) -> Result<PermPvals, ModelError>
where
    P: Fn(&ScreenData, &mut StdRng) -> ScreenData + Sync,
{
    perm_pvals(
        |d: &ScreenData| Ok(mlm_backest_sum(d, opts, x_side, z_side)?.t_stat(is_main_eff)),
        data,
        n_perms,
        perm_fn,
        seed,
    )
}

/// The omitted-level contrast `[0, -1, ..., -1]` as a 1 x len row: zero at
/// the intercept position, minus one for every sum-contrast column.
fn contrast(len: usize) -> Array2<f64> {
    Array2::from_shape_fn((1, len), |(_, j)| if j == 0 { 0.0 } else { -1.0 })
}
