//! Least-squares fitting of matrix linear models.
//!
//! The bilinear model `Y = X B Z' + E` is solved in closed form:
//! `B = (X'X)^-1 X' Y Z (Z'Z)^-1`. The error covariance across response
//! columns is estimated from the residuals, optionally shrunk toward one of
//! four structured targets, and propagated into per-cell sampling variances
//! of `B` through the Kronecker structure
//! `Var(vec B) = varRight (x) varLeft`.
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use ndarray_linalg::Inverse;
use serde::{Deserialize, Serialize};

use crate::ModelError;
use crate::data::{Design, ScreenData};
use crate::kron::kron_diag;

/// Structured targets for linear shrinkage of the error covariance,
/// `sigma = lambda * T + (1 - lambda) * S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShrinkageTarget {
    /// `T = I`.
    Identity,
    /// `T = nu * I` with `nu` the mean sample variance.
    ConstantDiagonal,
    /// Common variance on the diagonal, common covariance elsewhere.
    CommonDiagOffDiag,
    /// `T = diag(S)`: only off-diagonal entries are shrunk.
    UnequalDiagonal,
}

/// Options for [`mlm`].
#[derive(Debug, Clone)]
pub struct FitOptions {
    /// Fit with an intercept on the X side (added or removed as needed).
    pub x_intercept: bool,
    /// Fit with an intercept on the Z side.
    pub z_intercept: bool,
    /// Optional nonnegative weight per response column.
    pub weights: Option<Array1<f64>>,
    /// Shrinkage target for the error covariance; `None` uses the plain
    /// residual covariance with `n - p` degrees of freedom.
    pub target: Option<ShrinkageTarget>,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            x_intercept: true,
            z_intercept: true,
            weights: None,
            target: None,
        }
    }
}

/// Which side of the bilinear design an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesignSide {
    X,
    Z,
}

/// Structured notice emitted when a design is adjusted to match the model.
/// Purely informational; correctness never depends on observing these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    InterceptAdded(DesignSide),
    InterceptRemoved(DesignSide),
}

/// A fitted matrix linear model.
///
/// `b` rows index X predictors and columns index Z predictors; `var_b` has
/// the same shape and holds the per-cell sampling variance. `sigma` is the
/// error covariance across response columns (of the weight-scaled model
/// when weights were supplied). The stored data carries the
/// intercept-reconciled design actually used by the solve. After
/// back-estimation the trailing row/column of `b` and `var_b` is the
/// reconstructed sum-contrast level, recorded by the `*_augmented` flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mlm {
    pub b: Array2<f64>,
    pub var_b: Array2<f64>,
    pub sigma: Array2<f64>,
    pub data: ScreenData,
    pub weights: Option<Array1<f64>>,
    pub x_augmented: bool,
    pub z_augmented: bool,
}

/// Fits the matrix linear model. See [`mlm_with`] for the variant that
/// reports design adjustments to a caller-supplied sink.
pub fn mlm(data: &ScreenData, opts: &FitOptions) -> Result<Mlm, ModelError> {
    mlm_with(data, opts, &mut |_| {})
}

/// Fits the matrix linear model, emitting a [`Diagnostic`] for every
/// intercept column added to or removed from the supplied design.
pub fn mlm_with(
    data: &ScreenData,
    opts: &FitOptions,
    sink: &mut dyn FnMut(Diagnostic),
) -> Result<Mlm, ModelError> {
    // 1. Reconcile the requested intercepts against the supplied design.
    let x = reconcile_intercept(
        data.x(),
        data.design().x_intercept,
        opts.x_intercept,
        DesignSide::X,
        sink,
    );
    let z = reconcile_intercept(
        data.z(),
        data.design().z_intercept,
        opts.z_intercept,
        DesignSide::Z,
        sink,
    );

    // 2. Per-column response weights scale Y columns and Z rows by sqrt(w).
    let (yw, zw) = match &opts.weights {
        Some(w) => {
            validate_weights(w, data.y().ncols())?;
            (scale_cols(data.y(), w), scale_rows(&z, w))
        }
        None => (data.y().clone(), z.clone()),
    };

    let n = x.nrows();
    let p = x.ncols();
    if opts.target.is_none() && n <= p {
        return Err(ModelError::Degenerate(format!(
            "{n} response rows leave no residual degrees of freedom for {p} X predictors"
        )));
    }

    // 3. Closed-form solve of B = (X'X)^-1 X' Y Z (Z'Z)^-1.
    let xtx_inv = x
        .t()
        .dot(&x)
        .inv()
        .map_err(|e| ModelError::LinAlg(format!("X'X is not invertible: {e}")))?;
    let ztz_inv = zw
        .t()
        .dot(&zw)
        .inv()
        .map_err(|e| ModelError::LinAlg(format!("Z'Z is not invertible: {e}")))?;
    let b = xtx_inv.dot(&x.t()).dot(&yw).dot(&zw).dot(&ztz_inv);

    // 4. Error covariance from the residuals of the (scaled) model.
    let resid = &yw - &x.dot(&b).dot(&zw.t());
    let sigma = estimate_sigma(&resid, p, opts.target)?;

    // 5. Per-cell sampling variance through the Kronecker structure:
    //    varLeft = (X'X)^-1, varRight = (Z'Z)^-1 Z' sigma Z (Z'Z)^-1.
    let var_right = ztz_inv.dot(&zw.t()).dot(&sigma).dot(&zw).dot(&ztz_inv);
    let var_b = kron_diag(&xtx_inv, &var_right);

    log::debug!(
        "fitted a {} x {} coefficient matrix from a {} x {} response",
        b.nrows(),
        b.ncols(),
        n,
        data.y().ncols()
    );

    let design = Design::new(x, z, opts.x_intercept, opts.z_intercept)?;
    let stored = ScreenData::new(data.y().clone(), design)?;
    Ok(Mlm {
        b,
        var_b,
        sigma,
        data: stored,
        weights: opts.weights.clone(),
        x_augmented: false,
        z_augmented: false,
    })
}

impl Mlm {
    /// Cell-wise t-statistics `b / sqrt(var_b)`. With `is_main_eff = false`
    /// the intercept row and column (when present) are dropped, leaving
    /// interaction effects only; back-estimated levels are always kept.
    pub fn t_stat(&self, is_main_eff: bool) -> Array2<f64> {
        let sd = self.var_b.mapv(f64::sqrt);
        let t = &self.b / &sd;
        if is_main_eff {
            return t;
        }
        let r0 = usize::from(self.data.design().x_intercept);
        let c0 = usize::from(self.data.design().z_intercept);
        t.slice(s![r0.., c0..]).to_owned()
    }

    /// The coefficient matrix. `drop_x_level` / `drop_z_level` drop the
    /// trailing back-estimated row/column, returning only the directly
    /// estimated coefficients; a no-op on sides never augmented.
    pub fn coef(&self, drop_x_level: bool, drop_z_level: bool) -> Array2<f64> {
        let rows = self.b.nrows() - usize::from(drop_x_level && self.x_augmented);
        let cols = self.b.ncols() - usize::from(drop_z_level && self.z_augmented);
        self.b.slice(s![..rows, ..cols]).to_owned()
    }

    /// Directly estimated coefficient block, back-estimated levels dropped.
    fn estimated_b(&self) -> ArrayView2<'_, f64> {
        let rows = self.b.nrows() - usize::from(self.x_augmented);
        let cols = self.b.ncols() - usize::from(self.z_augmented);
        self.b.slice(s![..rows, ..cols])
    }

    /// Predicted response `X_new B Z_new'` for a new design, reconciling
    /// its intercept presence with the fitted model's.
    pub fn predict(&self, new_design: &Design) -> Result<Array2<f64>, ModelError> {
        self.predict_with(new_design, &mut |_| {})
    }

    pub fn predict_with(
        &self,
        new_design: &Design,
        sink: &mut dyn FnMut(Diagnostic),
    ) -> Result<Array2<f64>, ModelError> {
        let x = reconcile_intercept(
            &new_design.x,
            new_design.x_intercept,
            self.data.design().x_intercept,
            DesignSide::X,
            sink,
        );
        let z = reconcile_intercept(
            &new_design.z,
            new_design.z_intercept,
            self.data.design().z_intercept,
            DesignSide::Z,
            sink,
        );
        let b = self.estimated_b();
        if x.ncols() != b.nrows() || z.ncols() != b.ncols() {
            return Err(ModelError::Dimensions(format!(
                "prediction design has {} x {} predictors but the fit estimated {} x {}",
                x.ncols(),
                z.ncols(),
                b.nrows(),
                b.ncols()
            )));
        }
        Ok(x.dot(&b).dot(&z.t()))
    }

    /// Residuals `Y - X B Z'` against the supplied data, or against the
    /// fit's own data when `None`.
    pub fn resid(&self, data: Option<&ScreenData>) -> Result<Array2<f64>, ModelError> {
        self.resid_with(data, &mut |_| {})
    }

    pub fn resid_with(
        &self,
        data: Option<&ScreenData>,
        sink: &mut dyn FnMut(Diagnostic),
    ) -> Result<Array2<f64>, ModelError> {
        let d = data.unwrap_or(&self.data);
        let fitted = self.predict_with(d.design(), sink)?;
        Ok(d.y() - &fitted)
    }
}

/// Adds or removes a leading ones column so the design matches the model.
fn reconcile_intercept(
    mat: &Array2<f64>,
    has: bool,
    want: bool,
    side: DesignSide,
    sink: &mut dyn FnMut(Diagnostic),
) -> Array2<f64> {
    if want && !has {
        log::debug!("adding an intercept column to the {side:?} design");
        sink(Diagnostic::InterceptAdded(side));
        let mut out = Array2::ones((mat.nrows(), mat.ncols() + 1));
        out.slice_mut(s![.., 1..]).assign(mat);
        out
    } else if !want && has {
        log::debug!("removing the intercept column from the {side:?} design");
        sink(Diagnostic::InterceptRemoved(side));
        mat.slice(s![.., 1..]).to_owned()
    } else {
        mat.clone()
    }
}

fn validate_weights(w: &Array1<f64>, n_resp_cols: usize) -> Result<(), ModelError> {
    if w.len() != n_resp_cols {
        return Err(ModelError::Weights(format!(
            "{} weights for {} response columns",
            w.len(),
            n_resp_cols
        )));
    }
    if w.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(ModelError::Weights(
            "weights must be finite and nonnegative".to_string(),
        ));
    }
    Ok(())
}

fn scale_cols(y: &Array2<f64>, w: &Array1<f64>) -> Array2<f64> {
    let mut out = y.clone();
    for (j, mut col) in out.axis_iter_mut(Axis(1)).enumerate() {
        let s = w[j].sqrt();
        col.mapv_inplace(|v| v * s);
    }
    out
}

/// Scales row `j` of `z` by `sqrt(w[j])`; shared with back-estimation so
/// variance propagation sees the same column-side design as the fit.
pub(crate) fn scale_rows(z: &Array2<f64>, w: &Array1<f64>) -> Array2<f64> {
    let mut out = z.clone();
    for (j, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
        let s = w[j].sqrt();
        row.mapv_inplace(|v| v * s);
    }
    out
}

fn estimate_sigma(
    resid: &Array2<f64>,
    n_x_preds: usize,
    target: Option<ShrinkageTarget>,
) -> Result<Array2<f64>, ModelError> {
    match target {
        None => {
            let dof = resid.nrows() as f64 - n_x_preds as f64;
            Ok(resid.t().dot(resid) / dof)
        }
        Some(t) => shrink_sigma(resid, t),
    }
}

/// Linear shrinkage of the residual covariance toward a structured target,
/// with the analytic intensity `lambda = sum Var(s_ij) / sum (s_ij - t_ij)^2`
/// clamped to [0, 1].
fn shrink_sigma(resid: &Array2<f64>, target: ShrinkageTarget) -> Result<Array2<f64>, ModelError> {
    let n = resid.nrows();
    let m = resid.ncols();
    if n < 2 {
        return Err(ModelError::Degenerate(
            "shrinkage covariance needs at least two residual rows".to_string(),
        ));
    }
    let nf = n as f64;
    let means = resid.sum_axis(Axis(0)) / nf;
    let centered = resid - &means;
    let s = centered.t().dot(&centered) / (nf - 1.0);

    // Unbiased estimate of Var(s_ij) from the centered cross-products.
    let mut var_s = Array2::zeros((m, m));
    for i in 0..m {
        for j in i..m {
            let mut wbar = 0.0;
            for k in 0..n {
                wbar += centered[[k, i]] * centered[[k, j]];
            }
            wbar /= nf;
            let mut ss = 0.0;
            for k in 0..n {
                let d = centered[[k, i]] * centered[[k, j]] - wbar;
                ss += d * d;
            }
            let v = nf / ((nf - 1.0).powi(3)) * ss;
            var_s[[i, j]] = v;
            var_s[[j, i]] = v;
        }
    }

    let t = build_target(&s, target);
    // Targets that copy the diagonal of S contribute nothing there, so the
    // sums run over off-diagonal entries only.
    let off_diag_only = matches!(target, ShrinkageTarget::UnequalDiagonal);
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..m {
        for j in 0..m {
            if off_diag_only && i == j {
                continue;
            }
            num += var_s[[i, j]];
            let d = s[[i, j]] - t[[i, j]];
            den += d * d;
        }
    }
    let lambda = if den > 0.0 {
        (num / den).clamp(0.0, 1.0)
    } else {
        0.0
    };
    log::debug!("shrinkage intensity lambda = {lambda:.4} toward {target:?}");
    Ok(&t * lambda + &s * (1.0 - lambda))
}

fn build_target(s: &Array2<f64>, target: ShrinkageTarget) -> Array2<f64> {
    let m = s.nrows();
    match target {
        ShrinkageTarget::Identity => Array2::eye(m),
        ShrinkageTarget::ConstantDiagonal => {
            let nu = s.diag().sum() / m as f64;
            Array2::eye(m) * nu
        }
        ShrinkageTarget::CommonDiagOffDiag => {
            let nu = s.diag().sum() / m as f64;
            let c = if m > 1 {
                (s.sum() - s.diag().sum()) / (m * (m - 1)) as f64
            } else {
                0.0
            };
            Array2::from_shape_fn((m, m), |(i, j)| if i == j { nu } else { c })
        }
        ShrinkageTarget::UnequalDiagonal => Array2::from_diag(&s.diag()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::Rng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn noiseless_data() -> (ScreenData, Array2<f64>) {
        // X and Z already carry intercepts; B is known exactly.
        let x = array![
            [1.0, 1.0],
            [1.0, -1.0],
            [1.0, 2.0],
            [1.0, 0.5],
            [1.0, -0.5],
            [1.0, 1.5],
        ];
        let z = array![[1.0, 0.5], [1.0, -0.5], [1.0, 1.0], [1.0, 0.0]];
        let b = array![[2.0, -1.0], [0.5, 3.0]];
        let y = x.dot(&b).dot(&z.t());
        let design = Design::new(x, z, true, true).unwrap();
        (ScreenData::new(y, design).unwrap(), b)
    }

    #[test]
    fn noiseless_fit_recovers_coefficients_exactly() {
        let (data, b_true) = noiseless_data();
        let fit = mlm(&data, &FitOptions::default()).unwrap();
        assert_eq!(fit.b.dim(), (2, 2));
        for (est, truth) in fit.b.iter().zip(b_true.iter()) {
            assert_abs_diff_eq!(est, truth, epsilon = 1e-8);
        }
        // Zero noise leaves zero residuals everywhere.
        let resid = fit.resid(None).unwrap();
        for r in resid.iter() {
            assert_abs_diff_eq!(r, &0.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn intercepts_are_reconciled_and_reported() {
        let (data, _) = noiseless_data();
        // Strip the intercept columns and mark them absent.
        let x = data.x().slice(s![.., 1..]).to_owned();
        let z = data.z().slice(s![.., 1..]).to_owned();
        let stripped = ScreenData::new(
            data.y().clone(),
            Design::new(x, z, false, false).unwrap(),
        )
        .unwrap();
        let mut events = Vec::new();
        let fit = mlm_with(&stripped, &FitOptions::default(), &mut |d| events.push(d)).unwrap();
        assert_eq!(
            events,
            vec![
                Diagnostic::InterceptAdded(DesignSide::X),
                Diagnostic::InterceptAdded(DesignSide::Z)
            ]
        );
        assert_eq!(fit.b.dim(), (2, 2));
        assert!(fit.data.design().x_intercept);
    }

    #[test]
    fn invalid_weights_are_rejected() {
        let (data, _) = noiseless_data();
        let mut opts = FitOptions::default();
        opts.weights = Some(array![1.0, 1.0]); // response has 4 columns
        assert!(matches!(
            mlm(&data, &opts).unwrap_err(),
            ModelError::Weights(_)
        ));
        opts.weights = Some(array![1.0, -1.0, 1.0, 1.0]);
        assert!(matches!(
            mlm(&data, &opts).unwrap_err(),
            ModelError::Weights(_)
        ));
    }

    #[test]
    fn unit_weights_match_the_unweighted_fit() {
        let (data, _) = noiseless_data();
        let unweighted = mlm(&data, &FitOptions::default()).unwrap();
        let mut opts = FitOptions::default();
        opts.weights = Some(array![1.0, 1.0, 1.0, 1.0]);
        let weighted = mlm(&data, &opts).unwrap();
        for (a, b) in unweighted.b.iter().zip(weighted.b.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn singular_design_is_a_linalg_error() {
        let x = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]];
        let z = array![[1.0], [1.0]];
        let y = Array2::ones((3, 2));
        let data =
            ScreenData::new(y, Design::new(x, z, false, false).unwrap()).unwrap();
        let mut opts = FitOptions::default();
        opts.x_intercept = false;
        opts.z_intercept = false;
        assert!(matches!(
            mlm(&data, &opts).unwrap_err(),
            ModelError::LinAlg(_)
        ));
    }

    #[test]
    fn t_stat_drops_intercepts_unless_asked() {
        let (data, _) = noiseless_data();
        let mut y = data.y().clone();
        // Perturb so variances are nonzero.
        let mut rng = StdRng::seed_from_u64(3);
        y.mapv_inplace(|v| v + rng.gen_range(-0.1..0.1));
        let data = ScreenData::new(y, data.design().clone()).unwrap();
        let fit = mlm(&data, &FitOptions::default()).unwrap();
        assert_eq!(fit.t_stat(true).dim(), (2, 2));
        assert_eq!(fit.t_stat(false).dim(), (1, 1));
    }

    fn noisy_residual_fit() -> Mlm {
        let (data, _) = noiseless_data();
        let mut rng = StdRng::seed_from_u64(19);
        let mut y = data.y().clone();
        y.mapv_inplace(|v| v + rng.gen_range(-0.5..0.5));
        let data = ScreenData::new(y, data.design().clone()).unwrap();
        mlm(
            &data,
            &FitOptions {
                target: Some(ShrinkageTarget::Identity),
                ..FitOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn shrunk_sigma_is_symmetric_with_nonnegative_diagonal() {
        for target in [
            ShrinkageTarget::Identity,
            ShrinkageTarget::ConstantDiagonal,
            ShrinkageTarget::CommonDiagOffDiag,
            ShrinkageTarget::UnequalDiagonal,
        ] {
            let (data, _) = noiseless_data();
            let mut rng = StdRng::seed_from_u64(23);
            let mut y = data.y().clone();
            y.mapv_inplace(|v| v + rng.gen_range(-0.5..0.5));
            let data = ScreenData::new(y, data.design().clone()).unwrap();
            let fit = mlm(
                &data,
                &FitOptions {
                    target: Some(target),
                    ..FitOptions::default()
                },
            )
            .unwrap();
            let m = fit.sigma.nrows();
            for i in 0..m {
                assert!(fit.sigma[[i, i]] >= 0.0);
                for j in 0..m {
                    assert_abs_diff_eq!(
                        fit.sigma[[i, j]],
                        fit.sigma[[j, i]],
                        epsilon = 1e-12
                    );
                }
            }
        }
    }

    #[test]
    fn predict_reconciles_new_designs() {
        let fit = noisy_residual_fit();
        // New design without intercept columns: they are added back.
        let x_new = array![[0.25], [1.25]];
        let z_new = array![[0.75]];
        let mut events = Vec::new();
        let pred = fit
            .predict_with(
                &Design::new(x_new.clone(), z_new.clone(), false, false).unwrap(),
                &mut |d| events.push(d),
            )
            .unwrap();
        assert_eq!(pred.dim(), (2, 1));
        assert_eq!(
            events,
            vec![
                Diagnostic::InterceptAdded(DesignSide::X),
                Diagnostic::InterceptAdded(DesignSide::Z)
            ]
        );
        // Manual reconstruction of the same prediction.
        let b = &fit.b;
        let expect = 1.0 * b[[0, 0]]
            + 0.25 * b[[1, 0]]
            + 0.75 * (1.0 * b[[0, 1]] + 0.25 * b[[1, 1]]);
        assert_abs_diff_eq!(pred[[0, 0]], expect, epsilon = 1e-10);
    }

    #[test]
    fn mismatched_prediction_design_is_rejected() {
        let fit = noisy_residual_fit();
        let bad = Design::new(Array2::ones((2, 3)), Array2::ones((1, 2)), true, true).unwrap();
        assert!(matches!(
            fit.predict(&bad).unwrap_err(),
            ModelError::Dimensions(_)
        ));
    }
}
