//! Containers for screen designs and responses.
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Row-side and column-side predictor matrices for a screen.
///
/// Rows of `x` align with response rows (experimental-unit replicates),
/// rows of `z` align with response columns (plate-position replicates).
/// The intercept flags record whether the leading column of each matrix is
/// an intercept; the fitting routines reconcile these flags against the
/// requested model before solving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Design {
    /// Row-side predictors, one column per encoded predictor.
    pub x: Array2<f64>,
    /// Column-side predictors, one column per encoded predictor.
    pub z: Array2<f64>,
    /// Whether `x` carries an intercept as its first column.
    pub x_intercept: bool,
    /// Whether `z` carries an intercept as its first column.
    pub z_intercept: bool,
}

impl Design {
    pub fn new(
        x: Array2<f64>,
        z: Array2<f64>,
        x_intercept: bool,
        z_intercept: bool,
    ) -> Result<Self, ModelError> {
        if x.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite("X design matrix"));
        }
        if z.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite("Z design matrix"));
        }
        Ok(Design {
            x,
            z,
            x_intercept,
            z_intercept,
        })
    }

    /// Number of row-side predictor columns.
    pub fn n_x_preds(&self) -> usize {
        self.x.ncols()
    }

    /// Number of column-side predictor columns.
    pub fn n_z_preds(&self) -> usize {
        self.z.ncols()
    }
}

/// A validated response matrix together with its design.
///
/// Construction checks the alignment invariants once; the matrices are
/// treated read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenData {
    y: Array2<f64>,
    design: Design,
}

impl ScreenData {
    pub fn new(y: Array2<f64>, design: Design) -> Result<Self, ModelError> {
        if design.x.nrows() != y.nrows() {
            return Err(ModelError::Dimensions(format!(
                "X has {} rows but the response has {} rows",
                design.x.nrows(),
                y.nrows()
            )));
        }
        if design.z.nrows() != y.ncols() {
            return Err(ModelError::Dimensions(format!(
                "Z has {} rows but the response has {} columns",
                design.z.nrows(),
                y.ncols()
            )));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite("response matrix"));
        }
        Ok(ScreenData { y, design })
    }

    /// The response matrix.
    pub fn y(&self) -> &Array2<f64> {
        &self.y
    }

    /// The row-side predictor matrix.
    pub fn x(&self) -> &Array2<f64> {
        &self.design.x
    }

    /// The column-side predictor matrix.
    pub fn z(&self) -> &Array2<f64> {
        &self.design.z
    }

    pub fn design(&self) -> &Design {
        &self.design
    }

    /// Same design, different response. The caller guarantees the new
    /// response has the shape of the old one (permutations preserve it).
    pub(crate) fn replace_response(&self, y: Array2<f64>) -> ScreenData {
        ScreenData {
            y,
            design: self.design.clone(),
        }
    }
}

/// Median of a slice; the average of the two middle values for even
/// lengths. Returns NaN on an empty slice.
pub(crate) fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

/// Linearly interpolated quantile of a sorted slice, `p` in [0, 1].
fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let h = (n - 1) as f64 * p;
    let lo = h.floor() as usize;
    let frac = h - lo as f64;
    if lo + 1 < n {
        sorted[lo] + frac * (sorted[lo + 1] - sorted[lo])
    } else {
        sorted[lo]
    }
}

/// Median-centers and IQR-scales each column of a raw response matrix,
/// the customary normalization of colony-size plates before scoring.
/// Columns with zero interquartile range are centered but not scaled.
pub fn median_iqr_standardize(y: &Array2<f64>) -> Array2<f64> {
    let mut out = y.clone();
    for mut col in out.axis_iter_mut(Axis(1)) {
        let mut sorted: Vec<f64> = col.iter().copied().collect();
        if sorted.is_empty() {
            continue;
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let med = quantile_sorted(&sorted, 0.5);
        let iqr = quantile_sorted(&sorted, 0.75) - quantile_sorted(&sorted, 0.25);
        if iqr > 0.0 {
            col.mapv_inplace(|v| (v - med) / iqr);
        } else {
            col.mapv_inplace(|v| v - med);
        }
    }
    out
}
