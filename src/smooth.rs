//! Local-regression smoothing of a mean-variance relationship.
//!
//! Colony-size measurements show systematically smaller spread at low
//! signal. The variance floor estimates that trend by smoothing the
//! per-cell standard deviation against the per-cell mean and evaluating
//! the smooth at arbitrary query means. The smoother is a plain
//! tricube-weighted local linear regression: for each query point the
//! `ceil(span * n)` nearest predictor values form the neighborhood, each
//! neighbor is weighted by `(1 - (d/dmax)^3)^3`, and a weighted degree-1
//! polynomial is solved in closed form.
use crate::ModelError;

/// A fitted local linear smoother over a set of (x, y) points.
///
/// `span` is the fraction of points entering each local fit; the default
/// used by the variance floor is 0.75.
#[derive(Debug, Clone)]
pub struct LocalLinear {
    xs: Vec<f64>,
    ys: Vec<f64>,
    k: usize,
}

impl LocalLinear {
    /// Builds a smoother from paired observations. The pairs are sorted by
    /// predictor internally; `span` must lie in (0, 1].
    pub fn fit(x: &[f64], y: &[f64], span: f64) -> Result<Self, ModelError> {
        if x.len() != y.len() {
            return Err(ModelError::Dimensions(format!(
                "smoother got {} predictors but {} responses",
                x.len(),
                y.len()
            )));
        }
        if x.is_empty() {
            return Err(ModelError::Degenerate(
                "smoother needs at least one observation".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&span) || span == 0.0 {
            return Err(ModelError::Degenerate(format!(
                "smoother span must lie in (0, 1], got {span}"
            )));
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite("smoother observations"));
        }
        let mut order: Vec<usize> = (0..x.len()).collect();
        order.sort_by(|&a, &b| x[a].partial_cmp(&x[b]).unwrap_or(std::cmp::Ordering::Equal));
        let xs: Vec<f64> = order.iter().map(|&i| x[i]).collect();
        let ys: Vec<f64> = order.iter().map(|&i| y[i]).collect();
        let k = ((span * xs.len() as f64).ceil() as usize).clamp(2.min(xs.len()), xs.len());
        Ok(LocalLinear { xs, ys, k })
    }

    /// Evaluates the smooth at an arbitrary query point.
    pub fn predict(&self, x0: f64) -> f64 {
        let n = self.xs.len();
        if n == 1 {
            return self.ys[0];
        }
        // Nearest-k window around x0; the points are sorted, so grow the
        // window one step at a time toward the nearer side.
        let pos = self.xs.partition_point(|&v| v < x0);
        let (mut lo, mut hi) = (pos, pos);
        while hi - lo < self.k {
            if lo == 0 {
                hi += 1;
            } else if hi == n {
                lo -= 1;
            } else if (x0 - self.xs[lo - 1]).abs() <= (self.xs[hi] - x0).abs() {
                lo -= 1;
            } else {
                hi += 1;
            }
        }
        let dmax = (x0 - self.xs[lo]).abs().max((self.xs[hi - 1] - x0).abs());

        // Weighted degree-1 fit in coordinates centered on the query, so
        // the intercept is the fitted value.
        let mut sw = 0.0;
        let mut swu = 0.0;
        let mut swy = 0.0;
        let mut swuu = 0.0;
        let mut swuy = 0.0;
        for i in lo..hi {
            let u = self.xs[i] - x0;
            let w = if dmax > 0.0 {
                tricube((u / dmax).abs())
            } else {
                1.0
            };
            sw += w;
            swu += w * u;
            swy += w * self.ys[i];
            swuu += w * u * u;
            swuy += w * u * self.ys[i];
        }
        if sw <= 0.0 {
            // Every window point sits at the boundary distance; all tricube
            // weights vanish. Fall back to the unweighted window mean.
            return self.ys[lo..hi].iter().sum::<f64>() / (hi - lo) as f64;
        }
        let denom = sw * swuu - swu * swu;
        if denom.abs() < 1e-12 * sw.max(1.0) {
            // Zero spread in the window: fall back to the weighted mean.
            return swy / sw;
        }
        (swuu * swy - swu * swuy) / denom
    }
}

#[inline]
fn tricube(u: f64) -> f64 {
    let u = u.min(1.0);
    let t = 1.0 - u * u * u;
    t * t * t
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn reproduces_a_straight_line() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        let smooth = LocalLinear::fit(&x, &y, 0.75).unwrap();
        for q in [0.0, 3.7, 10.0, 19.0] {
            assert_abs_diff_eq!(smooth.predict(q), 2.0 * q + 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn constant_data_yields_the_constant() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [5.0; 4];
        let smooth = LocalLinear::fit(&x, &y, 1.0).unwrap();
        assert_abs_diff_eq!(smooth.predict(2.5), 5.0, epsilon = 1e-12);
        // Ties in x: window spread is zero, weighted-mean fallback.
        let smooth = LocalLinear::fit(&[2.0; 4], &y, 1.0).unwrap();
        assert_abs_diff_eq!(smooth.predict(2.0), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn tracks_a_monotone_trend() {
        let x: Vec<f64> = (0..50).map(|i| i as f64 / 5.0).collect();
        let y: Vec<f64> = x.iter().map(|v| v.sqrt()).collect();
        let smooth = LocalLinear::fit(&x, &y, 0.5).unwrap();
        let mut prev = smooth.predict(0.5);
        for q in [2.0, 4.0, 6.0, 8.0] {
            let cur = smooth.predict(q);
            assert!(cur > prev, "smooth not increasing at {q}");
            prev = cur;
        }
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(LocalLinear::fit(&[1.0], &[1.0, 2.0], 0.5).is_err());
        assert!(LocalLinear::fit(&[], &[], 0.5).is_err());
        assert!(LocalLinear::fit(&[1.0, 2.0], &[1.0, 2.0], 0.0).is_err());
        assert!(LocalLinear::fit(&[1.0, f64::NAN], &[1.0, 2.0], 0.5).is_err());
    }
}
