//! Collins-style interaction scores for colony-size screens.
//!
//! The S score compares a condition x clone group's mean response against
//! the clone's control mean over the whole screen, normalized by a pooled
//! standard error. With the variance floor enabled (the default), control
//! and experimental variances are bounded below by cross-cell estimates so
//! that near-zero-variance groups cannot produce spuriously inflated
//! scores: low-replicate colony measurements routinely show far less
//! spread than the measurement process warrants.
use ndarray::Array2;
use rand::rngs::StdRng;

use crate::ModelError;
use crate::data::{ScreenData, median};
use crate::perm::{PermPvals, perm_pvals};
use crate::smooth::LocalLinear;

/// Span of the local-regression smooth behind the experimental-variance
/// floor (fraction of cells entering each local fit).
const FLOOR_SPAN: f64 = 0.75;

/// Per-cell and per-clone replicate statistics of the raw response.
struct CellStats {
    mu_exp: Array2<f64>,
    var_exp: Array2<f64>,
    n_exp: Array2<f64>,
    mu_cont: Vec<f64>,
    var_cont: Vec<f64>,
    n_cont: Vec<f64>,
}

/// Floored variances and the adjusted control replicate count.
struct FlooredStats {
    var_exp: Array2<f64>,
    var_cont: Vec<f64>,
    n_cont: f64,
}

/// Interaction scores, conditions x clones.
///
/// `x` and `z` must be 0/1 treatment-contrast indicator matrices without
/// intercepts: one column per condition (over response rows) and per clone
/// (over response columns). `var_floor` selects the floored, pooled
/// denominator; without it the plain two-sample formula is used.
pub fn s_score(data: &ScreenData, var_floor: bool) -> Result<Array2<f64>, ModelError> {
    let stats = cell_stats(data)?;
    let (n_cond, n_clone) = stats.mu_exp.dim();
    let mut scores = Array2::zeros((n_cond, n_clone));

    if !var_floor {
        for i in 0..n_cond {
            for j in 0..n_clone {
                let se = (stats.var_exp[[i, j]] / stats.n_exp[[i, j]]
                    + stats.var_cont[j] / stats.n_cont[j])
                    .sqrt();
                scores[[i, j]] = (stats.mu_exp[[i, j]] - stats.mu_cont[j]) / se;
            }
        }
        return Ok(scores);
    }

    let floored = floor_variances(&stats)?;
    for i in 0..n_cond {
        for j in 0..n_clone {
            let df_exp = stats.n_exp[[i, j]] - 1.0;
            let df_cont = floored.n_cont - 1.0;
            if df_exp + df_cont <= 0.0 {
                return Err(ModelError::Degenerate(format!(
                    "condition {i} x clone {j} leaves no degrees of freedom to pool"
                )));
            }
            let var_pool = (df_exp * floored.var_exp[[i, j]] + df_cont * floored.var_cont[j])
                / (df_exp + df_cont);
            let se = (var_pool * (1.0 / stats.n_exp[[i, j]] + 1.0 / floored.n_cont)).sqrt();
            scores[[i, j]] = (stats.mu_exp[[i, j]] - stats.mu_cont[j]) / se;
        }
    }
    Ok(scores)
}

/// Empirical p-values for the S scores under response reshuffling.
pub fn s_score_perms<P>(
    data: &ScreenData,
    n_perms: usize,
    perm_fn: P,
    var_floor: bool,
    seed: u64,
) -> Result<PermPvals, ModelError>
where
    P: Fn(&ScreenData, &mut StdRng) -> ScreenData + Sync,
{
    perm_pvals(
        |d: &ScreenData| s_score(d, var_floor),
        data,
        n_perms,
        perm_fn,
        seed,
    )
}

/// Gathers replicate mean/variance/count per condition x clone cell, and
/// per clone the control statistics over every response row. A cell with
/// zero measured replicates is a data error, never a silent NaN.
fn cell_stats(data: &ScreenData) -> Result<CellStats, ModelError> {
    let (x, z, y) = (data.x(), data.z(), data.y());
    validate_indicator(x, "X", data.design().x_intercept)?;
    validate_indicator(z, "Z", data.design().z_intercept)?;

    let n_cond = x.ncols();
    let n_clone = z.ncols();
    let cond_rows: Vec<Vec<usize>> = (0..n_cond)
        .map(|i| {
            x.column(i)
                .iter()
                .enumerate()
                .filter(|(_, &v)| v == 1.0)
                .map(|(r, _)| r)
                .collect()
        })
        .collect();
    let clone_cols: Vec<Vec<usize>> = (0..n_clone)
        .map(|j| {
            z.column(j)
                .iter()
                .enumerate()
                .filter(|(_, &v)| v == 1.0)
                .map(|(s, _)| s)
                .collect()
        })
        .collect();

    let mut mu_exp = Array2::zeros((n_cond, n_clone));
    let mut var_exp = Array2::zeros((n_cond, n_clone));
    let mut n_exp = Array2::zeros((n_cond, n_clone));
    for i in 0..n_cond {
        for j in 0..n_clone {
            let vals: Vec<f64> = cond_rows[i]
                .iter()
                .flat_map(|&r| clone_cols[j].iter().map(move |&s| y[[r, s]]))
                .collect();
            if vals.is_empty() {
                return Err(ModelError::EmptyCell {
                    condition: i,
                    clone: j,
                });
            }
            let (mu, var) = mean_var(&vals);
            mu_exp[[i, j]] = mu;
            var_exp[[i, j]] = var;
            n_exp[[i, j]] = vals.len() as f64;
        }
    }

    // The control for a clone is its full set of measurements across the
    // screen, conditions included.
    let mut mu_cont = Vec::with_capacity(n_clone);
    let mut var_cont = Vec::with_capacity(n_clone);
    let mut n_cont = Vec::with_capacity(n_clone);
    for cols in &clone_cols {
        let vals: Vec<f64> = (0..y.nrows())
            .flat_map(|r| cols.iter().map(move |&s| y[[r, s]]))
            .collect();
        let (mu, var) = mean_var(&vals);
        mu_cont.push(mu);
        var_cont.push(var);
        n_cont.push(vals.len() as f64);
    }

    Ok(CellStats {
        mu_exp,
        var_exp,
        n_exp,
        mu_cont,
        var_cont,
        n_cont,
    })
}

/// The variance-floor adjustment. Monotone by construction: every floored
/// variance is at least its raw value.
fn floor_variances(stats: &CellStats) -> Result<FlooredStats, ModelError> {
    let (n_cond, n_clone) = stats.mu_exp.dim();

    // Experimental floor: smooth sd against mean across all cells, square
    // the prediction at each cell's mean, keep the larger variance.
    let means: Vec<f64> = stats.mu_exp.iter().copied().collect();
    let sds: Vec<f64> = stats.var_exp.iter().map(|v| v.sqrt()).collect();
    let smooth = LocalLinear::fit(&means, &sds, FLOOR_SPAN)?;
    let mut var_exp = stats.var_exp.clone();
    for i in 0..n_cond {
        for j in 0..n_clone {
            let predicted_sd = smooth.predict(stats.mu_exp[[i, j]]).max(0.0);
            let floor = predicted_sd * predicted_sd;
            if floor > var_exp[[i, j]] {
                var_exp[[i, j]] = floor;
            }
        }
    }

    // Control floor: per clone, the larger of the clone's median
    // experimental variance and a bound scaled from the control mean by
    // the screen-wide median sd/mean ratio.
    let ratios: Vec<f64> = stats
        .mu_exp
        .iter()
        .zip(stats.var_exp.iter())
        .filter(|(mu, _)| **mu != 0.0)
        .map(|(mu, var)| var.sqrt() / mu)
        .filter(|r| r.is_finite())
        .collect();
    let ratio = if ratios.is_empty() {
        0.0
    } else {
        median(&ratios)
    };
    let mut var_cont = Vec::with_capacity(n_clone);
    for j in 0..n_clone {
        let clone_vars: Vec<f64> = (0..n_cond).map(|i| stats.var_exp[[i, j]]).collect();
        let scaled = (stats.mu_cont[j] * ratio).powi(2);
        var_cont.push(stats.var_cont[j].max(median(&clone_vars)).max(scaled));
    }

    // Control replicate count: the median experimental replicate count.
    let counts: Vec<f64> = stats.n_exp.iter().copied().collect();
    let n_cont = median(&counts);

    Ok(FlooredStats {
        var_exp,
        var_cont,
        n_cont,
    })
}

fn mean_var(vals: &[f64]) -> (f64, f64) {
    let n = vals.len() as f64;
    let mu = vals.iter().sum::<f64>() / n;
    if vals.len() < 2 {
        // A single replicate has no spread to estimate; the floor mode
        // raises it to a cross-cell bound.
        return (mu, 0.0);
    }
    let ss: f64 = vals.iter().map(|v| (v - mu) * (v - mu)).sum();
    (mu, ss / (n - 1.0))
}

fn validate_indicator(
    mat: &Array2<f64>,
    side: &str,
    has_intercept: bool,
) -> Result<(), ModelError> {
    if has_intercept {
        return Err(ModelError::NotIndicator(format!(
            "{side} carries an intercept column"
        )));
    }
    if mat.iter().any(|v| *v != 0.0 && *v != 1.0) {
        return Err(ModelError::NotIndicator(format!(
            "{side} has entries other than 0 and 1"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Design;
    use crate::perm::shuffle_rows;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Two conditions x two clones, two replicate rows/columns each.
    fn indicator_data(y: Array2<f64>) -> ScreenData {
        let x = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        let z = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        ScreenData::new(y, Design::new(x, z, false, false).unwrap()).unwrap()
    }

    fn staircase() -> Array2<f64> {
        array![
            [1.0, 2.0, 3.0, 4.0],
            [3.0, 4.0, 5.0, 6.0],
            [5.0, 6.0, 7.0, 8.0],
            [7.0, 8.0, 9.0, 10.0]
        ]
    }

    #[test]
    fn unfloored_score_matches_a_hand_computation() {
        let data = indicator_data(staircase());
        let s = s_score(&data, false).unwrap();
        assert_eq!(s.dim(), (2, 2));
        // Cell (0,0): values {1,2,3,4}, mean 2.5, variance 5/3, n 4.
        // Control clone 0: {1..8}, mean 4.5, variance 6, n 8.
        // S = (2.5 - 4.5) / sqrt(5/12 + 6/8) = -2 / sqrt(7/6).
        let expect = -2.0 / (7.0f64 / 6.0).sqrt();
        assert_abs_diff_eq!(s[[0, 0]], expect, epsilon = 1e-12);
        // The design is symmetric: condition 1 sits as far above the
        // control as condition 0 sits below it.
        assert_abs_diff_eq!(s[[1, 0]], -s[[0, 0]], epsilon = 1e-12);
    }

    #[test]
    fn flooring_is_monotone() {
        let data = indicator_data(staircase());
        let stats = cell_stats(&data).unwrap();
        let floored = floor_variances(&stats).unwrap();
        for (raw, adj) in stats.var_exp.iter().zip(floored.var_exp.iter()) {
            assert!(adj >= raw, "experimental floor lowered {raw} to {adj}");
        }
        for (raw, adj) in stats.var_cont.iter().zip(floored.var_cont.iter()) {
            assert!(adj >= raw, "control floor lowered {raw} to {adj}");
        }
    }

    #[test]
    fn floored_scores_are_finite_for_constant_cells() {
        // One cell with identical replicates: raw variance 0 would blow up
        // the plain formula, the floor keeps the score finite.
        let mut y = staircase();
        y[[0, 0]] = 2.0;
        y[[0, 1]] = 2.0;
        y[[1, 0]] = 2.0;
        y[[1, 1]] = 2.0;
        let data = indicator_data(y);
        let s = s_score(&data, true).unwrap();
        for v in s.iter() {
            assert!(v.is_finite(), "non-finite floored score {v}");
        }
    }

    #[test]
    fn empty_cells_are_reported() {
        let x = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        // Clone 1 has no measured positions at all.
        let z = array![[1.0, 0.0], [1.0, 0.0], [1.0, 0.0], [1.0, 0.0]];
        let data =
            ScreenData::new(staircase(), Design::new(x, z, false, false).unwrap()).unwrap();
        let err = s_score(&data, true).unwrap_err();
        assert!(matches!(err, ModelError::EmptyCell { clone: 1, .. }));
    }

    #[test]
    fn non_indicator_designs_are_rejected() {
        let data = indicator_data(staircase());
        // Intercept flag set.
        let flagged = ScreenData::new(
            data.y().clone(),
            Design::new(data.x().clone(), data.z().clone(), true, false).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            s_score(&flagged, false).unwrap_err(),
            ModelError::NotIndicator(_)
        ));
        // Fractional entry.
        let mut x = data.x().clone();
        x[[0, 0]] = 0.5;
        let fractional = ScreenData::new(
            data.y().clone(),
            Design::new(x, data.z().clone(), false, false).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            s_score(&fractional, false).unwrap_err(),
            ModelError::NotIndicator(_)
        ));
    }

    #[test]
    fn permutation_pvalues_are_well_formed() {
        let data = indicator_data(staircase());
        let out = s_score_perms(&data, 20, shuffle_rows, true, 17).unwrap();
        assert_eq!(out.observed.dim(), (2, 2));
        for p in out.pvals.iter() {
            assert!(*p > 0.0 && *p <= 1.0);
        }
    }
}
