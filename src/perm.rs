//! Permutation-based empirical p-values.
//!
//! A generic engine: compute a statistic on the real data, recompute it on
//! independently reshuffled copies, and count, per matrix cell, how often
//! the permuted magnitude reaches the observed one. The trials are
//! independent pure computations, so they run on the rayon worker pool
//! with per-worker count accumulators merged by elementwise addition, a
//! commutative and associative reduction: results are identical for any
//! worker count or completion order.
use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::ModelError;
use crate::data::ScreenData;

/// Observed statistic and its empirical p-values, cell for cell.
#[derive(Debug, Clone)]
pub struct PermPvals {
    pub observed: Array2<f64>,
    pub pvals: Array2<f64>,
}

/// Empirical two-sided p-values for `stat` under `perm`-reshuffling.
///
/// Each trial `t` draws from its own `StdRng` seeded with `seed + t`, so
/// concurrent trials never share a permutation stream and the run is
/// reproducible. Per cell, the p-value is `(count_ge + 1) / (n_perms + 1)`
/// with ties counting as "greater or equal": it is never zero, and with
/// `n_perms == 0` it degenerates to exactly 1 everywhere. A failure in any
/// single trial aborts the whole run.
pub fn perm_pvals<D, S, P>(
    stat: S,
    data: &D,
    n_perms: usize,
    perm: P,
    seed: u64,
) -> Result<PermPvals, ModelError>
where
    D: Sync,
    S: Fn(&D) -> Result<Array2<f64>, ModelError> + Sync,
    P: Fn(&D, &mut StdRng) -> D + Sync,
{
    let observed = stat(data)?;
    let abs_obs = observed.mapv(f64::abs);
    let dim = observed.dim();

    let counts = (0..n_perms)
        .into_par_iter()
        .try_fold(
            || Array2::<f64>::zeros(dim),
            |mut acc, trial| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(trial as u64));
                let shuffled = perm(data, &mut rng);
                let permuted = stat(&shuffled)?;
                if permuted.dim() != dim {
                    return Err(ModelError::Dimensions(format!(
                        "permuted statistic is {:?} but the observed one is {:?}",
                        permuted.dim(),
                        dim
                    )));
                }
                for ((a, s), o) in acc.iter_mut().zip(permuted.iter()).zip(abs_obs.iter()) {
                    if s.abs() >= *o {
                        *a += 1.0;
                    }
                }
                Ok(acc)
            },
        )
        .try_reduce(|| Array2::zeros(dim), |a, b| Ok(a + b))?;

    let denom = (n_perms + 1) as f64;
    let pvals = counts.mapv(|c| (c + 1.0) / denom);
    Ok(PermPvals { observed, pvals })
}

/// A copy of the data with independently permuted response rows.
pub fn shuffle_rows(data: &ScreenData, rng: &mut StdRng) -> ScreenData {
    let mut idx: Vec<usize> = (0..data.y().nrows()).collect();
    idx.shuffle(rng);
    data.replace_response(data.y().select(Axis(0), &idx))
}

/// A copy of the data with independently permuted response columns.
pub fn shuffle_cols(data: &ScreenData, rng: &mut StdRng) -> ScreenData {
    let mut idx: Vec<usize> = (0..data.y().ncols()).collect();
    idx.shuffle(rng);
    data.replace_response(data.y().select(Axis(1), &idx))
}
