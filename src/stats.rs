//! Provides functions for computing MCMC statistics.

use crate::error::{Error, Result};
use ndarray::prelude::*;
use ndarray_stats::QuantileExt;

/// Fraction of accepted steps per chain, from `[n_chains, n_steps]` flags.
///
/// A chain with no recorded steps has rate `0`.
pub fn acceptance_rate(accepted: &Array2<bool>) -> Array1<f64> {
    let n_steps = accepted.ncols();
    accepted.map_axis(Axis(1), |row| {
        if n_steps == 0 {
            0.0
        } else {
            row.iter().filter(|&&a| a).count() as f64 / n_steps as f64
        }
    })
}

/// Potential scale reduction factor (R-hat) of each parameter.
///
/// # Parameters
///
/// * `positions`: samples of shape `[n_chains, n_steps, n_dim]`.
///
/// # Returns
///
/// One R-hat value per dimension. Values close to 1 indicate that the chains agree.
///
/// # Errors
///
/// Returns [`Error::Config`] with fewer than two chains or fewer than two steps.
pub fn potential_scale_reduction(positions: ArrayView3<f64>) -> Result<Array1<f64>> {
    let (n_chains, n_steps, _) = positions.dim();
    if n_chains < 2 || n_steps < 2 {
        return Err(Error::Config(format!(
            "R-hat needs at least 2 chains and 2 steps, got {n_chains} chains and {n_steps} steps"
        )));
    }
    let n = n_steps as f64;

    // Per-chain means and sample variances, [n_chains, n_dim].
    let chain_means = positions.mean_axis(Axis(1)).ok_or_else(empty)?;
    let chain_vars = positions.var_axis(Axis(1), 1.0);

    let within = chain_vars.mean_axis(Axis(0)).ok_or_else(empty)?;
    // B / n, the variance of the chain means.
    let between_over_n = chain_means.var_axis(Axis(0), 1.0);

    let var = &within * ((n - 1.0) / n) + between_over_n;
    Ok((var / within).mapv(f64::sqrt))
}

/// Largest R-hat, ignoring NaN entries from constant parameters.
pub fn max_rhat(rhat: &Array1<f64>) -> f64 {
    *rhat.max_skipnan()
}

fn empty() -> Error {
    Error::Config("cannot reduce over an empty axis".into())
}

#[cfg(test)]
mod tests {
    use std::f64;

    use super::*;

    fn run_rhat_test(data0: Array2<f64>, data1: Array2<f64>, expected: Array1<f64>, tol: f64) {
        let positions = ndarray::stack(Axis(1), &[data0.view(), data1.view()]).unwrap();
        let rhat = potential_scale_reduction(positions.view()).unwrap();
        let diff = *(rhat.clone() - expected.clone()).abs().max().unwrap();
        assert!(
            diff < tol,
            "Mismatch in Rhat. Got {:?}, expected {:?}, diff = {:?}",
            rhat,
            expected,
            diff
        );
    }

    #[test]
    fn test_rhat_1() {
        // Step 0 data (chains x params)
        let data_step_0 = arr2(&[
            [0.0, 1.0, 0.0, 1.0], // chain 0
            [1.0, 2.0, 0.0, 2.0], // chain 1
            [0.0, 0.0, 0.0, 2.0], // chain 2
        ]);

        // Step 1 data (chains x params)
        let data_step_1 = arr2(&[
            [1.0, 2.0, 2.0, 0.0], // chain 0
            [1.0, 1.0, 1.0, 1.0], // chain 1
            [0.0, 1.0, 0.0, 0.0], // chain 2
        ]);
        let expected = array![f64::consts::SQRT_2, 1.08012345, 0.89442719, 0.8660254];
        run_rhat_test(data_step_0, data_step_1, expected, 1e-7);
    }

    #[test]
    fn test_rhat_2() {
        let data_step_0 = arr2(&[
            [1.0, 0.0, 0.0, 1.0],
            [1.0, 0.0, 0.0, 1.0],
            [0.0, 1.0, 0.0, 2.0],
        ]);
        let data_step_1 = arr2(&[
            [1.0, 2.0, 0.0, 2.0],
            [1.0, 2.0, 0.0, 0.0],
            [2.0, 0.0, 1.0, 2.0],
        ]);
        let expected = array![f64::consts::FRAC_1_SQRT_2, 0.74535599, 1.0, 1.5];
        run_rhat_test(data_step_0, data_step_1, expected, 1e-7);
    }

    #[test]
    fn rhat_needs_two_chains() {
        let positions = Array3::<f64>::zeros((1, 10, 2));
        assert!(potential_scale_reduction(positions.view()).is_err());
    }

    #[test]
    fn max_rhat_skips_nan() {
        assert_eq!(max_rhat(&array![1.1, f64::NAN, 1.3]), 1.3);
    }

    #[test]
    fn acceptance_rate_per_chain() {
        let accepted = array![[true, false, true, true], [false, false, false, false]];
        assert_eq!(acceptance_rate(&accepted), array![0.75, 0.0]);
        assert_eq!(acceptance_rate(&Array2::from_elem((2, 0), false)), array![0.0, 0.0]);
    }
}
