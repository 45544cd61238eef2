//! Metropolis-adjusted Langevin algorithm.
//!
//! Proposes `x' = x + ε ∇log p(x) + sqrt(2ε) z` and corrects for the asymmetric
//! proposal with the full Metropolis-Hastings ratio.

use crate::cache::ShapeCache;
use crate::core::{Ensemble, ProposalKernel};
use crate::error::{check_dim, check_step_size, Result};
use crate::rng::{lane_draws, metropolis_accept, RngKey};
use crate::target::{evaluate_log_prob, evaluate_with_grad, ConditioningData, LogDensity};
use burn::tensor::backend::AutodiffBackend;
use ndarray::{Array1, Array2, Axis, Zip};
use std::marker::PhantomData;

/// Step size `ε` of the Langevin proposal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MalaConfig {
    pub step_size: f64,
}

impl Default for MalaConfig {
    fn default() -> Self {
        Self { step_size: 0.1 }
    }
}

impl MalaConfig {
    /// Sets the Langevin step size.
    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }
}

/// A data-parallel MALA kernel.
#[derive(Debug)]
pub struct Mala<B, T> {
    target: T,
    config: MalaConfig,
    n_dim: usize,
    cache: ShapeCache,
    _backend: PhantomData<fn() -> B>,
}

impl<B, T> Mala<B, T>
where
    B: AutodiffBackend,
{
    /// Creates a MALA kernel for `target` in `n_dim` dimensions.
    ///
    /// # Parameters
    /// * `target` - Unnormalized log-density, evaluated on the whole ensemble at once.
    /// * `config` - Step size.
    /// * `n_dim` - Dimension of each chain.
    ///
    /// # Returns
    /// `Error::Config` if the step size is not positive and finite.
    pub fn new(target: T, config: MalaConfig, n_dim: usize) -> Result<Self> {
        check_step_size(config.step_size)?;
        Ok(Self {
            target,
            config,
            n_dim,
            cache: ShapeCache::new(),
            _backend: PhantomData,
        })
    }

    /// Returns the kernel configuration.
    pub fn config(&self) -> &MalaConfig {
        &self.config
    }

    /// `log q(to | from)` up to a constant, for a Langevin step from `from`.
    fn log_transition(
        &self,
        to: &Array2<f64>,
        from: &Array2<f64>,
        grad_from: &Array2<f64>,
    ) -> Array1<f64> {
        let eps = self.config.step_size;
        let mut diff = to - from;
        diff.scaled_add(-eps, grad_from);
        diff.mapv_inplace(|v| v * v);
        diff.sum_axis(Axis(1)) / (-4.0 * eps)
    }
}

impl<B, T, D> ProposalKernel<D> for Mala<B, T>
where
    B: AutodiffBackend,
    T: LogDensity<B, D>,
    D: ConditioningData,
{
    fn name(&self) -> &'static str {
        "MALA"
    }

    fn n_dim(&self) -> usize {
        self.n_dim
    }

    fn shape_cache(&self) -> &ShapeCache {
        &self.cache
    }

    fn log_prob_ensemble(&self, positions: &Array2<f64>, data: &D) -> Result<Array1<f64>> {
        check_dim("MALA position", self.n_dim, positions.ncols())?;
        evaluate_log_prob::<B, D, T>(&self.target, positions, data)
    }

    fn prime(&self, n_chains: usize, data: &D) -> Result<()> {
        let zeros = Array2::zeros((n_chains, self.n_dim));
        evaluate_with_grad::<B, D, T>(&self.target, &zeros, data).map(|_| ())
    }

    fn step_lanes(
        &self,
        keys: &[RngKey],
        positions: &Array2<f64>,
        log_probs: &Array1<f64>,
        data: &D,
    ) -> Result<Ensemble> {
        check_dim("MALA lanes", keys.len(), positions.nrows())?;
        check_dim("MALA position", self.n_dim, positions.ncols())?;
        let eps = self.config.step_size;
        let draws = lane_draws(keys, self.n_dim)?;

        let (_, grad) = evaluate_with_grad::<B, D, T>(&self.target, positions, data)?;
        let mut proposed = positions.clone();
        proposed.scaled_add(eps, &grad);
        proposed.scaled_add((2.0 * eps).sqrt(), &draws.noise);

        let (logp_proposed, grad_proposed) =
            evaluate_with_grad::<B, D, T>(&self.target, &proposed, data)?;
        let forward = self.log_transition(&proposed, positions, &grad);
        let reverse = self.log_transition(positions, &proposed, &grad_proposed);

        let mut accepted = Array1::from_elem(keys.len(), false);
        Zip::from(&mut accepted)
            .and(log_probs)
            .and(&logp_proposed)
            .and(&forward)
            .and(&reverse)
            .and(&draws.uniforms)
            .for_each(|acc, &lp, &lp_new, &fwd, &rev, &u| {
                *acc = metropolis_accept(lp_new - lp + rev - fwd, u);
            });

        Ok(Ensemble::accept_where(
            positions,
            log_probs,
            proposed,
            logp_proposed,
            accepted,
        ))
    }
}
