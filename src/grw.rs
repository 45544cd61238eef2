//! Gaussian random-walk Metropolis.

use crate::cache::ShapeCache;
use crate::core::{Ensemble, ProposalKernel};
use crate::error::{check_dim, check_step_size, Result};
use crate::rng::{lane_draws, metropolis_accept, RngKey};
use crate::target::{evaluate_log_prob, ConditioningData, LogDensity};
use burn::tensor::backend::Backend;
use ndarray::{Array1, Array2, Zip};
use std::marker::PhantomData;

/// Scale of the isotropic Gaussian random-walk proposal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrwConfig {
    pub step_size: f64,
}

impl Default for GrwConfig {
    fn default() -> Self {
        Self { step_size: 0.1 }
    }
}

impl GrwConfig {
    /// Sets the proposal standard deviation.
    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }
}

/// Symmetric random-walk proposal `x' = x + step_size * z`.
///
/// Needs no gradients, so any `burn` backend works.
#[derive(Debug)]
pub struct Grw<B, T> {
    target: T,
    config: GrwConfig,
    n_dim: usize,
    cache: ShapeCache,
    _backend: PhantomData<fn() -> B>,
}

impl<B, T> Grw<B, T>
where
    B: Backend,
{
    /// Creates a random-walk kernel for `target` in `n_dim` dimensions.
    ///
    /// Fails with `Error::Config` for a non-positive or non-finite step size.
    pub fn new(target: T, config: GrwConfig, n_dim: usize) -> Result<Self> {
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
    pub fn config(&self) -> &GrwConfig {
        &self.config
    }
}

impl<B, T, D> ProposalKernel<D> for Grw<B, T>
where
    B: Backend,
    T: LogDensity<B, D>,
    D: ConditioningData,
{
    fn name(&self) -> &'static str {
        "GRW"
    }

    fn n_dim(&self) -> usize {
        self.n_dim
    }

    fn shape_cache(&self) -> &ShapeCache {
        &self.cache
    }

    fn log_prob_ensemble(&self, positions: &Array2<f64>, data: &D) -> Result<Array1<f64>> {
        check_dim("GRW position", self.n_dim, positions.ncols())?;
        evaluate_log_prob::<B, D, T>(&self.target, positions, data)
    }

    fn step_lanes(
        &self,
        keys: &[RngKey],
        positions: &Array2<f64>,
        log_probs: &Array1<f64>,
        data: &D,
    ) -> Result<Ensemble> {
        check_dim("GRW lanes", keys.len(), positions.nrows())?;
        check_dim("GRW position", self.n_dim, positions.ncols())?;
        let draws = lane_draws(keys, self.n_dim)?;

        let mut proposed = positions.clone();
        proposed.scaled_add(self.config.step_size, &draws.noise);
        let logp_proposed = self.log_prob_ensemble(&proposed, data)?;

        let mut accepted = Array1::from_elem(keys.len(), false);
        Zip::from(&mut accepted)
            .and(log_probs)
            .and(&logp_proposed)
            .and(&draws.uniforms)
            .for_each(|acc, &lp, &lp_new, &u| *acc = metropolis_accept(lp_new - lp, u));

        Ok(Ensemble::accept_where(
            positions,
            log_probs,
            proposed,
            logp_proposed,
            accepted,
        ))
    }
}
