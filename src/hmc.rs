//! Hamiltonian (Hybrid) Monte Carlo with a dense mass matrix.
//!
//! The sampler works in a data-parallel fashion: gradients for all chains come from a
//! single batched autodiff pass over the target, while momenta and acceptance draws
//! are taken per chain from that chain's own key.
//!
//! With condition matrix `M`, momenta are drawn from `N(0, M^{-1})`, positions move
//! along `M p`, and the kinetic energy is `0.5 p^T M p`. The leapfrog integrator is
//! the usual Störmer-Verlet scheme and is reversible up to rounding.

use crate::cache::ShapeCache;
use crate::core::{Ensemble, ProposalKernel};
use crate::error::{check_dim, check_step_size, Error, Result};
use crate::rng::{lane_draws, metropolis_accept, RngKey};
use crate::target::{evaluate_log_prob, evaluate_with_grad, ConditioningData, LogDensity};
use burn::tensor::backend::AutodiffBackend;
use nalgebra as na;
use ndarray::{Array1, Array2, Axis, Zip};
use std::marker::PhantomData;

/// Configuration of an [`Hmc`] kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct HmcConfig {
    /// The step size for the leapfrog integrator.
    pub step_size: f64,
    /// The number of leapfrog steps to take per HMC update.
    pub n_leapfrog: usize,
    /// Symmetric positive-definite mass matrix, `[n_dim, n_dim]`.
    pub condition_matrix: Array2<f64>,
}

impl HmcConfig {
    /// Identity mass matrix, `step_size = 0.1`, `n_leapfrog = 10`.
    pub fn new(n_dim: usize) -> Self {
        Self {
            step_size: 0.1,
            n_leapfrog: 10,
            condition_matrix: Array2::eye(n_dim),
        }
    }

    /// Sets the leapfrog step size.
    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    /// Sets the number of leapfrog steps per trajectory.
    pub fn with_n_leapfrog(mut self, n_leapfrog: usize) -> Self {
        self.n_leapfrog = n_leapfrog;
        self
    }

    /// Sets the inverse mass matrix. It must be symmetric positive definite.
    pub fn with_condition_matrix(mut self, condition_matrix: Array2<f64>) -> Self {
        self.condition_matrix = condition_matrix;
        self
    }

    /// Dimension implied by the condition matrix.
    pub fn n_dim(&self) -> usize {
        self.condition_matrix.nrows()
    }
}

/// A data-parallel Hamiltonian Monte Carlo kernel.
///
/// # Type Parameters
///
/// * `B`: Autodiff backend from the `burn` crate.
/// * `T`: The target log-density.
#[derive(Debug)]
pub struct Hmc<B, T> {
    target: T,
    config: HmcConfig,
    /// `L^{-1}` for the Cholesky factor `M = L L^T`; maps standard normal rows to
    /// momenta with covariance `M^{-1}`.
    momentum_transform: Array2<f64>,
    cache: ShapeCache,
    _backend: PhantomData<fn() -> B>,
}

impl<B, T> Hmc<B, T>
where
    B: AutodiffBackend,
{
    /// Create a new HMC kernel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the step size is not positive, `n_leapfrog` is
    /// zero, or the condition matrix is not square, symmetric and positive-definite.
    pub fn new(target: T, config: HmcConfig) -> Result<Self> {
        check_step_size(config.step_size)?;
        if config.n_leapfrog == 0 {
            return Err(Error::Config("n_leapfrog must be at least 1".into()));
        }
        let momentum_transform = momentum_transform(&config.condition_matrix)?;
        Ok(Self {
            target,
            config,
            momentum_transform,
            cache: ShapeCache::new(),
            _backend: PhantomData,
        })
    }

    /// Returns the kernel configuration.
    pub fn config(&self) -> &HmcConfig {
        &self.config
    }

    /// Returns the log-density.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Kinetic energy `0.5 p^T M p` of each momentum row.
    fn kinetic_energy(&self, momenta: &Array2<f64>) -> Array1<f64> {
        let scaled = momenta.dot(&self.config.condition_matrix);
        (&scaled * momenta).sum_axis(Axis(1)) * 0.5
    }

    /// Runs the leapfrog integrator from `(positions, momenta)` for all chains.
    ///
    /// Each of the `n_leapfrog` iterations does a half-step on the momenta along the
    /// log-density gradient, a full step on the positions along `M p`, and another
    /// momentum half-step. Gradients are reused between consecutive iterations.
    ///
    /// # Returns
    ///
    /// The new positions, the new momenta, and the log-density at the new positions.
    pub fn leapfrog<D>(
        &self,
        positions: &Array2<f64>,
        momenta: &Array2<f64>,
        data: &D,
    ) -> Result<(Array2<f64>, Array2<f64>, Array1<f64>)>
    where
        T: LogDensity<B, D>,
    {
        let (_, grad) = evaluate_with_grad::<B, D, T>(&self.target, positions, data)?;
        self.leapfrog_from(positions.clone(), momenta.clone(), grad, data)
    }

    fn leapfrog_from<D>(
        &self,
        mut pos: Array2<f64>,
        mut mom: Array2<f64>,
        mut grad: Array2<f64>,
        data: &D,
    ) -> Result<(Array2<f64>, Array2<f64>, Array1<f64>)>
    where
        T: LogDensity<B, D>,
    {
        let eps = self.config.step_size;
        let half = 0.5 * eps;
        let mut logp = Array1::zeros(pos.nrows());

        for _ in 0..self.config.n_leapfrog {
            // Half-step momentum update.
            mom.scaled_add(half, &grad);

            // Full-step position update.
            let velocity = mom.dot(&self.config.condition_matrix);
            pos.scaled_add(eps, &velocity);

            // Gradient at the new positions, then the second half-step.
            let (new_logp, new_grad) = evaluate_with_grad::<B, D, T>(&self.target, &pos, data)?;
            grad = new_grad;
            logp = new_logp;
            mom.scaled_add(half, &grad);
        }
        Ok((pos, mom, logp))
    }
}

impl<B, T, D> ProposalKernel<D> for Hmc<B, T>
where
    B: AutodiffBackend,
    T: LogDensity<B, D>,
    D: ConditioningData,
{
    fn name(&self) -> &'static str {
        "HMC"
    }

    fn n_dim(&self) -> usize {
        self.config.n_dim()
    }

    fn shape_cache(&self) -> &ShapeCache {
        &self.cache
    }

    fn log_prob_ensemble(&self, positions: &Array2<f64>, data: &D) -> Result<Array1<f64>> {
        check_dim("HMC position", self.config.n_dim(), positions.ncols())?;
        evaluate_log_prob::<B, D, T>(&self.target, positions, data)
    }

    fn prime(&self, n_chains: usize, data: &D) -> Result<()> {
        let zeros = Array2::zeros((n_chains, self.config.n_dim()));
        evaluate_with_grad::<B, D, T>(&self.target, &zeros, data).map(|_| ())
    }

    /// Perform one batched HMC update.
    ///
    /// 1) Draw momenta from `N(0, M^{-1})`, one row per lane.
    /// 2) Run the leapfrog integrator to propose new positions.
    /// 3) Accept each lane with probability `min(1, exp(H_before - H_after))`.
    fn step_lanes(
        &self,
        keys: &[RngKey],
        positions: &Array2<f64>,
        log_probs: &Array1<f64>,
        data: &D,
    ) -> Result<Ensemble> {
        check_dim("HMC lanes", keys.len(), positions.nrows())?;
        check_dim("HMC position", self.config.n_dim(), positions.ncols())?;
        let draws = lane_draws(keys, self.config.n_dim())?;

        // 1) Momenta.
        let momenta = draws.noise.dot(&self.momentum_transform);

        // Hamiltonian before integration: potential (-log p) plus kinetic energy.
        let h_current = self.kinetic_energy(&momenta) - log_probs;

        // 2) Leapfrog.
        let (_, grad) = evaluate_with_grad::<B, D, T>(&self.target, positions, data)?;
        let (proposed, proposed_momenta, logp_proposed) =
            self.leapfrog_from(positions.clone(), momenta, grad, data)?;
        let h_proposed = self.kinetic_energy(&proposed_momenta) - &logp_proposed;

        // 3) Accept/reject each proposal.
        let mut accepted = Array1::from_elem(keys.len(), false);
        Zip::from(&mut accepted)
            .and(&h_current)
            .and(&h_proposed)
            .and(&draws.uniforms)
            .for_each(|acc, &h0, &h1, &u| *acc = metropolis_accept(h0 - h1, u));

        Ok(Ensemble::accept_where(
            positions,
            log_probs,
            proposed,
            logp_proposed,
            accepted,
        ))
    }
}

/// Validates the mass matrix and returns `L^{-1}` for its Cholesky factor `L`.
fn momentum_transform(condition_matrix: &Array2<f64>) -> Result<Array2<f64>> {
    let (rows, cols) = condition_matrix.dim();
    if rows == 0 || rows != cols {
        return Err(Error::Config(format!(
            "condition_matrix must be square and non-empty, got {rows}x{cols}"
        )));
    }
    let scale = condition_matrix
        .iter()
        .fold(0.0_f64, |acc, x| acc.max(x.abs()))
        .max(1.0);
    for i in 0..rows {
        for j in 0..i {
            if (condition_matrix[[i, j]] - condition_matrix[[j, i]]).abs() > 1e-10 * scale {
                return Err(Error::Config("condition_matrix must be symmetric".into()));
            }
        }
    }

    let m = na::DMatrix::from_fn(rows, cols, |i, j| condition_matrix[[i, j]]);
    let chol = na::Cholesky::new(m)
        .ok_or_else(|| Error::Config("condition_matrix must be positive-definite".into()))?;
    let l_inv = chol
        .l()
        .try_inverse()
        .ok_or_else(|| Error::Config("condition_matrix is numerically singular".into()))?;
    Ok(Array2::from_shape_fn((rows, cols), |(i, j)| l_inv[(i, j)]))
}
