//! Independence Metropolis-Hastings with a density model as the proposal.
//!
//! Candidates come from the model regardless of the current state, so the acceptance
//! ratio compares importance weights `w(x) = log p(x) - log q(x)`:
//! `min(1, exp(w(x') - w(x)))`.

use super::{check_model_dim, DensityModel};
use crate::cache::ShapeCache;
use crate::core::{Ensemble, ProposalKernel, Trajectory};
use crate::error::{check_dim, Result};
use crate::rng::{metropolis_accept, RngKey};
use crate::target::{evaluate_log_prob, sanitize, to_host, to_tensor, ConditioningData, LogDensity};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::{s, Array1, Array2, Axis};
use rand::Rng;
use rayon::prelude::*;
use std::marker::PhantomData;

/// Global proposal kernel backed by a trained density model.
#[derive(Debug)]
pub struct FlowProposal<B, T, M> {
    target: T,
    model: M,
    cache: ShapeCache,
    _backend: PhantomData<fn() -> B>,
}

impl<B, T, M> FlowProposal<B, T, M>
where
    B: Backend,
    M: DensityModel<B>,
{
    /// Creates a proposal that draws candidates from `model` and scores them under `target`.
    pub fn new(target: T, model: M) -> Self {
        Self {
            target,
            model,
            cache: ShapeCache::new(),
            _backend: PhantomData,
        }
    }

    /// Swaps in a new model, keeping the primed shapes.
    pub fn with_model(mut self, model: M) -> Self {
        self.model = model;
        self
    }

    /// Returns the density model used for proposals.
    pub fn model(&self) -> &M {
        &self.model
    }

    fn model_log_prob(&self, positions: &Array2<f64>) -> Result<Array1<f64>> {
        let values = to_host(self.model.log_prob(to_tensor::<B>(positions)))?;
        check_dim("density model output", positions.nrows(), values.len())?;
        Ok(Array1::from_vec(values).mapv_into(sanitize))
    }

    fn draw(&self, key: RngKey, n: usize) -> Result<Array2<f64>> {
        let n_dim = self.model.n_dim();
        let values = to_host(self.model.sample(key, n))?;
        Ok(Array2::from_shape_vec((n, n_dim), values)?)
    }

    /// `log p(x) - log q(x)` for a batch; NaN where either side is `-inf`.
    fn log_weights<D>(&self, positions: &Array2<f64>, data: &D) -> Result<Array1<f64>>
    where
        T: LogDensity<B, D>,
    {
        let target = evaluate_log_prob::<B, D, T>(&self.target, positions, data)?;
        Ok(target - self.model_log_prob(positions)?)
    }
}

impl<B, T, M, D> ProposalKernel<D> for FlowProposal<B, T, M>
where
    B: Backend,
    T: LogDensity<B, D>,
    M: DensityModel<B>,
    D: ConditioningData,
{
    fn name(&self) -> &'static str {
        "flow"
    }

    fn n_dim(&self) -> usize {
        self.model.n_dim()
    }

    fn shape_cache(&self) -> &ShapeCache {
        &self.cache
    }

    fn log_prob_ensemble(&self, positions: &Array2<f64>, data: &D) -> Result<Array1<f64>> {
        check_dim("flow position", self.model.n_dim(), positions.ncols())?;
        evaluate_log_prob::<B, D, T>(&self.target, positions, data)
    }

    fn prime(&self, n_chains: usize, data: &D) -> Result<()> {
        let zeros = Array2::zeros((n_chains, self.model.n_dim()));
        self.log_weights(&zeros, data).map(|_| ())
    }

    fn step_lanes(
        &self,
        keys: &[RngKey],
        positions: &Array2<f64>,
        log_probs: &Array1<f64>,
        data: &D,
    ) -> Result<Ensemble> {
        check_dim("flow lanes", keys.len(), positions.nrows())?;
        check_model_dim::<B, M>(&self.model, positions.ncols())?;

        let mut uniforms = Array1::zeros(keys.len());
        let mut samples = Vec::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            let (sample_key, accept_key) = key.split();
            samples.push(self.model.sample(sample_key, 1));
            uniforms[i] = accept_key.into_rng().gen::<f64>();
        }
        let n_dim = self.model.n_dim();
        let proposed = if samples.is_empty() {
            Array2::zeros((0, n_dim))
        } else {
            Array2::from_shape_vec((keys.len(), n_dim), to_host(Tensor::cat(samples, 0))?)?
        };

        let logp_proposed = evaluate_log_prob::<B, D, T>(&self.target, &proposed, data)?;
        let weight_proposed = &logp_proposed - &self.model_log_prob(&proposed)?;
        let weight_current = log_probs - &self.model_log_prob(positions)?;

        let accepted: Array1<bool> = (0..keys.len())
            .map(|i| metropolis_accept(weight_proposed[i] - weight_current[i], uniforms[i]))
            .collect();

        Ok(Ensemble::accept_where(
            positions,
            log_probs,
            proposed,
            logp_proposed,
            accepted,
        ))
    }

    /// Runs `n_steps` independence steps per chain.
    ///
    /// All `n_steps` candidates of a chain come from one draw of the model, and the
    /// target and model densities of every candidate are evaluated in one batch. The
    /// accept/reject sweep is then sequential within a chain and parallel across chains.
    fn run_steps(
        &self,
        key: RngKey,
        n_steps: usize,
        initial_positions: &Array2<f64>,
        data: &D,
    ) -> Result<Trajectory> {
        let (n_chains, n_dim) = initial_positions.dim();
        self.precompile(n_chains, n_dim, n_steps, data)?;

        let logp_initial = self.log_prob_ensemble(initial_positions, data)?;
        let weight_initial = &logp_initial - &self.model_log_prob(initial_positions)?;

        let lane_keys: Vec<(RngKey, RngKey)> =
            key.split_n(n_chains).into_iter().map(RngKey::split).collect();

        // Candidates, [n_chains * n_steps, n_dim], chain-major.
        let mut candidates = Array2::zeros((n_chains * n_steps, n_dim));
        for (chain, (sample_key, _)) in lane_keys.iter().enumerate() {
            candidates
                .slice_mut(s![chain * n_steps..(chain + 1) * n_steps, ..])
                .assign(&self.draw(*sample_key, n_steps)?);
        }
        let logp_candidates = evaluate_log_prob::<B, D, T>(&self.target, &candidates, data)?;
        let weight_candidates = &logp_candidates - &self.model_log_prob(&candidates)?;

        let sweeps: Vec<(Array2<f64>, Array1<f64>, Array1<bool>)> = (0..n_chains)
            .into_par_iter()
            .map(|chain| {
                let mut rng = lane_keys[chain].1.into_rng();
                let mut current = initial_positions.row(chain).to_owned();
                let mut current_logp = logp_initial[chain];
                let mut current_weight = weight_initial[chain];

                let mut positions = Array2::zeros((n_steps, n_dim));
                let mut log_probs = Array1::zeros(n_steps);
                let mut accepted = Array1::from_elem(n_steps, false);
                for step in 0..n_steps {
                    let row = chain * n_steps + step;
                    let u: f64 = rng.gen();
                    let accept = metropolis_accept(weight_candidates[row] - current_weight, u);
                    if accept {
                        current.assign(&candidates.row(row));
                        current_logp = logp_candidates[row];
                        current_weight = weight_candidates[row];
                    }
                    positions.row_mut(step).assign(&current);
                    log_probs[step] = current_logp;
                    accepted[step] = accept;
                }
                (positions, log_probs, accepted)
            })
            .collect();

        let mut trajectory = Trajectory::zeros(n_chains, n_steps, n_dim);
        for (chain, (positions, log_probs, accepted)) in sweeps.into_iter().enumerate() {
            trajectory
                .positions
                .index_axis_mut(Axis(0), chain)
                .assign(&positions);
            trajectory.log_probs.row_mut(chain).assign(&log_probs);
            trajectory.accepted.row_mut(chain).assign(&accepted);
        }
        Ok(trajectory)
    }
}
