//! Chain state, trajectories, and the capability trait shared by every kernel.
//!
//! A kernel only has to say how to advance a batch of lanes given one key per lane
//! ([`ProposalKernel::step_lanes`]). Single-chain steps, ensemble steps, multi-step
//! runs and precompilation are derived from that in the same way for all kernels.

use crate::cache::{ShapeCache, ShapeSignature};
use crate::error::{check_dim, Result};
use crate::rng::RngKey;
use crate::target::ConditioningData;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis};

/// The state of a single chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    /// Current position.
    pub position: Array1<f64>,
    /// Log-density at `position`.
    pub log_prob: f64,
    /// Whether the step that produced this state accepted its proposal.
    pub accepted: bool,
}

/// The states of all chains, stored row-wise (`[n_chains, n_dim]`).
#[derive(Debug, Clone, PartialEq)]
pub struct Ensemble {
    pub positions: Array2<f64>,
    pub log_probs: Array1<f64>,
    pub accepted: Array1<bool>,
}

impl Ensemble {
    /// Creates an ensemble with no step taken yet.
    pub fn new(positions: Array2<f64>, log_probs: Array1<f64>) -> Result<Self> {
        check_dim("ensemble log-probs", positions.nrows(), log_probs.len())?;
        let accepted = Array1::from_elem(positions.nrows(), false);
        Ok(Self {
            positions,
            log_probs,
            accepted,
        })
    }

    /// Number of chains.
    pub fn n_chains(&self) -> usize {
        self.positions.nrows()
    }

    /// Dimension of each chain.
    pub fn n_dim(&self) -> usize {
        self.positions.ncols()
    }

    /// The state of chain `i`.
    pub fn chain(&self, i: usize) -> ChainState {
        ChainState {
            position: self.positions.row(i).to_owned(),
            log_prob: self.log_probs[i],
            accepted: self.accepted[i],
        }
    }

    /// Keeps the proposal for accepted lanes and the current state for the rest.
    pub(crate) fn accept_where(
        positions: &Array2<f64>,
        log_probs: &Array1<f64>,
        mut proposed: Array2<f64>,
        mut proposed_log_probs: Array1<f64>,
        accepted: Array1<bool>,
    ) -> Self {
        for (i, &acc) in accepted.iter().enumerate() {
            if !acc {
                proposed.row_mut(i).assign(&positions.row(i));
                proposed_log_probs[i] = log_probs[i];
            }
        }
        Self {
            positions: proposed,
            log_probs: proposed_log_probs,
            accepted,
        }
    }
}

/// The per-step record of a multi-step run.
///
/// Positions are `[n_chains, n_steps, n_dim]`; log-probs and acceptance flags are
/// `[n_chains, n_steps]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub positions: Array3<f64>,
    pub log_probs: Array2<f64>,
    pub accepted: Array2<bool>,
}

impl Trajectory {
    pub(crate) fn zeros(n_chains: usize, n_steps: usize, n_dim: usize) -> Self {
        Self {
            positions: Array3::zeros((n_chains, n_steps, n_dim)),
            log_probs: Array2::zeros((n_chains, n_steps)),
            accepted: Array2::from_elem((n_chains, n_steps), false),
        }
    }

    pub(crate) fn record(&mut self, step: usize, ensemble: &Ensemble) {
        self.positions
            .slice_mut(s![.., step, ..])
            .assign(&ensemble.positions);
        self.log_probs
            .column_mut(step)
            .assign(&ensemble.log_probs);
        self.accepted.column_mut(step).assign(&ensemble.accepted);
    }

    /// Number of chains.
    pub fn n_chains(&self) -> usize {
        self.positions.shape()[0]
    }

    /// Number of recorded steps.
    pub fn n_steps(&self) -> usize {
        self.positions.shape()[1]
    }

    /// Dimension of each chain.
    pub fn n_dim(&self) -> usize {
        self.positions.shape()[2]
    }

    /// The ensemble after the final step, or `None` for an empty run.
    pub fn last(&self) -> Option<Ensemble> {
        let last = self.n_steps().checked_sub(1)?;
        Some(Ensemble {
            positions: self.positions.index_axis(Axis(1), last).to_owned(),
            log_probs: self.log_probs.column(last).to_owned(),
            accepted: self.accepted.column(last).to_owned(),
        })
    }

    /// Fraction of accepted steps, per chain.
    pub fn acceptance_rate(&self) -> Array1<f64> {
        crate::stats::acceptance_rate(&self.accepted)
    }
}

/// A Markov kernel over an ensemble of independent chains.
///
/// Implementors provide [`step_lanes`](ProposalKernel::step_lanes), which advances
/// lane `i` using only `keys[i]`. The remaining operations are shared.
pub trait ProposalKernel<D: ConditioningData> {
    /// Short human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Dimension of the state space.
    fn n_dim(&self) -> usize;

    /// The cache consulted by [`precompile`](ProposalKernel::precompile).
    fn shape_cache(&self) -> &ShapeCache;

    /// Log-density of the kernel's target for a batch of positions.
    fn log_prob_ensemble(&self, positions: &Array2<f64>, data: &D) -> Result<Array1<f64>>;

    /// Advances every lane by one step.
    ///
    /// `keys`, `positions` and `log_probs` have one entry per lane. The result must
    /// depend on lane `i`'s inputs and key only.
    fn step_lanes(
        &self,
        keys: &[RngKey],
        positions: &Array2<f64>,
        log_probs: &Array1<f64>,
        data: &D,
    ) -> Result<Ensemble>;

    /// Warms up evaluation at `[n_chains, n_dim]`.
    fn prime(&self, n_chains: usize, data: &D) -> Result<()> {
        let zeros = Array2::zeros((n_chains, self.n_dim()));
        self.log_prob_ensemble(&zeros, data).map(|_| ())
    }

    /// One step of a single chain. A pure function of its arguments.
    fn kernel(
        &self,
        key: RngKey,
        position: ArrayView1<f64>,
        log_prob: f64,
        data: &D,
    ) -> Result<ChainState> {
        check_dim("kernel position", self.n_dim(), position.len())?;
        let positions = position.to_owned().insert_axis(Axis(0));
        let log_probs = Array1::from_elem(1, log_prob);
        let out = self.step_lanes(&[key], &positions, &log_probs, data)?;
        Ok(out.chain(0))
    }

    /// One step of every chain; `key` is split into one substream per chain.
    ///
    /// Row `i` of the result equals `kernel(key.split_n(n)[i], ...)` on row `i`.
    fn kernel_parallel(
        &self,
        key: RngKey,
        positions: &Array2<f64>,
        log_probs: &Array1<f64>,
        data: &D,
    ) -> Result<Ensemble> {
        check_dim("ensemble position", self.n_dim(), positions.ncols())?;
        check_dim("ensemble log-probs", positions.nrows(), log_probs.len())?;
        let keys = key.split_n(positions.nrows());
        self.step_lanes(&keys, positions, log_probs, data)
    }

    /// Runs `n_steps` sequential ensemble steps from `initial_positions`.
    fn run_steps(
        &self,
        key: RngKey,
        n_steps: usize,
        initial_positions: &Array2<f64>,
        data: &D,
    ) -> Result<Trajectory> {
        let (n_chains, n_dim) = initial_positions.dim();
        self.precompile(n_chains, n_dim, n_steps, data)?;

        let log_probs = self.log_prob_ensemble(initial_positions, data)?;
        let mut ensemble = Ensemble::new(initial_positions.clone(), log_probs)?;
        let mut trajectory = Trajectory::zeros(n_chains, n_steps, n_dim);

        let mut key = key;
        for step in 0..n_steps {
            let (next, step_key) = key.split();
            key = next;
            ensemble =
                self.kernel_parallel(step_key, &ensemble.positions, &ensemble.log_probs, data)?;
            trajectory.record(step, &ensemble);
        }
        Ok(trajectory)
    }

    /// Primes the evaluation path for this shape signature ahead of time.
    ///
    /// Has no effect on sampled values; a signature is primed at most once.
    fn precompile(&self, n_chains: usize, n_dim: usize, n_steps: usize, data: &D) -> Result<()> {
        check_dim("precompile n_dim", self.n_dim(), n_dim)?;
        let signature = ShapeSignature {
            n_chains,
            n_dim,
            n_steps,
            data_shape: data.shape(),
        };
        self.shape_cache()
            .ensure(signature, || self.prime(n_chains, data))
            .map(|_| ())
    }
}
