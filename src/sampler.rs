//! Two-phase flow-assisted ensemble sampler.
//!
//! Each loop of a phase runs the local kernel for `n_local_steps`, then (with
//! `use_global`) retrains the density model on those samples (training phase only) and
//! runs the flow proposal for `n_global_steps`. The production phase repeats the same
//! loop with the model frozen.
//!
//! # Example
//!
//! ```rust,no_run
//! use burn::backend::{Autodiff, NdArray};
//! use burn::optim::AdamConfig;
//! use burn::tensor::Tensor;
//! use flow_mcmc::flow::{AffineFlow, FlowState};
//! use flow_mcmc::hmc::HmcConfig;
//! use flow_mcmc::rng::{initialize, standard_normal};
//! use flow_mcmc::sampler::{Sampler, SamplerConfig};
//!
//! type B = Autodiff<NdArray<f64>>;
//!
//! let target = |x: Tensor<B, 2>, _data: &()| {
//!     x.powi_scalar(2).sum_dim(1).squeeze::<1>(1).mul_scalar(-0.5)
//! };
//! let config = SamplerConfig::new(2, 8);
//! let sampler = Sampler::<B, _>::new(config, HmcConfig::new(2), target).unwrap();
//!
//! let keys = initialize(8, 42);
//! let initial = standard_normal(keys.init, 8, 2);
//! let flow = FlowState::new(
//!     AffineFlow::<B>::new(2, &Default::default()),
//!     AdamConfig::new().init::<B, AffineFlow<B>>(),
//! );
//! let out = sampler.sample(keys.flow, &initial, &(), flow).unwrap();
//! println!("{:?}", out.production.local_acceptance_rate());
//! ```

use crate::core::{Ensemble, ProposalKernel, Trajectory};
use crate::error::{check_dim, Error, Result};
use crate::flow::{
    check_model_dim, train_flow, DensityModel, FlowProposal, FlowState, SampleBuffer, TrainConfig,
};
use crate::local::{LocalKernel, LocalKernelConfig};
use crate::rng::RngKey;
use crate::stats::{acceptance_rate, max_rhat, potential_scale_reduction};
use crate::target::{ConditioningData, LogDensity};
use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{concatenate, Array1, Array2, Array3, Axis};
use std::fmt;

/// Run configuration of a [`Sampler`].
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    /// Dimension of each chain.
    pub n_dim: usize,
    /// Number of chains run in parallel.
    pub n_chains: usize,
    /// Local kernel steps per loop.
    pub n_local_steps: usize,
    /// Global proposal steps per loop.
    pub n_global_steps: usize,
    /// Loops in the training phase.
    pub n_loop_training: usize,
    /// Loops in the production phase, with the model frozen.
    pub n_loop_production: usize,
    /// Train the density model and run global steps. Without it the sampler is a
    /// plain local-kernel ensemble and never touches the model.
    pub use_global: bool,
    /// Flow training and buffer settings.
    pub train: TrainConfig,
    /// Show a progress bar per phase.
    pub progress: bool,
}

impl SamplerConfig {
    /// Creates a configuration with default step and loop counts.
    ///
    /// # Parameters
    /// * `n_dim` - Dimension of each chain.
    /// * `n_chains` - Number of chains in the ensemble.
    ///
    /// # Returns
    /// 50 local and 50 global steps per loop, 5 training and 5 production loops, global
    /// steps enabled and no progress bar.
    pub fn new(n_dim: usize, n_chains: usize) -> Self {
        Self {
            n_dim,
            n_chains,
            n_local_steps: 50,
            n_global_steps: 50,
            n_loop_training: 5,
            n_loop_production: 5,
            use_global: true,
            train: TrainConfig::default(),
            progress: false,
        }
    }

    /// Sets the local steps per loop.
    pub fn with_n_local_steps(mut self, n_local_steps: usize) -> Self {
        self.n_local_steps = n_local_steps;
        self
    }

    /// Sets the global steps per loop.
    pub fn with_n_global_steps(mut self, n_global_steps: usize) -> Self {
        self.n_global_steps = n_global_steps;
        self
    }

    /// Sets the number of training loops.
    pub fn with_n_loop_training(mut self, n_loop_training: usize) -> Self {
        self.n_loop_training = n_loop_training;
        self
    }

    /// Sets the number of production loops.
    pub fn with_n_loop_production(mut self, n_loop_production: usize) -> Self {
        self.n_loop_production = n_loop_production;
        self
    }

    /// Enables or disables flow training and global steps.
    pub fn with_use_global(mut self, use_global: bool) -> Self {
        self.use_global = use_global;
        self
    }

    /// Replaces the training configuration.
    pub fn with_train(mut self, train: TrainConfig) -> Self {
        self.train = train;
        self
    }

    /// Shows or hides the progress bar.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Rejects empty ensembles and zero local steps, and checks the training
    /// configuration when global steps are enabled.
    pub fn validate(&self) -> Result<()> {
        if self.n_dim == 0 || self.n_chains == 0 || self.n_local_steps == 0 {
            return Err(Error::Config(
                "n_dim, n_chains and n_local_steps must be at least 1".into(),
            ));
        }
        if self.use_global {
            self.train.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Training,
    Production,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Training => write!(f, "training"),
            Phase::Production => write!(f, "production"),
        }
    }
}

/// Everything recorded during one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseHistory {
    /// `[n_chains, n_steps, n_dim]`, local and global steps in execution order.
    pub positions: Array3<f64>,
    /// `[n_chains, n_steps]`, matching `positions`.
    pub log_probs: Array2<f64>,
    /// `[n_chains, n_local_steps * n_loops]`.
    pub local_accepted: Array2<bool>,
    /// `[n_chains, n_global_steps * n_loops]`; empty without global steps.
    pub global_accepted: Array2<bool>,
    /// Mean training loss of every epoch; empty in production.
    pub losses: Vec<f64>,
}

impl PhaseHistory {
    fn new(n_chains: usize, n_dim: usize) -> Self {
        Self {
            positions: Array3::zeros((n_chains, 0, n_dim)),
            log_probs: Array2::zeros((n_chains, 0)),
            local_accepted: Array2::from_elem((n_chains, 0), false),
            global_accepted: Array2::from_elem((n_chains, 0), false),
            losses: Vec::new(),
        }
    }

    fn append(&mut self, trajectory: &Trajectory, global: bool) -> Result<()> {
        let positions = concatenate(
            Axis(1),
            &[self.positions.view(), trajectory.positions.view()],
        )?;
        let log_probs = concatenate(
            Axis(1),
            &[self.log_probs.view(), trajectory.log_probs.view()],
        )?;
        let accepted = if global {
            &mut self.global_accepted
        } else {
            &mut self.local_accepted
        };
        let merged = concatenate(Axis(1), &[accepted.view(), trajectory.accepted.view()])?;
        *accepted = merged;
        self.positions = positions;
        self.log_probs = log_probs;
        Ok(())
    }

    /// Number of recorded steps per chain.
    pub fn n_steps(&self) -> usize {
        self.positions.shape()[1]
    }

    /// Per-chain acceptance rate of the local steps.
    pub fn local_acceptance_rate(&self) -> Array1<f64> {
        acceptance_rate(&self.local_accepted)
    }

    /// Per-chain acceptance rate of the global steps.
    pub fn global_acceptance_rate(&self) -> Array1<f64> {
        acceptance_rate(&self.global_accepted)
    }

    /// Per-dimension R-hat over the whole phase.
    pub fn rhat(&self) -> Result<Array1<f64>> {
        potential_scale_reduction(self.positions.view())
    }
}

/// Result of [`Sampler::sample`].
pub struct SamplerOutput<B, M, O> {
    /// Chain states after the last step.
    pub ensemble: Ensemble,
    /// Everything recorded while the model was being trained.
    pub training: PhaseHistory,
    /// Everything recorded with the model frozen.
    pub production: PhaseHistory,
    /// The density model and optimizer state after training.
    pub flow: FlowState<B, M, O>,
}

/// Flow-assisted ensemble sampler.
///
/// # Type Parameters
///
/// * `B`: Autodiff backend from the `burn` crate.
/// * `T`: The target log-density, shared by the local kernel and the flow proposal.
pub struct Sampler<B, T> {
    config: SamplerConfig,
    local: LocalKernel<B, T>,
    target: T,
}

impl<B, T> Sampler<B, T>
where
    B: AutodiffBackend,
    T: Clone,
{
    /// Validates the run configuration and builds the local kernel.
    pub fn new(
        config: SamplerConfig,
        local: impl Into<LocalKernelConfig>,
        target: T,
    ) -> Result<Self> {
        config.validate()?;
        let local = LocalKernel::new(target.clone(), local, config.n_dim)?;
        Ok(Self {
            config,
            local,
            target,
        })
    }

    /// Returns the run configuration.
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Returns the local kernel built from the configuration.
    pub fn local_kernel(&self) -> &LocalKernel<B, T> {
        &self.local
    }

    /// Runs the training phase, then the production phase.
    ///
    /// # Parameters
    ///
    /// * `key`: Root of every random draw in the run.
    /// * `initial_positions`: Starting points, `[n_chains, n_dim]`.
    /// * `data`: Conditioning data passed to every log-density evaluation.
    /// * `flow`: Initial density model and optimizer state.
    ///
    /// # Errors
    ///
    /// Dimension mismatches of the initial positions or the model, and
    /// [`Error::TrainingDivergence`], which aborts the run.
    pub fn sample<D, M, O>(
        &self,
        key: RngKey,
        initial_positions: &Array2<f64>,
        data: &D,
        flow: FlowState<B, M, O>,
    ) -> Result<SamplerOutput<B, M, O>>
    where
        D: ConditioningData,
        T: LogDensity<B, D>,
        M: DensityModel<B> + AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let config = &self.config;
        check_dim("initial chains", config.n_chains, initial_positions.nrows())?;
        check_dim("initial position", config.n_dim, initial_positions.ncols())?;
        if config.use_global {
            check_model_dim::<B, M>(&flow.model, config.n_dim)?;
        }

        let log_probs = self.local.log_prob_ensemble(initial_positions, data)?;
        let mut run = RunState {
            key,
            ensemble: Ensemble::new(initial_positions.clone(), log_probs)?,
            proposal: None,
        };

        log::info!(
            "sampling {} chains in {} dimensions with {} ({} training + {} production loops)",
            config.n_chains,
            config.n_dim,
            ProposalKernel::<D>::name(&self.local),
            config.n_loop_training,
            config.n_loop_production,
        );
        let (training, flow) = self.run_phase(Phase::Training, &mut run, flow, data)?;
        let (production, flow) = self.run_phase(Phase::Production, &mut run, flow, data)?;

        if let Ok(rhat) = production.rhat() {
            log::info!("production max R-hat: {:.4}", max_rhat(&rhat));
        }

        Ok(SamplerOutput {
            ensemble: run.ensemble,
            training,
            production,
            flow,
        })
    }

    fn run_phase<D, M, O>(
        &self,
        phase: Phase,
        run: &mut RunState<B, T, M>,
        flow: FlowState<B, M, O>,
        data: &D,
    ) -> Result<(PhaseHistory, FlowState<B, M, O>)>
    where
        D: ConditioningData,
        T: LogDensity<B, D>,
        M: DensityModel<B> + AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let config = &self.config;
        let n_loops = match phase {
            Phase::Training => config.n_loop_training,
            Phase::Production => config.n_loop_production,
        };
        let mut history = PhaseHistory::new(config.n_chains, config.n_dim);
        let pb = progress_bar(config.progress, n_loops, phase);
        let mut flow = flow;

        for i in 0..n_loops {
            // Local exploration.
            let local_key = run.next_key();
            let local = self
                .local
                .run_steps(local_key, config.n_local_steps, &run.ensemble.positions, data)?;
            history.append(&local, false)?;
            run.ensemble = last_ensemble(&local)?;

            if config.use_global {
                if phase == Phase::Training {
                    let train_key = run.next_key();
                    let buffer = SampleBuffer::from_trajectory(
                        &local,
                        config.train.thinning,
                        config.train.max_samples,
                    )?;
                    let out = train_flow(train_key, flow, &buffer, &config.train)?;
                    history.losses.extend_from_slice(&out.epoch_losses);
                    flow = out.state;
                }

                if config.n_global_steps > 0 {
                    let global_key = run.next_key();
                    let model = flow.model.clone().no_grad();
                    let proposal = match run.proposal.take() {
                        Some(proposal) => proposal.with_model(model),
                        None => FlowProposal::new(self.target.clone(), model),
                    };
                    let global = proposal.run_steps(
                        global_key,
                        config.n_global_steps,
                        &run.ensemble.positions,
                        data,
                    )?;
                    run.proposal = Some(proposal);
                    history.append(&global, true)?;
                    run.ensemble = last_ensemble(&global)?;
                }
            }

            let local_rate = mean(&acceptance_rate(&local.accepted));
            log::debug!(
                "{} loop {}/{}: local acceptance {:.3}, loss {:?}",
                phase,
                i + 1,
                n_loops,
                local_rate,
                history.losses.last()
            );
            pb.inc(1);
            pb.set_message(format!(
                "p(local)≈{:.2} p(global)≈{:.2}",
                local_rate,
                mean(&history.global_acceptance_rate())
            ));
        }
        pb.finish_with_message("Done!");

        if n_loops > 0 {
            let local_rate = history.local_acceptance_rate();
            log::info!(
                "{} phase done: local acceptance {:.3}, global acceptance {:.3}",
                phase,
                mean(&local_rate),
                mean(&history.global_acceptance_rate())
            );
            let stuck = local_rate.iter().filter(|&&r| r == 0.0).count();
            if stuck > 0 {
                log::warn!(
                    "{} chain(s) accepted no local proposals during the {} phase",
                    stuck,
                    phase
                );
            }
            if let Some(loss) = history.losses.last() {
                log::info!("final {} loss: {:.4}", phase, loss);
            }
        }
        Ok((history, flow))
    }
}

/// State threaded through both phases.
struct RunState<B, T, M> {
    key: RngKey,
    ensemble: Ensemble,
    proposal: Option<FlowProposal<B, T, M>>,
}

impl<B, T, M> RunState<B, T, M> {
    fn next_key(&mut self) -> RngKey {
        let (next, use_key) = self.key.split();
        self.key = next;
        use_key
    }
}

fn last_ensemble(trajectory: &Trajectory) -> Result<Ensemble> {
    trajectory
        .last()
        .ok_or_else(|| Error::Config("a segment must run at least one step".into()))
}

fn mean(values: &Array1<f64>) -> f64 {
    values.mean().unwrap_or(0.0)
}

fn progress_bar(show: bool, n_loops: usize, phase: Phase) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(n_loops as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("{prefix:10} {bar:40.white} ETA {eta:3} | {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_prefix(phase.to_string());
    pb
}
