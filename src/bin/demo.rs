//! Samples a bimodal "dual moon" posterior with HMC plus a flow global proposal and
//! prints summary statistics.
//!
//! Set `RUST_LOG=debug` for per-loop output.

use burn::backend::{Autodiff, NdArray};
use burn::optim::AdamConfig;
use burn::tensor::{Tensor, TensorData};
use flow_mcmc::flow::{AffineFlow, FlowState, TrainConfig};
use flow_mcmc::hmc::HmcConfig;
use flow_mcmc::rng::{initialize, standard_normal};
use flow_mcmc::sampler::{Sampler, SamplerConfig};
use ndarray::Axis;
use std::error::Error;
use tracing_subscriber::EnvFilter;

type BackendType = Autodiff<NdArray<f64>>;

const N_DIM: usize = 5;
const N_CHAINS: usize = 20;
const SEED: u64 = 42;

/// Row-wise `log(exp(a_1) + ... + exp(a_k))` of `[n, k]` to `[n]`.
fn logsumexp(values: Tensor<BackendType, 2>) -> Tensor<BackendType, 1> {
    let max = values.clone().max_dim(1);
    (values - max.clone())
        .exp()
        .sum_dim(1)
        .log()
        .add(max)
        .squeeze::<1>(1)
}

/// A ring of radius 2 around `data`, modulated by two bimodal factors on the first
/// two coordinates.
fn dual_moon(x: Tensor<BackendType, 2>, data: &Tensor<BackendType, 1>) -> Tensor<BackendType, 1> {
    let [n, _] = x.dims();
    let device = x.device();

    let radius = (x.clone() - data.clone().unsqueeze::<2>())
        .powi_scalar(2)
        .sum_dim(1)
        .sqrt()
        .squeeze::<1>(1);
    let ring = radius.sub_scalar(2.0).div_scalar(0.1).powi_scalar(2).mul_scalar(0.5);

    let shifts =
        Tensor::<BackendType, 2>::from_data(TensorData::new(vec![-3.0, 3.0], [1, 2]), &device);
    let x0 = x.clone().slice([0..n, 0..1]);
    let x1 = x.slice([0..n, 1..2]);
    let mode0 = (x0 + shifts.clone()).div_scalar(0.8).powi_scalar(2).mul_scalar(-0.5);
    let mode1 = (x1 + shifts).div_scalar(0.6).powi_scalar(2).mul_scalar(-0.5);

    (ring - logsumexp(mode0) - logsumexp(mode1)).neg()
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let device = Default::default();
    let data = Tensor::<BackendType, 1>::from_data(
        TensorData::new((0..N_DIM).map(|i| i as f64).collect::<Vec<_>>(), [N_DIM]),
        &device,
    );

    let config = SamplerConfig::new(N_DIM, N_CHAINS)
        .with_n_local_steps(100)
        .with_n_global_steps(100)
        .with_n_loop_training(5)
        .with_n_loop_production(5)
        .with_train(
            TrainConfig::default()
                .with_n_epochs(20)
                .with_batch_size(500)
                .with_learning_rate(1e-2),
        )
        .with_progress(true);
    let local = HmcConfig::new(N_DIM).with_step_size(0.01).with_n_leapfrog(10);
    let sampler = Sampler::<BackendType, _>::new(config, local, dual_moon)?;

    let keys = initialize(N_CHAINS, SEED);
    let initial = standard_normal(keys.init, N_CHAINS, N_DIM);
    let flow = FlowState::new(
        AffineFlow::<BackendType>::new(N_DIM, &device),
        AdamConfig::new().init::<BackendType, AffineFlow<BackendType>>(),
    );

    let out = sampler.sample(keys.flow, &initial, &data, flow)?;

    let production = &out.production;
    let n_samples = production.positions.shape()[0] * production.positions.shape()[1];
    let samples = production
        .positions
        .to_shape((n_samples, N_DIM))?
        .to_owned();
    println!("Generated {} samples", n_samples);
    if let Some(mean) = samples.mean_axis(Axis(0)) {
        println!("Posterior mean: {:.3}", mean);
    }
    println!("Posterior std:  {:.3}", samples.std_axis(Axis(0), 1.0));
    println!(
        "Local acceptance:  {:.3}",
        production.local_acceptance_rate().mean().unwrap_or(0.0)
    );
    println!(
        "Global acceptance: {:.3}",
        production.global_acceptance_rate().mean().unwrap_or(0.0)
    );
    println!("Training losses: {:.3?}", out.training.losses);
    if let Ok(rhat) = production.rhat() {
        println!("R-hat: {:.3}", rhat);
    }
    Ok(())
}
