//! End-to-end runs of the two-phase sampler on the dual-moon target.

use burn::backend::{Autodiff, NdArray};
use burn::optim::AdamConfig;
use burn::tensor::{Tensor, TensorData};
use flow_mcmc::flow::{AffineFlow, FlowState, TrainConfig};
use flow_mcmc::grw::GrwConfig;
use flow_mcmc::hmc::HmcConfig;
use flow_mcmc::mala::MalaConfig;
use flow_mcmc::local::LocalKernelConfig;
use flow_mcmc::rng::{initialize, standard_normal};
use flow_mcmc::{Sampler, SamplerConfig};

type BackendType = Autodiff<NdArray<f64>>;

const N_DIM: usize = 5;
const N_CHAINS: usize = 2;

fn logsumexp(values: Tensor<BackendType, 2>) -> Tensor<BackendType, 1> {
    let max = values.clone().max_dim(1);
    (values - max.clone()).exp().sum_dim(1).log().add(max).squeeze::<1>(1)
}

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

fn data() -> Tensor<BackendType, 1> {
    Tensor::from_data(
        TensorData::new((0..N_DIM).map(|i| i as f64).collect::<Vec<_>>(), [N_DIM]),
        &Default::default(),
    )
}

fn config(use_global: bool) -> SamplerConfig {
    SamplerConfig::new(N_DIM, N_CHAINS)
        .with_n_local_steps(20)
        .with_n_global_steps(3)
        .with_n_loop_training(2)
        .with_n_loop_production(2)
        .with_use_global(use_global)
        .with_train(TrainConfig::default().with_n_epochs(5).with_batch_size(8))
}

fn run(local: LocalKernelConfig, use_global: bool) {
    let sampler = Sampler::<BackendType, _>::new(config(use_global), local, dual_moon).unwrap();
    let keys = initialize(N_CHAINS, 42);
    let initial = standard_normal(keys.init, N_CHAINS, N_DIM);
    let flow = FlowState::new(
        AffineFlow::<BackendType>::new(N_DIM, &Default::default()),
        AdamConfig::new().init::<BackendType, AffineFlow<BackendType>>(),
    );
    let out = sampler.sample(keys.flow, &initial, &data(), flow).unwrap();

    let steps_per_loop = if use_global { 23 } else { 20 };
    assert_eq!(out.production.positions.dim(), (N_CHAINS, 2 * steps_per_loop, N_DIM));
    assert_eq!(out.training.local_accepted.dim(), (N_CHAINS, 40));
    assert_eq!(out.training.losses.len(), if use_global { 10 } else { 0 });
    assert!(out.training.losses.iter().all(|l| l.is_finite()));
    assert!(out.ensemble.positions.iter().all(|x| x.is_finite()));
    assert!(out.ensemble.log_probs.iter().all(|lp| *lp > f64::NEG_INFINITY));
}

#[test]
fn test_local_only() {
    run(HmcConfig::new(N_DIM).with_step_size(0.01).with_n_leapfrog(5).into(), false);
    run(MalaConfig::default().with_step_size(1e-3).into(), false);
    run(GrwConfig::default().with_step_size(0.02).into(), false);
}

#[test]
fn test_global_sampler() {
    run(HmcConfig::new(N_DIM).with_step_size(0.01).with_n_leapfrog(5).into(), true);
    run(MalaConfig::default().with_step_size(1e-3).into(), true);
    run(GrwConfig::default().with_step_size(0.02).into(), true);
}

#[test]
fn test_trained_flow_is_returned() {
    let local = GrwConfig::default().with_step_size(0.02);
    let sampler = Sampler::<BackendType, _>::new(config(true), local, dual_moon).unwrap();
    let keys = initialize(N_CHAINS, 7);
    let initial = standard_normal(keys.init, N_CHAINS, N_DIM);
    let untrained = AffineFlow::<BackendType>::new(N_DIM, &Default::default());
    let flow = FlowState::new(
        untrained.clone(),
        AdamConfig::new().init::<BackendType, AffineFlow<BackendType>>(),
    );
    let out = sampler.sample(keys.flow, &initial, &data(), flow).unwrap();

    let before = untrained.loc().into_data().to_vec::<f64>().unwrap();
    let after = out.flow.model.loc().into_data().to_vec::<f64>().unwrap();
    assert_ne!(before, after);
}
