use burn::backend::{Autodiff, NdArray};
use burn::tensor::Tensor;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use flow_mcmc::local::{LocalKernel, LocalKernelConfig};
use flow_mcmc::grw::GrwConfig;
use flow_mcmc::hmc::HmcConfig;
use flow_mcmc::mala::MalaConfig;
use flow_mcmc::rng::{standard_normal, RngKey};
use flow_mcmc::ProposalKernel;

type BackendType = Autodiff<NdArray<f64>>;
type Target = fn(Tensor<BackendType, 2>, &()) -> Tensor<BackendType, 1>;

fn log_posterior(x: Tensor<BackendType, 2>, _data: &()) -> Tensor<BackendType, 1> {
    x.powi_scalar(2).sum_dim(1).squeeze::<1>(1).mul_scalar(-0.5)
}

fn bench_run_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_steps");
    group.sample_size(20);

    const N_STEPS: usize = 50;
    let cases = [(16usize, 2usize), (64usize, 10usize), (256usize, 10usize)];

    for &(n_chains, n_dim) in &cases {
        let initial = standard_normal(RngKey::new(123), n_chains, n_dim);
        let configs: [(&str, LocalKernelConfig); 3] = [
            ("hmc", HmcConfig::new(n_dim).with_step_size(0.2).with_n_leapfrog(5).into()),
            ("mala", MalaConfig::default().with_step_size(0.2).into()),
            ("grw", GrwConfig::default().with_step_size(0.5).into()),
        ];

        for (name, config) in configs {
            let kernel =
                LocalKernel::<BackendType, Target>::new(log_posterior, config, n_dim).unwrap();
            kernel.precompile(n_chains, n_dim, N_STEPS, &()).unwrap();
            group.bench_with_input(
                BenchmarkId::new(name, format!("c{n_chains}_d{n_dim}")),
                &(n_chains, n_dim),
                |b, _| b.iter(|| kernel.run_steps(RngKey::new(7), N_STEPS, &initial, &()).unwrap()),
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_run_steps);
criterion_main!(benches);
