//! Runtime choice between the local kernels.

use crate::cache::ShapeCache;
use crate::core::{Ensemble, ProposalKernel};
use crate::error::{check_dim, Result};
use crate::grw::{Grw, GrwConfig};
use crate::hmc::{Hmc, HmcConfig};
use crate::mala::{Mala, MalaConfig};
use crate::rng::RngKey;
use crate::target::{ConditioningData, LogDensity};
use burn::tensor::backend::AutodiffBackend;
use ndarray::{Array1, Array2};

/// Which local kernel to build, with its configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalKernelConfig {
    Hmc(HmcConfig),
    Mala(MalaConfig),
    Grw(GrwConfig),
}

impl From<HmcConfig> for LocalKernelConfig {
    fn from(config: HmcConfig) -> Self {
        Self::Hmc(config)
    }
}

impl From<MalaConfig> for LocalKernelConfig {
    fn from(config: MalaConfig) -> Self {
        Self::Mala(config)
    }
}

impl From<GrwConfig> for LocalKernelConfig {
    fn from(config: GrwConfig) -> Self {
        Self::Grw(config)
    }
}

#[derive(Debug)]
pub enum LocalKernel<B, T> {
    Hmc(Hmc<B, T>),
    Mala(Mala<B, T>),
    Grw(Grw<B, T>),
}

impl<B, T> LocalKernel<B, T>
where
    B: AutodiffBackend,
{
    /// Builds the configured kernel over `n_dim` dimensions.
    ///
    /// # Errors
    ///
    /// Any configuration error of the chosen kernel, or a mismatch between
    /// `n_dim` and the HMC condition matrix.
    pub fn new(target: T, config: impl Into<LocalKernelConfig>, n_dim: usize) -> Result<Self> {
        Ok(match config.into() {
            LocalKernelConfig::Hmc(config) => {
                check_dim("HMC condition_matrix", n_dim, config.n_dim())?;
                Self::Hmc(Hmc::new(target, config)?)
            }
            LocalKernelConfig::Mala(config) => Self::Mala(Mala::new(target, config, n_dim)?),
            LocalKernelConfig::Grw(config) => Self::Grw(Grw::new(target, config, n_dim)?),
        })
    }
}

macro_rules! dispatch {
    ($self:ident, $kernel:ident => $body:expr) => {
        match $self {
            LocalKernel::Hmc($kernel) => $body,
            LocalKernel::Mala($kernel) => $body,
            LocalKernel::Grw($kernel) => $body,
        }
    };
}

impl<B, T, D> ProposalKernel<D> for LocalKernel<B, T>
where
    B: AutodiffBackend,
    T: LogDensity<B, D>,
    D: ConditioningData,
{
    fn name(&self) -> &'static str {
        dispatch!(self, k => ProposalKernel::<D>::name(k))
    }

    fn n_dim(&self) -> usize {
        dispatch!(self, k => ProposalKernel::<D>::n_dim(k))
    }

    fn shape_cache(&self) -> &ShapeCache {
        dispatch!(self, k => ProposalKernel::<D>::shape_cache(k))
    }

    fn log_prob_ensemble(&self, positions: &Array2<f64>, data: &D) -> Result<Array1<f64>> {
        dispatch!(self, k => k.log_prob_ensemble(positions, data))
    }

    fn prime(&self, n_chains: usize, data: &D) -> Result<()> {
        dispatch!(self, k => k.prime(n_chains, data))
    }

    fn step_lanes(
        &self,
        keys: &[RngKey],
        positions: &Array2<f64>,
        log_probs: &Array1<f64>,
        data: &D,
    ) -> Result<Ensemble> {
        dispatch!(self, k => k.step_lanes(keys, positions, log_probs, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::rng::initialize;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Tensor;
    use ndarray::array;

    type BackendType = Autodiff<NdArray<f64>>;
    type Target = fn(Tensor<BackendType, 2>, &()) -> Tensor<BackendType, 1>;

    fn log_posterior(x: Tensor<BackendType, 2>, _data: &()) -> Tensor<BackendType, 1> {
        x.powi_scalar(2).sum_dim(1).squeeze::<1>(1).mul_scalar(-0.5)
    }

    #[test]
    fn builds_each_variant() {
        type Kernel = LocalKernel<BackendType, Target>;
        let hmc = Kernel::new(log_posterior, HmcConfig::new(3), 3).unwrap();
        let mala = Kernel::new(log_posterior, MalaConfig::default(), 3).unwrap();
        let grw = Kernel::new(log_posterior, GrwConfig::default(), 3).unwrap();
        assert_eq!(ProposalKernel::<()>::name(&hmc), "HMC");
        assert_eq!(ProposalKernel::<()>::name(&mala), "MALA");
        assert_eq!(ProposalKernel::<()>::name(&grw), "GRW");
        assert_eq!(ProposalKernel::<()>::n_dim(&grw), 3);
    }

    #[test]
    fn hmc_mass_matrix_must_match_dimension() {
        let err = LocalKernel::<BackendType, Target>::new(log_posterior, HmcConfig::new(2), 3)
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, got: 2, .. }));
    }

    #[test]
    fn delegates_to_the_wrapped_kernel() {
        let config = MalaConfig::default().with_step_size(0.2);
        let wrapped = LocalKernel::<BackendType, Target>::new(log_posterior, config, 2).unwrap();
        let direct = Mala::<BackendType, Target>::new(log_posterior, config, 2).unwrap();
        let positions = array![[0.3, 0.1], [-1.0, 2.0]];
        let a = wrapped.run_steps(RngKey::new(3), 5, &positions, &()).unwrap();
        let b = direct.run_steps(RngKey::new(3), 5, &positions, &()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn per_chain_keys_drive_single_chain_steps() {
        let keys = initialize(3, 11);
        let positions = array![[0.3, 0.1], [-1.0, 2.0], [0.0, -0.5]];
        let configs: [LocalKernelConfig; 2] = [
            MalaConfig::default().with_step_size(0.2).into(),
            GrwConfig::default().with_step_size(0.5).into(),
        ];
        for config in configs {
            let kernel = LocalKernel::<BackendType, Target>::new(log_posterior, config, 2).unwrap();
            let log_probs = kernel.log_prob_ensemble(&positions, &()).unwrap();
            let ensemble = kernel.step_lanes(&keys.chains, &positions, &log_probs, &()).unwrap();
            for (i, key) in keys.chains.iter().enumerate() {
                let state = kernel.kernel(*key, positions.row(i), log_probs[i], &()).unwrap();
                let expected = ensemble.chain(i);
                assert_abs_diff_eq!(state.position, expected.position, epsilon = 1e-12);
                assert_abs_diff_eq!(state.log_prob, expected.log_prob, epsilon = 1e-12);
            }
        }
    }
}
