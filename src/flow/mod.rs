//! Trainable density models used as a global proposal.
//!
//! A [`DensityModel`] is any `burn` module that can evaluate its own log-density and
//! draw samples from a [`RngKey`]. [`AffineFlow`] is the elementwise affine flow
//! `x = loc + exp(log_scale) * z` over a standard-normal base `z`; richer architectures
//! plug in through the same trait.

pub mod buffer;
pub mod proposal;
pub mod train;

pub use buffer::SampleBuffer;
pub use proposal::FlowProposal;
pub use train::{train_flow, FlowState, TrainConfig, TrainOutput};

use crate::error::{check_dim, Error, Result};
use crate::rng::{standard_normal, RngKey};
use burn::module::{Module, Param};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::{Array1, Array2, Axis};
use std::f64::consts::PI;

/// A density model with a tractable log-density and a sampler.
pub trait DensityModel<B: Backend>: Module<B> {
    /// Dimension of the modelled space.
    fn n_dim(&self) -> usize;

    /// Log-density of each row of `x` (`[n, n_dim]` to `[n]`).
    fn log_prob(&self, x: Tensor<B, 2>) -> Tensor<B, 1>;

    /// Draws `n` samples, `[n, n_dim]`. The key is the only source of randomness.
    fn sample(&self, key: RngKey, n: usize) -> Tensor<B, 2>;
}

/// Diagonal affine flow over a standard-normal base.
#[derive(Module, Debug)]
pub struct AffineFlow<B: Backend> {
    loc: Param<Tensor<B, 1>>,
    log_scale: Param<Tensor<B, 1>>,
}

impl<B: Backend> AffineFlow<B> {
    /// Standard normal in `n_dim` dimensions.
    pub fn new(n_dim: usize, device: &B::Device) -> Self {
        Self {
            loc: Param::from_tensor(Tensor::zeros([n_dim], device)),
            log_scale: Param::from_tensor(Tensor::zeros([n_dim], device)),
        }
    }

    /// Matches the per-dimension mean and standard deviation of `samples`.
    ///
    /// Standard deviations are floored at `1e-6` so that constant columns stay finite.
    pub fn from_moments(samples: &Array2<f64>, device: &B::Device) -> Result<Self> {
        if samples.nrows() < 2 {
            return Err(Error::Config(format!(
                "need at least 2 samples to fit moments, got {}",
                samples.nrows()
            )));
        }
        let mean = samples
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::Config("empty sample set".into()))?;
        let log_std = samples
            .std_axis(Axis(0), 1.0)
            .mapv(|s| s.max(1e-6).ln());
        Ok(Self {
            loc: Param::from_tensor(vector(&mean, device)),
            log_scale: Param::from_tensor(vector(&log_std, device)),
        })
    }

    /// Per-dimension shift.
    pub fn loc(&self) -> Tensor<B, 1> {
        self.loc.val()
    }

    /// Per-dimension log standard deviation.
    pub fn log_scale(&self) -> Tensor<B, 1> {
        self.log_scale.val()
    }
}

impl<B: Backend> DensityModel<B> for AffineFlow<B> {
    fn n_dim(&self) -> usize {
        self.loc.val().dims()[0]
    }

    fn log_prob(&self, x: Tensor<B, 2>) -> Tensor<B, 1> {
        let n_dim = self.n_dim() as f64;
        let loc = self.loc.val().unsqueeze::<2>();
        let log_scale = self.log_scale.val();
        let inv_scale = log_scale.clone().neg().exp().unsqueeze::<2>();

        let z = (x - loc) * inv_scale;
        let log_det = log_scale.sum();
        z.powi_scalar(2)
            .sum_dim(1)
            .squeeze::<1>(1)
            .mul_scalar(-0.5)
            .sub(log_det)
            .sub_scalar(0.5 * n_dim * (2.0 * PI).ln())
    }

    fn sample(&self, key: RngKey, n: usize) -> Tensor<B, 2> {
        let n_dim = self.n_dim();
        let device = self.loc.val().device();
        let z = standard_normal(key, n, n_dim);
        let z = Tensor::<B, 2>::from_data(
            TensorData::new(z.into_raw_vec_and_offset().0, [n, n_dim]),
            &device,
        );
        z * self.log_scale.val().exp().unsqueeze::<2>() + self.loc.val().unsqueeze::<2>()
    }
}

fn vector<B: Backend>(values: &Array1<f64>, device: &B::Device) -> Tensor<B, 1> {
    Tensor::from_data(TensorData::new(values.to_vec(), [values.len()]), device)
}

/// Checks that `model` lives in `n_dim` dimensions.
pub(crate) fn check_model_dim<B: Backend, M: DensityModel<B>>(
    model: &M,
    n_dim: usize,
) -> Result<()> {
    check_dim("density model", n_dim, model.n_dim())
}
