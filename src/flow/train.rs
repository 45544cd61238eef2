//! Maximum-likelihood training of a density model on chain samples.

use super::{check_model_dim, DensityModel, SampleBuffer};
use crate::error::{Error, Result};
use crate::rng::RngKey;
use crate::target::{to_host, to_tensor};
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use ndarray::Axis;
use rand::seq::SliceRandom;
use std::marker::PhantomData;

/// Hyperparameters of [`train_flow`] and of the sample buffer it consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainConfig {
    /// Passes over the buffer per training round.
    pub n_epochs: usize,
    /// Samples per optimizer step.
    pub batch_size: usize,
    /// Learning rate handed to the optimizer.
    pub learning_rate: f64,
    /// Upper bound on the number of buffered samples per training round.
    pub max_samples: usize,
    /// Keep every `thinning`-th local step in the buffer.
    pub thinning: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_epochs: 10,
            batch_size: 1000,
            learning_rate: 1e-2,
            max_samples: 100_000,
            thinning: 1,
        }
    }
}

impl TrainConfig {
    /// Sets the number of epochs per training round.
    pub fn with_n_epochs(mut self, n_epochs: usize) -> Self {
        self.n_epochs = n_epochs;
        self
    }

    /// Sets the mini-batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the learning rate.
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Caps the number of buffered samples.
    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }

    /// Keeps only every `thinning`-th local step.
    pub fn with_thinning(mut self, thinning: usize) -> Self {
        self.thinning = thinning;
        self
    }

    /// Checks that every count is at least 1 and the learning rate is positive and finite.
    pub fn validate(&self) -> Result<()> {
        if self.n_epochs == 0 || self.batch_size == 0 {
            return Err(Error::Config(
                "n_epochs and batch_size must be at least 1".into(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if self.max_samples == 0 || self.thinning == 0 {
            return Err(Error::Config(
                "max_samples and thinning must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// A density model together with its optimizer state.
///
/// Training consumes a state and hands back a new one; nothing is updated in place.
#[derive(Clone)]
pub struct FlowState<B, M, O> {
    /// The density model.
    pub model: M,
    /// Optimizer state matching `model`.
    pub optimizer: O,
    _backend: PhantomData<fn() -> B>,
}

impl<B, M, O> FlowState<B, M, O>
where
    B: AutodiffBackend,
    M: DensityModel<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    /// Pairs a model with a freshly initialized optimizer.
    pub fn new(model: M, optimizer: O) -> Self {
        Self {
            model,
            optimizer,
            _backend: PhantomData,
        }
    }
}

/// Result of one call to [`train_flow`].
pub struct TrainOutput<B, M, O> {
    /// Model and optimizer after the last step.
    pub state: FlowState<B, M, O>,
    /// Loss of every mini-batch, in order.
    pub batch_losses: Vec<f64>,
    /// Mean batch loss of each epoch.
    pub epoch_losses: Vec<f64>,
}

/// Fits the model to `buffer` by minimising the mean negative log-likelihood.
///
/// Each epoch shuffles the buffer with a fresh substream of `key` and walks over it in
/// mini-batches of `batch_size`, taking one optimizer step per batch. A buffer smaller
/// than `batch_size` is a single batch; otherwise the incomplete tail of the shuffled
/// order is dropped.
///
/// # Errors
///
/// [`Error::TrainingDivergence`] as soon as a batch loss is not finite.
pub fn train_flow<B, M, O>(
    key: RngKey,
    state: FlowState<B, M, O>,
    buffer: &SampleBuffer,
    config: &TrainConfig,
) -> Result<TrainOutput<B, M, O>>
where
    B: AutodiffBackend,
    M: DensityModel<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    config.validate()?;
    if buffer.is_empty() {
        return Err(Error::Config("cannot train on an empty sample buffer".into()));
    }
    check_model_dim::<B, M>(&state.model, buffer.n_dim())?;

    let FlowState {
        mut model,
        mut optimizer,
        ..
    } = state;
    let n = buffer.len();
    let (batch_size, n_batches) = if n < config.batch_size {
        (n, 1)
    } else {
        (config.batch_size, n / config.batch_size)
    };

    let mut batch_losses = Vec::with_capacity(config.n_epochs * n_batches);
    let mut epoch_losses = Vec::with_capacity(config.n_epochs);
    let mut key = key;

    for epoch in 0..config.n_epochs {
        let (next, shuffle_key) = key.split();
        key = next;
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut shuffle_key.into_rng());

        let mut epoch_total = 0.0;
        for (batch, indices) in order.chunks_exact(batch_size).take(n_batches).enumerate() {
            let x = to_tensor::<B>(&buffer.positions.select(Axis(0), indices));
            let loss = model.log_prob(x).mean().neg();

            let value = to_host(loss.clone())?
                .first()
                .copied()
                .unwrap_or(f64::NAN);
            if !value.is_finite() {
                return Err(Error::TrainingDivergence {
                    epoch,
                    batch,
                    loss: value,
                });
            }

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(config.learning_rate, model, grads);

            batch_losses.push(value);
            epoch_total += value;
        }
        let epoch_loss = epoch_total / n_batches as f64;
        log::debug!("flow epoch {}: loss = {:.4}", epoch, epoch_loss);
        epoch_losses.push(epoch_loss);
    }

    Ok(TrainOutput {
        state: FlowState::new(model, optimizer),
        batch_losses,
        epoch_losses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::AffineFlow;
    use crate::rng::standard_normal;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;
    use ndarray::{array, Array1, Array2};

    type BackendType = Autodiff<NdArray<f64>>;

    fn buffer(positions: Array2<f64>) -> SampleBuffer {
        let log_probs = Array1::zeros(positions.nrows());
        SampleBuffer {
            positions,
            log_probs,
        }
    }

    fn fresh_state(
        n_dim: usize,
    ) -> FlowState<
        BackendType,
        AffineFlow<BackendType>,
        impl Optimizer<AffineFlow<BackendType>, BackendType>,
    > {
        let model = AffineFlow::<BackendType>::new(n_dim, &Default::default());
        let optimizer = AdamConfig::new().init::<BackendType, AffineFlow<BackendType>>();
        FlowState::new(model, optimizer)
    }

    #[test]
    fn loss_decreases_on_a_fixed_buffer() {
        let data =
            standard_normal(RngKey::new(0), 2000, 2) * array![[2.0, 0.5]] + array![[3.0, -1.0]];
        let config = TrainConfig::default()
            .with_n_epochs(30)
            .with_batch_size(200)
            .with_learning_rate(0.05);
        let out = train_flow(RngKey::new(1), fresh_state(2), &buffer(data), &config).unwrap();

        assert_eq!(out.epoch_losses.len(), 30);
        assert_eq!(out.batch_losses.len(), 300);
        let first: f64 = out.epoch_losses[..5].iter().sum::<f64>() / 5.0;
        let last: f64 = out.epoch_losses[25..].iter().sum::<f64>() / 5.0;
        assert!(last < first, "first {first}, last {last}");

        let loc = to_host(out.state.model.loc()).unwrap();
        assert_abs_diff_eq!(loc[0], 3.0, epsilon = 0.3);
        assert_abs_diff_eq!(loc[1], -1.0, epsilon = 0.3);
    }

    #[test]
    fn small_buffer_is_one_batch() {
        let data = standard_normal(RngKey::new(2), 10, 2);
        let config = TrainConfig::default().with_n_epochs(3).with_batch_size(32);
        let out =
            train_flow(RngKey::new(3), fresh_state(2), &buffer(data.clone()), &config).unwrap();
        assert_eq!(out.batch_losses.len(), 3);

        let config = config.with_batch_size(4);
        let out = train_flow(RngKey::new(3), fresh_state(2), &buffer(data), &config).unwrap();
        assert_eq!(out.batch_losses.len(), 6);
    }

    #[test]
    fn training_is_deterministic() {
        let data = standard_normal(RngKey::new(4), 100, 2);
        let config = TrainConfig::default().with_n_epochs(4).with_batch_size(16);
        let a = train_flow(RngKey::new(5), fresh_state(2), &buffer(data.clone()), &config).unwrap();
        let b = train_flow(RngKey::new(5), fresh_state(2), &buffer(data), &config).unwrap();
        assert_eq!(a.batch_losses, b.batch_losses);
    }

    #[test]
    fn non_finite_loss_is_a_divergence() {
        let mut data = standard_normal(RngKey::new(6), 8, 2);
        data[[3, 1]] = f64::NAN;
        let config = TrainConfig::default().with_n_epochs(2).with_batch_size(100);
        let err = train_flow(RngKey::new(7), fresh_state(2), &buffer(data), &config)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::TrainingDivergence {
                epoch: 0,
                batch: 0,
                ..
            }
        ));
    }

    #[test]
    fn dimension_and_config_errors() {
        let data = standard_normal(RngKey::new(8), 8, 3);
        let config = TrainConfig::default();
        assert!(matches!(
            train_flow(RngKey::new(0), fresh_state(2), &buffer(data.clone()), &config).err(),
            Some(Error::DimensionMismatch { .. })
        ));
        let config = TrainConfig::default().with_batch_size(0);
        assert!(matches!(
            train_flow(RngKey::new(0), fresh_state(3), &buffer(data), &config).err(),
            Some(Error::Config(_))
        ));
    }
}
