//! Target log-densities and their evaluation on the host.
//!
//! A target is written against the `burn` tensor API, so gradients needed by HMC
//! and MALA come straight out of burn's reverse-mode autodiff. Chain state itself
//! lives on the host as `ndarray` arrays of `f64`; the helpers in this module move a
//! batch of positions into a tensor, evaluate the target, and read the results back.

use crate::error::{check_dim, Error, Result};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use ndarray::{Array1, Array2, ArrayBase, Data, Dimension};

/// A batched, unnormalized log-density over `n_dim`-dimensional positions.
///
/// # Type Parameters
///
/// * `B`: The `burn` backend the density is evaluated on.
/// * `D`: The conditioning data passed unchanged to every evaluation.
pub trait LogDensity<B: Backend, D> {
    /// Compute the log-density for a batch of positions.
    ///
    /// # Parameters
    ///
    /// * `positions`: A tensor of shape `[n_chains, n_dim]`.
    /// * `data`: The conditioning data.
    ///
    /// # Returns
    ///
    /// A 1D tensor of shape `[n_chains]`. Row `i` of the output must depend on row `i`
    /// of the input only.
    fn log_prob_batch(&self, positions: Tensor<B, 2>, data: &D) -> Tensor<B, 1>;
}

impl<B, D, F> LogDensity<B, D> for F
where
    B: Backend,
    F: Fn(Tensor<B, 2>, &D) -> Tensor<B, 1>,
{
    fn log_prob_batch(&self, positions: Tensor<B, 2>, data: &D) -> Tensor<B, 1> {
        self(positions, data)
    }
}

/// Conditioning data whose shape identifies a precompiled code path.
pub trait ConditioningData {
    /// The shape of the payload; empty for scalar or absent data.
    fn shape(&self) -> Vec<usize>;
}

impl ConditioningData for () {
    fn shape(&self) -> Vec<usize> {
        Vec::new()
    }
}

impl<T> ConditioningData for Vec<T> {
    fn shape(&self) -> Vec<usize> {
        vec![self.len()]
    }
}

impl<S, Dim> ConditioningData for ArrayBase<S, Dim>
where
    S: Data,
    Dim: Dimension,
{
    fn shape(&self) -> Vec<usize> {
        ArrayBase::shape(self).to_vec()
    }
}

impl<B: Backend, const N: usize> ConditioningData for Tensor<B, N> {
    fn shape(&self) -> Vec<usize> {
        self.dims().to_vec()
    }
}

/// Copies a host batch `[n, d]` into a tensor on the backend's default device.
pub fn to_tensor<B: Backend>(positions: &Array2<f64>) -> Tensor<B, 2> {
    let (n, d) = positions.dim();
    let data = TensorData::new(positions.iter().copied().collect::<Vec<f64>>(), [n, d]);
    Tensor::from_data(data, &B::Device::default())
}

/// Reads a tensor back to the host as a flat `f64` vector in row-major order.
pub fn to_host<B: Backend, const N: usize>(tensor: Tensor<B, N>) -> Result<Vec<f64>> {
    tensor
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|e| Error::Tensor(format!("{e:?}")))
}

/// Maps any non-finite log-density to `-inf`, i.e. an automatic rejection.
pub(crate) fn sanitize(log_prob: f64) -> f64 {
    if log_prob.is_finite() {
        log_prob
    } else {
        f64::NEG_INFINITY
    }
}

/// Evaluates the target on a host batch.
///
/// Non-finite values come back as `-inf`.
pub fn evaluate_log_prob<B, D, T>(
    target: &T,
    positions: &Array2<f64>,
    data: &D,
) -> Result<Array1<f64>>
where
    B: Backend,
    T: LogDensity<B, D> + ?Sized,
{
    let n = positions.nrows();
    let values = to_host(target.log_prob_batch(to_tensor::<B>(positions), data))?;
    check_dim("log-density output", n, values.len())?;
    Ok(Array1::from_vec(values).mapv_into(sanitize))
}

/// Evaluates the target and its gradient with respect to the positions.
///
/// The gradient is obtained by backpropagating the sum of the per-chain
/// log-densities; since rows are independent this yields every chain's own
/// gradient in one pass.
///
/// # Returns
///
/// The log-densities `[n]` (non-finite values mapped to `-inf`) and the gradients
/// `[n, d]`. A target that does not depend on the positions has a zero gradient.
pub fn evaluate_with_grad<B, D, T>(
    target: &T,
    positions: &Array2<f64>,
    data: &D,
) -> Result<(Array1<f64>, Array2<f64>)>
where
    B: AutodiffBackend,
    T: LogDensity<B, D> + ?Sized,
{
    let (n, d) = positions.dim();
    let x = to_tensor::<B>(positions).require_grad();
    let logp = target.log_prob_batch(x.clone(), data);
    let grads = logp.clone().sum().backward();

    let grad = match x.grad(&grads) {
        Some(g) => Array2::from_shape_vec((n, d), to_host(g)?)?,
        None => Array2::zeros((n, d)),
    };
    let values = to_host(logp)?;
    check_dim("log-density output", n, values.len())?;
    Ok((Array1::from_vec(values).mapv_into(sanitize), grad))
}
