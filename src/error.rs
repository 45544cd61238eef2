//! Error types for flow-mcmc.

use thiserror::Error;

/// Errors raised while configuring or running a sampler.
///
/// A non-finite log-density is deliberately absent from this list: kernels
/// treat it as a rejected proposal.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid kernel, training or run configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Array or tensor dimensions that do not agree with the configuration.
    #[error("dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },

    /// The flow training loss became non-finite.
    #[error("flow training diverged at epoch {epoch}, batch {batch}: loss = {loss}")]
    TrainingDivergence { epoch: usize, batch: usize, loss: f64 },

    /// Reading tensor data back to the host failed.
    #[error("tensor conversion failed: {0}")]
    Tensor(String),

    /// Assembling a host array failed.
    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn check_dim(context: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::DimensionMismatch {
            context,
            expected,
            got,
        })
    }
}

pub(crate) fn check_step_size(step_size: f64) -> Result<()> {
    if step_size.is_finite() && step_size > 0.0 {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "step_size must be positive and finite, got {step_size}"
        )))
    }
}
