//! Ensemble MCMC with local gradient/random-walk kernels and a normalizing-flow
//! global proposal.
//!
//! Targets are written with `burn` tensors; chain state lives on the host as `ndarray`
//! arrays. See [`sampler`] for the two-phase driver.

pub mod cache;
pub mod core;
pub mod error;
pub mod flow;
pub mod grw;
pub mod hmc;
pub mod local;
pub mod mala;
pub mod rng;
pub mod sampler;
pub mod stats;
pub mod target;

pub use crate::core::{ChainState, Ensemble, ProposalKernel, Trajectory};
pub use crate::error::{Error, Result};
pub use crate::rng::{initialize, KeySet, RngKey};
pub use crate::sampler::{PhaseHistory, Sampler, SamplerConfig, SamplerOutput};
pub use crate::target::LogDensity;
