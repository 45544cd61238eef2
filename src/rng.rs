//! Splittable random keys.
//!
//! Every stochastic operation in the crate consumes exactly one [`RngKey`]. A key is
//! either split into fresh descendants or turned into a generator, never both, so two
//! operations never share a stream. Identical top-level seeds reproduce a run bit for bit.

use crate::error::Result;
use ndarray::{Array1, Array2};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

// Offsets the splitting stream from the drawing stream of the same key.
const SPLIT_STREAM: u64 = 0x9E37_79B9_7F4A_7C15;

/// An opaque seed for one random substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RngKey(u64);

impl RngKey {
    /// Creates a root key from a seed.
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Splits the key into two independent descendants.
    pub fn split(self) -> (Self, Self) {
        let mut rng = SmallRng::seed_from_u64(self.0 ^ SPLIT_STREAM);
        (Self(rng.gen()), Self(rng.gen()))
    }

    /// Splits the key into `n` independent descendants.
    pub fn split_n(self, n: usize) -> Vec<Self> {
        let mut rng = SmallRng::seed_from_u64(self.0 ^ SPLIT_STREAM);
        (0..n).map(|_| Self(rng.gen())).collect()
    }

    /// Consumes the key as a random number generator.
    pub fn into_rng(self) -> SmallRng {
        SmallRng::seed_from_u64(self.0)
    }
}

/// The keys needed to start a sampling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    /// Key for drawing initial positions.
    pub init: RngKey,
    /// One key per chain, for stepping chains one at a time with
    /// [`ProposalKernel::kernel`](crate::core::ProposalKernel::kernel) or as the lane
    /// keys of a single `step_lanes` call. [`Sampler`](crate::sampler::Sampler) derives
    /// its lane keys from `flow` instead.
    pub chains: Vec<RngKey>,
    /// Key for the sampler's own stream (local, training and global steps).
    pub flow: RngKey,
    /// Key for initialising density model parameters.
    pub flow_init: RngKey,
}

/// Derives the full key set for `n_chains` chains from a single seed.
pub fn initialize(n_chains: usize, seed: u64) -> KeySet {
    let (init, rest) = RngKey::new(seed).split();
    let (chains, rest) = rest.split();
    let (flow, flow_init) = rest.split();
    KeySet {
        init,
        chains: chains.split_n(n_chains),
        flow,
        flow_init,
    }
}

/// Draws an `[n_rows, n_cols]` array of standard normal values.
pub fn standard_normal(key: RngKey, n_rows: usize, n_cols: usize) -> Array2<f64> {
    let mut rng = key.into_rng();
    Array2::from_shape_simple_fn((n_rows, n_cols), || rng.sample(StandardNormal))
}

/// Per-lane randomness for one kernel step.
#[derive(Debug, Clone)]
pub(crate) struct LaneDraws {
    /// Standard normal noise, one row per lane.
    pub noise: Array2<f64>,
    /// One uniform draw in `[0, 1)` per lane, for the accept/reject test.
    pub uniforms: Array1<f64>,
}

/// Draws the noise row and the acceptance uniform for every lane, in parallel.
///
/// Lane `i` consumes only `keys[i]`: first `n_dim` normals, then one uniform.
pub(crate) fn lane_draws(keys: &[RngKey], n_dim: usize) -> Result<LaneDraws> {
    let draws: Vec<(Vec<f64>, f64)> = keys
        .par_iter()
        .map(|key| {
            let mut rng = key.into_rng();
            let noise: Vec<f64> = (0..n_dim).map(|_| rng.sample(StandardNormal)).collect();
            let u: f64 = rng.gen();
            (noise, u)
        })
        .collect();

    let mut flat = Vec::with_capacity(keys.len() * n_dim);
    let mut uniforms = Vec::with_capacity(keys.len());
    for (noise, u) in draws {
        flat.extend(noise);
        uniforms.push(u);
    }
    Ok(LaneDraws {
        noise: Array2::from_shape_vec((keys.len(), n_dim), flat)?,
        uniforms: Array1::from_vec(uniforms),
    })
}

/// Metropolis test in log space. A NaN ratio always rejects.
pub(crate) fn metropolis_accept(log_ratio: f64, u: f64) -> bool {
    u.ln() < log_ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn split_is_deterministic() {
        let key = RngKey::new(42);
        assert_eq!(key.split(), key.split());
        assert_eq!(key.split_n(5), key.split_n(5));
    }

    #[test]
    fn split_children_are_distinct() {
        let key = RngKey::new(7);
        let (a, b) = key.split();
        assert_ne!(a, b);
        assert_ne!(a, key);
        let many: HashSet<RngKey> = key.split_n(1000).into_iter().collect();
        assert_eq!(many.len(), 1000);
    }

    #[test]
    fn initialize_gives_one_key_per_chain() {
        let keys = initialize(15, 42);
        assert_eq!(keys.chains.len(), 15);
        assert_ne!(keys.init, keys.flow);
        assert_eq!(keys, initialize(15, 42));
    }

    #[test]
    fn lane_draws_follow_their_own_key() {
        let keys = RngKey::new(3).split_n(4);
        let draws = lane_draws(&keys, 3).unwrap();
        for (i, key) in keys.iter().enumerate() {
            let single = lane_draws(&[*key], 3).unwrap();
            assert_eq!(draws.noise.row(i), single.noise.row(0));
            assert_eq!(draws.uniforms[i], single.uniforms[0]);
        }
    }

    #[test]
    fn nan_ratio_rejects() {
        assert!(!metropolis_accept(f64::NAN, 0.5));
        assert!(!metropolis_accept(f64::NEG_INFINITY, 0.0));
        assert!(metropolis_accept(0.0, 0.0));
        assert!(metropolis_accept(f64::INFINITY, 0.99));
    }
}
