//! Cache of primed evaluation shapes.
//!
//! Priming a shape runs the target (and its gradient, for gradient kernels) once on a
//! batch of that shape and validates the output. After that the signature is recorded
//! and later runs with the same signature skip the warm-up entirely.

use crate::error::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// The tuple that identifies one specialised code path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeSignature {
    pub n_chains: usize,
    pub n_dim: usize,
    pub n_steps: usize,
    pub data_shape: Vec<usize>,
}

/// Hit and miss counters of a [`ShapeCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Lookups of a shape that was already primed.
    pub hits: usize,
    /// Lookups that primed a new shape.
    pub misses: usize,
}

#[derive(Debug, Default)]
pub struct ShapeCache {
    primed: Mutex<HashMap<ShapeSignature, Duration>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl ShapeCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure `signature` is primed, running `prime` on a miss.
    ///
    /// Returns `true` on a cache hit. A failing `prime` leaves the cache unchanged.
    pub fn ensure<F>(&self, signature: ShapeSignature, prime: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        if self.contains(&signature) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }

        let start = Instant::now();
        prime()?;
        let elapsed = start.elapsed();
        log::debug!("primed {:?} in {:?}", signature, elapsed);

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.primed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(signature, elapsed);
        Ok(false)
    }

    /// Whether `signature` has been primed.
    pub fn contains(&self, signature: &ShapeSignature) -> bool {
        self.primed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(signature)
    }

    /// Hit and miss counts so far.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn signature(n_steps: usize) -> ShapeSignature {
        ShapeSignature {
            n_chains: 4,
            n_dim: 2,
            n_steps,
            data_shape: vec![5],
        }
    }

    #[test]
    fn second_lookup_is_a_hit() {
        let cache = ShapeCache::new();
        let mut primed = 0;
        assert!(!cache.ensure(signature(10), || {
            primed += 1;
            Ok(())
        })
        .unwrap());
        assert!(cache.ensure(signature(10), || unreachable!()).unwrap());
        assert_eq!(primed, 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn signatures_are_distinguished() {
        let cache = ShapeCache::new();
        cache.ensure(signature(10), || Ok(())).unwrap();
        assert!(!cache.contains(&signature(11)));
    }

    #[test]
    fn failed_priming_is_not_recorded() {
        let cache = ShapeCache::new();
        let res = cache.ensure(signature(1), || Err(Error::Config("boom".into())));
        assert!(res.is_err());
        assert!(!cache.contains(&signature(1)));
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
