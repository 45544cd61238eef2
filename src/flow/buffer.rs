use crate::core::Trajectory;
use crate::error::{Error, Result};
use ndarray::{s, Array1, Array2};

/// Positions and log-densities collected from one local segment, one row per sample.
///
/// Rows are ordered chain-major: all kept steps of chain 0, then chain 1, and so on.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    /// `[n_samples, n_dim]` positions.
    pub positions: Array2<f64>,
    /// Target log-density of each row.
    pub log_probs: Array1<f64>,
}

impl SampleBuffer {
    /// Collects every `thinning`-th step of each chain, keeping at most
    /// `max_samples` rows overall by dropping the oldest steps first.
    ///
    /// When there are more chains than `max_samples`, only the latest step of the
    /// first `max_samples` chains is kept.
    pub fn from_trajectory(
        trajectory: &Trajectory,
        thinning: usize,
        max_samples: usize,
    ) -> Result<Self> {
        if thinning == 0 || max_samples == 0 {
            return Err(Error::Config(
                "thinning and max_samples must be at least 1".into(),
            ));
        }
        let n_chains = trajectory.n_chains().min(max_samples);
        let n_dim = trajectory.n_dim();

        let mut steps: Vec<usize> = (0..trajectory.n_steps()).step_by(thinning).collect();
        let per_chain = max_samples / n_chains.max(1);
        if steps.len() > per_chain {
            steps.drain(..steps.len() - per_chain);
        }

        let n_rows = n_chains * steps.len();
        let mut positions = Array2::zeros((n_rows, n_dim));
        let mut log_probs = Array1::zeros(n_rows);
        let mut row = 0;
        for chain in 0..n_chains {
            for &step in &steps {
                positions
                    .row_mut(row)
                    .assign(&trajectory.positions.slice(s![chain, step, ..]));
                log_probs[row] = trajectory.log_probs[[chain, step]];
                row += 1;
            }
        }
        Ok(Self {
            positions,
            log_probs,
        })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.positions.nrows()
    }

    /// Whether the buffer holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dimension of each row.
    pub fn n_dim(&self) -> usize {
        self.positions.ncols()
    }
}
