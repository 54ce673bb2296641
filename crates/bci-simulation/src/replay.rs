//! Replay of a recorded block as an irregular chunk stream

use bci_core::{BspError, BspResult, Chunk, Timestamps};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Splits `(channels, samples)` rows into chunks of random length.
///
/// Sample `i` carries the timestamp `t0 + i / fs`.
pub struct ChunkedReplay {
    rows: Vec<Vec<f64>>,
    sampling_rate: f64,
    t0: f64,
    min_chunk: usize,
    max_chunk: usize,
    rng: StdRng,
    position: usize,
}

impl ChunkedReplay {
    pub fn new(rows: Vec<Vec<f64>>, sampling_rate: f64, t0: f64) -> BspResult<Self> {
        let n_samples = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != n_samples) {
            return Err(BspError::shape("replay", "channel rows have different lengths"));
        }
        if sampling_rate <= 0.0 {
            return Err(BspError::config(format!("invalid sampling rate {}", sampling_rate)));
        }
        Ok(ChunkedReplay {
            rows,
            sampling_rate,
            t0,
            min_chunk: 10,
            max_chunk: 10,
            rng: StdRng::seed_from_u64(0),
            position: 0,
        })
    }

    /// Draw chunk lengths uniformly from `min..=max` with a seeded generator
    pub fn with_chunk_sizes(mut self, min: usize, max: usize, seed: u64) -> BspResult<Self> {
        if min == 0 || min > max {
            return Err(BspError::config(format!("invalid chunk size range {}..={}", min, max)));
        }
        self.min_chunk = min;
        self.max_chunk = max;
        self.rng = StdRng::seed_from_u64(seed);
        Ok(self)
    }

    pub fn len_samples(&self) -> usize {
        self.rows.first().map(Vec::len).unwrap_or(0)
    }

    pub fn remaining(&self) -> usize {
        self.len_samples() - self.position
    }
}

impl Iterator for ChunkedReplay {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.remaining() == 0 {
            return None;
        }
        let size = self.rng.gen_range(self.min_chunk..=self.max_chunk).min(self.remaining());
        let start = self.position;
        let rows = &self.rows;
        let data = ArrayD::from_shape_fn(IxDyn(&[1, rows.len(), size]), |idx| rows[idx[1]][start + idx[2]]);
        let timestamps = Timestamps::from_values((start..start + size).map(|i| self.t0 + i as f64 / self.sampling_rate));
        self.position += size;
        Some(Chunk::new(data, Some(timestamps)))
    }
}
