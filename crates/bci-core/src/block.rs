//! Block: the multi-dimensional sample container handed between nodes
//!
//! Axis convention is `(trial, channel, [feature...], time)`. The time axis is
//! always last and in temporal order within one call.

use crate::error::{BspError, BspResult};
use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

/// Numeric block with semantic axes (trial, channel, [feature...], time)
pub type Block = ArrayD<f64>;

/// Class label attached to one trial during offline training
pub type Label = i32;

/// Index of the trial axis
pub const TRIAL_AXIS: Axis = Axis(0);
/// Index of the channel axis
pub const CHANNEL_AXIS: Axis = Axis(1);

/// Time axis of a block (always the last axis)
pub fn time_axis(block: &Block) -> Axis {
    Axis(block.ndim().saturating_sub(1))
}

/// Number of samples along the time axis
pub fn time_len(block: &Block) -> usize {
    block.shape().last().copied().unwrap_or(0)
}

/// Number of channels (length of axis 1)
pub fn channel_count(block: &Block) -> usize {
    block.shape().get(1).copied().unwrap_or(0)
}

/// Number of trials (length of axis 0)
pub fn trial_count(block: &Block) -> usize {
    block.shape().first().copied().unwrap_or(0)
}

/// Build a `(1, channels, time)` block from per-channel rows
pub fn block_from_channels(rows: &[Vec<f64>]) -> BspResult<Block> {
    let n_channels = rows.len();
    let n_times = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|r| r.len() != n_times) {
        return Err(BspError::shape("block", "channel rows have different lengths"));
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    ArrayD::from_shape_vec(IxDyn(&[1, n_channels, n_times]), flat)
        .map_err(|e| BspError::shape("block", e.to_string()))
}

/// Timestamps accompanying a block.
///
/// `None` at the call site means no timestamps at all; inside a series a
/// `None` entry means "unknown, to be assigned downstream".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamps {
    /// One timestamp for the whole chunk, belonging to its last sample
    Scalar(f64),
    /// One entry per time sample
    Series(Vec<Option<f64>>),
}

impl Timestamps {
    /// Series of known timestamps
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        Timestamps::Series(values.into_iter().map(Some).collect())
    }

    /// Most recent timestamp, if any
    pub fn last(&self) -> Option<f64> {
        match self {
            Timestamps::Scalar(t) => Some(*t),
            Timestamps::Series(series) => series.last().copied().flatten(),
        }
    }

    /// Check alignment with a time axis of length `n_times`
    pub fn validate(&self, n_times: usize) -> BspResult<()> {
        match self {
            Timestamps::Scalar(_) => Ok(()),
            Timestamps::Series(series) if series.len() == n_times => Ok(()),
            Timestamps::Series(series) => Err(BspError::InvalidTimestamps {
                expected: n_times,
                actual: series.len(),
            }),
        }
    }

    /// Per-sample view of `n_times` samples; a scalar stamps only the last one
    pub fn per_sample(timestamps: Option<&Timestamps>, n_times: usize) -> Vec<Option<f64>> {
        match timestamps {
            None => vec![None; n_times],
            Some(Timestamps::Scalar(t)) => {
                let mut out = vec![None; n_times];
                if let Some(last) = out.last_mut() {
                    *last = Some(*t);
                }
                out
            }
            Some(Timestamps::Series(series)) => series.clone(),
        }
    }

    /// Whether any entry is unknown
    pub fn has_unknown(&self) -> bool {
        match self {
            Timestamps::Scalar(_) => false,
            Timestamps::Series(series) => series.iter().any(Option::is_none),
        }
    }
}

/// One delivery unit: a block plus its timestamps
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub data: Block,
    pub timestamps: Option<Timestamps>,
}

impl Chunk {
    pub fn new(data: Block, timestamps: Option<Timestamps>) -> Self {
        Chunk { data, timestamps }
    }

    /// Samples along the time axis
    pub fn len(&self) -> usize {
        time_len(&self.data)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trial-shaped data replayed offline through `train`
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    pub data: Block,
    /// One label per trial
    pub labels: Vec<Label>,
    pub timestamps: Option<Timestamps>,
}

impl TrainingSet {
    pub fn new(data: Block, labels: Vec<Label>, timestamps: Option<Timestamps>) -> BspResult<Self> {
        if labels.len() != trial_count(&data) {
            return Err(BspError::shape(
                "training set",
                format!("{} labels for {} trials", labels.len(), trial_count(&data)),
            ));
        }
        Ok(TrainingSet { data, labels, timestamps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_from_channels() {
        let block = block_from_channels(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        assert_eq!(block.shape(), &[1, 2, 3]);
        assert_eq!(channel_count(&block), 2);
        assert_eq!(time_len(&block), 3);
        assert_eq!(block[[0, 1, 2]], 6.0);

        assert!(block_from_channels(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_scalar_timestamp_stamps_last_sample() {
        let ts = Timestamps::Scalar(4.5);
        assert_eq!(Timestamps::per_sample(Some(&ts), 3), vec![None, None, Some(4.5)]);
        assert_eq!(Timestamps::per_sample(None, 2), vec![None, None]);
        assert_eq!(ts.last(), Some(4.5));
    }

    #[test]
    fn test_series_validation() {
        let ts = Timestamps::from_values([0.0, 0.1, 0.2]);
        assert!(ts.validate(3).is_ok());
        assert_eq!(
            ts.validate(4),
            Err(BspError::InvalidTimestamps { expected: 4, actual: 3 })
        );
        assert!(!ts.has_unknown());
        assert!(Timestamps::Series(vec![Some(1.0), None]).has_unknown());
    }

    #[test]
    fn test_training_set_label_count() {
        let data = Block::zeros(IxDyn(&[2, 1, 5]));
        assert!(TrainingSet::new(data.clone(), vec![0, 1], None).is_ok());
        assert!(TrainingSet::new(data, vec![0], None).is_err());
    }
}
