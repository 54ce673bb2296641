//! Generic numeric collapse along the time axis

use crate::processor::{check_dimensions, ProcessingNode};
use crate::registry::NodeConfig;
use bci_core::{time_axis, Block, BspError, BspResult, ChannelSet, Chunk, Timestamps};
use ndarray::{Axis, Zip};
use serde::{Deserialize, Serialize};

/// One reduction step, applied to the last axis of the block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionOp {
    /// Keep only the most recent sample (removes the axis)
    TakeLast,
    Mean,
    /// Population variance
    Variance,
    Min,
    Max,
    /// Append a length-1 axis
    ExpandDims,
    /// Element-wise absolute value
    Abs,
    /// Element-wise natural logarithm
    Log,
}

impl ReductionOp {
    fn apply(self, data: Block) -> BspResult<Block> {
        if data.ndim() == 0 && !matches!(self, ReductionOp::ExpandDims | ReductionOp::Abs | ReductionOp::Log) {
            return Err(BspError::shape("reduction", format!("{:?} needs at least one axis", self)));
        }
        let axis = time_axis(&data);
        let empty = || BspError::shape("reduction", format!("{:?} over an empty axis", self));
        let reduced = match self {
            ReductionOp::TakeLast => {
                let last = data.len_of(axis).checked_sub(1).ok_or_else(empty)?;
                data.index_axis(axis, last).to_owned()
            }
            ReductionOp::Mean => data.mean_axis(axis).ok_or_else(empty)?,
            ReductionOp::Variance => {
                if data.len_of(axis) == 0 {
                    return Err(empty());
                }
                data.var_axis(axis, 0.0)
            }
            ReductionOp::Min => fold_axis(&data, axis, f64::INFINITY, f64::min).ok_or_else(empty)?,
            ReductionOp::Max => fold_axis(&data, axis, f64::NEG_INFINITY, f64::max).ok_or_else(empty)?,
            ReductionOp::ExpandDims => {
                let n = data.ndim();
                data.insert_axis(Axis(n))
            }
            ReductionOp::Abs => data.mapv_into(f64::abs),
            ReductionOp::Log => data.mapv_into(f64::ln),
        };
        Ok(reduced)
    }
}

fn fold_axis(data: &Block, axis: Axis, init: f64, f: fn(f64, f64) -> f64) -> Option<Block> {
    if data.len_of(axis) == 0 {
        return None;
    }
    let mut out = data.index_axis(axis, 0).to_owned().mapv_into(|_| init);
    for lane in data.axis_iter(axis) {
        Zip::from(&mut out).and(&lane).for_each(|acc, &x| *acc = f(*acc, x));
    }
    Some(out)
}

/// Settings of a reduction node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionSettings {
    /// Applied in order
    pub operations: Vec<ReductionOp>,
}

/// Applies a sequence of reductions; timestamps collapse to the most recent one
pub struct ReductionNode {
    channels: ChannelSet,
    settings: ReductionSettings,
}

impl ReductionNode {
    pub fn new(channels: ChannelSet, settings: ReductionSettings) -> BspResult<Self> {
        Ok(ReductionNode { channels, settings })
    }

    fn reduce_timestamps(timestamps: Option<&Timestamps>) -> Option<Timestamps> {
        match timestamps? {
            Timestamps::Scalar(t) => Some(Timestamps::Series(vec![Some(*t)])),
            Timestamps::Series(series) => Some(Timestamps::Series(vec![series.last().copied().flatten()])),
        }
    }
}

impl ProcessingNode for ReductionNode {
    fn name(&self) -> &str {
        "reduction"
    }

    fn in_channels(&self) -> &ChannelSet {
        &self.channels
    }

    fn process(&mut self, input: &Chunk) -> BspResult<Option<Chunk>> {
        if !check_dimensions(self.name(), &self.channels, input)? {
            return Ok(None);
        }
        let data = self
            .settings
            .operations
            .iter()
            .try_fold(input.data.clone(), |data, op| op.apply(data))?;
        Ok(Some(Chunk::new(data, Self::reduce_timestamps(input.timestamps.as_ref()))))
    }

    fn clear(&mut self) {}

    fn settings(&self) -> NodeConfig {
        NodeConfig::Reduction(self.settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn node(operations: Vec<ReductionOp>) -> ReductionNode {
        ReductionNode::new(ChannelSet::new(["EOG"]).unwrap(), ReductionSettings { operations }).unwrap()
    }

    fn chunk() -> Chunk {
        let data = Array::from_shape_vec(IxDyn(&[1, 1, 4]), vec![1.0, -3.0, 2.0, 4.0]).unwrap();
        Chunk::new(data, Some(Timestamps::from_values([0.1, 0.2, 0.3, 0.4])))
    }

    #[test]
    fn test_take_last_keeps_layout() {
        let mut node = node(vec![ReductionOp::TakeLast, ReductionOp::ExpandDims]);
        let out = node.process(&chunk()).unwrap().unwrap();
        assert_eq!(out.data.shape(), &[1, 1, 1]);
        assert_eq!(out.data[[0, 0, 0]], 4.0);
        assert_eq!(out.timestamps, Some(Timestamps::Series(vec![Some(0.4)])));
    }

    #[test]
    fn test_statistics() {
        let mut mean = node(vec![ReductionOp::Mean, ReductionOp::ExpandDims]);
        assert_eq!(mean.process(&chunk()).unwrap().unwrap().data[[0, 0, 0]], 1.0);

        let mut var = node(vec![ReductionOp::Variance, ReductionOp::ExpandDims]);
        assert!((var.process(&chunk()).unwrap().unwrap().data[[0, 0, 0]] - 6.5).abs() < 1e-12);

        let mut max_abs = node(vec![ReductionOp::Abs, ReductionOp::Max, ReductionOp::ExpandDims]);
        assert_eq!(max_abs.process(&chunk()).unwrap().unwrap().data[[0, 0, 0]], 4.0);

        let mut min = node(vec![ReductionOp::Min, ReductionOp::ExpandDims]);
        assert_eq!(min.process(&chunk()).unwrap().unwrap().data[[0, 0, 0]], -3.0);
    }

    #[test]
    fn test_timestamp_collapse() {
        assert_eq!(ReductionNode::reduce_timestamps(None), None);
        assert_eq!(
            ReductionNode::reduce_timestamps(Some(&Timestamps::Scalar(3.0))),
            Some(Timestamps::Series(vec![Some(3.0)]))
        );
        assert_eq!(
            ReductionNode::reduce_timestamps(Some(&Timestamps::Series(vec![Some(1.0), None]))),
            Some(Timestamps::Series(vec![None]))
        );
    }
}
