//! Ring buffer framing a continuous stream into fixed-length windows

use crate::processor::{check_dimensions, ProcessingNode};
use crate::registry::NodeConfig;
use bci_core::{time_axis, time_len, trial_count, Block, BspError, BspResult, ChannelSet, Chunk, Timestamps, TrainingSet};
use ndarray::{concatenate, ArrayView, Axis, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Backing capacity as a multiple of the window length
const CAPACITY_FACTOR: usize = 10;

/// Settings of a windowing buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferSettings {
    /// Window length L in samples
    pub buffer_length: usize,
    /// Hop S in samples between consecutive windows
    pub shift: usize,
}

/// Backing store, shaped from the first block
struct Ring {
    data: Block,
    timestamps: Vec<Option<f64>>,
    write_index: usize,
    read_index: usize,
    written: usize,
    discarded: usize,
}

impl Ring {
    fn new(template: &Block, capacity: usize) -> Self {
        let mut shape = template.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = capacity;
        }
        Ring {
            data: Block::zeros(IxDyn(&shape)),
            timestamps: vec![None; capacity],
            write_index: 0,
            read_index: 0,
            written: 0,
            discarded: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.timestamps.len()
    }

    /// Unread samples; zero while a hop longer than the window is still skipping
    fn occupied(&self) -> usize {
        self.written.saturating_sub(self.discarded)
    }

    fn available(&self) -> usize {
        self.capacity() - self.occupied()
    }

    /// Whether a block has the same non-time layout as the store
    fn accepts(&self, block: &Block) -> bool {
        let n = block.ndim();
        block.ndim() == self.data.ndim() && block.shape()[..n - 1] == self.data.shape()[..n - 1]
    }

    fn write(&mut self, block: &Block, timestamps: &[Option<f64>]) -> BspResult<()> {
        let new_samples = time_len(block);
        // samples the read cursor has already hopped over are never stored
        let skipped = self.discarded.saturating_sub(self.written).min(new_samples);
        if new_samples - skipped > self.available() {
            return Err(BspError::CapacityExceeded {
                capacity: self.capacity(),
                available: self.available(),
                requested: new_samples - skipped,
            });
        }

        let axis = time_axis(block);
        self.write_index = (self.write_index + skipped) % self.capacity();
        for (i, ts) in timestamps.iter().enumerate().take(new_samples).skip(skipped) {
            self.data
                .index_axis_mut(axis, self.write_index)
                .assign(&block.index_axis(axis, i));
            self.timestamps[self.write_index] = *ts;
            self.write_index = (self.write_index + 1) % self.capacity();
        }
        self.written += new_samples;
        Ok(())
    }

    /// Copy `length` samples starting at the read cursor, then advance it by `shift`
    fn read(&mut self, length: usize, shift: usize) -> (Block, Vec<Option<f64>>) {
        let axis = time_axis(&self.data);
        let mut shape = self.data.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = length;
        }
        let mut window = Block::zeros(IxDyn(&shape));
        let mut timestamps = Vec::with_capacity(length);
        for j in 0..length {
            let src = (self.read_index + j) % self.capacity();
            window.index_axis_mut(axis, j).assign(&self.data.index_axis(axis, src));
            timestamps.push(self.timestamps[src]);
        }
        self.read_index = (self.read_index + shift) % self.capacity();
        self.discarded += shift;
        (window, timestamps)
    }
}

/// Sliding-window buffer with hop `shift` and overlap `buffer_length - shift`.
///
/// Emits at most one window per call, once at least `buffer_length` unread
/// samples are held. A write that would overwrite unread samples fails with
/// `CapacityExceeded` instead of dropping data.
pub struct BufferNode {
    channels: ChannelSet,
    settings: BufferSettings,
    ring: Option<Ring>,
}

impl BufferNode {
    pub fn new(channels: ChannelSet, settings: BufferSettings) -> BspResult<Self> {
        if settings.buffer_length == 0 || settings.shift == 0 {
            return Err(BspError::config(format!(
                "buffer_length and shift must be > 0, got {} and {}",
                settings.buffer_length, settings.shift
            )));
        }
        if settings.shift > settings.buffer_length {
            warn!(
                buffer_length = settings.buffer_length,
                shift = settings.shift,
                "Buffer shift exceeds its length; samples between windows are skipped"
            );
        }
        Ok(BufferNode {
            channels,
            settings,
            ring: None,
        })
    }

    /// Backing capacity in samples
    pub fn capacity(&self) -> usize {
        self.settings.buffer_length * CAPACITY_FACTOR
    }

    /// Free slots before the next write; full capacity before the first block
    pub fn available(&self) -> usize {
        self.ring.as_ref().map(Ring::available).unwrap_or_else(|| self.capacity())
    }

    /// All L-length, S-strided windows of one trial
    fn windows<'a>(&self, trial: ArrayView<'a, f64, IxDyn>) -> Vec<ArrayView<'a, f64, IxDyn>> {
        let axis = Axis(trial.ndim() - 1);
        let n_times = trial.len_of(axis);
        let length = self.settings.buffer_length;
        if n_times < length {
            return Vec::new();
        }
        (0..=n_times - length)
            .step_by(self.settings.shift)
            .map(|start| trial.clone().slice_axis_move(axis, Slice::from(start..start + length)))
            .collect()
    }
}

impl ProcessingNode for BufferNode {
    fn name(&self) -> &str {
        "buffer"
    }

    fn in_channels(&self) -> &ChannelSet {
        &self.channels
    }

    fn process(&mut self, input: &Chunk) -> BspResult<Option<Chunk>> {
        if !check_dimensions(self.name(), &self.channels, input)? {
            return Ok(None);
        }

        let capacity = self.capacity();
        let ring = self.ring.get_or_insert_with(|| Ring::new(&input.data, capacity));
        if !ring.accepts(&input.data) {
            return Err(BspError::shape(
                "buffer",
                format!(
                    "block shape {:?} does not match buffered shape {:?}",
                    input.data.shape(),
                    ring.data.shape()
                ),
            ));
        }

        let timestamps = Timestamps::per_sample(input.timestamps.as_ref(), input.len());
        ring.write(&input.data, &timestamps)?;

        if ring.occupied() < self.settings.buffer_length {
            debug!(
                samples = ring.occupied(),
                buffer_length = self.settings.buffer_length,
                "Buffer does not yet hold a full window"
            );
            return Ok(None);
        }

        let (window, timestamps) = ring.read(self.settings.buffer_length, self.settings.shift);
        Ok(Some(Chunk::new(window, Some(Timestamps::Series(timestamps)))))
    }

    /// Slice every trial into windows directly, without the ring.
    ///
    /// Labels are repeated per window. Output timestamps are the first
    /// `buffer_length` entries of the input timestamps.
    fn train(&mut self, input: &TrainingSet) -> BspResult<Option<TrainingSet>> {
        self.clear();
        let data = &input.data;
        if data.ndim() < 3 {
            return Err(BspError::shape("buffer", "training data needs at least 3 axes"));
        }
        if data.len_of(Axis(1)) != self.channels.len() {
            return Err(BspError::shape(
                "buffer",
                format!("{} channels, expected {}", data.len_of(Axis(1)), self.channels.len()),
            ));
        }

        let mut views = Vec::new();
        let mut labels = Vec::new();
        for (i, label) in input.labels.iter().enumerate().take(trial_count(data)) {
            let trial = data.slice_axis(Axis(0), Slice::from(i..i + 1));
            let windows = self.windows(trial);
            if windows.is_empty() {
                warn!(
                    trial = i,
                    samples = time_len(data),
                    buffer_length = self.settings.buffer_length,
                    "Trial shorter than one window"
                );
            }
            labels.extend(std::iter::repeat(*label).take(windows.len()));
            views.extend(windows);
        }

        if views.is_empty() {
            return Ok(None);
        }
        let windows = concatenate(Axis(0), &views).map_err(|e| BspError::shape("buffer", e.to_string()))?;

        let n_times = time_len(data);
        let timestamps = match input.timestamps.as_ref() {
            Some(ts) => {
                ts.validate(n_times)?;
                let mut series = Timestamps::per_sample(Some(ts), n_times);
                series.truncate(self.settings.buffer_length);
                Some(Timestamps::Series(series))
            }
            None => None,
        };

        self.clear();
        Ok(Some(TrainingSet {
            data: windows,
            labels,
            timestamps,
        }))
    }

    fn clear(&mut self) {
        self.ring = None;
    }

    fn settings(&self) -> NodeConfig {
        NodeConfig::Buffer(self.settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn node(length: usize, shift: usize) -> BufferNode {
        BufferNode::new(
            ChannelSet::new(["C3"]).unwrap(),
            BufferSettings {
                buffer_length: length,
                shift,
            },
        )
        .unwrap()
    }

    fn ramp(start: usize, end: usize) -> Chunk {
        let values: Vec<f64> = (start..=end).map(|v| v as f64).collect();
        let n = values.len();
        let ts = Timestamps::from_values(values.iter().map(|v| v / 10.0));
        Chunk::new(Array::from_shape_vec(IxDyn(&[1, 1, n]), values).unwrap(), Some(ts))
    }

    fn samples(chunk: &Chunk) -> Vec<f64> {
        chunk.data.iter().copied().collect()
    }

    #[test]
    fn test_not_ready_until_full() {
        let mut buffer = node(10, 5);
        assert!(buffer.process(&ramp(1, 5)).unwrap().is_none());
        let window = buffer.process(&ramp(6, 10)).unwrap().unwrap();
        assert_eq!(samples(&window), (1..=10).map(|v| v as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut buffer = node(2, 1);
        assert_eq!(buffer.capacity(), 20);
        let err = buffer.process(&ramp(1, 21)).unwrap_err();
        assert!(matches!(err, BspError::CapacityExceeded { capacity: 20, requested: 21, .. }));
    }

    #[test]
    fn test_backlog_fills_capacity() {
        // each call consumes one hop, so a stream faster than the hop overflows
        let mut buffer = node(2, 1);
        let mut result = Ok(None);
        for i in 0..10 {
            result = buffer.process(&ramp(3 * i + 1, 3 * i + 3));
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(BspError::CapacityExceeded { .. })));
    }

    #[test]
    fn test_scalar_timestamp_marks_last_sample() {
        let mut buffer = node(3, 3);
        let data = Array::from_shape_vec(IxDyn(&[1, 1, 3]), vec![1.0, 2.0, 3.0]).unwrap();
        let window = buffer
            .process(&Chunk::new(data, Some(Timestamps::Scalar(7.5))))
            .unwrap()
            .unwrap();
        assert_eq!(window.timestamps, Some(Timestamps::Series(vec![None, None, Some(7.5)])));
    }

    #[test]
    fn test_shape_change_rejected_until_clear() {
        let mut buffer = node(4, 2);
        buffer.process(&ramp(1, 2)).unwrap();
        let wide = Chunk::new(Block::zeros(IxDyn(&[2, 1, 2])), None);
        assert!(matches!(buffer.process(&wide), Err(BspError::ShapeMismatch { .. })));
        buffer.clear();
        assert!(buffer.process(&wide).unwrap().is_none());
    }

    #[test]
    fn test_train_slices_trials() {
        let mut buffer = node(4, 2);
        let values: Vec<f64> = (0..20).map(|v| v as f64).collect();
        let data = Array::from_shape_vec(IxDyn(&[2, 1, 10]), values).unwrap();
        let ts = Timestamps::from_values((0..10).map(|v| v as f64));
        let set = TrainingSet::new(data, vec![1, 2], Some(ts)).unwrap();

        let out = buffer.train(&set).unwrap().unwrap();
        // windows start at 0, 2, 4, 6 in each trial
        assert_eq!(out.data.shape(), &[8, 1, 4]);
        assert_eq!(out.labels, vec![1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(out.data[[1, 0, 0]], 2.0);
        assert_eq!(out.data[[4, 0, 0]], 10.0);
        assert_eq!(out.timestamps, Some(Timestamps::from_values([0.0, 1.0, 2.0, 3.0])));
    }

    #[test]
    fn test_hop_longer_than_window_skips_samples() {
        let mut buffer = node(4, 10);
        let first = buffer.process(&ramp(1, 4)).unwrap().unwrap();
        assert_eq!(samples(&first), vec![1.0, 2.0, 3.0, 4.0]);
        // samples 5..=10 fall between windows
        assert!(buffer.process(&ramp(5, 8)).unwrap().is_none());
        assert!(buffer.process(&ramp(9, 12)).unwrap().is_none());
        let second = buffer.process(&ramp(13, 16)).unwrap().unwrap();
        assert_eq!(samples(&second), vec![11.0, 12.0, 13.0, 14.0]);
        assert_eq!(second.timestamps, Some(Timestamps::from_values([1.1, 1.2, 1.3, 1.4])));
    }

    #[test]
    fn test_skipped_samples_do_not_count_against_capacity() {
        let mut buffer = node(2, 30);
        assert_eq!(buffer.capacity(), 20);
        buffer.process(&ramp(1, 2)).unwrap().unwrap();
        // 28 skipped plus 2 kept
        let window = buffer.process(&ramp(3, 32)).unwrap().unwrap();
        assert_eq!(samples(&window), vec![31.0, 32.0]);
    }

    #[test]
    fn test_train_rejects_mismatched_timestamps() {
        let mut buffer = node(4, 2);
        let ts = Timestamps::from_values((0..7).map(|v| v as f64));
        let set = TrainingSet {
            data: Block::zeros(IxDyn(&[1, 1, 10])),
            labels: vec![0],
            timestamps: Some(ts),
        };
        assert!(matches!(
            buffer.train(&set),
            Err(BspError::InvalidTimestamps { expected: 10, actual: 7 })
        ));
    }

    #[test]
    fn test_train_short_trials_yield_nothing() {
        let mut buffer = node(8, 2);
        let set = TrainingSet::new(Block::zeros(IxDyn(&[1, 1, 5])), vec![0], None).unwrap();
        assert!(buffer.train(&set).unwrap().is_none());
    }
}
