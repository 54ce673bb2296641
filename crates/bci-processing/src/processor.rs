//! Core node trait shared by every pipeline stage

use crate::registry::NodeConfig;
use bci_core::{channel_count, time_len, BspError, BspResult, ChannelSet, Chunk, TrainingSet};

/// Core trait for all processing nodes.
///
/// `process` returns `Ok(None)` when the node has nothing to emit yet; the
/// pipeline stops at that stage for the current call.
pub trait ProcessingNode: Send {
    /// Node name/identifier
    fn name(&self) -> &str;

    /// Channels expected on input
    fn in_channels(&self) -> &ChannelSet;

    /// Channels produced on output
    fn out_channels(&self) -> &ChannelSet {
        self.in_channels()
    }

    /// Streaming entry point
    fn process(&mut self, input: &Chunk) -> BspResult<Option<Chunk>>;

    /// Offline entry point over trial-shaped data.
    ///
    /// Defaults to `process` over the whole batch with labels passed through.
    fn train(&mut self, input: &TrainingSet) -> BspResult<Option<TrainingSet>> {
        let chunk = Chunk::new(input.data.clone(), input.timestamps.clone());
        Ok(self.process(&chunk)?.map(|out| TrainingSet {
            data: out.data,
            labels: input.labels.clone(),
            timestamps: out.timestamps,
        }))
    }

    /// Reset transient state; calling it twice is the same as once
    fn clear(&mut self);

    /// Serializable configuration that rebuilds an equivalent node
    fn settings(&self) -> NodeConfig;
}

/// Validate a chunk against a node's channel set.
///
/// Returns `Ok(false)` for an empty time axis, which callers turn into
/// `Ok(None)`.
pub fn check_dimensions(node: &str, channels: &ChannelSet, input: &Chunk) -> BspResult<bool> {
    let data = &input.data;
    if data.ndim() < 3 {
        return Err(BspError::shape(
            node,
            format!("expected at least 3 axes (trial, channel, time), got {}", data.ndim()),
        ));
    }
    if channel_count(data) != channels.len() {
        return Err(BspError::shape(
            node,
            format!(
                "block has {} channels, node is configured for {} {}",
                channel_count(data),
                channels.len(),
                channels
            ),
        ));
    }
    let n_times = time_len(data);
    if n_times == 0 {
        return Ok(false);
    }
    if let Some(ts) = &input.timestamps {
        ts.validate(n_times)?;
    }
    Ok(true)
}
