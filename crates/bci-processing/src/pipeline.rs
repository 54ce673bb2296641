//! Pipeline engine: sequential stages, fan-out observers and optional stages

use crate::processor::ProcessingNode;
use crate::registry::{NodeConfig, PipelineConfig, StageConfig};
use bci_core::{BspError, BspResult, ChannelSet, Chunk, TrainingSet};
use tracing::{debug, info};

/// One pipeline stage
pub enum Stage {
    /// Output feeds the next stage
    Node(Box<dyn ProcessingNode>),
    /// Every member sees the same input; their outputs are discarded
    FanOut(Vec<Stage>),
    /// Transparent pass-through while disabled
    Optional { enabled: bool, stage: Box<Stage> },
}

/// What a stage did with its input
enum StageOutput<T> {
    Replaced(T),
    Unchanged,
    NotReady,
}

impl<T> From<Option<T>> for StageOutput<T> {
    fn from(output: Option<T>) -> Self {
        output.map_or(StageOutput::NotReady, StageOutput::Replaced)
    }
}

impl Stage {
    pub fn node(node: impl ProcessingNode + 'static) -> Self {
        Stage::Node(Box::new(node))
    }

    pub fn optional(stage: Stage, enabled: bool) -> Self {
        Stage::Optional {
            enabled,
            stage: Box::new(stage),
        }
    }

    /// Channels after this stage, given the channels before it
    fn out_channels(&self, input: &ChannelSet) -> ChannelSet {
        match self {
            Stage::Node(node) => node.out_channels().clone(),
            Stage::FanOut(_) => input.clone(),
            Stage::Optional { stage, .. } => stage.out_channels(input),
        }
    }

    /// Check that this stage accepts `input` channels
    fn validate(&self, input: &ChannelSet) -> BspResult<()> {
        match self {
            Stage::Node(node) if node.in_channels() != input => Err(BspError::config(format!(
                "stage '{}' expects channels {}, previous stage produces {}",
                node.name(),
                node.in_channels(),
                input
            ))),
            Stage::Node(_) => Ok(()),
            Stage::FanOut(members) => members.iter().try_for_each(|m| m.validate(input)),
            Stage::Optional { stage, .. } => {
                stage.validate(input)?;
                if &stage.out_channels(input) != input {
                    return Err(BspError::config(
                        "optional stages must not change the channel layout",
                    ));
                }
                Ok(())
            }
        }
    }

    fn process(&mut self, input: &Chunk) -> BspResult<StageOutput<Chunk>> {
        match self {
            Stage::Node(node) => Ok(node.process(input)?.into()),
            Stage::FanOut(members) => {
                for member in members.iter_mut() {
                    member.process(input)?;
                }
                Ok(StageOutput::Unchanged)
            }
            Stage::Optional { enabled: false, .. } => Ok(StageOutput::Unchanged),
            Stage::Optional { stage, .. } => stage.process(input),
        }
    }

    fn train(&mut self, input: &TrainingSet) -> BspResult<StageOutput<TrainingSet>> {
        match self {
            Stage::Node(node) => Ok(node.train(input)?.into()),
            Stage::FanOut(members) => {
                for member in members.iter_mut() {
                    member.train(input)?;
                }
                Ok(StageOutput::Unchanged)
            }
            Stage::Optional { enabled: false, .. } => Ok(StageOutput::Unchanged),
            Stage::Optional { stage, .. } => stage.train(input),
        }
    }

    fn clear(&mut self) {
        match self {
            Stage::Node(node) => node.clear(),
            Stage::FanOut(members) => members.iter_mut().for_each(Stage::clear),
            Stage::Optional { stage, .. } => stage.clear(),
        }
    }

    fn config(&self) -> StageConfig {
        match self {
            Stage::Node(node) => StageConfig::Node(node.settings()),
            Stage::FanOut(members) => StageConfig::FanOut(members.iter().map(Stage::config).collect()),
            Stage::Optional { enabled, stage } => StageConfig::Optional {
                enabled: *enabled,
                stage: Box::new(stage.config()),
            },
        }
    }
}

/// Ordered chain of stages.
///
/// The first stage that is not ready ends the call with `Ok(None)`; no
/// partial result reaches later stages.
pub struct Pipeline {
    name: String,
    in_channels: ChannelSet,
    out_channels: ChannelSet,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Enable or disable the optional stage at `index`
    pub fn set_enabled(&mut self, index: usize, enable: bool) -> BspResult<()> {
        match self.stages.get_mut(index) {
            Some(Stage::Optional { enabled, .. }) => {
                *enabled = enable;
                debug!(pipeline = %self.name, index, enable, "Toggled optional stage");
                Ok(())
            }
            Some(_) => Err(BspError::config(format!("stage {} is not optional", index))),
            None => Err(BspError::config(format!(
                "pipeline '{}' has no stage {}",
                self.name, index
            ))),
        }
    }

    /// Snapshot that rebuilds an equivalent pipeline
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            name: self.name.clone(),
            stages: self.stages.iter().map(Stage::config).collect(),
        }
    }
}

impl ProcessingNode for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_channels(&self) -> &ChannelSet {
        &self.in_channels
    }

    fn out_channels(&self) -> &ChannelSet {
        &self.out_channels
    }

    fn process(&mut self, input: &Chunk) -> BspResult<Option<Chunk>> {
        let mut current: Option<Chunk> = None;
        for stage in self.stages.iter_mut() {
            let stage_input = current.as_ref().unwrap_or(input);
            match stage.process(stage_input)? {
                StageOutput::Replaced(output) => current = Some(output),
                StageOutput::Unchanged => {}
                StageOutput::NotReady => return Ok(None),
            }
        }
        Ok(Some(current.unwrap_or_else(|| input.clone())))
    }

    fn train(&mut self, input: &TrainingSet) -> BspResult<Option<TrainingSet>> {
        let mut current: Option<TrainingSet> = None;
        for stage in self.stages.iter_mut() {
            let stage_input = current.as_ref().unwrap_or(input);
            match stage.train(stage_input)? {
                StageOutput::Replaced(output) => current = Some(output),
                StageOutput::Unchanged => {}
                StageOutput::NotReady => return Ok(None),
            }
        }
        Ok(Some(current.unwrap_or_else(|| input.clone())))
    }

    fn clear(&mut self) {
        self.stages.iter_mut().for_each(Stage::clear);
    }

    fn settings(&self) -> NodeConfig {
        NodeConfig::Pipeline(self.config())
    }
}

/// Pipeline builder checking channel compatibility stage by stage
pub struct PipelineBuilder {
    name: String,
    in_channels: ChannelSet,
    channels: ChannelSet,
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    /// Create new pipeline builder for `in_channels`
    pub fn new(name: &str, in_channels: ChannelSet) -> Self {
        PipelineBuilder {
            name: name.to_string(),
            channels: in_channels.clone(),
            in_channels,
            stages: Vec::new(),
        }
    }

    /// Channels produced by the stages added so far
    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// Add any stage to the pipeline
    pub fn add_stage(&mut self, stage: Stage) -> BspResult<&mut Self> {
        stage.validate(&self.channels)?;
        self.channels = stage.out_channels(&self.channels);
        self.stages.push(stage);
        Ok(self)
    }

    /// Add a sequential node
    pub fn add_node(&mut self, node: impl ProcessingNode + 'static) -> BspResult<&mut Self> {
        self.add_stage(Stage::node(node))
    }

    /// Add passive observers sharing the current input
    pub fn add_fan_out(&mut self, members: Vec<Box<dyn ProcessingNode>>) -> BspResult<&mut Self> {
        self.add_stage(Stage::FanOut(members.into_iter().map(Stage::Node).collect()))
    }

    /// Add a node that can be switched off later
    pub fn add_optional(&mut self, node: impl ProcessingNode + 'static, enabled: bool) -> BspResult<&mut Self> {
        self.add_stage(Stage::optional(Stage::node(node), enabled))
    }

    pub fn build(self) -> Pipeline {
        info!(
            pipeline = %self.name,
            stages = self.stages.len(),
            inputs = %self.in_channels,
            outputs = %self.channels,
            "Built pipeline"
        );
        Pipeline {
            name: self.name,
            in_channels: self.in_channels,
            out_channels: self.channels,
            stages: self.stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferNode, BufferSettings};
    use crate::selector::{ChannelSelectorNode, SelectorSettings};
    use crate::tap::{SamplePublisher, TapNode, TapSettings};
    use bci_core::{block_from_channels, Timestamps};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Counter(Arc<Mutex<usize>>);

    impl SamplePublisher for Counter {
        fn push(&mut self, _: &[f64], _: f64) -> BspResult<()> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn channels() -> ChannelSet {
        ChannelSet::new(["C3", "C4"]).unwrap()
    }

    fn ramp(start: usize, n: usize) -> Chunk {
        let c3: Vec<f64> = (start..start + n).map(|v| v as f64).collect();
        let c4: Vec<f64> = c3.iter().map(|v| -v).collect();
        Chunk::new(
            block_from_channels(&[c3, c4]).unwrap(),
            Some(Timestamps::from_values((start..start + n).map(|v| v as f64))),
        )
    }

    fn buffer(length: usize, shift: usize) -> BufferNode {
        BufferNode::new(channels(), BufferSettings { buffer_length: length, shift }).unwrap()
    }

    #[test]
    fn test_not_ready_short_circuits() {
        let counter = Counter::default();
        let mut builder = PipelineBuilder::new("test", channels());
        builder.add_node(buffer(4, 2)).unwrap();
        builder
            .add_node(TapNode::new(channels(), TapSettings::default(), Box::new(counter.clone())))
            .unwrap();
        let mut pipeline = builder.build();

        assert!(pipeline.process(&ramp(0, 2)).unwrap().is_none());
        assert_eq!(*counter.0.lock().unwrap(), 0);

        let out = pipeline.process(&ramp(2, 2)).unwrap().unwrap();
        assert_eq!(out.data.shape(), &[1, 2, 4]);
        assert_eq!(*counter.0.lock().unwrap(), 4);
    }

    #[test]
    fn test_fan_out_does_not_alter_flow() {
        let counter = Counter::default();
        let mut builder = PipelineBuilder::new("test", channels());
        builder
            .add_fan_out(vec![
                Box::new(buffer(100, 10)),
                Box::new(TapNode::new(channels(), TapSettings::default(), Box::new(counter.clone()))),
            ])
            .unwrap();
        let mut pipeline = builder.build();
        let input = ramp(0, 3);
        // the buffer member is not ready but the main flow continues
        assert_eq!(pipeline.process(&input).unwrap().unwrap(), input);
        assert_eq!(*counter.0.lock().unwrap(), 3);
    }

    #[test]
    fn test_disabled_optional_is_bypassed() {
        let counter = Counter::default();
        let mut builder = PipelineBuilder::new("test", channels());
        builder
            .add_optional(TapNode::new(channels(), TapSettings::default(), Box::new(counter.clone())), false)
            .unwrap();
        let mut pipeline = builder.build();
        pipeline.process(&ramp(0, 3)).unwrap();
        assert_eq!(*counter.0.lock().unwrap(), 0);

        pipeline.set_enabled(0, true).unwrap();
        pipeline.process(&ramp(0, 3)).unwrap();
        assert_eq!(*counter.0.lock().unwrap(), 3);
    }

    #[test]
    fn test_channel_flow_validated() {
        let selector = ChannelSelectorNode::new(
            channels(),
            SelectorSettings {
                select: Some(vec!["C3".to_string()]),
                ..Default::default()
            },
        )
        .unwrap();
        let mut builder = PipelineBuilder::new("test", channels());
        builder.add_node(selector).unwrap();
        assert_eq!(builder.channels().len(), 1);
        // buffer configured for two channels after a one-channel stage
        assert!(builder.add_node(buffer(4, 2)).is_err());
    }

    #[test]
    fn test_set_enabled_on_plain_stage_fails() {
        let mut builder = PipelineBuilder::new("test", channels());
        builder.add_node(buffer(4, 2)).unwrap();
        let mut pipeline = builder.build();
        assert!(pipeline.set_enabled(0, false).is_err());
        assert!(pipeline.set_enabled(3, false).is_err());
    }

    #[test]
    fn test_clear_resets_every_stage() {
        let mut builder = PipelineBuilder::new("test", channels());
        builder.add_node(buffer(4, 2)).unwrap();
        let mut pipeline = builder.build();
        pipeline.process(&ramp(0, 3)).unwrap();
        pipeline.clear();
        assert!(pipeline.process(&ramp(0, 3)).unwrap().is_none());
    }
}
