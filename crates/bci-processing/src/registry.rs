//! Static node registry and serializable pipeline configuration
//!
//! Every node type has a typed settings struct; `NodeConfig` tags them so a
//! whole pipeline can be described in JSON and rebuilt from a snapshot.

use crate::buffer::{BufferNode, BufferSettings};
use crate::burg::BurgSpectrumSettings;
use crate::filters::{IirFilterNode, SinglePoleFilterNode, SinglePoleSettings};
use crate::iir_design::FilterSpec;
use crate::pipeline::{Pipeline, PipelineBuilder, Stage};
use crate::processor::ProcessingNode;
use crate::reduction::{ReductionNode, ReductionSettings};
use crate::selector::{ChannelSelectorNode, SelectorSettings};
use crate::spatial::{SpatialFilterNode, SpatialFilterSettings};
use crate::spectrum::BurgSpectrumNode;
use crate::tap::{TapBus, TapNode, TapSettings};
use bci_core::{BspError, BspResult, ChannelSet};
use serde::{Deserialize, Serialize};

/// Settings of any node, tagged by node type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfig {
    IirFilter(FilterSpec),
    SinglePole(SinglePoleSettings),
    Buffer(BufferSettings),
    SpatialFilter(SpatialFilterSettings),
    ChannelSelector(SelectorSettings),
    Reduction(ReductionSettings),
    BurgSpectrum(BurgSpectrumSettings),
    Tap(TapSettings),
    Pipeline(PipelineConfig),
}

impl NodeConfig {
    /// Registry tag of this node type
    pub fn kind(&self) -> &'static str {
        match self {
            NodeConfig::IirFilter(_) => "iir_filter",
            NodeConfig::SinglePole(_) => "single_pole",
            NodeConfig::Buffer(_) => "buffer",
            NodeConfig::SpatialFilter(_) => "spatial_filter",
            NodeConfig::ChannelSelector(_) => "channel_selector",
            NodeConfig::Reduction(_) => "reduction",
            NodeConfig::BurgSpectrum(_) => "burg_spectrum",
            NodeConfig::Tap(_) => "tap",
            NodeConfig::Pipeline(_) => "pipeline",
        }
    }
}

/// One stage of a pipeline description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageConfig {
    Node(NodeConfig),
    FanOut(Vec<StageConfig>),
    Optional { enabled: bool, stage: Box<StageConfig> },
}

/// Serializable pipeline description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    /// Convert to JSON
    pub fn to_json(&self) -> BspResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| BspError::config(format!("Serialization error: {}", e)))
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> BspResult<Self> {
        serde_json::from_str(json).map_err(|e| BspError::config(format!("Deserialization error: {}", e)))
    }
}

/// Build a node for `channels` from its configuration
pub fn build_node(channels: ChannelSet, config: &NodeConfig, bus: &TapBus) -> BspResult<Box<dyn ProcessingNode>> {
    let node: Box<dyn ProcessingNode> = match config {
        NodeConfig::IirFilter(spec) => Box::new(IirFilterNode::new(channels, spec.clone())?),
        NodeConfig::SinglePole(settings) => Box::new(SinglePoleFilterNode::new(channels, settings.clone())?),
        NodeConfig::Buffer(settings) => Box::new(BufferNode::new(channels, settings.clone())?),
        NodeConfig::SpatialFilter(settings) => Box::new(SpatialFilterNode::new(channels, settings.clone())?),
        NodeConfig::ChannelSelector(settings) => Box::new(ChannelSelectorNode::new(channels, settings.clone())?),
        NodeConfig::Reduction(settings) => Box::new(ReductionNode::new(channels, settings.clone())?),
        NodeConfig::BurgSpectrum(settings) => Box::new(BurgSpectrumNode::new(channels, settings.clone())?),
        NodeConfig::Tap(settings) => Box::new(TapNode::on_bus(channels, settings.clone(), bus)),
        NodeConfig::Pipeline(config) => Box::new(build_pipeline(channels, config, bus)?),
    };
    Ok(node)
}

fn build_stage(channels: &ChannelSet, config: &StageConfig, bus: &TapBus) -> BspResult<Stage> {
    Ok(match config {
        StageConfig::Node(node) => Stage::Node(build_node(channels.clone(), node, bus)?),
        StageConfig::FanOut(members) => Stage::FanOut(
            members
                .iter()
                .map(|member| build_stage(channels, member, bus))
                .collect::<BspResult<Vec<_>>>()?,
        ),
        StageConfig::Optional { enabled, stage } => Stage::optional(build_stage(channels, stage, bus)?, *enabled),
    })
}

/// Build a pipeline, feeding each stage's output channels into the next
pub fn build_pipeline(channels: ChannelSet, config: &PipelineConfig, bus: &TapBus) -> BspResult<Pipeline> {
    let mut builder = PipelineBuilder::new(&config.name, channels);
    for stage in &config.stages {
        let stage = build_stage(builder.channels(), stage, bus)?;
        builder.add_stage(stage)?;
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iir_design::{BandType, Edge, Prototype};

    fn config() -> PipelineConfig {
        PipelineConfig {
            name: "eeg".to_string(),
            stages: vec![
                StageConfig::Node(NodeConfig::ChannelSelector(SelectorSettings {
                    select: Some(vec!["C3".to_string(), "C4".to_string()]),
                    ..Default::default()
                })),
                StageConfig::Node(NodeConfig::IirFilter(FilterSpec {
                    sampling_rate: 500.0,
                    order: 3,
                    band: BandType::Bandpass,
                    prototype: Prototype::Butter,
                    fpass: Edge::Band([8.0, 12.0]),
                    fstop: Edge::Band([4.0, 13.0]),
                    gpass: 3.0,
                    gstop: 40.0,
                })),
                StageConfig::Optional {
                    enabled: false,
                    stage: Box::new(StageConfig::Node(NodeConfig::Tap(TapSettings {
                        stream_name: Some("debug".to_string()),
                        source_id: Some("fixed".to_string()),
                        ..Default::default()
                    }))),
                },
                StageConfig::Node(NodeConfig::Buffer(BufferSettings {
                    buffer_length: 250,
                    shift: 50,
                })),
                StageConfig::Node(NodeConfig::BurgSpectrum(BurgSpectrumSettings::new(500.0, 10.0))),
            ],
        }
    }

    #[test]
    fn test_json_round_trip_rebuilds_same_settings() {
        let json = config().to_json().unwrap();
        assert!(json.contains("\"type\": \"iir_filter\""));
        let parsed = PipelineConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config());

        let channels = ChannelSet::new(["Fz", "C3", "C4"]).unwrap();
        let pipeline = build_pipeline(channels, &parsed, &TapBus::default()).unwrap();
        assert_eq!(pipeline.stage_count(), 5);
        assert_eq!(pipeline.out_channels().labels(), &["C3", "C4"]);
        assert_eq!(pipeline.config(), config());
    }

    #[test]
    fn test_handwritten_json() {
        let json = r#"{
            "name": "smoothing",
            "stages": [
                {"node": {"type": "single_pole", "time_const": 0.5, "sampling_rate": 20}},
                {"fan_out": [{"node": {"type": "tap", "stream_name": "raw"}}]},
                {"node": {"type": "reduction", "operations": ["take_last", "expand_dims"]}}
            ]
        }"#;
        let config = PipelineConfig::from_json(json).unwrap();
        let pipeline = build_pipeline(ChannelSet::new(["a"]).unwrap(), &config, &TapBus::default()).unwrap();
        assert_eq!(pipeline.stage_count(), 3);
        assert_eq!(config.stages[0], StageConfig::Node(NodeConfig::SinglePole(SinglePoleSettings {
            time_const: 0.5,
            sampling_rate: 20.0,
        })));
    }

    #[test]
    fn test_invalid_config_reported() {
        assert!(matches!(
            PipelineConfig::from_json("{\"name\": 3}"),
            Err(BspError::ConfigurationError { .. })
        ));

        let bad = NodeConfig::Buffer(BufferSettings { buffer_length: 0, shift: 1 });
        assert!(build_node(ChannelSet::new(["a"]).unwrap(), &bad, &TapBus::default()).is_err());
        assert_eq!(bad.kind(), "buffer");
    }
}
