//! Static channel subsetting, reordering and renaming

use crate::processor::{check_dimensions, ProcessingNode};
use crate::registry::NodeConfig;
use bci_core::{BspResult, ChannelSet, Chunk};
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Settings of a channel selector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectorSettings {
    /// Channels to keep; `None` keeps every channel not excluded
    #[serde(default)]
    pub select: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Output label per input label
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
}

/// Selects channels by label. Output keeps the input order.
pub struct ChannelSelectorNode {
    in_channels: ChannelSet,
    out_channels: ChannelSet,
    settings: SelectorSettings,
    indices: Vec<usize>,
}

impl ChannelSelectorNode {
    pub fn new(in_channels: ChannelSet, settings: SelectorSettings) -> BspResult<Self> {
        let selected: Vec<String> = match &settings.select {
            Some(select) => select.clone(),
            None => in_channels
                .iter()
                .filter(|label| !settings.exclude.iter().any(|e| e == label))
                .map(str::to_string)
                .collect(),
        };

        let missing: Vec<&String> = selected.iter().filter(|label| !in_channels.contains(label)).collect();
        if !missing.is_empty() {
            warn!(missing = ?missing, available = %in_channels, "Selected channels not provided on input");
        }

        let mut indices = Vec::new();
        let mut out_labels = Vec::new();
        for (i, label) in in_channels.iter().enumerate() {
            if !selected.iter().any(|s| s == label) {
                continue;
            }
            if settings.exclude.iter().any(|e| e == label) {
                warn!(channel = label, "Channel is both selected and excluded, keeping it");
            }
            indices.push(i);
            out_labels.push(settings.rename.get(label).cloned().unwrap_or_else(|| label.to_string()));
        }

        Ok(ChannelSelectorNode {
            in_channels,
            out_channels: ChannelSet::new(out_labels)?,
            settings,
            indices,
        })
    }

    /// Input positions of the kept channels
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl ProcessingNode for ChannelSelectorNode {
    fn name(&self) -> &str {
        "channel_selector"
    }

    fn in_channels(&self) -> &ChannelSet {
        &self.in_channels
    }

    fn out_channels(&self) -> &ChannelSet {
        &self.out_channels
    }

    fn process(&mut self, input: &Chunk) -> BspResult<Option<Chunk>> {
        if !check_dimensions(self.name(), &self.in_channels, input)? {
            return Ok(None);
        }
        let data = input.data.select(Axis(1), &self.indices);
        Ok(Some(Chunk::new(data, input.timestamps.clone())))
    }

    fn clear(&mut self) {}

    fn settings(&self) -> NodeConfig {
        NodeConfig::ChannelSelector(self.settings.clone())
    }
}
