//! Runner configuration: simulated recording plus the processing to apply

use anyhow::{Context, Result};
use bci_core::ChannelSet;
use bci_processing::{Montage, PipelineConfig, SmrErdConfig};
use bci_simulation::ErdShape;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// ERD event injected into the simulated recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErdEvent {
    pub channel: String,
    /// Onset in seconds from the start of the recording
    pub at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Simulation {
    pub duration: f64,
    pub f_smr: f64,
    pub amplitude_smr: f64,
    pub amplitude_noise: f64,
    pub erd_length: f64,
    pub erd_shape: ErdShape,
    pub events: Vec<ErdEvent>,
    pub min_chunk: usize,
    pub max_chunk: usize,
    pub seed: u64,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            duration: 20.0,
            f_smr: 11.0,
            amplitude_smr: 2.0,
            amplitude_noise: 1.0,
            erd_length: 4.0,
            erd_shape: ErdShape::SquaredSineHalfwave,
            events: vec![
                ErdEvent {
                    channel: "C3".to_string(),
                    at: 5.0,
                },
                ErdEvent {
                    channel: "C4".to_string(),
                    at: 12.0,
                },
            ],
            min_chunk: 5,
            max_chunk: 20,
            seed: 1,
        }
    }
}

/// Processing applied to the simulated stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Processing {
    /// Common preprocessing feeding the EEG and EOG feature branches
    SmrErd(SmrErdConfig),
    /// A single pipeline described node by node
    Pipeline {
        channels: Vec<String>,
        sampling_rate: f64,
        pipeline: PipelineConfig,
    },
}

impl Processing {
    pub fn input_channels(&self) -> &[String] {
        match self {
            Processing::SmrErd(config) => &config.input_channels,
            Processing::Pipeline { channels, .. } => channels,
        }
    }

    pub fn sampling_rate(&self) -> f64 {
        match self {
            Processing::SmrErd(config) => config.sampling_rate,
            Processing::Pipeline { sampling_rate, .. } => *sampling_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub simulation: Simulation,
    pub processing: Processing,
}

impl RunConfig {
    /// SMR-ERD preset on a bipolar EOG pair plus C3, Cz and C4
    pub fn preset() -> Result<Self> {
        let inputs = ChannelSet::new(["EOG1", "EOG2", "C3", "CZ", "C4"])?;
        let montage = Montage::new(inputs.clone())
            .bipolar("bipolar EOG", "EOG1", "EOG2")?
            .identity("C3")?
            .identity("C4")?
            .identity("CZ")?
            .build()?;
        let config = SmrErdConfig {
            input_channels: inputs.labels().to_vec(),
            sampling_rate: 512.0,
            spatial_labels: montage.out_channels.labels().to_vec(),
            spatial_weights: Some(montage.weights),
            ..Default::default()
        };
        Ok(RunConfig {
            simulation: Simulation::default(),
            processing: Processing::SmrErd(config),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_round_trip() {
        let preset = RunConfig::preset().unwrap();
        let json = preset.to_json().unwrap();
        assert!(json.contains("\"mode\": \"smr_erd\""));
        let parsed: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.processing.input_channels(), preset.processing.input_channels());
        assert_eq!(parsed.processing.sampling_rate(), 512.0);
    }

    #[test]
    fn test_pipeline_mode_with_default_simulation() {
        let json = r#"{
            "processing": {
                "mode": "pipeline",
                "channels": ["C3"],
                "sampling_rate": 250,
                "pipeline": {"name": "raw", "stages": []}
            }
        }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.simulation.duration, 20.0);
        assert_eq!(config.processing.sampling_rate(), 250.0);
    }
}
