//! Sensorimotor-rhythm ERD feedback preset
//!
//! Three pipelines: a common preprocessing chain over every input channel,
//! then an EEG branch producing smoothed Burg band amplitudes and an EOG
//! branch producing the latest low-passed eye signal, both at `fs_out`.

use crate::buffer::BufferSettings;
use crate::burg::BurgSpectrumSettings;
use crate::filters::SinglePoleSettings;
use crate::iir_design::{BandType, Edge, FilterSpec, Prototype};
use crate::pipeline::Pipeline;
use crate::processor::ProcessingNode;
use crate::reduction::{ReductionOp, ReductionSettings};
use crate::registry::{build_pipeline, NodeConfig, PipelineConfig, StageConfig};
use crate::selector::SelectorSettings;
use crate::spatial::SpatialFilterSettings;
use crate::tap::{TapBus, TapSettings};
use bci_core::{BspError, BspResult, ChannelSet};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Settings of the SMR-ERD preset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmrErdConfig {
    pub input_channels: Vec<String>,
    pub sampling_rate: f64,
    /// Frequency of interest of the Burg estimator
    pub foi: f64,
    /// Requested feature rate; adjusted to an integral hop
    pub fs_out: f64,
    pub f_highpass: f64,
    pub f_lowpass: f64,
    pub f_notch: f64,
    /// Output labels of the spatial filter
    pub spatial_labels: Vec<String>,
    /// `[out][in]` weights of the spatial filter, required
    pub spatial_weights: Option<Vec<Vec<f64>>>,
    pub f_eeg_bandpass: [f64; 2],
    pub f_eog_lowpass: f64,
    pub window_seconds: f64,
    pub single_pole_time_const: f64,
    /// Enable the debug taps after every stage
    pub debug_taps: bool,
    pub eeg_channels: Vec<String>,
    pub eog_channel: String,
}

impl Default for SmrErdConfig {
    fn default() -> Self {
        Self {
            input_channels: Vec::new(),
            sampling_rate: 500.0,
            foi: 11.0,
            fs_out: 25.0,
            f_highpass: 0.1,
            f_lowpass: 70.0,
            f_notch: 50.0,
            spatial_labels: ["bipolar EOG", "C3", "C4", "CZ"].map(String::from).to_vec(),
            spatial_weights: None,
            f_eeg_bandpass: [1.0, 30.0],
            f_eog_lowpass: 5.0,
            window_seconds: 0.4,
            single_pole_time_const: 0.5,
            debug_taps: false,
            eeg_channels: ["C3", "C4", "CZ"].map(String::from).to_vec(),
            eog_channel: "bipolar EOG".to_string(),
        }
    }
}

/// Serializable descriptions of the three preset pipelines
#[derive(Debug, Clone, PartialEq)]
pub struct SmrErdLayout {
    pub common: PipelineConfig,
    pub eeg: PipelineConfig,
    pub eog: PipelineConfig,
    /// Effective feature rate
    pub fs_out: f64,
}

/// Built preset pipelines
pub struct SmrErdPipelines {
    pub common: Pipeline,
    pub eeg: Pipeline,
    pub eog: Pipeline,
    pub fs_out: f64,
}

impl SmrErdPipelines {
    /// Input channels of the EEG and EOG branches
    pub fn branch_channels(&self) -> &ChannelSet {
        self.common.out_channels()
    }
}

fn butter(fs: f64, order: usize, band: BandType, fpass: Edge, fstop: Edge) -> StageConfig {
    StageConfig::Node(NodeConfig::IirFilter(FilterSpec {
        sampling_rate: fs,
        order,
        band,
        prototype: Prototype::Butter,
        fpass,
        fstop,
        gpass: 3.0,
        gstop: 50.0,
    }))
}

fn notch(fs: f64, f_notch: f64) -> StageConfig {
    StageConfig::Node(NodeConfig::IirFilter(FilterSpec {
        sampling_rate: fs,
        order: 3,
        band: BandType::Bandstop,
        prototype: Prototype::Cheby1,
        fpass: Edge::Band([f_notch - 6.0, f_notch + 6.0]),
        fstop: Edge::Band([f_notch - 5.0, f_notch + 5.0]),
        gpass: 0.1,
        gstop: 50.0,
    }))
}

fn select(labels: &[String]) -> StageConfig {
    StageConfig::Node(NodeConfig::ChannelSelector(SelectorSettings {
        select: Some(labels.to_vec()),
        ..Default::default()
    }))
}

/// Pushes stages, following each with a debug tap
struct Chain {
    stages: Vec<StageConfig>,
    debug: bool,
}

impl Chain {
    fn new(debug: bool) -> Self {
        Chain { stages: Vec::new(), debug }
    }

    fn then(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    fn tap(mut self, stream: &str, feature_dimensions: Vec<usize>) -> Self {
        self.stages.push(StageConfig::Optional {
            enabled: self.debug,
            stage: Box::new(StageConfig::Node(NodeConfig::Tap(TapSettings {
                stream_name: Some(stream.to_string()),
                feature_dimensions,
                ..Default::default()
            }))),
        });
        self
    }

    fn finish(self, name: &str) -> PipelineConfig {
        PipelineConfig {
            name: name.to_string(),
            stages: self.stages,
        }
    }
}

impl SmrErdConfig {
    /// Window length and hop in samples, plus the effective feature rate
    pub fn framing(&self) -> BspResult<(usize, usize, f64)> {
        let fs = self.sampling_rate;
        if !(fs > 0.0 && self.fs_out > 0.0 && self.fs_out <= fs) {
            return Err(BspError::config(format!(
                "output rate {} Hz must be positive and at most the sampling rate {} Hz",
                self.fs_out, fs
            )));
        }
        let buffer_length = (fs * self.window_seconds) as usize;
        let shift = (fs / self.fs_out).round() as usize;
        let mut fs_out = self.fs_out;
        if (fs / self.fs_out).fract() > 1e-2 {
            fs_out = fs / shift as f64;
            warn!(
                requested = self.fs_out,
                sampling_rate = fs,
                adjusted = fs_out,
                "Output rate is not an integral fraction of the sampling rate, using closest possible rate"
            );
        }
        Ok((buffer_length, shift, fs_out))
    }

    /// Describe the three pipelines without building them
    pub fn layout(&self) -> BspResult<SmrErdLayout> {
        let fs = self.sampling_rate;
        let (buffer_length, shift, fs_out) = self.framing()?;
        let weights = self.spatial_weights.clone().ok_or_else(|| {
            BspError::config("spatial filter weight matrix [out_channels x in_channels] needs to be set")
        })?;
        let spatial = SpatialFilterSettings {
            weights,
            out_channels: ChannelSet::new(self.spatial_labels.iter().cloned())?,
        };
        let buffer = BufferSettings { buffer_length, shift };
        let burg = BurgSpectrumSettings::new(fs, self.foi);
        let nbins = burg.nbins;
        let debug = self.debug_taps;

        let common = Chain::new(debug)
            .then(butter(
                fs,
                1,
                BandType::Highpass,
                Edge::Single(self.f_highpass),
                Edge::Single(self.f_highpass / 2.0),
            ))
            .tap("debug1", vec![])
            .then(butter(
                fs,
                2,
                BandType::Lowpass,
                Edge::Single(self.f_lowpass),
                Edge::Single(self.f_lowpass + 1.0),
            ))
            .tap("debug2", vec![])
            .then(notch(fs, self.f_notch))
            .tap("debug3", vec![])
            .then(notch(fs, self.f_notch))
            .tap("debug4", vec![])
            .then(StageConfig::Node(NodeConfig::SpatialFilter(spatial)))
            .tap("debug5", vec![])
            .finish("common");

        let [low, high] = self.f_eeg_bandpass;
        let eeg = Chain::new(debug)
            .then(select(&self.eeg_channels))
            .then(butter(
                fs,
                3,
                BandType::Bandpass,
                Edge::Band([low, high]),
                Edge::Band([low / 2.0, high + 1.0]),
            ))
            .tap("debug7", vec![])
            .then(StageConfig::Node(NodeConfig::Buffer(buffer.clone())))
            .tap("debug14", vec![])
            .then(StageConfig::Node(NodeConfig::BurgSpectrum(burg)))
            .tap("debug9", vec![nbins])
            .then(StageConfig::Node(NodeConfig::SinglePole(SinglePoleSettings {
                time_const: self.single_pole_time_const,
                sampling_rate: fs_out,
            })))
            .tap("debug10", vec![nbins])
            .finish("eeg");

        let eog = Chain::new(debug)
            .then(select(std::slice::from_ref(&self.eog_channel)))
            .tap("debug11", vec![])
            .then(butter(
                fs,
                2,
                BandType::Lowpass,
                Edge::Single(self.f_eog_lowpass),
                Edge::Single(self.f_eog_lowpass + 1.0),
            ))
            .tap("debug12", vec![])
            .then(StageConfig::Node(NodeConfig::Buffer(buffer)))
            .tap("debug15", vec![])
            .then(StageConfig::Node(NodeConfig::Reduction(ReductionSettings {
                operations: vec![ReductionOp::TakeLast, ReductionOp::ExpandDims],
            })))
            .tap("debug13", vec![])
            .finish("eog");

        Ok(SmrErdLayout { common, eeg, eog, fs_out })
    }
}

/// Build the common, EEG and EOG pipelines of the preset
pub fn smr_erd_pipelines(config: &SmrErdConfig, bus: &TapBus) -> BspResult<SmrErdPipelines> {
    let layout = config.layout()?;
    let input = ChannelSet::new(config.input_channels.iter().cloned())?;
    let common = build_pipeline(input, &layout.common, bus)?;
    let branch = common.out_channels().clone();
    let eeg = build_pipeline(branch.clone(), &layout.eeg, bus)?;
    let eog = build_pipeline(branch, &layout.eog, bus)?;
    info!(fs_out = layout.fs_out, debug_taps = config.debug_taps, "SMR-ERD pipelines built");
    Ok(SmrErdPipelines {
        common,
        eeg,
        eog,
        fs_out: layout.fs_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bci_core::{block_from_channels, Chunk, Timestamps};

    fn config() -> SmrErdConfig {
        SmrErdConfig {
            input_channels: ["EOG1", "EOG2", "C3", "C4", "CZ"].map(String::from).to_vec(),
            spatial_weights: Some(vec![
                vec![1.0, -1.0, 0.0, 0.0, 0.0],
                vec![0.0, 0.0, 1.0, 0.0, 0.0],
                vec![0.0, 0.0, 0.0, 1.0, 0.0],
                vec![0.0, 0.0, 0.0, 0.0, 1.0],
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_weights_rejected() {
        let config = SmrErdConfig {
            spatial_weights: None,
            ..config()
        };
        assert!(matches!(
            smr_erd_pipelines(&config, &TapBus::default()),
            Err(BspError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn test_output_rate_adjusted() {
        let config = SmrErdConfig { fs_out: 30.0, ..config() };
        let (length, shift, fs_out) = config.framing().unwrap();
        assert_eq!(length, 200);
        assert_eq!(shift, 17);
        assert!((fs_out - 500.0 / 17.0).abs() < 1e-12);
        assert_eq!(config.layout().unwrap().fs_out, fs_out);

        let (_, shift, fs_out) = SmrErdConfig::default().framing().unwrap();
        assert_eq!((shift, fs_out), (20, 25.0));
    }

    #[test]
    fn test_branches_produce_features() {
        let pipelines = smr_erd_pipelines(&config(), &TapBus::default()).unwrap();
        let SmrErdPipelines {
            mut common,
            mut eeg,
            mut eog,
            fs_out,
        } = pipelines;
        assert_eq!(fs_out, 25.0);
        assert_eq!(common.out_channels().labels(), &["bipolar EOG", "C3", "C4", "CZ"]);
        assert_eq!(eeg.out_channels().labels(), &["C3", "C4", "CZ"]);
        assert_eq!(eog.out_channels().labels(), &["bipolar EOG"]);

        let rows: Vec<Vec<f64>> = (0..5)
            .map(|ch| (0..250).map(|i| ((i * (ch + 1)) as f64 * 0.07).sin()).collect())
            .collect();
        let ts = Timestamps::from_values((0..250).map(|i| i as f64 / 500.0));
        let chunk = Chunk::new(block_from_channels(&rows).unwrap(), Some(ts));

        let pre = common.process(&chunk).unwrap().unwrap();
        assert_eq!(pre.data.shape(), &[1, 4, 250]);

        let features = eeg.process(&pre).unwrap().unwrap();
        assert_eq!(features.data.shape(), &[1, 3, 1, 1]);
        assert!(features.data.iter().all(|v| v.is_finite()));

        let eye = eog.process(&pre).unwrap().unwrap();
        assert_eq!(eye.data.shape(), &[1, 1, 1]);
        assert_eq!(eye.timestamps, Some(Timestamps::Series(vec![Some(199.0 / 500.0)])));
    }

    #[test]
    fn test_debug_taps_follow_flag() {
        let layout = SmrErdConfig {
            debug_taps: true,
            ..config()
        }
        .layout()
        .unwrap();
        let enabled = layout
            .eeg
            .stages
            .iter()
            .filter(|s| matches!(s, StageConfig::Optional { enabled: true, .. }))
            .count();
        assert_eq!(enabled, 4);
        assert_eq!(layout.common.stages.len(), 10);
    }
}
