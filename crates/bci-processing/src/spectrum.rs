//! Spectral feature node built on the Burg estimator

use crate::burg::{BurgSpectrumSettings, SpectrumEstimator};
use crate::processor::{check_dimensions, ProcessingNode};
use crate::registry::NodeConfig;
use bci_core::{time_len, BspError, BspResult, ChannelSet, Chunk, Timestamps};
use ndarray::{Array4, Axis};

/// Per-window oscillatory power (or amplitude) around a frequency of interest.
///
/// Output shape is `(trials, channels, nbins, 1)`; the single time sample
/// carries the most recent input timestamp.
pub struct BurgSpectrumNode {
    channels: ChannelSet,
    estimator: SpectrumEstimator,
}

impl BurgSpectrumNode {
    pub fn new(channels: ChannelSet, settings: BurgSpectrumSettings) -> BspResult<Self> {
        Ok(BurgSpectrumNode {
            channels,
            estimator: SpectrumEstimator::new(settings)?,
        })
    }

    /// Centre frequency of every output bin
    pub fn center_frequencies(&self) -> Vec<f64> {
        self.estimator.center_frequencies()
    }
}

impl ProcessingNode for BurgSpectrumNode {
    fn name(&self) -> &str {
        "burg_spectrum"
    }

    fn in_channels(&self) -> &ChannelSet {
        &self.channels
    }

    fn process(&mut self, input: &Chunk) -> BspResult<Option<Chunk>> {
        if !check_dimensions(self.name(), &self.channels, input)? {
            return Ok(None);
        }
        let data = &input.data;
        if data.ndim() > 3 {
            return Err(BspError::shape(
                "burg_spectrum",
                format!("cannot process {} axes, only (trial, channel, time)", data.ndim()),
            ));
        }

        let (n_trials, n_channels) = (data.len_of(Axis(0)), data.len_of(Axis(1)));
        let nbins = self.estimator.settings().nbins;
        let order = self.estimator.settings().model_order();
        if order >= time_len(data) {
            return Err(BspError::config(format!(
                "model order {} must be below the window length {}",
                order,
                time_len(data)
            )));
        }

        let mut output = Array4::<f64>::zeros((n_trials, n_channels, nbins, 1));
        for (trial, mut out_trial) in data.axis_iter(Axis(0)).zip(output.axis_iter_mut(Axis(0))) {
            for (signal, mut out_channel) in trial.axis_iter(Axis(0)).zip(out_trial.axis_iter_mut(Axis(0))) {
                let samples: Vec<f64> = signal.iter().copied().collect();
                let bins = self.estimator.estimate(&samples)?;
                for (value, bin) in out_channel.iter_mut().zip(bins) {
                    *value = bin;
                }
            }
        }

        let timestamp = input.timestamps.as_ref().and_then(Timestamps::last);
        Ok(Some(Chunk::new(
            output.into_dyn(),
            Some(Timestamps::Series(vec![timestamp])),
        )))
    }

    fn clear(&mut self) {}

    fn settings(&self) -> NodeConfig {
        NodeConfig::BurgSpectrum(self.estimator.settings().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burg::OutputType;
    use bci_core::{block_from_channels, Block};
    use bci_simulation::SineSource;
    use ndarray::IxDyn;

    fn node(nbins: usize) -> BurgSpectrumNode {
        let settings = BurgSpectrumSettings {
            nbins,
            ..BurgSpectrumSettings::new(500.0, 10.0)
        };
        BurgSpectrumNode::new(ChannelSet::new(["C3"]).unwrap(), settings).unwrap()
    }

    #[test]
    fn test_output_layout_and_timestamp() {
        let mut node = node(3);
        let signal = SineSource::new(500.0, vec![10.0], 1.0, 0.1, 5).generate(250);
        let ts = Timestamps::from_values((0..250).map(|i| i as f64 / 500.0));
        let out = node
            .process(&Chunk::new(block_from_channels(&signal).unwrap(), Some(ts)))
            .unwrap()
            .unwrap();
        assert_eq!(out.data.shape(), &[1, 1, 3, 1]);
        assert_eq!(out.timestamps, Some(Timestamps::Series(vec![Some(249.0 / 500.0)])));
        assert_eq!(node.center_frequencies(), vec![7.0, 10.0, 13.0]);
    }

    #[test]
    fn test_scalar_and_missing_timestamps() {
        let mut node = node(1);
        let signal = block_from_channels(&SineSource::new(500.0, vec![10.0], 1.0, 0.1, 9).generate(100)).unwrap();
        let out = node
            .process(&Chunk::new(signal.clone(), Some(Timestamps::Scalar(2.0))))
            .unwrap()
            .unwrap();
        assert_eq!(out.timestamps, Some(Timestamps::Series(vec![Some(2.0)])));
        let out = node.process(&Chunk::new(signal, None)).unwrap().unwrap();
        assert_eq!(out.timestamps, Some(Timestamps::Series(vec![None])));
    }

    #[test]
    fn test_window_shorter_than_order() {
        let mut node = node(1);
        let short = Block::ones(IxDyn(&[1, 1, 40]));
        assert!(matches!(
            node.process(&Chunk::new(short, None)),
            Err(BspError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn test_constant_window_reports_instability() {
        let mut node = node(1);
        let flat = Block::from_elem(IxDyn(&[1, 1, 100]), 2.0);
        assert!(matches!(
            node.process(&Chunk::new(flat, None)),
            Err(BspError::AlgorithmicInstability { .. })
        ));
        let silent = Block::zeros(IxDyn(&[1, 1, 100]));
        let out = node.process(&Chunk::new(silent, None)).unwrap().unwrap();
        assert_eq!(out.data[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_power_is_amplitude_squared() {
        let signal = block_from_channels(&SineSource::new(500.0, vec![12.0], 2.0, 0.2, 1).generate(300)).unwrap();
        let mut amplitude = node(1);
        let mut power = BurgSpectrumNode::new(
            ChannelSet::new(["C3"]).unwrap(),
            BurgSpectrumSettings {
                output_type: OutputType::Power,
                ..BurgSpectrumSettings::new(500.0, 10.0)
            },
        )
        .unwrap();
        let a = amplitude.process(&Chunk::new(signal.clone(), None)).unwrap().unwrap().data[[0, 0, 0, 0]];
        let p = power.process(&Chunk::new(signal, None)).unwrap().unwrap().data[[0, 0, 0, 0]];
        assert!((a * a - p).abs() < 1e-9 * p.max(1.0));
    }
}
