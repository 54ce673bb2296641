//! Spatial filtering: linear re-referencing across channels

use crate::processor::{check_dimensions, ProcessingNode};
use crate::registry::NodeConfig;
use bci_core::{time_len, trial_count, BspError, BspResult, ChannelSet, Chunk};
use ndarray::{Array2, Array3, Axis, Ix2};
use serde::{Deserialize, Serialize};

/// Settings of a spatial filter: one weight row per output channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialFilterSettings {
    /// `(out x in)` weight matrix, row-major
    pub weights: Vec<Vec<f64>>,
    pub out_channels: ChannelSet,
}

/// `output[trial] = W . input[trial]` for 3-axis blocks
pub struct SpatialFilterNode {
    in_channels: ChannelSet,
    settings: SpatialFilterSettings,
    weights: Array2<f64>,
}

impl SpatialFilterNode {
    pub fn new(in_channels: ChannelSet, settings: SpatialFilterSettings) -> BspResult<Self> {
        let n_out = settings.out_channels.len();
        let n_in = in_channels.len();
        if settings.weights.is_empty() {
            return Err(BspError::config("spatial filter requires a weight matrix"));
        }
        if settings.weights.len() != n_out || settings.weights.iter().any(|row| row.len() != n_in) {
            return Err(BspError::config(format!(
                "weight matrix must be {} x {} (out x in)",
                n_out, n_in
            )));
        }

        let flat: Vec<f64> = settings.weights.iter().flatten().copied().collect();
        let weights = Array2::from_shape_vec((n_out, n_in), flat).map_err(|e| BspError::config(e.to_string()))?;
        Ok(SpatialFilterNode {
            in_channels,
            settings,
            weights,
        })
    }

    /// Identity transform over `channels`
    pub fn identity(channels: ChannelSet) -> BspResult<Self> {
        let settings = Montage::new(channels.clone()).identity_all()?.build()?;
        SpatialFilterNode::new(channels, settings)
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }
}

impl ProcessingNode for SpatialFilterNode {
    fn name(&self) -> &str {
        "spatial_filter"
    }

    fn in_channels(&self) -> &ChannelSet {
        &self.in_channels
    }

    fn out_channels(&self) -> &ChannelSet {
        &self.settings.out_channels
    }

    fn process(&mut self, input: &Chunk) -> BspResult<Option<Chunk>> {
        if !check_dimensions(self.name(), &self.in_channels, input)? {
            return Ok(None);
        }
        if input.data.ndim() > 3 {
            return Err(BspError::shape(
                "spatial_filter",
                format!("cannot process {} axes, only (trial, channel, time)", input.data.ndim()),
            ));
        }

        let n_trials = trial_count(&input.data);
        let mut output = Array3::<f64>::zeros((n_trials, self.weights.nrows(), time_len(&input.data)));
        for (trial, mut out) in input.data.axis_iter(Axis(0)).zip(output.axis_iter_mut(Axis(0))) {
            let trial = trial
                .into_dimensionality::<Ix2>()
                .map_err(|e| BspError::shape("spatial_filter", e.to_string()))?;
            out.assign(&self.weights.dot(&trial));
        }

        Ok(Some(Chunk::new(output.into_dyn(), input.timestamps.clone())))
    }

    fn clear(&mut self) {}

    fn settings(&self) -> NodeConfig {
        NodeConfig::SpatialFilter(self.settings.clone())
    }
}

/// Builds spatial weight matrices by channel label
#[derive(Debug, Clone)]
pub struct Montage {
    in_channels: ChannelSet,
    rows: Vec<(String, Vec<f64>)>,
}

impl Montage {
    pub fn new(in_channels: ChannelSet) -> Self {
        Montage {
            in_channels,
            rows: Vec::new(),
        }
    }

    fn index(&self, label: &str) -> BspResult<usize> {
        self.in_channels
            .index_of(label)
            .ok_or_else(|| BspError::config(format!("channel '{}' not in {}", label, self.in_channels)))
    }

    /// Output channel from explicit `(input label, weight)` terms
    pub fn weighted(mut self, out_label: &str, terms: &[(&str, f64)]) -> BspResult<Self> {
        let mut row = vec![0.0; self.in_channels.len()];
        for (label, weight) in terms {
            row[self.index(label)?] += weight;
        }
        self.rows.push((out_label.to_string(), row));
        Ok(self)
    }

    /// Pass one channel through under its own label
    pub fn identity(self, label: &str) -> BspResult<Self> {
        self.weighted(label, &[(label, 1.0)])
    }

    /// Pass every input channel through
    pub fn identity_all(self) -> BspResult<Self> {
        let labels: Vec<String> = self.in_channels.labels().to_vec();
        labels.iter().try_fold(self, |montage, label| montage.identity(label))
    }

    /// `positive - negative`
    pub fn bipolar(self, out_label: &str, positive: &str, negative: &str) -> BspResult<Self> {
        self.weighted(out_label, &[(positive, 1.0), (negative, -1.0)])
    }

    /// Surface Laplacian: centre minus the mean of its neighbours
    pub fn laplacian(self, out_label: &str, centre: &str, neighbours: &[&str]) -> BspResult<Self> {
        if neighbours.is_empty() {
            return Err(BspError::config(format!("Laplacian around '{}' needs neighbours", centre)));
        }
        let weight = -1.0 / neighbours.len() as f64;
        let mut terms = vec![(centre, 1.0)];
        terms.extend(neighbours.iter().map(|n| (*n, weight)));
        self.weighted(out_label, &terms)
    }

    pub fn build(self) -> BspResult<SpatialFilterSettings> {
        let (labels, weights): (Vec<String>, Vec<Vec<f64>>) = self.rows.into_iter().unzip();
        Ok(SpatialFilterSettings {
            weights,
            out_channels: ChannelSet::new(labels)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bci_core::{Block, Timestamps};
    use ndarray::{Array, IxDyn};

    fn eeg() -> ChannelSet {
        ChannelSet::new(["Fz", "C3", "Cz", "C4", "Pz"]).unwrap()
    }

    fn block(n_trials: usize) -> Block {
        let n = n_trials * 5 * 4;
        Array::from_shape_vec(IxDyn(&[n_trials, 5, 4]), (0..n).map(|v| (v as f64).sin()).collect()).unwrap()
    }

    #[test]
    fn test_laplacian_weights() {
        let settings = Montage::new(eeg())
            .laplacian("lapCz", "Cz", &["Fz", "C3", "C4", "Pz"])
            .unwrap()
            .bipolar("C3-C4", "C3", "C4")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(settings.weights[0], vec![-0.25, -0.25, 1.0, -0.25, -0.25]);
        assert_eq!(settings.weights[1], vec![0.0, 1.0, 0.0, -1.0, 0.0]);
        assert_eq!(settings.out_channels.labels(), &["lapCz", "C3-C4"]);
    }

    #[test]
    fn test_unknown_label_rejected() {
        assert!(Montage::new(eeg()).bipolar("x", "C3", "T7").is_err());
    }

    #[test]
    fn test_output_channels_follow_weights() {
        let settings = Montage::new(eeg()).bipolar("C3-C4", "C3", "C4").unwrap().build().unwrap();
        let mut node = SpatialFilterNode::new(eeg(), settings).unwrap();
        let input = block(2);
        let ts = Some(Timestamps::from_values([0.0, 1.0, 2.0, 3.0]));
        let out = node.process(&Chunk::new(input.clone(), ts.clone())).unwrap().unwrap();
        assert_eq!(out.data.shape(), &[2, 1, 4]);
        assert_eq!(out.timestamps, ts);
        for t in 0..4 {
            assert!((out.data[[1, 0, t]] - (input[[1, 1, t]] - input[[1, 3, t]])).abs() < 1e-12);
        }
        assert_eq!(node.out_channels().len(), 1);
    }

    #[test]
    fn test_identity_is_passthrough() {
        let mut node = SpatialFilterNode::identity(eeg()).unwrap();
        let input = block(1);
        let out = node.process(&Chunk::new(input.clone(), None)).unwrap().unwrap();
        assert_eq!(out.data, input);
    }

    #[test]
    fn test_rejects_feature_axes() {
        let mut node = SpatialFilterNode::identity(eeg()).unwrap();
        let input = Block::zeros(IxDyn(&[1, 5, 2, 4]));
        assert!(matches!(
            node.process(&Chunk::new(input, None)),
            Err(BspError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_weight_shape() {
        let settings = SpatialFilterSettings {
            weights: vec![vec![1.0, 0.0]],
            out_channels: ChannelSet::new(["a"]).unwrap(),
        };
        assert!(SpatialFilterNode::new(eeg(), settings).is_err());
        let empty = SpatialFilterSettings {
            weights: Vec::new(),
            out_channels: ChannelSet::new(Vec::<String>::new()).unwrap(),
        };
        assert!(matches!(
            SpatialFilterNode::new(eeg(), empty),
            Err(BspError::ConfigurationError { .. })
        ));
    }
}
