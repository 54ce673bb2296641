//! Stateful digital filters: IIR cascade and single-pole smoother

use crate::iir_design::{design, FilterDesign, FilterSpec, Sos};
use crate::processor::{check_dimensions, ProcessingNode};
use crate::registry::NodeConfig;
use bci_core::{time_axis, Block, BspError, BspResult, ChannelSet, Chunk, TrainingSet};
use ndarray::ArrayViewMut1;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Delay line of one second-order section (transposed direct form II)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct SectionState {
    z0: f64,
    z1: f64,
}

/// IIR filter applied as a cascade of second-order sections.
///
/// The delay lines survive across calls, so one block and the same samples
/// split into many chunks filter identically once the state is primed.
pub struct IirFilterNode {
    name: String,
    channels: ChannelSet,
    spec: FilterSpec,
    design: FilterDesign,
    /// `lanes * sections` delay lines, lane-major
    state: Option<Vec<SectionState>>,
}

impl IirFilterNode {
    /// Design the filter; fails with a configuration error on an invalid spec
    pub fn new(channels: ChannelSet, spec: FilterSpec) -> BspResult<Self> {
        let design = design(&spec)?;
        debug!(
            band = ?spec.band,
            prototype = ?spec.prototype,
            order = spec.order,
            min_order = design.min_order,
            corners = ?design.corners,
            "Designed IIR filter"
        );
        Ok(IirFilterNode {
            name: format!("iir_{:?}", spec.band).to_lowercase(),
            channels,
            spec,
            design,
            state: None,
        })
    }

    pub fn design(&self) -> &FilterDesign {
        &self.design
    }

    /// Minimum order meeting the pass/stop specification
    pub fn min_order(&self) -> usize {
        self.design.min_order
    }

    /// Steady state for each lane's mean, which suppresses the start-up transient
    fn initial_state(&self, data: &Block) -> Vec<SectionState> {
        let axis = time_axis(data);
        data.lanes(axis)
            .into_iter()
            .flat_map(|lane| {
                let mean = lane.sum() / lane.len() as f64;
                self.design.zi.iter().map(move |zi| SectionState {
                    z0: zi[0] * mean,
                    z1: zi[1] * mean,
                })
            })
            .collect()
    }

    fn filter_lane(sections: &[Sos], state: &mut [SectionState], lane: &mut ArrayViewMut1<f64>) {
        for sample in lane.iter_mut() {
            let mut x = *sample;
            for (section, z) in sections.iter().zip(state.iter_mut()) {
                let y = section.b[0] * x + z.z0;
                z.z0 = section.b[1] * x - section.a[1] * y + z.z1;
                z.z1 = section.b[2] * x - section.a[2] * y;
                x = y;
            }
            *sample = x;
        }
    }
}

impl ProcessingNode for IirFilterNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_channels(&self) -> &ChannelSet {
        &self.channels
    }

    fn process(&mut self, input: &Chunk) -> BspResult<Option<Chunk>> {
        if !check_dimensions(&self.name, &self.channels, input)? {
            return Ok(None);
        }

        let mut data = input.data.clone();
        let axis = time_axis(&data);
        let n_sections = self.design.sections.len();
        let n_lanes = data.len() / data.len_of(axis);

        let mut state = match self.state.take() {
            Some(state) => state,
            None => self.initial_state(&data),
        };
        if state.len() != n_lanes * n_sections {
            let held = state.len() / n_sections.max(1);
            self.state = Some(state);
            return Err(BspError::shape(
                &self.name,
                format!("filter state holds {} lanes, block has {}", held, n_lanes),
            ));
        }

        for (mut lane, lane_state) in data.lanes_mut(axis).into_iter().zip(state.chunks_mut(n_sections)) {
            Self::filter_lane(&self.design.sections, lane_state, &mut lane);
        }
        self.state = Some(state);

        Ok(Some(Chunk::new(data, input.timestamps.clone())))
    }

    fn train(&mut self, input: &TrainingSet) -> BspResult<Option<TrainingSet>> {
        // trials are independent recordings; do not leak state into streaming
        self.clear();
        let chunk = Chunk::new(input.data.clone(), input.timestamps.clone());
        let out = self.process(&chunk);
        self.clear();
        Ok(out?.map(|out| TrainingSet {
            data: out.data,
            labels: input.labels.clone(),
            timestamps: out.timestamps,
        }))
    }

    fn clear(&mut self) {
        self.state = None;
    }

    fn settings(&self) -> NodeConfig {
        NodeConfig::IirFilter(self.spec.clone())
    }
}

/// Settings of a single-pole smoother
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinglePoleSettings {
    /// Time constant in seconds; 0 disables smoothing
    pub time_const: f64,
    pub sampling_rate: f64,
}

/// Exponential smoother `y[n] = y[n-1] + (1 - a)(x[n] - y[n-1])`
pub struct SinglePoleFilterNode {
    channels: ChannelSet,
    settings: SinglePoleSettings,
    decay: f64,
    /// One accumulator per (trial, channel, feature) lane
    state: Option<Vec<f64>>,
}

impl SinglePoleFilterNode {
    pub fn new(channels: ChannelSet, settings: SinglePoleSettings) -> BspResult<Self> {
        if !(settings.time_const >= 0.0 && settings.sampling_rate > 0.0) {
            return Err(BspError::config(format!(
                "single pole filter needs time_const >= 0 and sampling_rate > 0, got {} and {}",
                settings.time_const, settings.sampling_rate
            )));
        }
        let samples = settings.time_const * settings.sampling_rate;
        let decay = if samples == 0.0 { 0.0 } else { (-1.0 / samples).exp() };
        Ok(SinglePoleFilterNode {
            channels,
            settings,
            decay,
            state: None,
        })
    }

    pub fn decay_factor(&self) -> f64 {
        self.decay
    }
}

impl ProcessingNode for SinglePoleFilterNode {
    fn name(&self) -> &str {
        "single_pole"
    }

    fn in_channels(&self) -> &ChannelSet {
        &self.channels
    }

    fn process(&mut self, input: &Chunk) -> BspResult<Option<Chunk>> {
        if !check_dimensions(self.name(), &self.channels, input)? {
            return Ok(None);
        }

        let mut data = input.data.clone();
        let axis = time_axis(&data);
        let n_lanes = data.len() / data.len_of(axis);
        let state = self.state.get_or_insert_with(|| vec![0.0; n_lanes]);
        if state.len() != n_lanes {
            return Err(BspError::shape(
                "single_pole",
                format!("accumulator holds {} lanes, block has {}", state.len(), n_lanes),
            ));
        }

        let decay = self.decay;
        let gain = 1.0 - decay;
        for (mut lane, y) in data.lanes_mut(axis).into_iter().zip(state.iter_mut()) {
            for sample in lane.iter_mut() {
                *y = decay * *y + gain * *sample;
                *sample = *y;
            }
        }

        Ok(Some(Chunk::new(data, input.timestamps.clone())))
    }

    fn train(&mut self, input: &TrainingSet) -> BspResult<Option<TrainingSet>> {
        self.clear();
        let chunk = Chunk::new(input.data.clone(), input.timestamps.clone());
        let out = self.process(&chunk);
        self.clear();
        Ok(out?.map(|out| TrainingSet {
            data: out.data,
            labels: input.labels.clone(),
            timestamps: out.timestamps,
        }))
    }

    fn clear(&mut self) {
        self.state = None;
    }

    fn settings(&self) -> NodeConfig {
        NodeConfig::SinglePole(self.settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iir_design::{BandType, Edge, Prototype};
    use bci_core::Timestamps;
    use ndarray::{s, Array, IxDyn};

    fn channels(n: usize) -> ChannelSet {
        ChannelSet::new((0..n).map(|i| format!("Ch{}", i))).unwrap()
    }

    fn lowpass() -> FilterSpec {
        FilterSpec {
            sampling_rate: 500.0,
            order: 2,
            band: BandType::Lowpass,
            prototype: Prototype::Butter,
            fpass: Edge::Single(30.0),
            fstop: Edge::Single(40.0),
            gpass: 3.0,
            gstop: 40.0,
        }
    }

    #[test]
    fn test_constant_input_passes_lowpass_without_transient() {
        let mut filter = IirFilterNode::new(channels(2), lowpass()).unwrap();
        let input = Chunk::new(Block::from_elem(IxDyn(&[1, 2, 50]), 3.0), None);
        let out = filter.process(&input).unwrap().unwrap();
        assert_eq!(out.data.shape(), &[1, 2, 50]);
        for value in out.data.iter() {
            assert!((value - 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_channel_mismatch_is_fatal() {
        let mut filter = IirFilterNode::new(channels(2), lowpass()).unwrap();
        let input = Chunk::new(Block::zeros(IxDyn(&[1, 3, 10])), None);
        assert!(matches!(filter.process(&input), Err(BspError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_empty_block_not_ready() {
        let mut filter = IirFilterNode::new(channels(1), lowpass()).unwrap();
        let input = Chunk::new(Block::zeros(IxDyn(&[1, 1, 0])), None);
        assert!(filter.process(&input).unwrap().is_none());
    }

    #[test]
    fn test_chunked_filtering_matches_single_block() {
        let n = 400;
        let signal: Vec<f64> = (0..n)
            .map(|i| (i as f64 * 0.07).sin() + 0.5 * (i as f64 * 0.9).cos())
            .collect();
        let block = Array::from_shape_vec(IxDyn(&[1, 1, n]), signal).unwrap();
        let head = block.slice(s![.., .., ..40]).to_owned().into_dyn();

        let mut whole = IirFilterNode::new(channels(1), lowpass()).unwrap();
        let mut chunked = IirFilterNode::new(channels(1), lowpass()).unwrap();
        // prime both with the same first chunk so their initial state agrees
        let first_a = whole.process(&Chunk::new(head.clone(), None)).unwrap().unwrap();
        let first_b = chunked.process(&Chunk::new(head, None)).unwrap().unwrap();
        assert_eq!(first_a, first_b);

        let rest = block.slice(s![.., .., 40..]).to_owned().into_dyn();
        let expected = whole.process(&Chunk::new(rest, None)).unwrap().unwrap();

        let mut pieces = Vec::new();
        let mut start = 40;
        for size in [1, 7, 33, 2, 100, 57].iter().cycle() {
            if start >= n {
                break;
            }
            let end = (start + size).min(n);
            let piece = block.slice(s![.., .., start..end]).to_owned().into_dyn();
            let out = chunked.process(&Chunk::new(piece, None)).unwrap().unwrap();
            pieces.extend(out.data.iter().copied());
            start = end;
        }

        assert_eq!(pieces.len(), expected.data.len());
        for (a, b) in pieces.iter().zip(expected.data.iter()) {
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn test_clear_reinitialises_state() {
        let mut filter = IirFilterNode::new(channels(1), lowpass()).unwrap();
        let ones = Chunk::new(Block::from_elem(IxDyn(&[1, 1, 20]), 1.0), None);
        let first = filter.process(&ones).unwrap().unwrap();
        filter.clear();
        filter.clear();
        let again = filter.process(&ones).unwrap().unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_single_pole_identity_when_time_const_zero() {
        let mut node = SinglePoleFilterNode::new(
            channels(1),
            SinglePoleSettings { time_const: 0.0, sampling_rate: 10.0 },
        )
        .unwrap();
        assert_eq!(node.decay_factor(), 0.0);
        let data = Array::from_shape_vec(IxDyn(&[1, 1, 4]), vec![1.0, -2.0, 5.0, 0.5]).unwrap();
        let ts = Some(Timestamps::from_values([0.0, 0.1, 0.2, 0.3]));
        let out = node.process(&Chunk::new(data.clone(), ts.clone())).unwrap().unwrap();
        assert_eq!(out.data, data);
        assert_eq!(out.timestamps, ts);

        // exact even when the carried state is not representable as a short sum
        let data = Array::from_shape_vec(IxDyn(&[1, 1, 3]), vec![0.48965453676761217, 1.1913668933480301, -0.3]).unwrap();
        let out = node.process(&Chunk::new(data.clone(), None)).unwrap().unwrap();
        assert_eq!(out.data, data);
    }

    #[test]
    fn test_single_pole_state_spans_calls() {
        let settings = SinglePoleSettings { time_const: 1.0, sampling_rate: 10.0 };
        let mut node = SinglePoleFilterNode::new(channels(1), settings).unwrap();
        let a = (-0.1f64).exp();
        let step = Chunk::new(Block::from_elem(IxDyn(&[1, 1, 1]), 1.0), None);
        let y1 = node.process(&step).unwrap().unwrap().data[[0, 0, 0]];
        let y2 = node.process(&step).unwrap().unwrap().data[[0, 0, 0]];
        assert!((y1 - (1.0 - a)).abs() < 1e-12);
        assert!((y2 - (1.0 - a * a)).abs() < 1e-12);

        node.clear();
        let y = node.process(&step).unwrap().unwrap().data[[0, 0, 0]];
        assert!((y - y1).abs() < 1e-12);
    }

    #[test]
    fn test_single_pole_rejects_negative_time_const() {
        assert!(SinglePoleFilterNode::new(
            channels(1),
            SinglePoleSettings { time_const: -1.0, sampling_rate: 10.0 }
        )
        .is_err());
    }
}
