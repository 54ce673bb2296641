//! Debug taps publishing intermediate stage output

use crate::processor::{check_dimensions, ProcessingNode};
use crate::registry::NodeConfig;
use bci_core::{time_axis, BspError, BspResult, ChannelSet, Chunk, Timestamps, TrainingSet};
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// One published sample
#[derive(Debug, Clone, PartialEq)]
pub struct TapSample {
    pub stream: String,
    pub source_id: String,
    /// Channel-major flattened channel x feature values
    pub values: Vec<f64>,
    pub timestamp: f64,
}

/// Sink for tapped samples
pub trait SamplePublisher: Send {
    fn push(&mut self, values: &[f64], timestamp: f64) -> BspResult<()>;
}

/// In-process bus carrying every tap's samples
#[derive(Debug, Clone)]
pub struct TapBus {
    sender: broadcast::Sender<TapSample>,
}

impl TapBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        TapBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TapSample> {
        self.sender.subscribe()
    }

    /// Publisher stamping samples with `stream` and `source_id`
    pub fn publisher(&self, stream: &str, source_id: &str) -> BusPublisher {
        BusPublisher {
            stream: stream.to_string(),
            source_id: source_id.to_string(),
            sender: self.sender.clone(),
        }
    }
}

impl Default for TapBus {
    fn default() -> Self {
        TapBus::new(1024)
    }
}

/// [`SamplePublisher`] backed by a [`TapBus`]
pub struct BusPublisher {
    stream: String,
    source_id: String,
    sender: broadcast::Sender<TapSample>,
}

impl SamplePublisher for BusPublisher {
    fn push(&mut self, values: &[f64], timestamp: f64) -> BspResult<()> {
        // no subscribers is fine: nobody is watching this tap
        let _ = self.sender.send(TapSample {
            stream: self.stream.clone(),
            source_id: self.source_id.clone(),
            values: values.to_vec(),
            timestamp,
        });
        Ok(())
    }
}

/// Settings of a tap node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TapSettings {
    /// Defaults to `tap_` plus a random suffix
    #[serde(default)]
    pub stream_name: Option<String>,
    /// Defaults to a random UUID
    #[serde(default)]
    pub source_id: Option<String>,
    /// Stamp samples with the wall clock regardless of input timestamps
    #[serde(default)]
    pub new_timestamps: bool,
    /// Sizes of the feature axes between channel and time
    #[serde(default)]
    pub feature_dimensions: Vec<usize>,
}

impl TapSettings {
    /// Settings with stream name and source id filled in
    pub fn resolved(mut self) -> Self {
        let id = Uuid::new_v4();
        if self.stream_name.is_none() {
            self.stream_name = Some(format!("tap_{}", &id.simple().to_string()[..6]));
        }
        if self.source_id.is_none() {
            self.source_id = Some(id.to_string());
        }
        self
    }

    pub fn stream_name(&self) -> &str {
        self.stream_name.as_deref().unwrap_or("tap")
    }

    pub fn source_id(&self) -> &str {
        self.source_id.as_deref().unwrap_or_default()
    }
}

fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Pass-through node pushing every sample it sees to a publisher.
///
/// Publishing is synchronous, so a slow publisher stalls the pipeline.
/// Publisher failures are logged and never stop the data flow.
pub struct TapNode {
    channels: ChannelSet,
    settings: TapSettings,
    publisher: Box<dyn SamplePublisher>,
}

impl TapNode {
    pub fn new(channels: ChannelSet, settings: TapSettings, publisher: Box<dyn SamplePublisher>) -> Self {
        TapNode {
            channels,
            settings: settings.resolved(),
            publisher,
        }
    }

    /// Tap publishing on `bus`
    pub fn on_bus(channels: ChannelSet, settings: TapSettings, bus: &TapBus) -> Self {
        let settings = settings.resolved();
        let publisher = bus.publisher(settings.stream_name(), settings.source_id());
        TapNode::new(channels, settings, Box::new(publisher))
    }

    fn expected_width(&self) -> usize {
        self.channels.len() * self.settings.feature_dimensions.iter().product::<usize>()
    }

    fn publish(&mut self, input: &Chunk) -> BspResult<()> {
        let data = &input.data;
        let axis = time_axis(data);
        let n_times = data.len_of(axis);
        let width: usize = data.shape()[1..data.ndim() - 1].iter().product();
        if width != self.expected_width() {
            warn!(
                stream = self.settings.stream_name(),
                width,
                expected = self.expected_width(),
                "Channel x feature count does not match the tap, not publishing"
            );
            return Ok(());
        }
        if data.len_of(Axis(0)) > 1 {
            warn!(
                stream = self.settings.stream_name(),
                trials = data.len_of(Axis(0)),
                "Publishing several trials one after another"
            );
        }

        let stamps: Vec<f64> = match (&input.timestamps, self.settings.new_timestamps) {
            (Some(Timestamps::Scalar(t)), false) => vec![*t; n_times],
            (Some(ts @ Timestamps::Series(series)), false) if !ts.has_unknown() => {
                series.iter().map(|t| t.unwrap_or_default()).collect()
            }
            _ => vec![wall_clock(); n_times],
        };

        for trial in data.axis_iter(Axis(0)) {
            let time = Axis(trial.ndim() - 1);
            for (sample, timestamp) in trial.axis_iter(time).zip(&stamps) {
                let values: Vec<f64> = sample.iter().copied().collect();
                self.publisher.push(&values, *timestamp)?;
            }
        }
        Ok(())
    }
}

impl ProcessingNode for TapNode {
    fn name(&self) -> &str {
        self.settings.stream_name()
    }

    fn in_channels(&self) -> &ChannelSet {
        &self.channels
    }

    fn process(&mut self, input: &Chunk) -> BspResult<Option<Chunk>> {
        if !check_dimensions(self.settings.stream_name(), &self.channels, input)? {
            return Ok(None);
        }
        if let Err(error) = self.publish(input) {
            match error {
                BspError::Publish { .. } => warn!(%error, "Tap publish failed"),
                other => return Err(other),
            }
        }
        Ok(Some(input.clone()))
    }

    fn train(&mut self, input: &TrainingSet) -> BspResult<Option<TrainingSet>> {
        Ok(Some(input.clone()))
    }

    fn clear(&mut self) {}

    fn settings(&self) -> NodeConfig {
        NodeConfig::Tap(self.settings.clone())
    }
}
