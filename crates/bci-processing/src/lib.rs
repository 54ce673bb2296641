//! BCI-Processing: Streaming signal pipeline for neurofeedback
//!
//! Stateful nodes (IIR and single-pole filters, windowing buffer, spatial
//! filter, channel selection, reductions, Burg spectra, debug taps) chained
//! by the pipeline engine and driven by a session worker.

pub mod processor;
pub mod iir_design;
pub mod filters;
pub mod buffer;
pub mod spatial;
pub mod selector;
pub mod reduction;
pub mod burg;
pub mod spectrum;
pub mod tap;
pub mod pipeline;
pub mod registry;
pub mod presets;
pub mod session;

pub use processor::{check_dimensions, ProcessingNode};
pub use iir_design::{design, BandType, Edge, FilterDesign, FilterSpec, Prototype, Sos};
pub use filters::{IirFilterNode, SinglePoleFilterNode, SinglePoleSettings};
pub use buffer::{BufferNode, BufferSettings};
pub use spatial::{Montage, SpatialFilterNode, SpatialFilterSettings};
pub use selector::{ChannelSelectorNode, SelectorSettings};
pub use reduction::{ReductionNode, ReductionOp, ReductionSettings};
pub use burg::{arburg, arburg_fast, ArModel, BurgSpectrumSettings, OutputType, SpectrumEstimator};
pub use spectrum::BurgSpectrumNode;
pub use tap::{BusPublisher, SamplePublisher, TapBus, TapNode, TapSample, TapSettings};
pub use pipeline::{Pipeline, PipelineBuilder, Stage};
pub use registry::{build_node, build_pipeline, NodeConfig, PipelineConfig, StageConfig};
pub use presets::{smr_erd_pipelines, SmrErdConfig, SmrErdLayout, SmrErdPipelines};
pub use session::{SessionState, SessionWorker};
