//! BCI-Core: Foundation types for the neurofeedback signal pipeline
//!
//! Channel sets, the block/timestamp data model and the shared error type.

pub mod block;
pub mod channels;
pub mod error;

pub use block::*;
pub use channels::ChannelSet;
pub use error::{BspError, BspResult};
