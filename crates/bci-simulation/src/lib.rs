//! BCI-Simulation: Synthetic EEG sources for testing and demos
//!
//! Seeded sinusoid, noise and AR(p) generators, a motor-imagery ERD
//! simulator, and chunked replay of a recorded block with timestamps.

pub mod sources;
pub mod erd;
pub mod replay;

pub use sources::*;
pub use erd::*;
pub use replay::ChunkedReplay;
