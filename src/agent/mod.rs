//! Orchestrator: wires source, batcher, buffer, uploaders and the health
//! monitor into one of the run modes and owns the shutdown sequence.

pub mod capture;
pub mod decode;
pub mod runner;

pub use capture::{CaptureLoop, CaptureSummary, FrameConsumer, StopReason};
pub use decode::{CatalogDecoder, FrameDecoder};
pub use runner::{termination_signal, AgentError, AgentRunner, RunMode, RunSummary};
