//! Real-time audio for the call engine: the frame type, resampling,
//! voice-activity detection, jitter buffering and the per-call
//! streaming pipeline.

pub mod frame;
pub mod jitter;
pub mod pipeline;
pub mod resampler;
pub mod vad;

pub use frame::{StreamDirection, StreamFrame};
pub use pipeline::{AudioPipeline, FrameSink, PipelineSettings};
