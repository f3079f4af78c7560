//! Real-time audio playback pipeline.
//!
//! Streams a queue of remote audio sources into a fixed-cadence PCM sink:
//! one 20 ms frame of 48 kHz stereo s16le every 20 ms, with pause, skip,
//! per-guild volume and recovery from network stalls or broken sources.

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod sources;
pub mod storage;

pub use error::{PipelineError, PipelineResult};
