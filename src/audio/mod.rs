//! # Audio Module
//!
//! Real-time playback core: turns a queue of remote, variable-latency
//! sources into a strictly paced stream of 20 ms PCM frames.
//!
//! ## Architecture
//!
//! ```text
//! Resolver → StreamFetcher → ReadAheadBuffer → Transcoder ─┐
//!                                                          │ PCM
//! SourceQueue ── consumer loop ── PcmChunker ── FrameQueue ┘
//!                                                  │
//!                                  FramePacer ── FrameSink
//! ```
//!
//! ### [`source`] - Source lifecycle
//! - Exactly-once background initialization per source
//! - Disposal releases the read-ahead buffer and kills the transcoder
//!
//! ### [`queue`] - Scheduling
//! - FIFO plus a single current slot, one-ahead prefetch
//! - Skip while a candidate initializes never returns that candidate
//!
//! ### [`pacer`] - Output pacing
//! - Bounded frame queue whose backpressure throttles decoding
//! - Silence ticks, prolonged-silence signalling, drift reset
//!
//! ### [`player`] - Per-guild player
//! - Consumer loop, pause/skip, persisted volume
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz
//! - **Bit Depth**: 16-bit signed little-endian
//! - **Channels**: Stereo (2 channels, interleaved)
//! - **Frame**: 20 ms = 3 840 bytes

pub mod frame;
pub mod pacer;
pub mod player;
pub mod queue;
pub mod read_ahead;
pub mod sink;
pub mod source;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

pub use pacer::PacerConfig;
pub use player::{AudioPlayer, PlayerConfig, PlayerManager};
pub use queue::{QueueSnapshot, SourceQueue};
pub use sink::{FrameSink, NullSink, PcmFileSink};
pub use source::{AudioSource, SourceBackend, SourceState, TrackInfo};
