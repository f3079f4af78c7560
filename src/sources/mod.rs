//! # Sources Module
//!
//! External collaborators of the playback core, expressed as traits:
//!
//! - [`Resolver`]: turns a logical reference (video page, search result,
//!   direct link) into a downloadable stream URL plus bitrate and duration
//! - [`StreamFetcher`]: opens the raw network byte stream for a resolved URL
//! - [`Transcoder`]: starts an external process that turns compressed media
//!   into interleaved s16le PCM at 48 kHz stereo
//!
//! Concrete implementations live in the submodules: [`ytdlp`],
//! [`direct_url`], [`smart`] for resolution, [`http`] for fetching and
//! [`ffmpeg`] for transcoding.

pub mod direct_url;
pub mod ffmpeg;
pub mod http;
pub mod smart;
pub mod ytdlp;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

pub use direct_url::DirectUrlResolver;
pub use ffmpeg::FfmpegTranscoder;
pub use http::HttpFetcher;
pub use smart::SmartResolver;
pub use ytdlp::YtDlpResolver;

/// Stream de bytes de lectura (red o salida del transcoder).
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Extremo de escritura (entrada del transcoder).
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Resultado de resolver una referencia
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAudio {
    pub stream_url: String,
    pub bitrate_kbit: Option<u32>,
    pub duration: Option<Duration>,
}

impl ResolvedAudio {
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            bitrate_kbit: None,
            duration: None,
        }
    }

    pub fn with_bitrate(mut self, bitrate_kbit: u32) -> Self {
        self.bitrate_kbit = Some(bitrate_kbit);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Resuelve una referencia lógica a una URL de audio descargable
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<ResolvedAudio>;

    /// Verifica si la referencia es válida para este resolver
    fn supports(&self, reference: &str) -> bool;

    fn name(&self) -> &'static str;
}

/// Abre el stream de red para una URL resuelta
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamFetcher: Send + Sync {
    async fn open(&self, url: &str) -> Result<ByteStream>;
}

/// Handle of a running transcoder process.
///
/// `kill` must be safe to call on a process that already exited.
pub trait TranscoderProcess: Send {
    fn kill(&mut self) -> Result<()>;

    fn id(&self) -> Option<u32>;
}

/// A started transcoder: compressed bytes go into `input`, PCM comes out of
/// `output`, and `process` owns the external lifetime.
pub struct TranscodeSession {
    pub input: ByteSink,
    pub output: ByteStream,
    pub process: Box<dyn TranscoderProcess>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn start(&self) -> Result<TranscodeSession>;
}
