//! Output side of the pipeline: where paced frames go.
//!
//! The real voice transport (Opus encoding, RTP, UDP) lives outside this
//! crate and plugs in through [`FrameSink`].

use anyhow::Result;
use async_trait::async_trait;
use std::{
    path::Path,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::{fs::File, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info};

/// Destino de los frames PCM ya pautados.
///
/// `emit_frame` always receives exactly one whole frame. An error from
/// either method is fatal for the player that owns the sink.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn emit_frame(&self, frame: &[u8]) -> Result<()>;

    async fn set_speaking(&self, speaking: bool) -> Result<()>;
}

/// Sink que descarta el audio (útil para pruebas de carga)
#[derive(Debug, Default)]
pub struct NullSink {
    frames: AtomicU64,
    speaking: AtomicBool,
}

impl NullSink {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameSink for NullSink {
    async fn emit_frame(&self, _frame: &[u8]) -> Result<()> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn set_speaking(&self, speaking: bool) -> Result<()> {
        self.speaking.store(speaking, Ordering::Relaxed);
        Ok(())
    }
}

/// Writes raw s16le frames to a file, playable with
/// `ffplay -f s16le -ar 48000 -ac 2 output.pcm`.
pub struct PcmFileSink {
    file: Mutex<File>,
    frames: AtomicU64,
}

impl PcmFileSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref()).await?;
        info!("💾 Escribiendo PCM en: {}", path.as_ref().display());
        Ok(Self {
            file: Mutex::new(file),
            frames: AtomicU64::new(0),
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameSink for PcmFileSink {
    async fn emit_frame(&self, frame: &[u8]) -> Result<()> {
        self.file.lock().await.write_all(frame).await?;
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn set_speaking(&self, speaking: bool) -> Result<()> {
        debug!("🎙️ Speaking: {}", speaking);
        if !speaking {
            self.file.lock().await.flush().await?;
        }
        Ok(())
    }
}
