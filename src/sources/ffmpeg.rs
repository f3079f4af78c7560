use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
};
use tracing::{debug, warn};

use super::{TranscodeSession, Transcoder, TranscoderProcess};
use crate::audio::frame::{CHANNELS, SAMPLE_RATE};

/// Lanza ffmpeg leyendo de stdin y escribiendo PCM s16le por stdout.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: String,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn args() -> Vec<String> {
        let sample_rate = SAMPLE_RATE.to_string();
        let channels = CHANNELS.to_string();
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-vn",
            "-f",
            "s16le",
            "-acodec",
            "pcm_s16le",
            "-ar",
            sample_rate.as_str(),
            "-ac",
            channels.as_str(),
            "pipe:1",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    /// Versión instalada, usada por el health check
    pub async fn version(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("-version")
            .output()
            .await
            .with_context(|| format!("Error al ejecutar {}", self.binary))?;

        if !output.status.success() {
            anyhow::bail!("{} -version falló", self.binary);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(&self) -> Result<TranscodeSession> {
        let mut child = Command::new(&self.binary)
            .args(Self::args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Error al iniciar {}", self.binary))?;

        let input = child.stdin.take().context("ffmpeg sin stdin")?;
        let output = child.stdout.take().context("ffmpeg sin stdout")?;
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("ffmpeg[{:?}]: {}", pid, line);
                }
            });
        }

        debug!("🎬 ffmpeg iniciado (pid {:?})", pid);
        Ok(TranscodeSession {
            input: Box::new(input),
            output: Box::new(output),
            process: Box::new(FfmpegProcess { child }),
        })
    }
}

struct FfmpegProcess {
    child: Child,
}

impl TranscoderProcess for FfmpegProcess {
    fn kill(&mut self) -> Result<()> {
        // ya terminó: nada que matar
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("ffmpeg ya había terminado: {}", status);
            return Ok(());
        }
        self.child.start_kill().context("Error terminando ffmpeg")
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}
