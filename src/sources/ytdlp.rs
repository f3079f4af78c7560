use anyhow::{Context, Result};
use async_process::Command;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::{sync::LazyLock, time::Duration};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::{ResolvedAudio, Resolver};

static YOUTUBE_URL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?(www\.|m\.)?(youtube\.com/(watch\?v=|embed/|v/|shorts/)|youtu\.be/|music\.youtube\.com/)").ok()
});

/// Información extraída de yt-dlp
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    duration: Option<f64>,
    /// URL del formato elegido por `-f`
    url: Option<String>,
    abr: Option<f64>,
    formats: Option<Vec<Format>>,
    is_live: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct Format {
    url: String,
    acodec: Option<String>,
    vcodec: Option<String>,
    abr: Option<f64>,
}

impl Format {
    fn is_audio_only(&self) -> bool {
        self.vcodec.as_deref() == Some("none") && self.acodec.as_deref().is_some_and(|c| c != "none")
    }
}

/// Resolver basado en yt-dlp.
///
/// Handles video pages of any site yt-dlp knows plus free-text searches
/// (`ytsearch1:`). Picks the audio-only format with the highest bitrate.
pub struct YtDlpResolver {
    binary: String,
    rate_limiter: Semaphore,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            // Limitar procesos concurrentes para evitar rate limiting
            rate_limiter: Semaphore::new(3),
        }
    }

    /// Verifica si una URL es de YouTube
    pub fn is_youtube_url(url: &str) -> bool {
        YOUTUBE_URL.as_ref().is_some_and(|re| re.is_match(url))
    }

    /// Versión instalada, usada por el health check
    pub async fn version(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("Error al ejecutar {}", self.binary))?;

        if !output.status.success() {
            anyhow::bail!("{} --version falló", self.binary);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn target(reference: &str) -> String {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            reference.to_string()
        } else {
            format!("ytsearch1:{}", reference)
        }
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    async fn resolve(&self, reference: &str) -> Result<ResolvedAudio> {
        let _permit = self.rate_limiter.acquire().await?;
        let target = Self::target(reference);
        debug!("🎵 Resolviendo con yt-dlp: {}", target);

        let output = Command::new(&self.binary)
            .args([
                "--no-playlist",
                "--dump-json",
                "-f",
                "bestaudio/best",
                "--no-warnings",
                &target,
            ])
            .output()
            .await
            .context("Error al ejecutar yt-dlp")?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("yt-dlp error: {}", error.trim());
        }

        // las búsquedas devuelven una línea JSON por resultado
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .context("yt-dlp no devolvió resultados")?;
        let info: YtDlpInfo =
            serde_json::from_str(line).context("Error al parsear respuesta de yt-dlp")?;

        if let Some(title) = &info.title {
            info!("🔗 Resuelto: {}", title);
        }
        select_stream(info)
    }

    fn supports(&self, reference: &str) -> bool {
        !reference.trim().is_empty()
    }

    fn name(&self) -> &'static str {
        "yt-dlp"
    }
}

/// Elige el mejor formato de solo audio, o el formato ya seleccionado por `-f`.
fn select_stream(info: YtDlpInfo) -> Result<ResolvedAudio> {
    if info.is_live.unwrap_or(false) {
        anyhow::bail!("Los streams en vivo no están soportados");
    }

    let best_audio = info
        .formats
        .unwrap_or_default()
        .into_iter()
        .filter(Format::is_audio_only)
        .max_by(|a, b| a.abr.unwrap_or(0.0).total_cmp(&b.abr.unwrap_or(0.0)));

    let (url, abr) = match best_audio {
        Some(format) => (format.url, format.abr),
        None => (
            info.url.context("yt-dlp no reportó una URL de stream")?,
            info.abr,
        ),
    };

    let mut resolved = ResolvedAudio::new(url);
    if let Some(abr) = abr.filter(|abr| *abr > 0.0) {
        resolved = resolved.with_bitrate(abr.round() as u32);
    }
    if let Some(duration) = info.duration.filter(|d| d.is_finite() && *d > 0.0) {
        resolved = resolved.with_duration(Duration::from_secs_f64(duration));
    }
    Ok(resolved)
}
