use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::audio::frame::FRAME_DURATION_MS;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Audio
    pub default_volume: f32,
    pub max_queue_size: usize,
    pub frame_buffer_ms: u64,
    pub max_silence_frames: u32,
    pub drift_reset_ms: u64,
    pub volume_ramp_frames: u32,
    pub default_bitrate_kbit: u32,

    // Red
    pub read_ahead_seconds: u64,
    pub resolve_cache_ttl: u64, // En segundos

    // Herramientas externas
    pub ytdlp_path: String,
    pub ffmpeg_path: String,

    // Rendimiento
    pub worker_threads: usize,

    // Paths
    pub data_dir: PathBuf,
    pub output_path: PathBuf,
}

fn env_or<T: std::str::FromStr>(name: &str, default: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{} inválido ({:?}): {}", name, raw, e))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Audio
            default_volume: env_or("DEFAULT_VOLUME", "0.5")?,
            max_queue_size: env_or("MAX_QUEUE_SIZE", "1000")?,
            frame_buffer_ms: env_or("FRAME_BUFFER_MS", "200")?,
            max_silence_frames: env_or("MAX_SILENCE_FRAMES", "25")?, // 500 ms
            drift_reset_ms: env_or("DRIFT_RESET_MS", "1000")?,
            volume_ramp_frames: env_or("VOLUME_RAMP_FRAMES", "15")?, // 300 ms
            default_bitrate_kbit: env_or("DEFAULT_BITRATE_KBIT", "128")?,

            // Red
            read_ahead_seconds: env_or::<u64>("READ_AHEAD_SECONDS", "30")?.clamp(1, 600),
            resolve_cache_ttl: env_or("RESOLVE_CACHE_TTL", "1800")?, // 30 minutos

            // Herramientas externas
            ytdlp_path: std::env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string()),
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),

            // Rendimiento
            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.trim().parse()?,
                _ => num_cpus::get(),
            },

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string())
                .into(),
            output_path: std::env::var("OUTPUT_PATH")
                .unwrap_or_else(|_| "output.pcm".to_string())
                .into(),
        };

        config.validate()?;

        // Create directories if they don't exist
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.0 and 1.0
    /// - Queue size, silence threshold and worker threads must be > 0
    /// - The frame buffer must hold at least one 20 ms frame
    /// - The drift threshold must be longer than one frame
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_volume) {
            anyhow::bail!("Default volume must be between 0.0 and 1.0, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.frame_buffer_ms < FRAME_DURATION_MS as u64 {
            anyhow::bail!(
                "Frame buffer must hold at least one frame ({} ms), got: {} ms",
                FRAME_DURATION_MS,
                self.frame_buffer_ms
            );
        }

        if self.max_silence_frames == 0 {
            anyhow::bail!("Max silence frames must be greater than 0");
        }

        if self.drift_reset_ms <= FRAME_DURATION_MS as u64 {
            anyhow::bail!("Drift reset threshold must exceed one frame, got: {} ms", self.drift_reset_ms);
        }

        if self.default_bitrate_kbit == 0 {
            anyhow::bail!("Default bitrate must be greater than 0");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Audio: {}% vol, {} ms buffer ({} frames), {} kbps hint\n  \
            Pacing: {} silence frames, {} ms drift reset, {} ramp frames\n  \
            Network: {}s read-ahead, {}s resolve cache\n  \
            Tools: {} / {}\n  \
            Limits: {} queue, {} workers\n  \
            Data: {}",
            (self.default_volume * 100.0) as u32,
            self.frame_buffer_ms,
            self.frame_buffer_ms / FRAME_DURATION_MS as u64,
            self.default_bitrate_kbit,
            self.max_silence_frames,
            self.drift_reset_ms,
            self.volume_ramp_frames,
            self.read_ahead_seconds,
            self.resolve_cache_ttl,
            self.ytdlp_path,
            self.ffmpeg_path,
            self.max_queue_size,
            self.worker_threads,
            self.data_dir.display()
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            default_volume: 0.5,
            max_queue_size: 1000,
            frame_buffer_ms: 200,
            max_silence_frames: 25,
            drift_reset_ms: 1000,
            volume_ramp_frames: 15,
            default_bitrate_kbit: 128,

            read_ahead_seconds: 30,
            resolve_cache_ttl: 1800,

            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),

            worker_threads: num_cpus::get(),

            data_dir: "./data".into(),
            output_path: "output.pcm".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(config.summary().contains("10 frames"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let loud = Config {
            default_volume: 1.5,
            ..Config::default()
        };
        assert!(loud.validate().is_err());

        let tiny_buffer = Config {
            frame_buffer_ms: 10,
            ..Config::default()
        };
        assert!(tiny_buffer.validate().is_err());

        let no_drift = Config {
            drift_reset_ms: 20,
            ..Config::default()
        };
        assert!(no_drift.validate().is_err());

        let empty_queue = Config {
            max_queue_size: 0,
            ..Config::default()
        };
        assert!(empty_queue.validate().is_err());
    }
}
