use anyhow::Result;
use async_trait::async_trait;
use url::Url;

use super::{ResolvedAudio, Resolver};

const AUDIO_EXTENSIONS: [&str; 7] = [".mp3", ".wav", ".ogg", ".opus", ".flac", ".m4a", ".aac"];

/// Resolver para enlaces directos a archivos de audio.
///
/// No metadata step: the URL is streamed as is and the read-ahead buffer is
/// sized from the configured bitrate hint.
#[derive(Debug, Default)]
pub struct DirectUrlResolver;

impl DirectUrlResolver {
    pub fn new() -> Self {
        Self
    }

    fn parse(reference: &str) -> Option<Url> {
        let url = Url::parse(reference.trim()).ok()?;
        matches!(url.scheme(), "http" | "https").then_some(url)
    }
}

#[async_trait]
impl Resolver for DirectUrlResolver {
    async fn resolve(&self, reference: &str) -> Result<ResolvedAudio> {
        let url = Self::parse(reference)
            .ok_or_else(|| anyhow::anyhow!("URL directa inválida: {}", reference))?;
        Ok(ResolvedAudio::new(url.as_str()))
    }

    fn supports(&self, reference: &str) -> bool {
        let Some(url) = Self::parse(reference) else {
            return false;
        };
        let path = url.path().to_lowercase();
        AUDIO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}
