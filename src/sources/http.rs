use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use std::{io, time::Duration};
use tokio_util::io::StreamReader;
use tracing::debug;

use super::{ByteStream, StreamFetcher};

/// Abre streams HTTP(S) con reqwest, sin cargar el cuerpo en memoria.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("music-pipeline/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Error creando cliente HTTP")?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StreamFetcher for HttpFetcher {
    async fn open(&self, url: &str) -> Result<ByteStream> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Error conectando a {}", url))?
            .error_for_status()?;

        debug!(
            "🌐 Stream abierto ({:?} bytes): {}",
            response.content_length(),
            response.url()
        );

        let body = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::new(StreamReader::new(body)))
    }
}
