use anyhow::Result;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::debug;

use super::{DirectUrlResolver, ResolvedAudio, Resolver, YtDlpResolver};
use crate::cache::ResolveCache;

const CACHE_CAPACITY: usize = 500;

/// Elige el resolver adecuado para cada referencia y cachea el resultado.
///
/// Resolvers are tried in order; the first whose `supports` accepts the
/// reference handles it.
pub struct SmartResolver {
    resolvers: Vec<Arc<dyn Resolver>>,
    cache: ResolveCache,
}

impl SmartResolver {
    pub fn new(resolvers: Vec<Arc<dyn Resolver>>, cache_ttl: Duration) -> Self {
        Self {
            resolvers,
            cache: ResolveCache::new(CACHE_CAPACITY, cache_ttl),
        }
    }

    /// Enlaces directos primero, yt-dlp para todo lo demás.
    pub fn with_defaults(ytdlp_path: &str, cache_ttl: Duration) -> Self {
        Self::new(
            vec![
                Arc::new(DirectUrlResolver::new()),
                Arc::new(YtDlpResolver::new(ytdlp_path)),
            ],
            cache_ttl,
        )
    }

    pub fn cache(&self) -> &ResolveCache {
        &self.cache
    }

    fn pick(&self, reference: &str) -> Option<&Arc<dyn Resolver>> {
        self.resolvers.iter().find(|r| r.supports(reference))
    }
}

#[async_trait]
impl Resolver for SmartResolver {
    async fn resolve(&self, reference: &str) -> Result<ResolvedAudio> {
        let key = reference.trim().to_string();
        if let Some(cached) = self.cache.get(&key) {
            debug!("⚡ Cache hit: {}", key);
            return Ok(cached);
        }

        let resolver = self
            .pick(&key)
            .ok_or_else(|| anyhow::anyhow!("Ningún resolver soporta: {}", key))?;
        debug!("🔀 {} → {}", key, resolver.name());

        let resolved = resolver.resolve(&key).await?;
        self.cache.insert(key, resolved.clone());
        Ok(resolved)
    }

    fn supports(&self, reference: &str) -> bool {
        self.pick(reference).is_some()
    }

    fn name(&self) -> &'static str {
        "smart"
    }
}
