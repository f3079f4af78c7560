//! # Cache Module
//!
//! Resolving a reference (running yt-dlp, probing formats) is by far the
//! slowest step of starting a track. [`ResolveCache`] keeps the result per
//! reference for `RESOLVE_CACHE_TTL` seconds so repeated or re-queued
//! references start immediately.
//!
//! Stream URLs handed out by extractors expire on their own, so the TTL
//! should stay below the extractor's URL lifetime.

pub mod ttl_cache;

use tracing::info;

use crate::sources::ResolvedAudio;
pub use ttl_cache::{CacheMetrics, TtlCache};

/// Cache de referencias ya resueltas.
pub type ResolveCache = TtlCache<String, ResolvedAudio>;

impl ResolveCache {
    /// Performs cache maintenance by removing expired entries.
    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }
    }
}
