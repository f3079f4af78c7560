//! One queued or playing item and its initialization lifecycle.
//!
//! `Uninitialized → Initializing → {Ready, Failed} → Disposed`
//!
//! Initialization runs at most once per source no matter how many callers
//! ask for it: an atomic compare-and-set picks the single caller that spawns
//! the work, and every caller observes the same single-assignment result
//! through a `watch` channel. Failure always ends in disposal.

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serenity::model::id::UserId;
use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    frame::PCM_BYTES_PER_SECOND,
    read_ahead::{capacity_for, ReadAheadBuffer},
};
use crate::sources::{
    ByteStream, ResolvedAudio, Resolver, StreamFetcher, TranscodeSession, Transcoder,
    TranscoderProcess,
};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Estado del ciclo de vida de una fuente
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
    Disposed,
}

/// Información descriptiva de un track (solo informativa)
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub title: String,
    pub url: String,
    pub thumbnail: Option<String>,
    pub duration: Option<Duration>,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
}

impl TrackInfo {
    pub fn new(title: impl Into<String>, url: impl Into<String>, requested_by: UserId) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            thumbnail: None,
            duration: None,
            requested_by,
            added_at: Utc::now(),
        }
    }

    pub fn with_thumbnail(mut self, thumbnail: String) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// The external collaborators a source needs to become playable.
pub struct SourceBackend {
    pub resolver: Arc<dyn Resolver>,
    pub fetcher: Arc<dyn StreamFetcher>,
    pub transcoder: Arc<dyn Transcoder>,
    pub read_ahead_horizon: Duration,
}

impl SourceBackend {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        fetcher: Arc<dyn StreamFetcher>,
        transcoder: Arc<dyn Transcoder>,
        read_ahead_horizon: Duration,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            transcoder,
            read_ahead_horizon,
        }
    }
}

/// Recursos vivos mientras la fuente está inicializada
struct ActiveResources {
    read_ahead: ReadAheadBuffer,
    process: Box<dyn TranscoderProcess>,
}

pub struct AudioSource {
    id: u64,
    reference: String,
    info: TrackInfo,
    backend: Arc<SourceBackend>,
    started: AtomicBool,
    disposed: AtomicBool,
    state: Mutex<SourceState>,
    ready: watch::Sender<Option<bool>>,
    cancel: CancellationToken,
    /// Se cancela si la copia hacia el transcoder falla a mitad de stream.
    stream_failed: CancellationToken,
    resolved: Mutex<Option<ResolvedAudio>>,
    failure: Mutex<Option<String>>,
    active: Mutex<Option<ActiveResources>>,
    pcm: tokio::sync::Mutex<Option<ByteStream>>,
    consumed: AtomicU64,
}

impl AudioSource {
    pub fn new(reference: impl Into<String>, info: TrackInfo, backend: Arc<SourceBackend>) -> Arc<Self> {
        let (ready, _) = watch::channel(None);
        Arc::new(Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            reference: reference.into(),
            info,
            backend,
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            state: Mutex::new(SourceState::Uninitialized),
            ready,
            cancel: CancellationToken::new(),
            stream_failed: CancellationToken::new(),
            resolved: Mutex::new(None),
            failure: Mutex::new(None),
            active: Mutex::new(None),
            pcm: tokio::sync::Mutex::new(None),
            consumed: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn state(&self) -> SourceState {
        *self.state.lock()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Motivo del fallo de inicialización, si lo hubo.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Resultado de la inicialización si ya terminó (`None` mientras corre).
    pub fn init_result(&self) -> Option<bool> {
        *self.ready.borrow()
    }

    /// Starts background initialization; only the first call does any work.
    ///
    /// `bitrate_hint_kbit` sizes the read-ahead buffer when the resolver
    /// reports no bitrate of its own.
    pub fn start_initializing(self: &Arc<Self>, bitrate_hint_kbit: u32) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if self.is_disposed() {
            self.complete(false);
            return;
        }

        *self.state.lock() = SourceState::Initializing;
        debug!("⏳ Inicializando fuente {}: {}", self.id, self.info.title);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = this.cancel.cancelled() => Err(anyhow::anyhow!("cancelled during initialization")),
                result = this.initialize(bitrate_hint_kbit) => result,
            };

            match outcome {
                Ok(()) => {
                    {
                        let mut state = this.state.lock();
                        if *state == SourceState::Initializing {
                            *state = SourceState::Ready;
                        }
                    }
                    info!("✅ Fuente {} lista: {}", this.id, this.info.title);
                    this.complete(true);
                }
                Err(e) => {
                    warn!("❌ Falló la inicialización de {} ({}): {:#}", this.info.title, this.id, e);
                    *this.failure.lock() = Some(format!("{:#}", e));
                    {
                        let mut state = this.state.lock();
                        if *state == SourceState::Initializing {
                            *state = SourceState::Failed;
                        }
                    }
                    this.complete(false);
                    this.dispose();
                }
            }
        });
    }

    /// Waits for the single initialization outcome without triggering work.
    pub async fn ensure_initialized(&self) -> bool {
        let mut rx = self.ready.subscribe();
        let initialized = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.unwrap_or(false),
            Err(_) => false,
        };
        initialized
    }

    async fn initialize(&self, bitrate_hint_kbit: u32) -> anyhow::Result<()> {
        let resolved = self
            .backend
            .resolver
            .resolve(&self.reference)
            .await
            .with_context(|| format!("resolving {}", self.reference))?;
        debug!(
            "🔗 Fuente {} resuelta ({:?} kbit/s, {:?})",
            self.id, resolved.bitrate_kbit, resolved.duration
        );

        let upstream = self
            .backend
            .fetcher
            .open(&resolved.stream_url)
            .await
            .context("opening network stream")?;

        let bitrate = resolved.bitrate_kbit.unwrap_or(bitrate_hint_kbit);
        let capacity = capacity_for(bitrate, self.backend.read_ahead_horizon);
        let (read_ahead, mut reader) = ReadAheadBuffer::spawn(upstream, capacity, &self.cancel);

        let TranscodeSession {
            mut input,
            output,
            mut process,
        } = self
            .backend
            .transcoder
            .start()
            .await
            .context("starting transcoder")?;

        // alimenta el transcoder desde el read-ahead
        let cancel = self.cancel.clone();
        let stream_failed = self.stream_failed.clone();
        let id = self.id;
        tokio::spawn(async move {
            let copied = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                copied = tokio::io::copy(&mut reader, &mut input) => copied,
            };
            match copied {
                Ok(bytes) => {
                    debug!("📤 Fuente {}: {} bytes enviados al transcoder", id, bytes);
                    let _ = input.shutdown().await;
                }
                Err(e) => {
                    // marcar antes de cerrar la entrada: el EOF del transcoder no debe parecer un final limpio
                    warn!("⚠️ Fuente {}: copia al transcoder interrumpida: {}", id, e);
                    stream_failed.cancel();
                }
            }
        });

        *self.resolved.lock() = Some(resolved);
        *self.pcm.lock().await = Some(output);

        let mut slot = self.active.lock();
        if self.is_disposed() {
            drop(slot);
            read_ahead.dispose();
            let _ = process.kill();
            anyhow::bail!("disposed during initialization");
        }
        *slot = Some(ActiveResources {
            read_ahead,
            process,
        });
        Ok(())
    }

    fn complete(&self, ok: bool) {
        self.ready.send_if_modified(|outcome| {
            if outcome.is_none() {
                *outcome = Some(ok);
                true
            } else {
                false
            }
        });
    }

    /// Reads PCM bytes from the transcoder output.
    ///
    /// `Ok(0)` is end of stream. Reads on a disposed or uninitialized source
    /// fail instead of blocking, and so does every read after the network
    /// stream broke mid-playback.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_disposed() {
            return Err(io::Error::other("source disposed"));
        }

        let mut pcm = self.pcm.lock().await;
        let stream = pcm
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "source not initialized"))?;

        let n = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(io::Error::other("source disposed")),
            _ = self.stream_failed.cancelled() => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "network stream failed mid-playback"));
            }
            read = stream.read(buf) => read?,
        };
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Completes once the source has been disposed.
    pub async fn disposed(&self) {
        self.cancel.cancelled().await
    }

    /// Tiempo restante estimado a partir de los bytes consumidos.
    pub fn remaining(&self) -> Option<Duration> {
        let duration = self
            .resolved
            .lock()
            .as_ref()
            .and_then(|r| r.duration)
            .or(self.info.duration)?;
        Some(duration.saturating_sub(self.played()))
    }

    /// Audio ya leído por el consumidor.
    pub fn played(&self) -> Duration {
        let bytes = self.consumed.load(Ordering::Relaxed);
        Duration::from_secs_f64(bytes as f64 / PCM_BYTES_PER_SECOND as f64)
    }

    /// Releases every resource of this source. Idempotent.
    ///
    /// Returns `true` only for the call that actually disposed it.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.cancel.cancel();
        if let Some(mut active) = self.active.lock().take() {
            active.read_ahead.dispose();
            if let Err(e) = active.process.kill() {
                warn!("⚠️ No se pudo terminar el transcoder de la fuente {}: {}", self.id, e);
            }
        }
        *self.state.lock() = SourceState::Disposed;
        self.complete(false);

        debug!("🗑️ Fuente {} liberada: {}", self.id, self.info.title);
        true
    }
}

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSource")
            .field("id", &self.id)
            .field("reference", &self.reference)
            .field("title", &self.info.title)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        frame::FRAME_SIZE_BYTES,
        testing::{self, FakeBackend, StreamEnd},
    };
    use crate::sources::{MockResolver, MockStreamFetcher, MockTranscoder};
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_initialize_once() {
        let resolves = Arc::new(AtomicUsize::new(0));
        let counter = resolves.clone();

        let mut resolver = MockResolver::new();
        resolver.expect_resolve().times(1).returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ResolvedAudio::new("mem://song").with_bitrate(128))
        });
        let mut fetcher = MockStreamFetcher::new();
        fetcher
            .expect_open()
            .times(1)
            .returning(|_| Ok(Box::new(std::io::Cursor::new(vec![0u8; 4096])) as ByteStream));
        let mut transcoder = MockTranscoder::new();
        transcoder
            .expect_start()
            .times(1)
            .returning(|| Ok(testing::identity_session(Arc::new(AtomicUsize::new(0)))));

        let backend = Arc::new(SourceBackend::new(
            Arc::new(resolver),
            Arc::new(fetcher),
            Arc::new(transcoder),
            Duration::from_secs(5),
        ));
        let source = AudioSource::new("song", testing::info("song"), backend);

        let callers: Vec<_> = (0..16)
            .map(|_| {
                let source = source.clone();
                tokio::spawn(async move {
                    source.start_initializing(128);
                    source.ensure_initialized().await
                })
            })
            .collect();

        for caller in callers {
            assert!(caller.await.unwrap());
        }
        assert_eq!(resolves.load(Ordering::SeqCst), 1);
        assert_eq!(source.state(), SourceState::Ready);
    }

    #[tokio::test]
    async fn failed_resolve_reports_false_and_disposes() {
        let backend = FakeBackend::new();
        backend.resolver.fail("broken");
        let source = AudioSource::new("broken", testing::info("broken"), backend.shared());

        source.start_initializing(128);
        assert!(!source.ensure_initialized().await);
        assert_eq!(source.state(), SourceState::Disposed);
        assert!(source.failure().unwrap().contains("broken"));
        assert!(!source.dispose());
    }

    #[tokio::test]
    async fn reads_pcm_and_tracks_remaining_time() {
        let backend = FakeBackend::new();
        // un segundo de PCM con duración declarada de 3 s
        backend.fetcher.set_payload("song", vec![1u8; PCM_BYTES_PER_SECOND as usize]);
        backend.resolver.set_duration("song", Duration::from_secs(3));
        let source = AudioSource::new("song", testing::info("song"), backend.shared());

        source.start_initializing(128);
        assert!(source.ensure_initialized().await);

        let mut total = 0;
        let mut buf = vec![0u8; 8192];
        loop {
            let n = source.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }

        assert_eq!(total, PCM_BYTES_PER_SECOND as usize);
        assert_eq!(source.played(), Duration::from_secs(1));
        assert_eq!(source.remaining(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_kills_transcoder_once() {
        let backend = FakeBackend::new();
        let source = AudioSource::new("song", testing::info("song"), backend.shared());
        source.start_initializing(128);
        assert!(source.ensure_initialized().await);

        assert!(source.dispose());
        assert!(!source.dispose());
        assert_eq!(backend.transcoder.kills(), 1);
        assert_eq!(source.state(), SourceState::Disposed);

        let mut buf = [0u8; 16];
        assert!(source.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn upstream_failure_is_not_read_as_end_of_stream() {
        let backend = FakeBackend::new();
        backend.fetcher.set_payload("flaky", vec![0x42; FRAME_SIZE_BYTES * 2]);
        backend.fetcher.set_ending("flaky", StreamEnd::Fail);
        let source = AudioSource::new("flaky", testing::info("flaky"), backend.shared());
        source.start_initializing(128);
        assert!(source.ensure_initialized().await);

        let mut buf = vec![0u8; 16 * 1024];
        let mut total = 0;
        let err = loop {
            match source.read(&mut buf).await {
                Ok(0) => panic!("broken upstream ended like a clean stream after {total} bytes"),
                Ok(n) => total += n,
                Err(e) => break e,
            }
        };
        assert!(total <= FRAME_SIZE_BYTES * 2);
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(!source.is_disposed());
    }

    #[tokio::test]
    async fn dispose_before_start_resolves_waiters() {
        let backend = FakeBackend::new();
        let source = AudioSource::new("song", testing::info("song"), backend.shared());

        source.dispose();
        source.start_initializing(128);
        assert!(!source.ensure_initialized().await);
        assert!(backend.resolver.calls().is_empty());
    }

    #[tokio::test]
    async fn dispose_during_resolve_cancels_initialization() {
        let backend = FakeBackend::new();
        backend.resolver.gate("slow");
        let source = AudioSource::new("slow", testing::info("slow"), backend.shared());

        source.start_initializing(128);
        tokio::task::yield_now().await;
        assert_eq!(source.state(), SourceState::Initializing);

        source.dispose();
        assert!(!source.ensure_initialized().await);
        assert_eq!(backend.transcoder.starts(), 0);
    }
}
