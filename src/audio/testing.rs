//! Fakes para los tests del pipeline.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serenity::model::id::UserId;
use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Notify;
use tokio_util::io::StreamReader;

use super::{
    frame::FRAME_SIZE_BYTES,
    sink::FrameSink,
    source::{SourceBackend, TrackInfo},
};
use crate::sources::{
    ByteStream, ResolvedAudio, Resolver, StreamFetcher, TranscodeSession, Transcoder,
    TranscoderProcess,
};

pub fn info(title: &str) -> TrackInfo {
    TrackInfo::new(title, format!("https://example.com/{title}"), UserId::new(1))
}

/// Resolver with per-reference failures and gates.
#[derive(Default)]
pub struct FakeResolver {
    failing: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    durations: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn fail(&self, reference: &str) {
        self.failing.lock().insert(reference.to_string());
    }

    /// Bloquea la resolución de `reference` hasta `release`.
    pub fn gate(&self, reference: &str) {
        self.gates
            .lock()
            .insert(reference.to_string(), Arc::new(Notify::new()));
    }

    pub fn release(&self, reference: &str) {
        if let Some(gate) = self.gates.lock().get(reference) {
            gate.notify_one();
        }
    }

    pub fn set_duration(&self, reference: &str, duration: Duration) {
        self.durations
            .lock()
            .insert(reference.to_string(), duration);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Resolver for FakeResolver {
    async fn resolve(&self, reference: &str) -> Result<ResolvedAudio> {
        self.calls.lock().push(reference.to_string());

        let gate = self.gates.lock().get(reference).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.failing.lock().contains(reference) {
            anyhow::bail!("cannot resolve {reference}");
        }

        let mut resolved = ResolvedAudio::new(format!("mem://{reference}")).with_bitrate(128);
        if let Some(duration) = self.durations.lock().get(reference) {
            resolved = resolved.with_duration(*duration);
        }
        Ok(resolved)
    }

    fn supports(&self, _reference: &str) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Qué hace el stream de red después de entregar el payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Eof,
    /// Queda abierto sin mandar nada más.
    Stall,
    /// La conexión se corta con un error.
    Fail,
}

/// Fetcher que sirve payloads en memoria.
#[derive(Default)]
pub struct FakeFetcher {
    payloads: Mutex<HashMap<String, Vec<u8>>>,
    endings: Mutex<HashMap<String, StreamEnd>>,
}

impl FakeFetcher {
    pub fn set_payload(&self, reference: &str, payload: Vec<u8>) {
        self.payloads
            .lock()
            .insert(format!("mem://{reference}"), payload);
    }

    pub fn set_ending(&self, reference: &str, ending: StreamEnd) {
        self.endings
            .lock()
            .insert(format!("mem://{reference}"), ending);
    }
}

#[async_trait]
impl StreamFetcher for FakeFetcher {
    async fn open(&self, url: &str) -> Result<ByteStream> {
        let payload = self
            .payloads
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_else(|| vec![0x11; 2 * FRAME_SIZE_BYTES]);
        let ending = self.endings.lock().get(url).copied().unwrap_or(StreamEnd::Eof);

        let head = stream::iter([Ok::<_, io::Error>(Bytes::from(payload))]);
        let body: ByteStream = match ending {
            StreamEnd::Eof => Box::new(StreamReader::new(head)),
            StreamEnd::Stall => Box::new(StreamReader::new(head.chain(stream::pending()))),
            StreamEnd::Fail => Box::new(StreamReader::new(head.chain(stream::iter([Err(
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"),
            )])))),
        };
        Ok(body)
    }
}

pub struct FakeProcess {
    kills: Arc<AtomicUsize>,
}

impl TranscoderProcess for FakeProcess {
    fn kill(&mut self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn id(&self) -> Option<u32> {
        None
    }
}

/// Transcoder que devuelve los bytes tal cual.
pub fn identity_session(kills: Arc<AtomicUsize>) -> TranscodeSession {
    let (input, output) = tokio::io::duplex(64 * 1024);
    TranscodeSession {
        input: Box::new(input),
        output: Box::new(output),
        process: Box::new(FakeProcess { kills }),
    }
}

#[derive(Default)]
pub struct IdentityTranscoder {
    starts: AtomicUsize,
    kills: Arc<AtomicUsize>,
}

impl IdentityTranscoder {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for IdentityTranscoder {
    async fn start(&self) -> Result<TranscodeSession> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(identity_session(self.kills.clone()))
    }
}

pub struct FakeBackend {
    pub resolver: Arc<FakeResolver>,
    pub fetcher: Arc<FakeFetcher>,
    pub transcoder: Arc<IdentityTranscoder>,
    backend: Arc<SourceBackend>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let resolver = Arc::new(FakeResolver::default());
        let fetcher = Arc::new(FakeFetcher::default());
        let transcoder = Arc::new(IdentityTranscoder::default());
        let backend = Arc::new(SourceBackend::new(
            resolver.clone(),
            fetcher.clone(),
            transcoder.clone(),
            Duration::from_secs(5),
        ));
        Self {
            resolver,
            fetcher,
            transcoder,
            backend,
        }
    }

    pub fn shared(&self) -> Arc<SourceBackend> {
        self.backend.clone()
    }
}

/// Lo que el sink vio, en orden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Speaking(bool),
    Audio(Vec<u8>),
    Silence,
}

/// Sink that records every call and can be told to fail.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    fail_emits: std::sync::atomic::AtomicBool,
    stall_next: Mutex<Option<Duration>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn audio_frames(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Audio(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: &SinkEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    pub fn fail_emits(&self) {
        self.fail_emits.store(true, Ordering::SeqCst);
    }

    /// El próximo `emit_frame` bloquea durante `delay` antes de registrarse.
    pub fn stall_next_emit(&self, delay: Duration) {
        *self.stall_next.lock() = Some(delay);
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn emit_frame(&self, frame: &[u8]) -> Result<()> {
        if self.fail_emits.load(Ordering::SeqCst) {
            anyhow::bail!("transport closed");
        }
        let stall = self.stall_next.lock().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        let event = if frame.iter().all(|b| *b == 0) {
            SinkEvent::Silence
        } else {
            SinkEvent::Audio(frame.to_vec())
        };
        self.events.lock().push(event);
        Ok(())
    }

    async fn set_speaking(&self, speaking: bool) -> Result<()> {
        self.events.lock().push(SinkEvent::Speaking(speaking));
        Ok(())
    }
}
