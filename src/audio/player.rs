//! Per-destination playback: one queue, one consumer loop, one pacer.
//!
//! The consumer pulls the next ready source from the [`SourceQueue`], chunks
//! its PCM into whole frames and pushes them into the pacer's bounded
//! [`FrameQueue`]. That push is where backpressure throttles decoding to
//! real time.

use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    frame::{FramePool, PcmChunker, FRAME_SIZE_BYTES},
    pacer::{frame_pacer, FramePacer, FrameQueue, PacerConfig, VolumeControl},
    queue::{QueueSnapshot, SourceQueue},
    sink::FrameSink,
    source::{AudioSource, SourceBackend, TrackInfo},
    volume::db_from_slider,
};
use crate::{
    config::Config,
    error::{PipelineError, PipelineResult},
    storage::JsonStorage,
};

/// Tamaño de cada lectura del transcoder
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Parámetros de un player
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub pacer: PacerConfig,
    pub max_queue_size: usize,
    pub bitrate_hint_kbit: u32,
}

impl PlayerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pacer: PacerConfig {
                buffer: Duration::from_millis(config.frame_buffer_ms),
                max_silence_frames: config.max_silence_frames,
                drift_reset: Duration::from_millis(config.drift_reset_ms),
                ramp_frames: config.volume_ramp_frames,
                ..PacerConfig::default()
            },
            max_queue_size: config.max_queue_size,
            bitrate_hint_kbit: config.default_bitrate_kbit,
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            pacer: PacerConfig::default(),
            max_queue_size: 1000,
            bitrate_hint_kbit: 128,
        }
    }
}

pub struct AudioPlayer {
    guild_id: GuildId,
    queue: SourceQueue,
    frames: FrameQueue,
    pacer: Mutex<Option<FramePacer>>,
    pool: Arc<FramePool>,
    volume: Arc<VolumeControl>,
    paused: watch::Sender<bool>,
    settings: Arc<JsonStorage>,
    cancel: CancellationToken,
}

impl AudioPlayer {
    /// Crea el player con el volumen guardado del servidor
    pub async fn new(
        guild_id: GuildId,
        config: &PlayerConfig,
        settings: Arc<JsonStorage>,
    ) -> PipelineResult<Arc<Self>> {
        let saved = settings
            .load(guild_id.get())
            .await
            .map_err(PipelineError::Settings)?;

        let pool = Arc::new(FramePool::new(config.pacer.queue_capacity() * 2));
        let volume = Arc::new(VolumeControl::new(saved.volume));
        let (paused, paused_rx) = watch::channel(false);
        let (frames, pacer) = frame_pacer(config.pacer.clone(), pool.clone(), volume.clone(), paused_rx);

        debug!("🎛️ Player creado para guild {} (volumen {:.2})", guild_id, saved.volume);
        Ok(Arc::new(Self {
            guild_id,
            queue: SourceQueue::new(config.max_queue_size, config.bitrate_hint_kbit),
            frames,
            pacer: Mutex::new(Some(pacer)),
            pool,
            volume,
            paused,
            settings,
            cancel: CancellationToken::new(),
        }))
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Runs the consumer loop and the pacer until shutdown.
    ///
    /// Returns the pacer's outcome: `Err(PipelineError::Sink)` means the
    /// output transport failed and the session should be torn down. Calling
    /// it a second time fails with `PacerStopped`.
    pub async fn run(self: Arc<Self>, sink: Arc<dyn FrameSink>) -> PipelineResult<()> {
        let pacer = self
            .pacer
            .lock()
            .take()
            .ok_or(PipelineError::PacerStopped)?;

        info!("▶️ Player iniciado para guild {}", self.guild_id);
        let consumer = tokio::spawn(self.clone().consume());
        let result = pacer.run(sink, self.cancel.clone()).await;

        // sin pacer no hay a quién entregar frames; liberar también una lectura bloqueada
        self.cancel.cancel();
        self.queue.teardown();
        match consumer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Consumidor de guild {} terminó: {}", self.guild_id, e),
            Err(e) => error!("💥 Consumidor de guild {} abortado: {}", self.guild_id, e),
        }

        if let Err(e) = &result {
            error!("❌ Pacer de guild {} falló: {}", self.guild_id, e);
        }
        self.teardown();
        result
    }

    async fn consume(self: Arc<Self>) -> PipelineResult<()> {
        let mut chunker = PcmChunker::new(FRAME_SIZE_BYTES);
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let source = match self.queue.get_next_source(&self.cancel).await {
                Ok(source) => source,
                Err(PipelineError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };
            info!("🎵 Reproduciendo en guild {}: {}", self.guild_id, source.info().title);

            'read: loop {
                let read = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(()),
                    read = source.read(&mut buf) => read,
                };
                let read = match read {
                    Ok(0) => {
                        debug!("🏁 Fin de stream: {}", source.info().title);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        if !source.is_disposed() {
                            warn!("⚠️ {} ({}), pasando a la siguiente", PipelineError::from(e), source.info().title);
                        }
                        break;
                    }
                };

                let mut data = &buf[..read];
                while !data.is_empty() {
                    let used = chunker.fill(data);
                    data = &data[used..];

                    let Some(frame) = chunker.take_frame(&self.pool) else {
                        continue;
                    };
                    let stop = async {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {}
                            _ = source.disposed() => {}
                        }
                    };
                    match self.frames.enqueue_until(frame, stop).await {
                        Ok(()) => {}
                        Err(PipelineError::Cancelled) if self.cancel.is_cancelled() => return Ok(()),
                        // fuente saltada o descartada
                        Err(PipelineError::Cancelled) => break 'read,
                        Err(e) => return Err(e),
                    }
                }
            }

            let dropped = chunker.reset();
            if dropped > 0 {
                debug!("✂️ Descartados {} bytes de frame incompleto", dropped);
            }
            self.queue.complete_current(&source);
        }
    }

    /// Agrega una fuente a la cola de reproducción
    pub fn enqueue(&self, source: Arc<AudioSource>) -> PipelineResult<()> {
        self.queue.enqueue(source)
    }

    /// Salta la fuente actual y descarta el audio ya encolado
    pub fn skip(&self) -> bool {
        let skipped = self.queue.skip();
        let cleared = self.frames.clear(|frame| self.pool.release(frame));
        if cleared > 0 {
            debug!("🧹 {} frames descartados en guild {}", cleared, self.guild_id);
        }
        skipped
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
        info!("⏸️ Pausado en guild {}", self.guild_id);
    }

    pub fn unpause(&self) {
        self.paused.send_replace(false);
        info!("▶️ Reanudado en guild {}", self.guild_id);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn volume(&self) -> f32 {
        self.volume.slider()
    }

    pub fn volume_db(&self) -> f32 {
        db_from_slider(self.volume.slider())
    }

    /// Changes the volume slider; the pacer picks it up on the next frame.
    ///
    /// The live value changes even if persisting it fails.
    pub async fn set_volume(&self, slider: f32) -> PipelineResult<f32> {
        let slider = self.volume.set(slider);
        self.settings
            .modify(self.guild_id.get(), |settings| settings.volume = slider)
            .await
            .map_err(PipelineError::Settings)?;
        info!("🔊 Volumen de guild {}: {:.0}% ({:.1} dB)", self.guild_id, slider * 100.0, db_from_slider(slider));
        Ok(slider)
    }

    pub fn queue_snapshot(&self, limit: usize) -> QueueSnapshot {
        self.queue.snapshot(limit)
    }

    pub fn now_playing(&self) -> Option<Arc<AudioSource>> {
        self.queue.peek_current()
    }

    pub fn clear_queue(&self) -> usize {
        self.queue.clear()
    }

    /// Nada sonando, nada en cola y el buffer de frames vacío.
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle() && self.frames.is_empty()
    }

    /// Stops the pacer and consumer and disposes every source.
    pub fn shutdown(&self) {
        info!("⏹️ Deteniendo player de guild {}", self.guild_id);
        self.cancel.cancel();
        self.teardown();
    }

    fn teardown(&self) {
        self.queue.teardown();
        self.frames.clear(|frame| self.pool.release(frame));
    }
}

/// Registro de players por servidor
pub struct PlayerManager {
    players: DashMap<GuildId, Arc<AudioPlayer>>,
    config: PlayerConfig,
    settings: Arc<JsonStorage>,
    backend: Arc<SourceBackend>,
}

impl PlayerManager {
    pub fn new(config: PlayerConfig, settings: Arc<JsonStorage>, backend: Arc<SourceBackend>) -> Self {
        Self {
            players: DashMap::new(),
            config,
            settings,
            backend,
        }
    }

    /// Obtiene el player del servidor o crea uno nuevo
    pub async fn get_or_create(&self, guild_id: GuildId) -> PipelineResult<Arc<AudioPlayer>> {
        if let Some(player) = self.players.get(&guild_id) {
            return Ok(player.clone());
        }

        let created = AudioPlayer::new(guild_id, &self.config, self.settings.clone()).await?;
        // otro llamador pudo ganarnos mientras esperábamos
        let player = self.players.entry(guild_id).or_insert(created).clone();
        Ok(player)
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<AudioPlayer>> {
        self.players.get(&guild_id).map(|p| p.clone())
    }

    /// Quita el player y libera todos sus recursos
    pub fn remove(&self, guild_id: GuildId) -> bool {
        match self.players.remove(&guild_id) {
            Some((_, player)) => {
                player.shutdown();
                true
            }
            None => false,
        }
    }

    /// Crea una fuente sin iniciarla; la cola decide cuándo precargarla.
    pub fn create_source(&self, reference: impl Into<String>, info: TrackInfo) -> Arc<AudioSource> {
        AudioSource::new(reference, info, self.backend.clone())
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn shutdown_all(&self) {
        let guilds: Vec<GuildId> = self.players.iter().map(|p| *p.key()).collect();
        for guild_id in guilds {
            self.remove(guild_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        frame::FRAME_SIZE_BYTES,
        testing::{self, FakeBackend, RecordingSink, SinkEvent, StreamEnd},
    };
    use pretty_assertions::assert_eq;

    struct Fixture {
        _dir: tempfile::TempDir,
        backend: FakeBackend,
        manager: PlayerManager,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(JsonStorage::new(dir.path().to_path_buf(), 1.0).await.unwrap());
        let backend = FakeBackend::new();
        let config = PlayerConfig {
            pacer: PacerConfig {
                ramp_frames: 0,
                max_silence_frames: 5,
                ..PacerConfig::default()
            },
            ..PlayerConfig::default()
        };
        let manager = PlayerManager::new(config, settings, backend.shared());
        Fixture {
            _dir: dir,
            backend,
            manager,
        }
    }

    fn guild() -> GuildId {
        GuildId::new(1)
    }

    async fn wait_until_idle(player: &AudioPlayer) {
        while !player.is_idle() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn plays_sources_back_to_back_in_whole_frames() {
        let f = fixture().await;
        // 2.5 frames: la cola parcial se descarta
        f.backend
            .fetcher
            .set_payload("first", vec![0x11; FRAME_SIZE_BYTES * 5 / 2]);
        f.backend.fetcher.set_payload("second", vec![0x22; FRAME_SIZE_BYTES]);

        let player = f.manager.get_or_create(guild()).await.unwrap();
        for reference in ["first", "second"] {
            let source = f.manager.create_source(reference, testing::info(reference));
            player.enqueue(source).unwrap();
        }

        let sink = Arc::new(RecordingSink::default());
        let run = tokio::spawn(player.clone().run(sink.clone()));
        wait_until_idle(&player).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let frames = sink.audio_frames();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == FRAME_SIZE_BYTES));
        assert_eq!(frames[0][0], 0x11);
        assert_eq!(frames[2][0], 0x22);
        assert_eq!(sink.count(&SinkEvent::Speaking(false)), 1);

        player.shutdown();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_source_is_skipped_without_stopping_playback() {
        let f = fixture().await;
        f.backend.resolver.fail("broken");

        let player = f.manager.get_or_create(guild()).await.unwrap();
        player.enqueue(f.manager.create_source("broken", testing::info("broken"))).unwrap();
        player.enqueue(f.manager.create_source("ok", testing::info("ok"))).unwrap();

        let sink = Arc::new(RecordingSink::default());
        let run = tokio::spawn(player.clone().run(sink.clone()));
        wait_until_idle(&player).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // payload por defecto: 2 frames
        assert_eq!(sink.audio_frames().len(), 2);
        player.shutdown();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn skip_moves_to_next_source() {
        let f = fixture().await;
        // fuente larga: 10 s de audio
        f.backend
            .fetcher
            .set_payload("long", vec![0x33; FRAME_SIZE_BYTES * 500]);
        f.backend.fetcher.set_payload("next", vec![0x44; FRAME_SIZE_BYTES]);

        let player = f.manager.get_or_create(guild()).await.unwrap();
        player.enqueue(f.manager.create_source("long", testing::info("long"))).unwrap();
        player.enqueue(f.manager.create_source("next", testing::info("next"))).unwrap();

        let sink = Arc::new(RecordingSink::default());
        let run = tokio::spawn(player.clone().run(sink.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(player.now_playing().unwrap().reference(), "long");

        assert!(player.skip());
        wait_until_idle(&player).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let frames = sink.audio_frames();
        assert!(frames.len() < 50, "long source should have been cut, got {}", frames.len());
        assert_eq!(frames.last().unwrap()[0], 0x44);

        player.shutdown();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stream_failure_mid_playback_moves_to_next_source() {
        let f = fixture().await;
        f.backend.fetcher.set_payload("flaky", vec![0x66; FRAME_SIZE_BYTES * 2]);
        f.backend.fetcher.set_ending("flaky", StreamEnd::Fail);
        f.backend.fetcher.set_payload("next", vec![0x77; FRAME_SIZE_BYTES]);

        let player = f.manager.get_or_create(guild()).await.unwrap();
        player.enqueue(f.manager.create_source("flaky", testing::info("flaky"))).unwrap();
        player.enqueue(f.manager.create_source("next", testing::info("next"))).unwrap();

        let sink = Arc::new(RecordingSink::default());
        let run = tokio::spawn(player.clone().run(sink.clone()));
        wait_until_idle(&player).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let frames = sink.audio_frames();
        assert!(frames.iter().filter(|f| f[0] == 0x66).count() <= 2);
        assert_eq!(frames.last().unwrap()[0], 0x77);

        player.shutdown();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_is_reported_while_network_stalls() {
        let f = fixture().await;
        f.backend.fetcher.set_payload("stalled", vec![0x55; FRAME_SIZE_BYTES * 2]);
        f.backend.fetcher.set_ending("stalled", StreamEnd::Stall);

        let player = f.manager.get_or_create(guild()).await.unwrap();
        let source = f.manager.create_source("stalled", testing::info("stalled"));
        player.enqueue(source.clone()).unwrap();

        let sink = Arc::new(RecordingSink::default());
        sink.fail_emits();
        let result = tokio::time::timeout(Duration::from_secs(30), player.clone().run(sink))
            .await
            .expect("run must return once the sink fails");

        assert!(matches!(result, Err(PipelineError::Sink(_))));
        assert!(source.is_disposed());
        assert!(player.is_idle());
    }

    #[tokio::test]
    async fn volume_is_persisted_per_guild() {
        let f = fixture().await;
        let player = f.manager.get_or_create(guild()).await.unwrap();
        assert_eq!(player.volume(), 1.0);

        assert_eq!(player.set_volume(1.5).await.unwrap(), 1.0);
        assert_eq!(player.set_volume(0.5).await.unwrap(), 0.5);
        assert!((player.volume_db() - -12.0412).abs() < 1e-3);

        // un player nuevo para el mismo guild recupera el valor
        assert!(f.manager.remove(guild()));
        let recreated = f.manager.get_or_create(guild()).await.unwrap();
        assert_eq!(recreated.volume(), 0.5);
    }

    #[tokio::test]
    async fn manager_reuses_players() {
        let f = fixture().await;
        let a = f.manager.get_or_create(guild()).await.unwrap();
        let b = f.manager.get_or_create(guild()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.manager.len(), 1);

        assert!(f.manager.get(GuildId::new(2)).is_none());
        assert!(f.manager.remove(guild()));
        assert!(!f.manager.remove(guild()));
        assert!(f.manager.is_empty());
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let f = fixture().await;
        let player = f.manager.get_or_create(guild()).await.unwrap();
        let sink = Arc::new(RecordingSink::default());

        let first = tokio::spawn(player.clone().run(sink.clone()));
        while player.pacer.lock().is_some() {
            tokio::task::yield_now().await;
        }
        let second = player.clone().run(sink).await;
        assert!(matches!(second, Err(PipelineError::PacerStopped)));

        player.shutdown();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sink_failure_is_fatal_for_the_player() {
        let f = fixture().await;
        let player = f.manager.get_or_create(guild()).await.unwrap();
        player.enqueue(f.manager.create_source("song", testing::info("song"))).unwrap();

        let sink = Arc::new(RecordingSink::default());
        sink.fail_emits();
        let result = player.clone().run(sink).await;

        let err = result.unwrap_err();
        assert!(err.is_fatal());
        assert!(player.is_idle());
    }
}
