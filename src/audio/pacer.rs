//! Frame-paced output scheduler.
//!
//! Upstream decoding runs as fast as the network allows; the sink needs one
//! frame every 20 ms. [`FrameQueue`] is the bounded hand-off between the two
//! and its backpressure is what throttles the whole pipeline to real time.
//! [`FramePacer`] is a single cooperative loop over an explicit clock state:
//! a monotonic reference point plus a frame counter, reset whenever the
//! drift grows past a threshold instead of trying to catch up.

use futures::FutureExt;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Notify},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    frame::{frame_interval, Frame, FramePool, FRAME_DURATION_MS},
    sink::FrameSink,
    volume::{amplitude_from_slider, scale_pcm_le, VolumeRamp},
};
use crate::error::{PipelineError, PipelineResult};

/// Configuración del pacer
#[derive(Debug, Clone)]
pub struct PacerConfig {
    pub frame_interval: Duration,
    /// Audio buffered ahead of the sink; sets the frame queue capacity.
    pub buffer: Duration,
    /// Silence ticks emitted before the sink is told to stop speaking.
    pub max_silence_frames: u32,
    pub drift_reset: Duration,
    pub ramp_frames: u32,
}

impl PacerConfig {
    pub fn queue_capacity(&self) -> usize {
        let interval = self.frame_interval.as_micros().max(1);
        ((self.buffer.as_micros() / interval) as usize).max(1)
    }
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            frame_interval: frame_interval(),
            buffer: Duration::from_millis(10 * FRAME_DURATION_MS as u64),
            max_silence_frames: 25,  // 500 ms
            drift_reset: Duration::from_millis(1000),
            ramp_frames: 15,         // 300 ms
        }
    }
}

/// Slider de volumen compartido entre el player y el pacer.
#[derive(Debug)]
pub struct VolumeControl {
    bits: AtomicU32,
}

impl VolumeControl {
    pub fn new(slider: f32) -> Self {
        Self {
            bits: AtomicU32::new(slider.clamp(0.0, 1.0).to_bits()),
        }
    }

    pub fn slider(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, slider: f32) -> f32 {
        let slider = slider.clamp(0.0, 1.0);
        self.bits.store(slider.to_bits(), Ordering::Relaxed);
        slider
    }
}

/// Creates the bounded frame queue and the loop that drains it.
pub fn frame_pacer(
    config: PacerConfig,
    pool: Arc<FramePool>,
    volume: Arc<VolumeControl>,
    paused: watch::Receiver<bool>,
) -> (FrameQueue, FramePacer) {
    let capacity = config.queue_capacity();
    let (tx, rx) = flume::bounded(capacity);
    let stopped = CancellationToken::new();
    let room = Arc::new(Notify::new());

    let queue = FrameQueue {
        tx,
        rx: rx.clone(),
        capacity,
        pool: pool.clone(),
        room: room.clone(),
        stopped: stopped.clone(),
    };
    let pacer = FramePacer {
        rx,
        config,
        pool,
        volume,
        paused,
        room,
        stopped,
    };
    (queue, pacer)
}

/// Producer handle of the pacer. Cheap to clone.
#[derive(Clone)]
pub struct FrameQueue {
    tx: flume::Sender<Frame>,
    rx: flume::Receiver<Frame>,
    capacity: usize,
    pool: Arc<FramePool>,
    /// Se notifica cada vez que el pacer saca un frame.
    room: Arc<Notify>,
    stopped: CancellationToken,
}

impl FrameQueue {
    /// Waits for room in the queue, then hands the frame over.
    ///
    /// Fails with `Cancelled` if `cancel` fires first and with
    /// `PacerStopped` once the pacing loop has exited.
    pub async fn enqueue(&self, frame: Frame, cancel: &CancellationToken) -> PipelineResult<()> {
        self.enqueue_until(frame, cancel.cancelled()).await
    }

    /// Like [`enqueue`](Self::enqueue), but gives up with `Cancelled` as soon
    /// as `stop` completes. A frame that was not handed over goes back to
    /// the pool.
    pub async fn enqueue_until(&self, mut frame: Frame, stop: impl Future<Output = ()>) -> PipelineResult<()> {
        tokio::pin!(stop);

        let reason = loop {
            if stop.as_mut().now_or_never().is_some() {
                break PipelineError::Cancelled;
            }
            if self.stopped.is_cancelled() {
                break PipelineError::PacerStopped;
            }

            // registrarse antes de intentar, para no perder el aviso
            let room = self.room.notified();
            tokio::pin!(room);
            room.as_mut().enable();

            match self.tx.try_send(frame) {
                Ok(()) => return Ok(()),
                Err(flume::TrySendError::Full(back)) => frame = back,
                Err(flume::TrySendError::Disconnected(back)) => {
                    frame = back;
                    break PipelineError::PacerStopped;
                }
            }

            tokio::select! {
                biased;
                _ = &mut stop => break PipelineError::Cancelled,
                _ = self.stopped.cancelled() => break PipelineError::PacerStopped,
                _ = &mut room => {}
            }
        };

        self.pool.release(frame);
        Err(reason)
    }

    /// Vacía la cola pasando cada frame por `cleanup` (p. ej. devolverlo al pool).
    pub fn clear(&self, mut cleanup: impl FnMut(Frame)) -> usize {
        let mut cleared = 0;
        while let Ok(frame) = self.rx.try_recv() {
            cleanup(frame);
            cleared += 1;
        }
        if cleared > 0 {
            self.room.notify_one();
        }
        cleared
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }
}

/// Decisión del reloj para la iteración actual
#[derive(Debug, Clone, Copy, PartialEq)]
enum PacingStep {
    Reset,
    Wait(Duration),
    Emit,
}

#[derive(Debug)]
struct PacingClock {
    reference: Instant,
    frame_index: u64,
    interval: Duration,
    drift_reset: Duration,
}

impl PacingClock {
    fn new(interval: Duration, drift_reset: Duration) -> Self {
        Self {
            reference: Instant::now(),
            frame_index: 0,
            interval,
            drift_reset,
        }
    }

    fn reset(&mut self) {
        self.reference = Instant::now();
        self.frame_index = 0;
    }

    fn advance(&mut self) {
        self.frame_index += 1;
    }

    /// Ideal offset of the next frame from the reference point.
    fn due(&self) -> Duration {
        let nanos = (self.interval.as_nanos() as u64).saturating_mul(self.frame_index);
        Duration::from_nanos(nanos)
    }

    fn plan(&self, elapsed: Duration) -> PacingStep {
        let due = self.due();
        if elapsed.abs_diff(due) > self.drift_reset {
            return PacingStep::Reset;
        }
        if elapsed < due {
            let wait = ((due - elapsed) / 2).max(Duration::from_millis(1));
            return PacingStep::Wait(wait);
        }
        PacingStep::Emit
    }
}

/// The pacing loop. Consumed by [`FramePacer::run`].
pub struct FramePacer {
    rx: flume::Receiver<Frame>,
    config: PacerConfig,
    pool: Arc<FramePool>,
    volume: Arc<VolumeControl>,
    paused: watch::Receiver<bool>,
    room: Arc<Notify>,
    stopped: CancellationToken,
}

impl FramePacer {
    fn next_frame(&self) -> Option<Frame> {
        let frame = self.rx.try_recv().ok()?;
        self.room.notify_one();
        Some(frame)
    }

    /// Runs until `cancel` fires or every producer handle is dropped.
    ///
    /// Only sink failures end it with an error; those are fatal for the
    /// owning session.
    pub async fn run(mut self, sink: Arc<dyn FrameSink>, cancel: CancellationToken) -> PipelineResult<()> {
        // los productores ven PacerStopped en cuanto salimos
        let _stopped = self.stopped.clone().drop_guard();

        let silence = Frame::silence();
        let mut clock = PacingClock::new(self.config.frame_interval, self.config.drift_reset);
        let mut ramp = VolumeRamp::new(self.config.ramp_frames);
        let mut held: Option<Frame> = None;
        let mut speaking = false;
        let mut idle = true;
        let mut silent_frames = 0u32;

        info!("🎚️ Pacer iniciado ({} frames de buffer)", self.config.queue_capacity());

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if *self.paused.borrow() {
                if speaking {
                    set_speaking(&sink, false).await?;
                    speaking = false;
                }
                debug!("⏸️ Pacer en pausa");
                let resumed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    resumed = self.paused.wait_for(|paused| !*paused) => resumed.is_ok(),
                };
                if !resumed {
                    break;
                }
                clock.reset();
                ramp.restart();
                silent_frames = 0;
                // la pausa ya avisó que no hablamos: sin audio retenido, volver a esperar
                idle = held.is_none();
                continue;
            }

            // sin audio pendiente: esperar sin pautar
            if idle && held.is_none() {
                let received = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    received = self.rx.recv_async() => received,
                };
                match received {
                    Ok(frame) => {
                        self.room.notify_one();
                        held = Some(frame);
                        idle = false;
                        clock.reset();
                        ramp.restart();
                        silent_frames = 0;
                        continue;
                    }
                    Err(_) => break,
                }
            }

            match clock.plan(clock.reference.elapsed()) {
                PacingStep::Reset => {
                    warn!("⏱️ Deriva de reloj mayor a {:?}, reiniciando referencia", self.config.drift_reset);
                    clock.reset();
                    continue;
                }
                PacingStep::Wait(wait) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    continue;
                }
                PacingStep::Emit => {}
            }

            match held.take().or_else(|| self.next_frame()) {
                Some(mut frame) => {
                    if !speaking {
                        set_speaking(&sink, true).await?;
                        speaking = true;
                    }
                    if silent_frames > 0 {
                        ramp.restart();
                    }

                    let slider = ramp.next_slider(self.volume.slider());
                    scale_pcm_le(frame.as_bytes_mut(), amplitude_from_slider(slider));
                    let emitted = sink.emit_frame(frame.as_bytes()).await;
                    self.pool.release(frame);
                    emitted.map_err(PipelineError::Sink)?;

                    silent_frames = 0;
                    clock.advance();
                }
                None if silent_frames < self.config.max_silence_frames => {
                    sink.emit_frame(silence.as_bytes())
                        .await
                        .map_err(PipelineError::Sink)?;
                    silent_frames += 1;
                    clock.advance();
                }
                None => {
                    debug!("🔇 Silencio prolongado tras {} frames", silent_frames);
                    if speaking {
                        set_speaking(&sink, false).await?;
                        speaking = false;
                    }
                    idle = true;
                }
            }
        }

        if speaking {
            // la sesión se cierra de todos modos; no es fatal
            if let Err(e) = sink.set_speaking(false).await {
                warn!("⚠️ No se pudo desactivar speaking al cerrar: {}", e);
            }
        }
        info!("⏹️ Pacer detenido");
        Ok(())
    }
}

async fn set_speaking(sink: &Arc<dyn FrameSink>, speaking: bool) -> PipelineResult<()> {
    sink.set_speaking(speaking)
        .await
        .map_err(PipelineError::Sink)
}
