//! Bounded read-ahead pipe between the network download and the transcoder.
//!
//! A background task copies the upstream stream into a bounded flume channel
//! of byte chunks. Once the channel is full the copy suspends until the
//! consumer drains it, so memory stays bounded whatever the speed mismatch
//! between download and playback.

use bytes::{Bytes, BytesMut};
use flume::r#async::RecvStream;
use futures::StreamExt;
use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{ready, Context, Poll},
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sources::ByteStream;

pub const MIN_CAPACITY: usize = 64 * 1024;
pub const MAX_CAPACITY: usize = 1024 * 1024 * 1024;

/// Horizonte de buffering permitido
pub const MIN_HORIZON: Duration = Duration::from_secs(1);
pub const MAX_HORIZON: Duration = Duration::from_secs(600);

/// Tamaño máximo de cada lectura de red
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Capacity in bytes for a source of `bitrate_kbit` buffered `horizon` ahead.
pub fn capacity_for(bitrate_kbit: u32, horizon: Duration) -> usize {
    let secs = horizon.clamp(MIN_HORIZON, MAX_HORIZON).as_secs_f64();
    let bytes = bitrate_kbit as f64 * 1000.0 / 8.0 * secs;
    (bytes as usize).clamp(MIN_CAPACITY, MAX_CAPACITY)
}

/// Producer side of the pipe. Dropping or disposing it cancels the copy task.
#[derive(Debug)]
pub struct ReadAheadBuffer {
    cancel: CancellationToken,
    completed: Arc<AtomicBool>,
    capacity: usize,
}

impl ReadAheadBuffer {
    /// Starts copying `upstream` in the background and returns the consumer end.
    ///
    /// The copy task is scoped to a child of `parent`, so cancelling the
    /// owning source also stops the download.
    pub fn spawn(
        upstream: ByteStream,
        capacity: usize,
        parent: &CancellationToken,
    ) -> (Self, ReadAheadReader) {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        let slots = capacity.div_ceil(CHUNK_SIZE);
        let (tx, rx) = flume::bounded(slots);
        let cancel = parent.child_token();
        let completed = Arc::new(AtomicBool::new(false));

        tokio::spawn(pump(upstream, tx, cancel.clone(), completed.clone()));
        debug!("📥 Read-ahead iniciado: {} bytes ({} chunks)", capacity, slots);

        let reader = ReadAheadReader {
            chunks: rx.into_stream(),
            pending: Bytes::new(),
            completed: completed.clone(),
            finished: false,
        };

        (
            Self {
                cancel,
                completed,
                capacity,
            },
            reader,
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Indica si el upstream llegó a EOF sin errores.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Cancela la copia; un lector pendiente recibe un error si no había terminado.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ReadAheadBuffer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump(
    mut upstream: ByteStream,
    tx: flume::Sender<io::Result<Bytes>>,
    cancel: CancellationToken,
    completed: Arc<AtomicBool>,
) {
    let mut total = 0u64;

    loop {
        let mut chunk = BytesMut::with_capacity(CHUNK_SIZE);
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = upstream.read_buf(&mut chunk) => read,
        };

        let item = match read {
            Ok(0) => {
                completed.store(true, Ordering::Release);
                debug!("📥 Read-ahead completo: {} bytes", total);
                break;
            }
            Ok(n) => {
                total += n as u64;
                Ok(chunk.freeze())
            }
            Err(e) => {
                warn!("⚠️ Error leyendo stream de red tras {} bytes: {}", total, e);
                Err(e)
            }
        };
        let is_error = item.is_err();

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send_async(item) => sent,
        };

        // lector desaparecido o error ya entregado
        if sent.is_err() || is_error {
            break;
        }
    }

    // libera el stream de red antes de cerrar el canal
    drop(upstream);
}

/// Consumer end of the pipe; implements [`AsyncRead`].
///
/// Reads surface an upstream error as an error, never as a silent
/// truncation. A pipe closed before the upstream finished (disposal) also
/// reads as an error.
pub struct ReadAheadReader {
    chunks: RecvStream<'static, io::Result<Bytes>>,
    pending: Bytes,
    completed: Arc<AtomicBool>,
    finished: bool,
}

impl AsyncRead for ReadAheadReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if buf.remaining() == 0 || this.finished {
                return Poll::Ready(Ok(()));
            }

            if !this.pending.is_empty() {
                let n = buf.remaining().min(this.pending.len());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match ready!(this.chunks.poll_next_unpin(cx)) {
                Some(Ok(bytes)) => this.pending = bytes,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None if this.completed.load(Ordering::Acquire) => {
                    this.finished = true;
                    return Poll::Ready(Ok(()));
                }
                None => {
                    return Poll::Ready(Err(io::Error::other(
                        "read-ahead buffer closed before upstream completed",
                    )));
                }
            }
        }
    }
}
