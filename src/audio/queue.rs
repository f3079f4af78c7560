//! FIFO of pending sources plus the single "current" slot.
//!
//! One `parking_lot` mutex guards the FIFO, the current slot and the
//! candidate being waited on. Nothing awaits while holding it: the consumer
//! takes a candidate out under the lock, then races its initialization
//! against an explicit skip with the lock released.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serenity::model::id::UserId;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::{AudioSource, TrackInfo};
use crate::error::{PipelineError, PipelineResult};

/// Candidato sacado de la cola cuya inicialización se está esperando
struct Pending {
    source: Arc<AudioSource>,
    skip: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Arc<AudioSource>>,
    current: Option<Arc<AudioSource>>,
    pending: Option<Pending>,
}

enum WaitOutcome {
    Initialized(bool),
    Skipped,
    Cancelled,
}

pub struct SourceQueue {
    state: Mutex<QueueState>,
    enqueued: Notify,
    max_size: usize,
    bitrate_hint_kbit: u32,
}

impl SourceQueue {
    pub fn new(max_size: usize, bitrate_hint_kbit: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            enqueued: Notify::new(),
            max_size,
            bitrate_hint_kbit,
        }
    }

    /// Agrega una fuente al final de la cola
    ///
    /// A source that lands at the head of the FIFO starts initializing right
    /// away. A rejected source is disposed.
    pub fn enqueue(&self, source: Arc<AudioSource>) -> PipelineResult<()> {
        let becomes_head = {
            let mut state = self.state.lock();
            if state.items.len() >= self.max_size {
                drop(state);
                source.dispose();
                return Err(PipelineError::QueueFull(self.max_size));
            }
            let becomes_head = state.items.is_empty();
            state.items.push_back(source.clone());
            becomes_head
        };

        if becomes_head {
            source.start_initializing(self.bitrate_hint_kbit);
        }
        info!("➕ Agregado a la cola: {}", source.info().title);
        self.enqueued.notify_one();
        Ok(())
    }

    /// Skips whatever would play now. Returns `false` if there was nothing.
    ///
    /// A candidate still initializing is aborted through its skip signal;
    /// otherwise the current source (or, with no current, the FIFO head) is
    /// disposed and the new head starts prefetching.
    pub fn skip(&self) -> bool {
        let mut state = self.state.lock();

        if let Some(pending) = state.pending.as_mut() {
            if let Some(signal) = pending.skip.take() {
                info!("⏭️ Saltando fuente en inicialización: {}", pending.source.info().title);
                let _ = signal.send(());
                return true;
            }
        }

        let skipped = match state.current.take() {
            Some(current) => Some(current),
            None => state.items.pop_front(),
        };
        let next = state.items.front().cloned();
        drop(state);

        let Some(skipped) = skipped else {
            return false;
        };
        info!("⏭️ Saltando: {}", skipped.info().title);
        skipped.dispose();
        if let Some(next) = next {
            next.start_initializing(self.bitrate_hint_kbit);
        }
        true
    }

    /// Devuelve la siguiente fuente lista, esperando si hace falta.
    ///
    /// Failed or skipped candidates are disposed and the loop moves on to the
    /// next item. Only `cancel` ends the wait with an error; a candidate
    /// interrupted that way goes back to the front of the queue.
    pub async fn get_next_source(&self, cancel: &CancellationToken) -> PipelineResult<Arc<AudioSource>> {
        loop {
            let (next, stale) = {
                let mut state = self.state.lock();

                let mut stale = None;
                if let Some(current) = &state.current {
                    if current.init_result() == Some(true) && !current.is_disposed() {
                        return Ok(current.clone());
                    }
                    stale = state.current.take();
                }

                let next = state.items.pop_front().map(|candidate| {
                    // mirar uno más adelante
                    if let Some(next) = state.items.front() {
                        next.start_initializing(self.bitrate_hint_kbit);
                    }
                    let (skip_tx, skip_rx) = oneshot::channel();
                    state.pending = Some(Pending {
                        source: candidate.clone(),
                        skip: Some(skip_tx),
                    });
                    (candidate, skip_rx)
                });
                (next, stale)
            };

            if let Some(stale) = stale {
                stale.dispose();
            }

            let Some((candidate, mut skip_rx)) = next else {
                debug!("💤 Cola vacía, esperando fuentes");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    _ = self.enqueued.notified() => {}
                }
                continue;
            };

            candidate.start_initializing(self.bitrate_hint_kbit);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => WaitOutcome::Cancelled,
                _ = &mut skip_rx => WaitOutcome::Skipped,
                ok = candidate.ensure_initialized() => WaitOutcome::Initialized(ok),
            };

            let mut state = self.state.lock();
            let still_wanted = state
                .pending
                .take()
                .is_some_and(|p| p.skip.is_some() && Arc::ptr_eq(&p.source, &candidate))
                && !candidate.is_disposed();

            match outcome {
                WaitOutcome::Cancelled => {
                    if still_wanted {
                        state.items.push_front(candidate);
                    } else {
                        drop(state);
                        candidate.dispose();
                    }
                    return Err(PipelineError::Cancelled);
                }
                WaitOutcome::Initialized(true) if still_wanted => {
                    state.current = Some(candidate.clone());
                    return Ok(candidate);
                }
                WaitOutcome::Initialized(false) => {
                    drop(state);
                    let error = PipelineError::Initialization {
                        source_id: candidate.id(),
                        reason: candidate.failure().unwrap_or_else(|| "disposed".to_string()),
                    };
                    warn!("⚠️ Fuente omitida ({}): {}", candidate.info().title, error);
                    candidate.dispose();
                }
                _ => {
                    drop(state);
                    debug!("⏭️ Candidato descartado: {}", candidate.info().title);
                    candidate.dispose();
                }
            }
        }
    }

    /// Marks `source` as finished: clears the current slot if it still holds
    /// it, disposes it and prefetches the new head.
    pub fn complete_current(&self, source: &Arc<AudioSource>) {
        let next = {
            let mut state = self.state.lock();
            if state
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, source))
            {
                state.current = None;
            }
            state.items.front().cloned()
        };

        source.dispose();
        if let Some(next) = next {
            next.start_initializing(self.bitrate_hint_kbit);
        }
    }

    /// Lo que suena ahora (puede ir una transición por detrás).
    pub fn peek_current(&self) -> Option<Arc<AudioSource>> {
        self.state.lock().current.clone()
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.items.len() + usize::from(state.pending.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sin fuente actual ni pendientes.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.current.is_none() && state.pending.is_none() && state.items.is_empty()
    }

    /// Snapshot for "now playing" and queue listings.
    ///
    /// A candidate still initializing is listed first among the upcoming
    /// items.
    pub fn snapshot(&self, limit: usize) -> QueueSnapshot {
        let state = self.state.lock();
        let upcoming_sources = state
            .pending
            .as_ref()
            .map(|p| &p.source)
            .into_iter()
            .chain(state.items.iter());

        let mut upcoming = Vec::new();
        let mut total_items = 0;
        let mut total_duration = Duration::ZERO;
        for source in upcoming_sources {
            if upcoming.len() < limit {
                upcoming.push(QueueEntry::from(source.as_ref()));
            }
            total_items += 1;
            total_duration += source.info().duration.unwrap_or_default();
        }

        let current = state.current.as_deref().map(QueueEntry::from);
        if let Some(current) = &current {
            total_duration += current.remaining.or(current.duration).unwrap_or_default();
        }

        QueueSnapshot {
            current,
            upcoming,
            total_items,
            total_duration,
        }
    }

    /// Descarta todo lo encolado (no la fuente actual)
    pub fn clear(&self) -> usize {
        let removed: Vec<_> = self.state.lock().items.drain(..).collect();
        let count = removed.len();
        for source in removed {
            source.dispose();
        }
        info!("🗑️ Cola limpiada: {} fuentes", count);
        count
    }

    /// Disposes every queued, pending and current source.
    pub fn teardown(&self) {
        let (items, current, pending) = {
            let mut state = self.state.lock();
            let items: Vec<_> = state.items.drain(..).collect();
            (items, state.current.take(), state.pending.take())
        };

        let mut disposed = 0;
        for source in items
            .into_iter()
            .chain(current)
            .chain(pending.map(|p| p.source))
        {
            if source.dispose() {
                disposed += 1;
            }
        }
        debug!("🧹 Cola desmontada: {} fuentes liberadas", disposed);
    }
}

impl Drop for SourceQueue {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Vista de una fuente para listados
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: u64,
    pub title: String,
    pub url: String,
    pub thumbnail: Option<String>,
    pub duration: Option<Duration>,
    pub remaining: Option<Duration>,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
}

impl From<&AudioSource> for QueueEntry {
    fn from(source: &AudioSource) -> Self {
        let TrackInfo {
            title,
            url,
            thumbnail,
            duration,
            requested_by,
            added_at,
        } = source.info().clone();
        Self {
            id: source.id(),
            title,
            url,
            thumbnail,
            duration,
            remaining: source.remaining(),
            requested_by,
            added_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub current: Option<QueueEntry>,
    pub upcoming: Vec<QueueEntry>,
    pub total_items: usize,
    pub total_duration: Duration,
}

impl QueueSnapshot {
    /// Obtiene una página específica de los próximos tracks
    pub fn page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let per_page = items_per_page.max(1);
        let current_page = page.max(1);
        let start = (current_page - 1) * per_page;
        let end = (start + per_page).min(self.upcoming.len());
        let total_pages = self.total_items.div_ceil(per_page).max(1);

        QueuePage {
            items: if start < self.upcoming.len() {
                self.upcoming[start..end].to_vec()
            } else {
                Vec::new()
            },
            current_page,
            total_pages,
            total_items: self.total_items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<QueueEntry>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
