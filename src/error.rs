use thiserror::Error;

/// Errores del pipeline de reproducción.
///
/// Per-source failures (`Initialization`, `StreamRead`) are local and
/// self-healing: the queue skips the source and continues. Only `Sink`
/// failures coming out of the pacing loop are fatal for a player.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Resolver, fetch or transcoder start failed for a source.
    #[error("initialization failed for source {source_id}: {reason}")]
    Initialization { source_id: u64, reason: String },

    /// A mid-playback read failed; handled as end of stream.
    #[error("stream read failed: {0}")]
    StreamRead(#[from] std::io::Error),

    /// A wait was cancelled before it completed (not the same as drained).
    #[error("operation cancelled")]
    Cancelled,

    /// The output sink rejected a frame or a speaking update.
    #[error("sink failure: {0}")]
    Sink(#[source] anyhow::Error),

    /// The pacing loop is gone and no longer accepts frames.
    #[error("frame pacer stopped")]
    PacerStopped,

    #[error("queue is full (max {0} items)")]
    QueueFull(usize),

    #[error("settings store error: {0}")]
    Settings(#[source] anyhow::Error),
}

impl PipelineError {
    /// Indica si el error debe derribar la sesión completa.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Sink(_))
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
