//! PCM frame format and the chunker that turns arbitrary reads into frames.

use parking_lot::Mutex;
use std::time::Duration;

/// Sample rate de salida (estándar de Discord).
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;
pub const BYTES_PER_SAMPLE: u32 = 2;
pub const FRAME_DURATION_MS: u32 = 20;

/// 48000 / 1000 * 20 * 2 canales * 2 bytes = 3840
pub const FRAME_SIZE_BYTES: usize =
    frame_size_bytes(SAMPLE_RATE, CHANNELS, BYTES_PER_SAMPLE, FRAME_DURATION_MS);

/// Bytes de PCM por segundo de audio (192 000 para 48 kHz estéreo s16).
pub const PCM_BYTES_PER_SECOND: u64 = (SAMPLE_RATE * CHANNELS * BYTES_PER_SAMPLE) as u64;

/// Frames per second at the codec cadence (50 for 20 ms frames).
pub const FRAMES_PER_SECOND: u32 = 1000 / FRAME_DURATION_MS;

pub const fn frame_size_bytes(
    sample_rate: u32,
    channels: u32,
    bytes_per_sample: u32,
    frame_ms: u32,
) -> usize {
    (sample_rate / 1000 * frame_ms * channels * bytes_per_sample) as usize
}

pub fn frame_interval() -> Duration {
    Duration::from_millis(FRAME_DURATION_MS as u64)
}

/// Un frame completo de PCM s16le intercalado.
///
/// A `Frame` can only be built full; the output path never sees a short one.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
}

impl Frame {
    pub fn silence() -> Self {
        Self {
            data: vec![0; FRAME_SIZE_BYTES],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn into_buffer(self) -> Vec<u8> {
        self.data
    }
}

/// Pool de buffers de frame reutilizables.
#[derive(Debug)]
pub struct FramePool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
}

impl FramePool {
    pub fn new(max_buffers: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_buffers)),
            max_buffers,
        }
    }

    fn take_buffer(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(FRAME_SIZE_BYTES))
    }

    /// Devuelve el buffer del frame al pool.
    pub fn release(&self, frame: Frame) {
        let mut buffer = frame.into_buffer();
        buffer.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_buffers {
            buffers.push(buffer);
        }
    }

    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// Accumulates PCM bytes from arbitrary-sized reads and hands out whole frames.
///
/// Leftover bytes stay in the staging buffer until the next read fills it.
#[derive(Debug)]
pub struct PcmChunker {
    staging: Vec<u8>,
    frame_size: usize,
}

impl PcmChunker {
    pub fn new(frame_size: usize) -> Self {
        Self {
            staging: Vec::with_capacity(frame_size),
            frame_size,
        }
    }

    /// Copies as much of `data` as fits in the current frame; returns bytes taken.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let missing = self.frame_size - self.staging.len();
        let take = missing.min(data.len());
        self.staging.extend_from_slice(&data[..take]);
        take
    }

    pub fn is_full(&self) -> bool {
        self.staging.len() == self.frame_size
    }

    /// Saca el frame si está completo, usando un buffer del pool.
    pub fn take_frame(&mut self, pool: &FramePool) -> Option<Frame> {
        if !self.is_full() {
            return None;
        }
        let mut buffer = pool.take_buffer();
        buffer.extend_from_slice(&self.staging);
        self.staging.clear();
        Some(Frame { data: buffer })
    }

    pub fn pending(&self) -> usize {
        self.staging.len()
    }

    /// Descarta el frame parcial (fin de una fuente).
    pub fn reset(&mut self) -> usize {
        let dropped = self.staging.len();
        self.staging.clear();
        dropped
    }
}
