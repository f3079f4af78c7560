//! Volume curve and PCM sample scaling.
//!
//! The user-facing slider lives in `[0, 1]` and maps to an amplitude factor
//! through a square curve, which sounds far more linear to the ear than a
//! direct mapping. All functions here are pure and allocation free.

/// Muestras procesadas por iteración en el camino vectorizable.
const LANES: usize = 8;

/// Convierte el slider (0..=1) al factor de amplitud.
pub fn amplitude_from_slider(slider: f32) -> f32 {
    let slider = slider.clamp(0.0, 1.0);
    slider * slider
}

/// Convierte el factor de amplitud de vuelta al slider.
pub fn slider_from_amplitude(amplitude: f32) -> f32 {
    amplitude.max(0.0).sqrt()
}

/// Amplitude factor in `(0, 1]` to decibels. Zero maps to negative infinity.
pub fn db_from_amplitude(amplitude: f32) -> f32 {
    if amplitude <= 0.0 {
        return f32::NEG_INFINITY;
    }
    20.0 * amplitude.log10()
}

pub fn amplitude_from_db(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

pub fn db_from_slider(slider: f32) -> f32 {
    db_from_amplitude(amplitude_from_slider(slider))
}

pub fn slider_from_db(db: f32) -> f32 {
    slider_from_amplitude(amplitude_from_db(db))
}

/// Scales interleaved i16 samples in place.
///
/// A factor of exactly `1.0` is a no-op. The main loop walks fixed-size
/// chunks so the compiler can vectorize it; the tail is done one sample at
/// a time. Results saturate at the i16 range.
pub fn scale_samples(samples: &mut [i16], factor: f32) {
    if factor == 1.0 {
        return;
    }

    let mut chunks = samples.chunks_exact_mut(LANES);
    for chunk in &mut chunks {
        for sample in chunk.iter_mut() {
            *sample = scale_one(*sample, factor);
        }
    }
    for sample in chunks.into_remainder() {
        *sample = scale_one(*sample, factor);
    }
}

/// Igual que [`scale_samples`] pero sobre bytes s16le crudos.
///
/// A trailing odd byte (never produced by a whole frame) is left untouched.
pub fn scale_pcm_le(bytes: &mut [u8], factor: f32) {
    if factor == 1.0 {
        return;
    }

    let mut chunks = bytes.chunks_exact_mut(LANES * 2);
    for chunk in &mut chunks {
        for pair in chunk.chunks_exact_mut(2) {
            scale_pair(pair, factor);
        }
    }
    for pair in chunks.into_remainder().chunks_exact_mut(2) {
        scale_pair(pair, factor);
    }
}

#[inline]
fn scale_one(sample: i16, factor: f32) -> i16 {
    // `as` satura en el rango de i16
    (sample as f32 * factor).round() as i16
}

#[inline]
fn scale_pair(pair: &mut [u8], factor: f32) {
    let sample = i16::from_le_bytes([pair[0], pair[1]]);
    pair.copy_from_slice(&scale_one(sample, factor).to_le_bytes());
}

/// Short linear fade-in applied to the raw slider after a silence gap.
///
/// Jumping straight to full volume after a gap produces an audible click;
/// the ramp spreads the change over `frames` frames instead.
#[derive(Debug, Clone)]
pub struct VolumeRamp {
    frames: u32,
    position: u32,
}

impl VolumeRamp {
    pub fn new(frames: u32) -> Self {
        // arranca completo: el primer audio tras un hueco llama a restart()
        Self {
            frames,
            position: frames,
        }
    }

    /// Reinicia la rampa (fin de un hueco de silencio).
    pub fn restart(&mut self) {
        self.position = 0;
    }

    pub fn is_ramping(&self) -> bool {
        self.position < self.frames
    }

    /// Returns the slider to use for the next frame and advances the ramp.
    pub fn next_slider(&mut self, target: f32) -> f32 {
        if !self.is_ramping() {
            return target;
        }
        self.position += 1;
        target * self.position as f32 / self.frames as f32
    }
}
