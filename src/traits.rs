//! Trait seams for the external collaborators named in spec §1: the
//! speech codec (encode/decode/PLC) and the audio sink/output ring. Both
//! are out of scope for this crate's own implementation — only the shape
//! the core depends on lives here, the way the teacher isolates `cpal`
//! devices behind `audio::AudioParams`.

use crate::config::SAMPLES_PER_FRAME;

/// A constant-bitrate speech codec. The core never implements codec
/// internals (native PLC included) — it only calls through this trait.
pub trait SpeechCodec: Send {
    /// Encode one frame of `SAMPLES_PER_FRAME` PCM samples.
    fn encode(&mut self, pcm: &[f32]) -> Vec<u8>;

    /// Decode one frame's payload into `out`, returning samples written.
    fn decode(&mut self, payload: &[u8], out: &mut [f32]) -> usize;

    /// Synthesize a plausible replacement for a missing frame ("conceal
    /// one frame", spec §9) into `out`, returning samples written.
    fn conceal(&mut self, out: &mut [f32]) -> usize;
}

/// Discard-on-overflow output ring the decoded/concealed samples are
/// written into (spec §4.6). Producers never block the audio tick.
pub trait AudioSink: Send {
    /// Push up to `SAMPLES_PER_FRAME` samples; excess is dropped rather
    /// than blocking the caller.
    fn push(&mut self, samples: &[f32]);

    /// Drop all buffered samples (visibility → false, spec §4.6).
    fn clear(&mut self);
}

/// A minimal in-memory ring sized for a handful of frames, usable by
/// tests and as a reference `AudioSink` implementation.
pub struct RingSink {
    buf: std::collections::VecDeque<f32>,
    capacity: usize,
}

impl RingSink {
    pub fn new(frames_capacity: usize) -> Self {
        Self {
            buf: std::collections::VecDeque::with_capacity(frames_capacity * SAMPLES_PER_FRAME as usize),
            capacity: frames_capacity * SAMPLES_PER_FRAME as usize,
        }
    }

    pub fn drain(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.buf.len());
        for slot in out.iter_mut().take(n) {
            *slot = self.buf.pop_front().unwrap();
        }
        n
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl AudioSink for RingSink {
    fn push(&mut self, samples: &[f32]) {
        for &s in samples {
            if self.buf.len() >= self.capacity {
                self.buf.pop_front();
            }
            self.buf.push_back(s);
        }
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_sink_discards_oldest_on_overflow() {
        let mut ring = RingSink::new(1);
        let cap = ring.capacity;
        let samples: Vec<f32> = (0..cap + 5).map(|i| i as f32).collect();
        ring.push(&samples);
        assert_eq!(ring.len(), cap);
        let mut out = vec![0.0; 1];
        ring.drain(&mut out);
        assert_eq!(out[0], 5.0);
    }

    #[test]
    fn ring_sink_clear_drops_everything() {
        let mut ring = RingSink::new(1);
        ring.push(&[1.0, 2.0, 3.0]);
        ring.clear();
        assert!(ring.is_empty());
    }
}
