//! Per-remote-speaker state machine: jitter buffer → decoder → output ring
//! (spec §4.6). Runs on a fixed-cadence tick of `frame_size_ms`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::SAMPLES_PER_FRAME;
use crate::jitter::{AdaptiveJitterBuffer, JitterConfig, PlaybackEvent};
use crate::traits::{AudioSink, SpeechCodec};

/// Lifecycle/visibility/mute state for one remote speaker (spec §3).
pub struct RemoteTalker<C: SpeechCodec, S: AudioSink> {
    pub talker_id: i32,
    jitter: Mutex<AdaptiveJitterBuffer>,
    decoder: Mutex<C>,
    output: Mutex<S>,
    last_arrival_wallclock: Mutex<Option<std::time::SystemTime>>,
    speaking: AtomicBool,
    user_muted: AtomicBool,
    visible: AtomicBool,
    silence_threshold_ms: u64,
}

impl<C: SpeechCodec, S: AudioSink> RemoteTalker<C, S> {
    pub fn new(talker_id: i32, jitter_config: JitterConfig, decoder: C, output: S, silence_threshold_ms: u64) -> Self {
        Self {
            talker_id,
            jitter: Mutex::new(AdaptiveJitterBuffer::new(jitter_config)),
            decoder: Mutex::new(decoder),
            output: Mutex::new(output),
            last_arrival_wallclock: Mutex::new(None),
            speaking: AtomicBool::new(false),
            user_muted: AtomicBool::new(false),
            visible: AtomicBool::new(true),
            silence_threshold_ms,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.user_muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.user_muted.load(Ordering::Relaxed)
    }

    /// Network thread: hand an arrived, decrypted frame to the jitter buffer.
    pub fn on_frame_arrived(&self, sequence: u16, payload: Vec<u8>, now: Instant) {
        self.jitter.lock().add(sequence, payload, now);
        *self.last_arrival_wallclock.lock() = Some(std::time::SystemTime::now());
    }

    /// Visibility → false: drop everything buffered to avoid stale audio
    /// when the speaker re-enters range (spec §4.6).
    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Relaxed);
        if !visible {
            self.clear_all();
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }

    pub fn clear_all(&self) {
        let mut jitter = self.jitter.lock();
        let config = jitter.config();
        *jitter = AdaptiveJitterBuffer::new(config);
        drop(jitter);
        self.output.lock().clear();
        self.speaking.store(false, Ordering::Relaxed);
    }

    /// One audio tick: query jitter buffer, decode/conceal/silence, write
    /// to the output ring. `speaking_threshold` is the RMS above which the
    /// talker is considered actively speaking.
    pub fn tick(&self, now: Instant, speaking_threshold: f32) {
        let event = self.jitter.lock().get(now);
        let mut scratch = [0.0f32; SAMPLES_PER_FRAME as usize];

        match event {
            PlaybackEvent::Packet(payload) => {
                let n = self.decoder.lock().decode(&payload, &mut scratch);
                self.publish(&scratch[..n], speaking_threshold);
            }
            PlaybackEvent::Lost => {
                let n = self.decoder.lock().conceal(&mut scratch);
                self.publish(&scratch[..n], speaking_threshold);
            }
            PlaybackEvent::Wait => {
                let stale = self
                    .last_arrival_wallclock
                    .lock()
                    .map(|t| t.elapsed().map(|d| d.as_millis() as u64).unwrap_or(0))
                    .unwrap_or(u64::MAX);
                if stale > self.silence_threshold_ms {
                    self.output.lock().push(&[0.0; SAMPLES_PER_FRAME as usize]);
                    self.speaking.store(false, Ordering::Relaxed);
                } else {
                    // Smooth transients rather than hard-cutting to silence.
                    let n = self.decoder.lock().conceal(&mut scratch);
                    self.publish(&scratch[..n], speaking_threshold);
                }
            }
        }
    }

    fn publish(&self, samples: &[f32], speaking_threshold: f32) {
        let rms = if samples.is_empty() {
            0.0
        } else {
            (samples.iter().map(|s| (*s as f64).powi(2)).sum::<f64>() / samples.len() as f64).sqrt() as f32
        };
        self.speaking.store(rms >= speaking_threshold, Ordering::Relaxed);
        self.output.lock().push(samples);
    }
}

impl<C: SpeechCodec> RemoteTalker<C, crate::traits::RingSink> {
    /// Drain decoded samples out of the in-memory ring sink.
    pub fn drain(&self, out: &mut [f32]) -> usize {
        self.output.lock().drain(out)
    }
}

/// Thread-safe shared handle to a talker's pipeline.
pub type SharedTalker<C, S> = Arc<RemoteTalker<C, S>>;
