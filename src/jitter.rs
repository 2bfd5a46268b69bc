//! Adaptive jitter buffer (spec §4.5 — "the hot core"): reordering,
//! duplicate/late rejection, sequence-wraparound handling, adaptive
//! target-delay control, PLC-signalling.

use std::collections::VecDeque;
use std::time::Instant;

use crate::error::JitterEvent;
use crate::sequence::{self, SequenceId};

/// One buffered frame.
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    pub sequence: SequenceId,
    pub payload: Vec<u8>,
    pub arrival: Instant,
}

/// What a tick's [`AdaptiveJitterBuffer::get`] call yields.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// Deliver this frame's payload to the decoder.
    Packet(Vec<u8>),
    /// Conceal one frame (PLC) — the expected sequence never arrived in time.
    Lost,
    /// Not enough buffered yet; caller should wait and re-poll.
    Wait,
}

/// Static configuration (spec §4.5).
#[derive(Debug, Clone, Copy)]
pub struct JitterConfig {
    pub min_buffer_ms: u32,
    pub max_buffer_ms: u32,
    pub frame_size_ms: u32,
}

impl JitterConfig {
    pub fn max_packets(&self) -> usize {
        (self.max_buffer_ms as usize).div_ceil(self.frame_size_ms as usize) + 2
    }
}

#[derive(Debug, Default)]
struct JitterStats {
    accepted: u64,
    duplicate: u64,
    late: u64,
    buffer_overflow: u64,
    lost: u64,
    out_of_order_played: u64,
    avg_jitter_ms: f64,
}

/// Per-remote-speaker reorder/de-dup/adaptive-delay/PLC-signal buffer.
///
/// Invariants (spec §4.5):
/// - every frame in `frames` is newer than `last_played` once that's set
/// - `min_buffer_ms <= adaptive_delay_ms <= max_buffer_ms`
/// - `frames.len() <= config.max_packets()`
pub struct AdaptiveJitterBuffer {
    config: JitterConfig,
    /// Ordered oldest (front) to newest (back) by sequence.
    frames: VecDeque<BufferedFrame>,
    last_played: Option<SequenceId>,
    next_expected: Option<SequenceId>,
    last_arrival: Option<Instant>,
    target_delay_ms: f64,
    adaptive_delay_ms: f64,
    stats: JitterStats,
}

impl AdaptiveJitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        let min = config.min_buffer_ms as f64;
        Self {
            config,
            frames: VecDeque::new(),
            last_played: None,
            next_expected: None,
            last_arrival: None,
            target_delay_ms: min,
            adaptive_delay_ms: min,
            stats: JitterStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn adaptive_delay_ms(&self) -> f64 {
        self.adaptive_delay_ms
    }

    pub fn config(&self) -> JitterConfig {
        self.config
    }

    pub fn stats_snapshot(&self) -> (u64, u64, u64, u64, u64, u64) {
        (
            self.stats.accepted,
            self.stats.duplicate,
            self.stats.late,
            self.stats.buffer_overflow,
            self.stats.lost,
            self.stats.out_of_order_played,
        )
    }

    /// Admit a newly-arrived frame. `now` is the caller's monotonic clock
    /// reading at arrival.
    pub fn add(&mut self, sequence: SequenceId, payload: Vec<u8>, now: Instant) -> JitterEvent {
        if let Some(prev_arrival) = self.last_arrival {
            let inter_arrival = now.saturating_duration_since(prev_arrival).as_secs_f64() * 1000.0;
            let jitter_sample = (inter_arrival - self.config.frame_size_ms as f64).abs();
            self.stats.avg_jitter_ms += (jitter_sample - self.stats.avg_jitter_ms) / 8.0;
        }
        self.last_arrival = Some(now);
        self.adapt_delay(self.stats.avg_jitter_ms);

        if let Some(last_played) = self.last_played {
            if !sequence::is_newer(sequence, last_played) {
                if sequence::distance(sequence, last_played) > self.config.max_packets() as u16 {
                    self.stats.late += 1;
                    return JitterEvent::Late;
                }
                self.stats.duplicate += 1;
                return JitterEvent::Duplicate;
            }
        }

        if let Some(next_expected) = self.next_expected {
            if !sequence::is_newer(sequence, next_expected)
                && sequence::distance(sequence, next_expected) > self.config.max_packets() as u16
            {
                self.stats.late += 1;
                return JitterEvent::Late;
            }
        }

        if self.frames.iter().any(|f| f.sequence == sequence) {
            self.stats.duplicate += 1;
            return JitterEvent::Duplicate;
        }

        let insert_at = self
            .frames
            .iter()
            .position(|f| sequence::is_newer(f.sequence, sequence))
            .unwrap_or(self.frames.len());
        self.frames.insert(insert_at, BufferedFrame { sequence, payload, arrival: now });
        self.stats.accepted += 1;

        if self.frames.len() > self.config.max_packets() {
            self.frames.pop_front();
            self.stats.late += 1;
            self.stats.buffer_overflow += 1;
            return JitterEvent::BufferOverflow;
        }

        JitterEvent::Accepted
    }

    /// Asymmetric delay adaptation: ramp up fast (protect against jitter
    /// bursts), ramp down slowly (avoid oscillation).
    fn adapt_delay(&mut self, avg_jitter_ms: f64) {
        let frame_ms = self.config.frame_size_ms as f64;
        let target_packets = (2.0_f64).max((avg_jitter_ms * 2.0 / frame_ms).ceil());
        let new_target_ms =
            (target_packets * frame_ms).clamp(self.config.min_buffer_ms as f64, self.config.max_buffer_ms as f64);

        if new_target_ms > self.target_delay_ms {
            self.target_delay_ms += frame_ms;
        } else if new_target_ms < self.target_delay_ms {
            self.target_delay_ms -= 1.0;
        }
        self.target_delay_ms = self.target_delay_ms.clamp(self.config.min_buffer_ms as f64, self.config.max_buffer_ms as f64);

        self.adaptive_delay_ms = (7.0 * self.adaptive_delay_ms + self.target_delay_ms) / 8.0;
        self.adaptive_delay_ms =
            self.adaptive_delay_ms.clamp(self.config.min_buffer_ms as f64, self.config.max_buffer_ms as f64);
    }

    /// Produce the next playback event for this tick.
    pub fn get(&mut self, now: Instant) -> PlaybackEvent {
        let Some(oldest) = self.frames.front() else {
            return PlaybackEvent::Wait;
        };

        if self.next_expected.is_none() {
            let buffered_ms = self.frames.len() as f64 * self.config.frame_size_ms as f64;
            if buffered_ms < self.adaptive_delay_ms {
                return PlaybackEvent::Wait;
            }
            let frame = self.frames.pop_front().unwrap();
            self.last_played = Some(frame.sequence);
            self.next_expected = Some(sequence::next(frame.sequence));
            return PlaybackEvent::Packet(frame.payload);
        }

        let next_expected = self.next_expected.unwrap();
        if oldest.sequence == next_expected {
            let frame = self.frames.pop_front().unwrap();
            self.last_played = Some(frame.sequence);
            self.next_expected = Some(sequence::next(frame.sequence));
            PlaybackEvent::Packet(frame.payload)
        } else if sequence::is_newer(oldest.sequence, next_expected) {
            let waited_ms = now.saturating_duration_since(oldest.arrival).as_secs_f64() * 1000.0;
            if waited_ms >= self.adaptive_delay_ms {
                self.stats.lost += 1;
                self.next_expected = Some(sequence::next(next_expected));
                PlaybackEvent::Lost
            } else {
                PlaybackEvent::Wait
            }
        } else {
            // Stale relative to next_expected: the add-time guards should
            // prevent this, but emit it rather than stalling, and count it
            // explicitly instead of the source's silent fallthrough.
            self.stats.out_of_order_played += 1;
            let frame = self.frames.pop_front().unwrap();
            self.last_played = Some(frame.sequence);
            self.next_expected = Some(sequence::next(frame.sequence));
            PlaybackEvent::Packet(frame.payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn config() -> JitterConfig {
        JitterConfig { min_buffer_ms: 0, max_buffer_ms: 200, frame_size_ms: 20 }
    }

    #[test]
    fn ordered_delivery_scenario() {
        let mut buf = AdaptiveJitterBuffer::new(config());
        let t0 = Instant::now();
        buf.add(1, vec![0x01], t0);
        buf.add(2, vec![0x02], t0 + Duration::from_millis(20));
        buf.add(3, vec![0x03], t0 + Duration::from_millis(40));

        let t_play = t0 + Duration::from_millis(60);
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![0x01]));
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![0x02]));
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![0x03]));

        let (accepted, dup, late, _, lost, _) = buf.stats_snapshot();
        assert_eq!((accepted, dup, late, lost), (3, 0, 0, 0));
    }

    #[test]
    fn reorder_and_dedup_scenario() {
        let mut buf = AdaptiveJitterBuffer::new(config());
        let t0 = Instant::now();
        buf.add(3, vec![0x03], t0);
        buf.add(1, vec![0x01], t0);
        buf.add(2, vec![0x02], t0);
        let dup_event = buf.add(1, vec![0x01], t0);
        assert_eq!(dup_event, JitterEvent::Duplicate);

        let t_play = t0 + Duration::from_millis(60);
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![0x01]));
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![0x02]));
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![0x03]));

        let (accepted, dup, ..) = buf.stats_snapshot();
        assert_eq!((accepted, dup), (3, 1));
    }

    #[test]
    fn loss_with_plc_scenario() {
        let mut cfg = config();
        cfg.min_buffer_ms = 40;
        let mut buf = AdaptiveJitterBuffer::new(cfg);
        let t0 = Instant::now();
        buf.add(1, vec![1], t0);
        buf.add(2, vec![2], t0 + Duration::from_millis(20));
        // seq 3 skipped
        buf.add(4, vec![4], t0 + Duration::from_millis(60));

        let t_play = t0 + Duration::from_millis(120);
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![1]));
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![2]));
        assert_eq!(buf.get(t_play), PlaybackEvent::Lost);
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![4]));

        let (_, _, _, _, lost, _) = buf.stats_snapshot();
        assert_eq!(lost, 1);
    }

    #[test]
    fn wraparound_scenario() {
        let mut buf = AdaptiveJitterBuffer::new(config());
        let t0 = Instant::now();
        buf.add(65534, vec![1], t0);
        buf.add(65535, vec![2], t0 + Duration::from_millis(20));
        buf.add(0, vec![3], t0 + Duration::from_millis(40));
        buf.add(1, vec![4], t0 + Duration::from_millis(60));

        let t_play = t0 + Duration::from_millis(80);
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![1]));
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![2]));
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![3]));
        assert_eq!(buf.get(t_play), PlaybackEvent::Packet(vec![4]));
    }

    #[test]
    fn adaptive_delay_stays_within_bounds() {
        let mut buf = AdaptiveJitterBuffer::new(config());
        let mut t = Instant::now();
        for i in 0..500u16 {
            // Irregular arrivals to stress the adaptation.
            let gap_ms = if i % 3 == 0 { 5 } else { 45 };
            t += Duration::from_millis(gap_ms);
            buf.add(i, vec![0], t);
            assert!(buf.adaptive_delay_ms() >= buf.config.min_buffer_ms as f64);
            assert!(buf.adaptive_delay_ms() <= buf.config.max_buffer_ms as f64);
        }
    }

    #[test]
    fn buffer_overflow_evicts_oldest_and_counts_late() {
        let mut cfg = config();
        cfg.max_buffer_ms = 40; // max_packets = 40/20 + 2 = 4
        let mut buf = AdaptiveJitterBuffer::new(cfg);
        let t0 = Instant::now();
        for i in 0..4u16 {
            buf.add(i, vec![i as u8], t0 + Duration::from_millis(i as u64));
        }
        assert_eq!(buf.len(), 4);
        let event = buf.add(10, vec![10], t0 + Duration::from_millis(10));
        assert_eq!(event, JitterEvent::BufferOverflow);
        assert!(buf.len() <= cfg.max_packets());
    }

    #[test]
    fn late_packet_outside_window_is_rejected() {
        let mut cfg = config();
        cfg.max_buffer_ms = 40;
        let mut buf = AdaptiveJitterBuffer::new(cfg);
        let t0 = Instant::now();
        // Establish next_expected via playback.
        buf.add(100, vec![1], t0);
        let _ = buf.get(t0);
        assert_eq!(buf.next_expected, Some(101));

        let max_packets = cfg.max_packets() as u16;
        let very_late = 101u16.wrapping_sub(max_packets + 5);
        let event = buf.add(very_late, vec![2], t0);
        assert_eq!(event, JitterEvent::Late);
    }
}
