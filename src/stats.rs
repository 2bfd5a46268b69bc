//! RTT/jitter/loss/bandwidth telemetry and a MOS-derived quality grade
//! (spec §4.4). Lock-free reads for snapshotting, a lock for RTT/jitter
//! updates (spec §5).

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Quality grade bucketed from RTT/loss/jitter thresholds (spec §4.4 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityGrade {
    Excellent,
    Good,
    Fair,
    Poor,
    Bad,
}

#[derive(Debug, Clone, Copy, Default)]
struct RttState {
    rtt_ms: f64,
    var_ms: f64,
    min_ms: f64,
    max_ms: f64,
    has_sample: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct JitterState {
    jitter_ms: f64,
    prev_transit_ms: Option<f64>,
}

/// Rolling network-quality telemetry for one peer/talker.
pub struct NetworkStats {
    rtt: RwLock<RttState>,
    jitter: RwLock<JitterState>,
    bandwidth: RwLock<BandwidthWindow>,
    sent: AtomicU64,
    received: AtomicU64,
    lost: AtomicU64,
    out_of_order: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct BandwidthWindow {
    window_start: std::time::Instant,
    bytes_in_window: u64,
    last_kbps: f64,
}

impl Default for BandwidthWindow {
    fn default() -> Self {
        Self { window_start: std::time::Instant::now(), bytes_in_window: 0, last_kbps: 0.0 }
    }
}

impl Default for NetworkStats {
    fn default() -> Self {
        Self {
            rtt: RwLock::new(RttState::default()),
            jitter: RwLock::new(JitterState::default()),
            bandwidth: RwLock::new(BandwidthWindow::default()),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }
}

impl NetworkStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// RFC 6298-shaped EWMA: first sample seeds `RTT`/`VAR`; subsequently
    /// `RTT += Δ/8`, `VAR += (|Δ| - VAR)/4`.
    pub fn record_rtt(&self, ms: f64) {
        let mut s = self.rtt.write();
        if !s.has_sample {
            s.rtt_ms = ms;
            s.var_ms = ms / 2.0;
            s.min_ms = ms;
            s.max_ms = ms;
            s.has_sample = true;
        } else {
            let delta = ms - s.rtt_ms;
            s.rtt_ms += delta / 8.0;
            s.var_ms += (delta.abs() - s.var_ms) / 4.0;
            s.min_ms = s.min_ms.min(ms);
            s.max_ms = s.max_ms.max(ms);
        }
    }

    pub fn record_packet_sent(&self, bytes: usize) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.bandwidth.write().bytes_in_window += bytes as u64;
    }

    /// `ts` is this packet's send timestamp (ms) if known; used for an
    /// RFC 3550-style jitter EWMA: `J += (|D| - J)/16`.
    pub fn record_packet_received(&self, bytes: usize, ts_ms: Option<f64>, arrival_ms: f64) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.bandwidth.write().bytes_in_window += bytes as u64;

        if let Some(ts) = ts_ms {
            let transit = arrival_ms - ts;
            let mut j = self.jitter.write();
            if let Some(prev) = j.prev_transit_ms {
                let d = (transit - prev).abs();
                j.jitter_ms += (d - j.jitter_ms) / 16.0;
            }
            j.prev_transit_ms = Some(transit);
        }
    }

    pub fn record_packet_lost(&self, n: u64) {
        self.lost.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_out_of_order(&self) {
        self.out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    /// Recompute the bandwidth estimate; call at least every 100ms.
    pub fn update_bandwidth(&self) {
        let mut b = self.bandwidth.write();
        let elapsed_ms = b.window_start.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms <= 0.0 {
            return;
        }
        b.last_kbps = (b.bytes_in_window as f64) * 8.0 / elapsed_ms;
        b.bytes_in_window = 0;
        b.window_start = std::time::Instant::now();
    }

    pub fn rtt_ms(&self) -> f64 {
        self.rtt.read().rtt_ms
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter.read().jitter_ms
    }

    pub fn bandwidth_kbps(&self) -> f64 {
        self.bandwidth.read().last_kbps
    }

    pub fn loss_ratio(&self) -> f64 {
        let lost = self.lost.load(Ordering::Relaxed) as f64;
        let received = self.received.load(Ordering::Relaxed) as f64;
        let total = lost + received;
        if total == 0.0 {
            0.0
        } else {
            lost / total
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
    pub fn out_of_order(&self) -> u64 {
        self.out_of_order.load(Ordering::Relaxed)
    }

    /// E-model-derived Mean Opinion Score, 1..4.5 (spec §4.4).
    pub fn mos(&self) -> f64 {
        let rtt = self.rtt_ms();
        let jitter = self.jitter_ms();
        let loss_pct = self.loss_ratio() * 100.0;

        let eff_latency = rtt / 2.0 + 2.0 * jitter;
        let id = if eff_latency < 160.0 {
            0.024 * eff_latency
        } else {
            0.024 * 160.0 + 0.11 * (eff_latency - 160.0)
        };
        let r = (93.2 - id - 2.5 * loss_pct).clamp(0.0, 100.0);
        let mos = 1.0 + 0.035 * r + r * (r - 60.0) * (100.0 - r) * 7e-6;
        mos.clamp(1.0, 4.5)
    }

    /// Bucket current RTT/loss/jitter into a [`QualityGrade`].
    pub fn quality_grade(&self) -> QualityGrade {
        let rtt = self.rtt_ms();
        let loss_pct = self.loss_ratio() * 100.0;
        let jitter = self.jitter_ms();

        if rtt < 50.0 && loss_pct < 1.0 && jitter < 20.0 {
            QualityGrade::Excellent
        } else if rtt < 100.0 && loss_pct < 3.0 && jitter < 40.0 {
            QualityGrade::Good
        } else if rtt < 200.0 && loss_pct < 5.0 && jitter < 70.0 {
            QualityGrade::Fair
        } else if rtt < 400.0 && loss_pct < 10.0 && jitter < 100.0 {
            QualityGrade::Poor
        } else {
            QualityGrade::Bad
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rtt_ewma_seeds_then_tracks() {
        let stats = NetworkStats::new();
        stats.record_rtt(100.0);
        assert_eq!(stats.rtt_ms(), 100.0);
        stats.record_rtt(108.0);
        // delta=8, rtt += 8/8 = 1 -> 101
        assert_eq!(stats.rtt_ms(), 101.0);
    }

    #[test]
    fn jitter_ewma_tracks_inter_arrival_variance() {
        let stats = NetworkStats::new();
        stats.record_packet_received(100, Some(0.0), 0.0);
        stats.record_packet_received(100, Some(20.0), 25.0);
        assert!(stats.jitter_ms() >= 0.0);
    }

    #[test]
    fn loss_ratio_and_quality_grade_excellent() {
        let stats = NetworkStats::new();
        stats.record_rtt(20.0);
        for _ in 0..100 {
            stats.record_packet_received(100, None, 0.0);
        }
        assert_eq!(stats.loss_ratio(), 0.0);
        assert_eq!(stats.quality_grade(), QualityGrade::Excellent);
    }

    #[test]
    fn quality_grade_degrades_with_loss() {
        let stats = NetworkStats::new();
        stats.record_rtt(300.0);
        for _ in 0..91 {
            stats.record_packet_received(100, None, 0.0);
        }
        stats.record_packet_lost(9);
        assert_eq!(stats.quality_grade(), QualityGrade::Poor);
    }

    #[test]
    fn quality_grade_is_bad_at_exact_poor_boundary() {
        let stats = NetworkStats::new();
        stats.record_rtt(300.0);
        for _ in 0..90 {
            stats.record_packet_received(100, None, 0.0);
        }
        stats.record_packet_lost(10);
        assert_eq!(stats.quality_grade(), QualityGrade::Bad);
    }

    #[test]
    fn mos_is_near_best_case_for_ideal_network() {
        let stats = NetworkStats::new();
        stats.record_rtt(10.0);
        for _ in 0..1000 {
            stats.record_packet_received(100, None, 0.0);
        }
        assert!(stats.mos() > 4.0, "mos={}", stats.mos());
    }

    #[test]
    fn mos_clamped_to_valid_range() {
        let stats = NetworkStats::new();
        stats.record_rtt(5000.0);
        stats.record_packet_lost(1000);
        stats.record_packet_received(1, None, 0.0);
        let mos = stats.mos();
        assert!((1.0..=4.5).contains(&mos));
    }
}
