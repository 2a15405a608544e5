//! Bandwidth measurement and adaptive quality selection.
//!
//! A probe produces raw throughput/latency/loss numbers; a fixed policy maps
//! them to a [`QualityTier`]; the [`BandwidthMonitor`] smooths tier
//! recommendations over a short history so a single good or bad sample does
//! not flip the video quality back and forth.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::metrics::LinkStats;

/// How long a measurement may run before the monitor gives up and applies
/// conservative fallback numbers.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const HISTORY_LEN: usize = 10;

/// Video quality rungs with fixed capture/bitrate parameters. Ordered from
/// worst to best so tier distance is ordinal distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
    Hd,
}

impl QualityTier {
    pub fn index(self) -> usize {
        match self {
            QualityTier::Low => 0,
            QualityTier::Medium => 1,
            QualityTier::High => 2,
            QualityTier::Hd => 3,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index {
            0 => QualityTier::Low,
            1 => QualityTier::Medium,
            2 => QualityTier::High,
            _ => QualityTier::Hd,
        }
    }

    pub fn resolution(self) -> (u32, u32) {
        match self {
            QualityTier::Low => (320, 240),
            QualityTier::Medium => (640, 480),
            QualityTier::High => (1280, 720),
            QualityTier::Hd => (1920, 1080),
        }
    }

    pub fn frame_rate(self) -> u32 {
        match self {
            QualityTier::Low => 15,
            QualityTier::Medium => 24,
            QualityTier::High | QualityTier::Hd => 30,
        }
    }

    pub fn max_bitrate_kbps(self) -> u32 {
        match self {
            QualityTier::Low => 300,
            QualityTier::Medium => 800,
            QualityTier::High => 1500,
            QualityTier::Hd => 3000,
        }
    }
}

/// Raw numbers out of one probe run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawMeasurement {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub packet_loss_pct: f64,
}

/// One finished measurement plus the tier it recommends on its own. The
/// smoothed tier the monitor actually holds is
/// [`BandwidthMonitor::committed_tier`]; a single sample never speaks for it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BandwidthSample {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub packet_loss_pct: f64,
    /// The recommendation derived from this measurement alone.
    pub tier: QualityTier,
    #[serde(skip_serializing)]
    pub measured_at: Instant,
}

impl BandwidthSample {
    /// Conservative numbers applied when a probe times out or cannot run.
    pub fn fallback() -> Self {
        Self {
            download_mbps: 1.0,
            upload_mbps: 0.5,
            latency_ms: 100.0,
            packet_loss_pct: 0.0,
            tier: QualityTier::Low,
            measured_at: Instant::now(),
        }
    }
}

/// Map raw numbers to a tier. High latency or loss overrides throughput;
/// otherwise the weaker of the two link directions decides.
pub fn recommend(m: &RawMeasurement) -> QualityTier {
    if m.latency_ms > 300.0 || m.packet_loss_pct > 5.0 {
        return QualityTier::Low;
    }
    let speed = m.download_mbps.min(m.upload_mbps);
    if speed >= 5.0 {
        QualityTier::Hd
    } else if speed >= 2.0 {
        QualityTier::High
    } else if speed >= 1.0 {
        QualityTier::Medium
    } else {
        QualityTier::Low
    }
}

/// Source of raw bandwidth numbers. Production uses [`StatsProbe`]; tests
/// substitute scripted probes.
#[async_trait]
pub trait BandwidthProbe: Send + Sync {
    async fn probe(&self) -> Result<RawMeasurement>;
}

/// Derives throughput from the byte-counter deltas of the active links and
/// latency/loss from their RTCP reports. Needs at least one active link and
/// one earlier snapshot to produce a rate.
pub struct StatsProbe {
    manager: Arc<ConnectionManager>,
    prev: Mutex<HashMap<String, LinkStats>>,
}

impl StatsProbe {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            prev: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BandwidthProbe for StatsProbe {
    async fn probe(&self) -> Result<RawMeasurement> {
        let snapshot = self.manager.link_stats_snapshot().await;
        if snapshot.is_empty() {
            return Err(Error::Engine(anyhow::anyhow!(
                "no active links to measure"
            )));
        }

        let mut prev = self.prev.lock().await;
        let mut up_bps = 0.0f64;
        let mut down_bps = 0.0f64;
        let mut rtt_sum = 0.0f64;
        let mut rtt_count = 0u32;
        let mut loss_pct_max = 0.0f64;
        let mut have_rate = false;

        for (peer_id, stats) in &snapshot {
            if let Some(rtt) = stats.round_trip_time_ms {
                rtt_sum += rtt;
                rtt_count += 1;
            }
            loss_pct_max = loss_pct_max.max(stats.packet_loss_pct());
            if let Some(earlier) = prev.get(peer_id) {
                let elapsed = stats
                    .sampled_at
                    .duration_since(earlier.sampled_at)
                    .as_secs_f64();
                if elapsed > 0.0 {
                    let sent = stats.bytes_sent.saturating_sub(earlier.bytes_sent);
                    let received =
                        stats.bytes_received.saturating_sub(earlier.bytes_received);
                    up_bps += sent as f64 * 8.0 / elapsed;
                    down_bps += received as f64 * 8.0 / elapsed;
                    have_rate = true;
                }
            }
        }
        for (peer_id, stats) in snapshot {
            prev.insert(peer_id, stats);
        }

        if !have_rate {
            return Err(Error::Engine(anyhow::anyhow!(
                "no counter history yet, need a second snapshot"
            )));
        }

        Ok(RawMeasurement {
            download_mbps: down_bps / 1_000_000.0,
            upload_mbps: up_bps / 1_000_000.0,
            latency_ms: if rtt_count > 0 {
                rtt_sum / rtt_count as f64
            } else {
                0.0
            },
            packet_loss_pct: loss_pct_max,
        })
    }
}

/// Smooths tier recommendations and drives periodic measurement.
///
/// The committed tier only moves when the rounded mean of the recent
/// recommendations sits more than one rung away from it, so one aberrant
/// sample cannot flip quality up and down.
pub struct BandwidthMonitor {
    probe: Arc<dyn BandwidthProbe>,
    history: Mutex<VecDeque<QualityTier>>,
    committed: Mutex<QualityTier>,
    last_sample: Mutex<Option<BandwidthSample>>,
    busy: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BandwidthMonitor {
    pub fn new(probe: Arc<dyn BandwidthProbe>) -> Self {
        Self {
            probe,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
            // Conservative starting point: one bad first sample can still
            // drop straight to Low, one great one cannot jump past Hd.
            committed: Mutex::new(QualityTier::High),
            last_sample: Mutex::new(None),
            busy: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub async fn committed_tier(&self) -> QualityTier {
        *self.committed.lock().await
    }

    pub async fn last_sample(&self) -> Option<BandwidthSample> {
        *self.last_sample.lock().await
    }

    /// Run one measurement. Overlapping calls are skipped: the second caller
    /// gets the most recent finished sample instead of a second probe. A
    /// probe that exceeds [`PROBE_TIMEOUT`] or fails is replaced by
    /// [`BandwidthSample::fallback`].
    pub async fn measure(&self) -> Result<BandwidthSample> {
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!("measurement already in progress, returning last sample");
            return Ok(self
                .last_sample()
                .await
                .unwrap_or_else(BandwidthSample::fallback));
        }

        let sample = match tokio::time::timeout(PROBE_TIMEOUT, self.probe.probe()).await {
            Ok(Ok(raw)) => {
                let recommendation = recommend(&raw);
                self.record(recommendation).await;
                BandwidthSample {
                    download_mbps: raw.download_mbps,
                    upload_mbps: raw.upload_mbps,
                    latency_ms: raw.latency_ms,
                    packet_loss_pct: raw.packet_loss_pct,
                    tier: recommendation,
                    measured_at: Instant::now(),
                }
            }
            Ok(Err(e)) => {
                warn!("bandwidth probe failed: {e}");
                self.record(QualityTier::Low).await;
                BandwidthSample::fallback()
            }
            Err(_) => {
                warn!("{}", Error::BandwidthTestTimeout(PROBE_TIMEOUT));
                self.record(QualityTier::Low).await;
                BandwidthSample::fallback()
            }
        };

        *self.last_sample.lock().await = Some(sample);
        self.busy.store(false, Ordering::SeqCst);
        Ok(sample)
    }

    /// Fold one recommendation into the history and return the (possibly
    /// updated) committed tier.
    pub async fn record(&self, recommendation: QualityTier) -> QualityTier {
        let mut history = self.history.lock().await;
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(recommendation);

        let sum: usize = history.iter().map(|t| t.index()).sum();
        let mean = (sum as f64 / history.len() as f64).round() as usize;
        let smoothed = QualityTier::from_index(mean);
        drop(history);

        let mut committed = self.committed.lock().await;
        let distance = smoothed.index().abs_diff(committed.index());
        if distance > 1 {
            info!(from = ?*committed, to = ?smoothed, "committing quality tier change");
            *committed = smoothed;
        }
        *committed
    }

    /// Begin periodic measurement, delivering each finished sample on
    /// `updates`. A previously started loop is stopped first.
    pub async fn start(
        self: &Arc<Self>,
        interval: Duration,
        updates: mpsc::Sender<BandwidthSample>,
    ) {
        self.stop().await;
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match monitor.measure().await {
                    Ok(sample) => {
                        if updates.send(sample).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("periodic measurement failed: {e}"),
                }
            }
        });
        *self.task.lock().await = Some(handle);
    }

    /// Stop periodic measurement. An in-flight probe is abandoned, never
    /// awaited.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            // The aborted task may have been mid-measure.
            self.busy.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedProbe {
        measurement: RawMeasurement,
    }

    #[async_trait]
    impl BandwidthProbe for ScriptedProbe {
        async fn probe(&self) -> Result<RawMeasurement> {
            Ok(self.measurement)
        }
    }

    struct StalledProbe;

    #[async_trait]
    impl BandwidthProbe for StalledProbe {
        async fn probe(&self) -> Result<RawMeasurement> {
            futures::future::pending().await
        }
    }

    fn measurement(down: f64, up: f64, latency: f64, loss: f64) -> RawMeasurement {
        RawMeasurement {
            download_mbps: down,
            upload_mbps: up,
            latency_ms: latency,
            packet_loss_pct: loss,
        }
    }

    #[test]
    fn policy_maps_thresholds_to_tiers() {
        assert_eq!(recommend(&measurement(10.0, 6.0, 40.0, 0.0)), QualityTier::Hd);
        assert_eq!(recommend(&measurement(10.0, 3.0, 40.0, 0.0)), QualityTier::High);
        assert_eq!(recommend(&measurement(1.5, 1.2, 40.0, 0.0)), QualityTier::Medium);
        assert_eq!(recommend(&measurement(0.7, 0.6, 40.0, 0.0)), QualityTier::Low);
    }

    #[test]
    fn weaker_direction_decides() {
        // Plenty of download, constrained upload.
        assert_eq!(recommend(&measurement(50.0, 1.1, 40.0, 0.0)), QualityTier::Medium);
    }

    #[test]
    fn latency_and_loss_override_throughput() {
        assert_eq!(recommend(&measurement(50.0, 50.0, 301.0, 0.0)), QualityTier::Low);
        assert_eq!(recommend(&measurement(50.0, 50.0, 40.0, 5.1)), QualityTier::Low);
    }

    #[tokio::test]
    async fn repeated_poor_samples_converge_to_low() {
        let monitor = BandwidthMonitor::new(Arc::new(StalledProbe));
        assert_eq!(monitor.committed_tier().await, QualityTier::High);
        for _ in 0..5 {
            monitor.record(QualityTier::Low).await;
        }
        assert_eq!(monitor.committed_tier().await, QualityTier::Low);
    }

    #[tokio::test]
    async fn one_good_sample_does_not_flip_a_poor_committed_tier() {
        let monitor = BandwidthMonitor::new(Arc::new(StalledProbe));
        for _ in 0..9 {
            monitor.record(QualityTier::Low).await;
        }
        assert_eq!(monitor.committed_tier().await, QualityTier::Low);

        let after = monitor.record(QualityTier::Hd).await;
        assert_eq!(after, QualityTier::Low);
    }

    #[tokio::test]
    async fn adjacent_tier_drift_does_not_commit() {
        let monitor = BandwidthMonitor::new(Arc::new(StalledProbe));
        // Medium is one rung from the committed High: never enough distance.
        for _ in 0..10 {
            assert_eq!(monitor.record(QualityTier::Medium).await, QualityTier::High);
        }
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let monitor = BandwidthMonitor::new(Arc::new(StalledProbe));
        for _ in 0..10 {
            monitor.record(QualityTier::Low).await;
        }
        // Ten Hd samples fully displace the old window; the commitment
        // climbs to High (Hd itself stays within one rung of High).
        for _ in 0..10 {
            monitor.record(QualityTier::Hd).await;
        }
        assert_eq!(monitor.committed_tier().await, QualityTier::High);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_probe_times_out_to_fallback() {
        let monitor = BandwidthMonitor::new(Arc::new(StalledProbe));
        let sample = monitor.measure().await.unwrap();
        assert_eq!(sample.download_mbps, 1.0);
        assert_eq!(sample.upload_mbps, 0.5);
        assert_eq!(sample.latency_ms, 100.0);
        assert_eq!(sample.tier, QualityTier::Low);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_recommends_low_regardless_of_history() {
        let monitor = BandwidthMonitor::new(Arc::new(StalledProbe));
        for _ in 0..10 {
            monitor.record(QualityTier::High).await;
        }

        // The sample speaks for this measurement only; the smoothed tier
        // absorbs the one bad reading.
        let sample = monitor.measure().await.unwrap();
        assert_eq!(sample.tier, QualityTier::Low);
        assert_eq!(monitor.committed_tier().await, QualityTier::High);
    }

    #[tokio::test]
    async fn samples_carry_their_own_recommendation() {
        let probe = Arc::new(ScriptedProbe {
            measurement: measurement(20.0, 10.0, 30.0, 0.1),
        });
        let monitor = BandwidthMonitor::new(probe);
        // Each sample recommends Hd; the committed tier holds at High
        // because Hd is only one rung away.
        for _ in 0..10 {
            let sample = monitor.measure().await.unwrap();
            assert_eq!(sample.tier, QualityTier::Hd);
        }
        assert_eq!(monitor.committed_tier().await, QualityTier::High);
    }
}
