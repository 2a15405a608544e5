use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Raw per-connection counters read from the engine.
#[derive(Debug, Clone, Copy)]
pub struct LinkStats {
    pub round_trip_time_ms: Option<f64>,
    pub packets_sent: u64,
    pub packets_lost: i64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sampled_at: Instant,
}

impl LinkStats {
    /// Fraction of packets lost since the connection opened, as a percentage.
    pub fn packet_loss_pct(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        (self.packets_lost.max(0) as f64 / self.packets_sent as f64) * 100.0
    }
}

/// Connection quality summary for one peer, surfaced by
/// `get_connection_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionQuality {
    pub round_trip_time: f64, // milliseconds
    pub jitter: f64,          // milliseconds
    pub packet_loss_rate: f64, // percentage (0-100)
    pub bitrate: f64,         // kbps
    pub quality_score: u8,    // 0-100
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self {
            round_trip_time: 0.0,
            jitter: 0.0,
            packet_loss_rate: 0.0,
            bitrate: 0.0,
            quality_score: 100,
        }
    }
}

impl ConnectionQuality {
    pub fn from_link(stats: &LinkStats, prev: Option<&LinkStats>) -> Self {
        let bitrate = match prev {
            Some(p) => {
                let elapsed = stats.sampled_at.duration_since(p.sampled_at).as_secs_f64();
                if elapsed > 0.0 {
                    (stats.bytes_sent.saturating_sub(p.bytes_sent) * 8) as f64 / elapsed / 1000.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        let mut quality = Self {
            round_trip_time: stats.round_trip_time_ms.unwrap_or(0.0),
            jitter: 0.0,
            packet_loss_rate: stats.packet_loss_pct(),
            bitrate,
            quality_score: 0,
        };
        quality.calculate_quality_score();
        quality
    }

    fn calculate_quality_score(&mut self) {
        let rtt_score = if self.round_trip_time < 150.0 {
            40
        } else if self.round_trip_time < 300.0 {
            30
        } else {
            20
        };

        let jitter_score = if self.jitter < 30.0 {
            20
        } else if self.jitter < 50.0 {
            15
        } else {
            10
        };

        let loss_score = if self.packet_loss_rate < 1.0 {
            40
        } else if self.packet_loss_rate < 3.0 {
            30
        } else if self.packet_loss_rate < 5.0 {
            20
        } else {
            10
        };

        self.quality_score = (rtt_score + jitter_score + loss_score) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(rtt: Option<f64>, sent: u64, lost: i64) -> LinkStats {
        LinkStats {
            round_trip_time_ms: rtt,
            packets_sent: sent,
            packets_lost: lost,
            bytes_sent: 0,
            bytes_received: 0,
            sampled_at: Instant::now(),
        }
    }

    #[test]
    fn clean_link_scores_full() {
        let q = ConnectionQuality::from_link(&stats(Some(40.0), 1000, 0), None);
        assert_eq!(q.quality_score, 100);
    }

    #[test]
    fn lossy_slow_link_scores_poorly() {
        let q = ConnectionQuality::from_link(&stats(Some(450.0), 1000, 80), None);
        assert_eq!(q.quality_score, 50);
        assert!(q.packet_loss_rate > 5.0);
    }

    #[test]
    fn loss_pct_handles_zero_sent() {
        assert_eq!(stats(None, 0, 5).packet_loss_pct(), 0.0);
    }
}
