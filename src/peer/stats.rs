use serde::Serialize;
use tokio::time::Instant;

use crate::peer::types::{MediaCounters, RawStats};

/// Numbers derived from one statistics poll
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSample {
    pub audio_bitrate_bps: Option<f64>,
    pub video_bitrate_bps: Option<f64>,
    pub packet_loss_percent: Option<f64>,
    pub latency_ms: Option<f64>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl StatsSample {
    pub fn has_inbound_media(&self) -> bool {
        self.bytes_received > 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Previous {
    at: Instant,
    audio_bytes: Option<u64>,
    video_bytes: Option<u64>,
}

/// Keeps the previous poll only; bitrate is the delta against it.
#[derive(Debug, Default)]
pub struct StatsTracker {
    previous: Option<Previous>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, raw: &RawStats) -> StatsSample {
        self.sample_at(raw, Instant::now())
    }

    pub fn sample_at(&mut self, raw: &RawStats, now: Instant) -> StatsSample {
        let audio_bytes = raw.audio.map(|c| c.bytes_received);
        let video_bytes = raw.video.map(|c| c.bytes_received);

        let (audio_bitrate_bps, video_bitrate_bps) = match self.previous {
            Some(prev) => {
                let secs = now.saturating_duration_since(prev.at).as_secs_f64();
                (
                    bitrate(prev.audio_bytes, audio_bytes, secs),
                    bitrate(prev.video_bytes, video_bytes, secs),
                )
            }
            None => (None, None),
        };

        self.previous = Some(Previous {
            at: now,
            audio_bytes,
            video_bytes,
        });

        let kinds: Vec<MediaCounters> = raw.audio.into_iter().chain(raw.video).collect();
        StatsSample {
            audio_bitrate_bps,
            video_bitrate_bps,
            packet_loss_percent: packet_loss(&kinds),
            latency_ms: raw.round_trip_time_ms,
            bytes_received: kinds.iter().map(|c| c.bytes_received).sum(),
            bytes_sent: kinds.iter().map(|c| c.bytes_sent).sum(),
        }
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

fn bitrate(previous: Option<u64>, current: Option<u64>, secs: f64) -> Option<f64> {
    let (previous, current) = (previous?, current?);
    if secs <= 0.0 {
        return Some(0.0);
    }
    Some(8.0 * current.saturating_sub(previous) as f64 / secs)
}

fn packet_loss(kinds: &[MediaCounters]) -> Option<f64> {
    if kinds.is_empty() {
        return None;
    }
    let lost: u64 = kinds.iter().map(|c| c.packets_lost).sum();
    let received: u64 = kinds.iter().map(|c| c.packets_received).sum();
    if received == 0 {
        return Some(0.0);
    }
    Some(lost as f64 / (lost + received) as f64 * 100.0)
}
