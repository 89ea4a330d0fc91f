//! Connection quality label derived from one statistics sample.

use std::fmt;

use serde::Serialize;

use crate::peer::stats::StatsSample;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Quality {
    Excellent,
    Good,
    Fair,
    Poor,
    VeryPoor,
    Unknown,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::VeryPoor => "very-poor",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Factors the scorer looks at; absent factors do not count
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityInputs {
    pub packet_loss_percent: Option<f64>,
    pub latency_ms: Option<f64>,
    pub video_bitrate_bps: Option<f64>,
}

impl From<&StatsSample> for QualityInputs {
    fn from(sample: &StatsSample) -> Self {
        Self {
            packet_loss_percent: sample.packet_loss_percent,
            latency_ms: sample.latency_ms,
            video_bitrate_bps: sample.video_bitrate_bps,
        }
    }
}

// Sub-score ladders. Packet loss is worth up to 40, latency and bitrate 30.

fn loss_points(percent: f64) -> f64 {
    match percent {
        p if p < 1.0 => 40.0,
        p if p < 3.0 => 30.0,
        p if p < 5.0 => 20.0,
        p if p < 10.0 => 10.0,
        _ => 0.0,
    }
}

fn latency_points(ms: f64) -> f64 {
    match ms {
        l if l < 50.0 => 30.0,
        l if l < 100.0 => 25.0,
        l if l < 200.0 => 20.0,
        l if l < 300.0 => 15.0,
        l if l < 500.0 => 10.0,
        _ => 0.0,
    }
}

fn bitrate_points(bps: f64) -> f64 {
    match bps {
        b if b > 1_000_000.0 => 30.0,
        b if b > 500_000.0 => 25.0,
        b if b > 200_000.0 => 20.0,
        b if b > 100_000.0 => 15.0,
        b if b > 50_000.0 => 10.0,
        _ => 0.0,
    }
}

/// Averages the sub-scores of the present factors and maps the result onto a label.
pub fn score(inputs: &QualityInputs) -> Quality {
    let points: Vec<f64> = [
        inputs.packet_loss_percent.map(loss_points),
        inputs.latency_ms.map(latency_points),
        inputs.video_bitrate_bps.map(bitrate_points),
    ]
    .into_iter()
    .flatten()
    .collect();

    if points.is_empty() {
        return Quality::Unknown;
    }

    let average = points.iter().sum::<f64>() / points.len() as f64;
    match average {
        a if a >= 25.0 => Quality::Excellent,
        a if a >= 20.0 => Quality::Good,
        a if a >= 15.0 => Quality::Fair,
        a if a >= 10.0 => Quality::Poor,
        _ => Quality::VeryPoor,
    }
}
