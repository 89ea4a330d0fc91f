use tracing::{debug, info};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::config::LogConfig;
use crate::peer::types::IceCandidate;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Installs the global subscriber. `RUST_LOG` wins over the configured filter.
///
/// Returns `false` when logging is disabled or a subscriber is already set.
pub fn init_logging(config: &LogConfig) -> bool {
    if !config.enabled {
        return false;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_owned()))
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Trickle-ICE candidate as it goes out or comes in
pub fn dump_candidate(label: &str, candidate: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        candidate.candidate,
        candidate.sdp_mid,
        candidate.sdp_mline_index,
        candidate.username_fragment
    );
}

/// Quick getStats snapshot of the nominated pair
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_logging_installs_nothing() {
        let config = LogConfig {
            enabled: false,
            ..LogConfig::default()
        };
        assert!(!init_logging(&config));
    }

    #[test]
    fn second_init_is_harmless() {
        let config = LogConfig {
            enabled: true,
            ..LogConfig::default()
        };
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
