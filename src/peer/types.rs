use serde::{Deserialize, Serialize};

/// Session description as carried in `offer` / `answer` payloads
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
}

/// ICE candidate for the WebRTC connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn candidate_type(&self) -> CandidateType {
        CandidateType::from_candidate_line(&self.candidate)
    }
}

/// Network path class of a candidate
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
    #[serde(other)]
    Unknown,
}

impl CandidateType {
    /// Reads the `typ` token of an SDP candidate attribute.
    pub fn from_candidate_line(line: &str) -> Self {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "typ" {
                return match tokens.next() {
                    Some("host") => Self::Host,
                    Some("srflx") => Self::Srflx,
                    Some("prflx") => Self::Prflx,
                    Some("relay") => Self::Relay,
                    _ => Self::Unknown,
                };
            }
        }
        Self::Unknown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Srflx => "srflx",
            Self::Prflx => "prflx",
            Self::Relay => "relay",
            Self::Unknown => "unknown",
        }
    }
}

/// Aggregate state of the negotiation object
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// ICE server configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IceServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Per-media-kind counters pulled from the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
}

/// One raw statistics snapshot, before any derivation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStats {
    pub audio: Option<MediaCounters>,
    pub video: Option<MediaCounters>,
    /// Current round-trip time of the selected candidate pair
    pub round_trip_time_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_type_is_read_from_typ_token() {
        let host = "candidate:1 1 udp 2130706431 192.168.1.4 54321 typ host";
        let srflx = "candidate:2 1 udp 1694498815 203.0.113.7 40000 typ srflx raddr 192.168.1.4 rport 54321";
        let relay = "candidate:3 1 udp 16777215 198.51.100.2 3478 typ relay raddr 0.0.0.0 rport 0";
        assert_eq!(CandidateType::from_candidate_line(host), CandidateType::Host);
        assert_eq!(CandidateType::from_candidate_line(srflx), CandidateType::Srflx);
        assert_eq!(CandidateType::from_candidate_line(relay), CandidateType::Relay);
        assert_eq!(CandidateType::from_candidate_line("garbage"), CandidateType::Unknown);
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }

    #[test]
    fn description_uses_type_key() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0"}));
    }
}
