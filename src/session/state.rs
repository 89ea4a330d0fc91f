use std::fmt;

use serde::Serialize;

use crate::signaling::PeerId;

/// Call-level lifecycle
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    #[default]
    Idle,
    /// Invite sent, waiting for the response
    Calling,
    /// Invite received, waiting for the local user (or for the offer once accepted)
    Receiving,
    /// Accepted by the peer, negotiation running
    Connecting,
    Connected,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Receiving => "receiving",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Why a call ended without the user asking for it
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    Timeout,
    Busy,
    Rejected,
    MediaUnavailable,
    SendFailed,
    PeerOffline,
    ConnectionFailed,
}

impl FailureReason {
    /// Reason string put on the wire when we end the call ourselves
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::Rejected => "rejected",
            Self::MediaUnavailable => "media-unavailable",
            Self::SendFailed => "send-failed",
            Self::PeerOffline => "peer-offline",
            Self::ConnectionFailed => "connection-failed",
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub local_id: PeerId,
    pub peer: Option<PeerId>,
    pub state: CallState,
    pub in_call: bool,
    /// The local user accepted an incoming call that is not connected yet
    pub accepted: bool,
}
