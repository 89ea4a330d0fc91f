//! Events published to the owning application.
//!
//! Every component receives an [`EventBus`] at construction; any number of
//! observers subscribe to it and each gets its own copy of every event.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ErrorKind;
use crate::peer::ice::CandidateSummary;
use crate::peer::stats::StatsSample;
use crate::peer::types::ConnectionState;
use crate::quality::Quality;
use crate::session::{CallState, FailureReason};
use crate::signaling::PeerId;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CallEvent {
    /// Call-level state moved
    CallStateChanged {
        previous: CallState,
        current: CallState,
        peer: Option<PeerId>,
    },
    /// A peer is inviting us; answer with accept or reject
    IncomingCall { from: PeerId },
    /// A call attempt or active call ended for a user-facing reason
    CallFailed { peer: PeerId, reason: FailureReason },
    /// The peer withdrew its invitation
    CallCancelled { peer: PeerId },
    /// The peer hung up
    RemoteHangup { peer: PeerId },
    ConnectionStateChanged {
        peer: PeerId,
        state: ConnectionState,
    },
    /// Fires once per connection lifetime
    ConnectionEstablished { peer: PeerId },
    /// Connectivity came back after a transient outage
    ConnectionRecovered { peer: PeerId },
    /// Automatic recovery did not bring the connection back
    ConnectionLost { peer: PeerId },
    /// Gathering finished without any server-reflexive or relay candidate
    IceHealthWarning {
        peer: PeerId,
        summary: CandidateSummary,
    },
    Stats {
        peer: PeerId,
        sample: StatsSample,
        quality: Quality,
    },
    PresenceUpdated { clients: Vec<PeerId> },
    Error { kind: ErrorKind, message: String },
}

/// Fan-out of [`CallEvent`]s to every subscriber
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish(&self, event: CallEvent) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            debug!(?event, "no subscribers for call event");
        }
    }

    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) {
        self.publish(CallEvent::Error {
            kind,
            message: message.into(),
        });
    }
}
