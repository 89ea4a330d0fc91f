//! Seam between the connection manager and the offer/answer/ICE primitive.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::EngineError;
use crate::media::{LocalTrack, RemoteTrack};
use crate::peer::types::{ConnectionState, IceCandidate, RawStats, ServerConfig, SessionDescription};
use crate::signaling::PeerId;

/// Something the negotiation object reported on its own
#[derive(Debug, Clone)]
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    /// End of candidates
    GatheringComplete,
    StateChanged(ConnectionState),
    RemoteTrack(RemoteTrack),
}

/// Sink handed to an engine for one connection object.
///
/// Every event is tagged with the generation of the object that produced it,
/// so the owner can drop events from an object it already replaced.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, EngineEvent)>,
}

impl EngineEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, EngineEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send((self.generation, event)).is_err() {
            trace!(generation = self.generation, "engine event after owner stopped");
        }
    }
}

/// Factory for connection objects
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn create_peer(
        &self,
        peer: &PeerId,
        ice_servers: &[ServerConfig],
        events: EngineEvents,
    ) -> Result<Arc<dyn PeerLink>, EngineError>;
}

/// One connection object. Each primitive may fail on its own.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), EngineError>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn stats(&self) -> RawStats;

    async fn close(&self) -> Result<(), EngineError>;
}
