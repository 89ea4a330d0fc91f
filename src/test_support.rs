//! Fakes shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{EngineError, MediaError, SignalingError};
use crate::media::{LocalStream, LocalTrack, MediaPort, RemoteStream};
use crate::peer::engine::{EngineEvents, NegotiationEngine, PeerLink};
use crate::peer::types::{IceCandidate, RawStats, ServerConfig, SessionDescription};
use crate::signaling::{MessageType, PeerId, SignalMessage, SignalingPort};

/// Signaling port that records every message it is asked to send
pub struct RecordingSignaling {
    id: PeerId,
    open: AtomicBool,
    sent: Mutex<Vec<SignalMessage>>,
}

impl RecordingSignaling {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.into(),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn take(&self) -> Vec<SignalMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn sent_of(&self, kind: MessageType) -> Vec<SignalMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SignalingPort for RecordingSignaling {
    fn client_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError> {
        let (_tx, rx) = mpsc::unbounded_channel();
        self.set_open(true);
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.set_open(false);
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, message: SignalMessage) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.sent.lock().unwrap().push(message);
        true
    }
}

/// Media collaborator without real tracks
pub struct StaticMedia {
    has_stream: AtomicBool,
    can_acquire: bool,
    pub remote: Mutex<Option<RemoteStream>>,
}

impl StaticMedia {
    pub fn with_stream() -> Self {
        Self {
            has_stream: AtomicBool::new(true),
            can_acquire: true,
            remote: Mutex::new(None),
        }
    }

    pub fn without_stream(can_acquire: bool) -> Self {
        Self {
            has_stream: AtomicBool::new(false),
            can_acquire,
            remote: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MediaPort for StaticMedia {
    fn has_stream(&self) -> bool {
        self.has_stream.load(Ordering::SeqCst)
    }

    fn current_stream(&self) -> Option<LocalStream> {
        self.has_stream().then(|| LocalStream {
            id: "local".into(),
            tracks: Vec::new(),
        })
    }

    async fn acquire(&self) -> Result<LocalStream, MediaError> {
        if !self.can_acquire {
            return Err(MediaError::Unavailable("no capture device".into()));
        }
        self.has_stream.store(true, Ordering::SeqCst);
        Ok(LocalStream {
            id: "local".into(),
            tracks: Vec::new(),
        })
    }

    fn set_remote_stream(&self, stream: RemoteStream) {
        *self.remote.lock().unwrap() = Some(stream);
    }

    fn clear_remote_stream(&self) {
        *self.remote.lock().unwrap() = None;
    }
}

/// Engine whose links only record what they were asked to do.
/// Tests drive engine events by hand through the event channel.
#[derive(Default)]
pub struct ScriptedEngine {
    pub links: Mutex<Vec<Arc<ScriptedLink>>>,
    pub fail_offers: AtomicBool,
}

impl ScriptedEngine {
    pub fn link(&self, index: usize) -> Arc<ScriptedLink> {
        self.links.lock().unwrap()[index].clone()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

#[async_trait]
impl NegotiationEngine for ScriptedEngine {
    async fn create_peer(
        &self,
        peer: &PeerId,
        _ice_servers: &[ServerConfig],
        events: EngineEvents,
    ) -> Result<Arc<dyn PeerLink>, EngineError> {
        let link = Arc::new(ScriptedLink {
            peer: peer.clone(),
            generation: events.generation(),
            fail_offers: self.fail_offers.load(Ordering::SeqCst),
            ..Default::default()
        });
        self.links.lock().unwrap().push(link.clone());
        Ok(link as Arc<dyn PeerLink>)
    }
}

#[derive(Default)]
pub struct ScriptedLink {
    pub peer: PeerId,
    pub generation: u64,
    fail_offers: bool,
    pub offers: Mutex<Vec<bool>>,
    pub answers: AtomicUsize,
    pub remote: Mutex<Option<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub closes: AtomicUsize,
    pub stats: Mutex<RawStats>,
}

impl ScriptedLink {
    pub fn restart_offers(&self) -> usize {
        self.offers.lock().unwrap().iter().filter(|r| **r).count()
    }
}

#[async_trait]
impl PeerLink for ScriptedLink {
    async fn add_track(&self, _track: &LocalTrack) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError> {
        if self.fail_offers {
            return Err(EngineError::Other("offer refused".into()));
        }
        self.offers.lock().unwrap().push(ice_restart);
        Ok(SessionDescription::offer(format!("v=0 offer restart={ice_restart}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, _description: SessionDescription) -> Result<(), EngineError> {
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        *self.remote.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        if self.remote.lock().unwrap().is_none() {
            return Err(EngineError::Other("remote description not set".into()));
        }
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn stats(&self) -> RawStats {
        self.stats.lock().unwrap().clone()
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
