#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use peercall::error::{EngineError, MediaError, SignalingError};
use peercall::media::{LocalStream, LocalTrack, MediaKind, MediaPort, RemoteStream, RemoteTrack};
use peercall::peer::engine::{EngineEvent, EngineEvents, NegotiationEngine, PeerLink};
use peercall::peer::types::{
    ConnectionState, IceCandidate, MediaCounters, RawStats, ServerConfig, SessionDescription,
};
use peercall::signaling::relay::RelayEndpoint;
use peercall::signaling::{MessageType, PeerId, SignalMessage, SignalingPort};
use peercall::{CallConfig, CallEvent};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> CallConfig {
    let mut config = CallConfig::default();
    config.log.enabled = false;
    config.recovery_delay_ms = 50;
    config.stats_interval_ms = 100;
    config
}

/// Waits for the first event matching `pred`, skipping everything else.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<CallEvent>, mut pred: F) -> CallEvent
where
    F: FnMut(&CallEvent) -> bool,
{
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await;
    match found {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for event"),
    }
}

pub fn is_call_state(event: &CallEvent, state: peercall::CallState) -> bool {
    matches!(event, CallEvent::CallStateChanged { current, .. } if *current == state)
}

/// Counts the events matching `pred` that are already queued.
pub fn drain_count<F>(rx: &mut broadcast::Receiver<CallEvent>, mut pred: F) -> usize
where
    F: FnMut(&CallEvent) -> bool,
{
    let mut count = 0;
    loop {
        match rx.try_recv() {
            Ok(event) if pred(&event) => count += 1,
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return count,
        }
    }
}

/// Relay endpoint whose channel refuses one message type
pub struct RefusingSignaling {
    inner: RelayEndpoint,
    refused: MessageType,
}

impl RefusingSignaling {
    pub fn new(inner: RelayEndpoint, refused: MessageType) -> Arc<Self> {
        Arc::new(Self { inner, refused })
    }
}

#[async_trait]
impl SignalingPort for RefusingSignaling {
    fn client_id(&self) -> PeerId {
        self.inner.client_id()
    }

    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError> {
        self.inner.connect().await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn send(&self, message: SignalMessage) -> bool {
        message.kind != self.refused && self.inner.send(message)
    }
}

/// Media collaborator without capture devices
pub struct FakeMedia {
    has_stream: AtomicBool,
    can_acquire: bool,
    pub remote: Mutex<Option<RemoteStream>>,
}

impl FakeMedia {
    pub fn ready() -> Arc<Self> {
        Arc::new(Self {
            has_stream: AtomicBool::new(true),
            can_acquire: true,
            remote: Mutex::new(None),
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            has_stream: AtomicBool::new(false),
            can_acquire: false,
            remote: Mutex::new(None),
        })
    }

    pub fn remote_tracks(&self) -> usize {
        self.remote
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |stream| stream.tracks.len())
    }
}

#[async_trait]
impl MediaPort for FakeMedia {
    fn has_stream(&self) -> bool {
        self.has_stream.load(Ordering::SeqCst)
    }

    fn current_stream(&self) -> Option<LocalStream> {
        self.has_stream().then(LocalStream::default)
    }

    async fn acquire(&self) -> Result<LocalStream, MediaError> {
        if !self.can_acquire {
            return Err(MediaError::Unavailable("camera unplugged".into()));
        }
        self.has_stream.store(true, Ordering::SeqCst);
        Ok(LocalStream::default())
    }

    fn set_remote_stream(&self, stream: RemoteStream) {
        *self.remote.lock().unwrap() = Some(stream);
    }

    fn clear_remote_stream(&self) {
        *self.remote.lock().unwrap() = None;
    }
}

/// Engine whose links "connect" as soon as both descriptions are applied.
///
/// Each link gathers one host and one server-reflexive candidate when its
/// local description is set and reports an audio and a video track just
/// before its first connect.
#[derive(Default)]
pub struct LoopbackEngine {
    links: Mutex<Vec<Arc<LoopbackLink>>>,
}

impl LoopbackEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn latest(&self) -> Arc<LoopbackLink> {
        self.links
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no link created yet")
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

#[async_trait]
impl NegotiationEngine for LoopbackEngine {
    async fn create_peer(
        &self,
        peer: &PeerId,
        _ice_servers: &[ServerConfig],
        events: EngineEvents,
    ) -> Result<Arc<dyn PeerLink>, EngineError> {
        let link = Arc::new(LoopbackLink {
            peer: peer.clone(),
            events,
            state: Mutex::new(LinkState::default()),
        });
        self.links.lock().unwrap().push(link.clone());
        Ok(link as Arc<dyn PeerLink>)
    }
}

#[derive(Default)]
struct LinkState {
    local: bool,
    remote: bool,
    connected_once: bool,
    offers: Vec<bool>,
    candidates: usize,
    closed: bool,
}

pub struct LoopbackLink {
    pub peer: PeerId,
    events: EngineEvents,
    state: Mutex<LinkState>,
}

impl LoopbackLink {
    /// Simulates a network outage on this side.
    pub fn drop_network(&self, state: ConnectionState) {
        self.events.emit(EngineEvent::StateChanged(state));
    }

    pub fn restart_offers(&self) -> usize {
        self.state.lock().unwrap().offers.iter().filter(|r| **r).count()
    }

    pub fn remote_candidates(&self) -> usize {
        self.state.lock().unwrap().candidates
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn maybe_connect(&self, state: &mut LinkState) {
        if !(state.local && state.remote) {
            return;
        }
        if !state.connected_once {
            state.connected_once = true;
            for (kind, id) in [(MediaKind::Audio, "mic"), (MediaKind::Video, "cam")] {
                self.events.emit(EngineEvent::RemoteTrack(RemoteTrack {
                    kind,
                    id: format!("{}-{id}", self.peer),
                    stream_id: format!("{}-stream", self.peer),
                    handle: None,
                }));
            }
        }
        self.events
            .emit(EngineEvent::StateChanged(ConnectionState::Checking));
        self.events
            .emit(EngineEvent::StateChanged(ConnectionState::Connected));
    }
}

fn candidate(typ: &str) -> IceCandidate {
    let address = if typ == "host" { "192.168.1.20" } else { "203.0.113.7" };
    IceCandidate {
        candidate: format!("candidate:1 1 udp 2122260223 {address} 50000 typ {typ}"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn add_track(&self, _track: &LocalTrack) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError> {
        self.state.lock().unwrap().offers.push(ice_restart);
        Ok(SessionDescription::offer(format!("v=0 restart={ice_restart}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, _description: SessionDescription) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.local = true;
        self.events.emit(EngineEvent::LocalCandidate(candidate("host")));
        self.events.emit(EngineEvent::LocalCandidate(candidate("srflx")));
        self.events.emit(EngineEvent::GatheringComplete);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.remote = true;
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if !state.remote {
            return Err(EngineError::Other("remote description not set".into()));
        }
        state.candidates += 1;
        Ok(())
    }

    async fn stats(&self) -> RawStats {
        RawStats {
            audio: Some(MediaCounters {
                bytes_sent: 4_000,
                bytes_received: 4_000,
                packets_received: 100,
                packets_lost: 0,
            }),
            video: None,
            round_trip_time_ms: Some(40.0),
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.events
            .emit(EngineEvent::StateChanged(ConnectionState::Closed));
        Ok(())
    }
}
