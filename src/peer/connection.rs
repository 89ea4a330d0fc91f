//! Offer/answer/ICE lifecycle of the single peer connection.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::CallConfig;
use crate::error::{ConnectionError, ConnectionResult, ErrorKind, ADD_ICE_CANDIDATE};
use crate::events::{CallEvent, EventBus};
use crate::logger::dump_candidate;
use crate::media::{MediaPort, RemoteStream};
use crate::peer::engine::{EngineEvent, EngineEvents, NegotiationEngine, PeerLink};
use crate::peer::ice::{analyze_candidates, CandidateBuffer, CandidateSummary};
use crate::peer::stats::StatsTracker;
use crate::peer::types::{CandidateType, ConnectionState, IceCandidate, ServerConfig};
use crate::quality::{score, QualityInputs};
use crate::signaling::{
    AnswerPayload, IceCandidatePayload, MessageType, OfferPayload, PeerId, SignalMessage,
    SignalingPort,
};
use crate::timer::{ScheduledTask, Scheduler, TimerEvent, TimerKind};

/// After an ICE restart, how many recovery delays to wait before giving up
const RESTART_VERIFY_FACTOR: u32 = 3;

/// What the call session asks of the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionCommand {
    StartAsOfferer(PeerId),
    Close,
    /// Negotiation message from the bound peer
    Deliver(SignalMessage),
}

/// What the connection manager reports back to the call session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotice {
    Established(PeerId),
    Lost(PeerId),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub peer: Option<PeerId>,
    pub state: ConnectionState,
    pub established: bool,
    pub generation: u64,
    pub local_candidates: CandidateSummary,
    pub remote_tracks: usize,
}

/// Owns one negotiation object at a time and everything derived from it:
/// timers, statistics history, early candidates and the remote stream.
pub struct ConnectionManager {
    local_id: PeerId,
    engine: Arc<dyn NegotiationEngine>,
    signaling: Arc<dyn SignalingPort>,
    media: Arc<dyn MediaPort>,
    events: EventBus,
    scheduler: Scheduler,
    engine_tx: mpsc::UnboundedSender<(u64, EngineEvent)>,
    config: CallConfig,

    link: Option<Arc<dyn PeerLink>>,
    generation: u64,
    peer: Option<PeerId>,
    state: ConnectionState,
    is_offerer: bool,
    established: bool,
    remote_description_set: bool,
    offer_in_flight: bool,
    restart_pending: bool,
    restart_attempted: bool,
    gave_up: bool,
    recovery_timer: Option<ScheduledTask>,
    stats_timer: Option<ScheduledTask>,
    stats: StatsTracker,
    early_candidates: CandidateBuffer,
    local_candidates: Vec<CandidateType>,
    remote_stream: RemoteStream,
}

impl ConnectionManager {
    pub fn new(
        engine: Arc<dyn NegotiationEngine>,
        signaling: Arc<dyn SignalingPort>,
        media: Arc<dyn MediaPort>,
        events: EventBus,
        scheduler: Scheduler,
        engine_tx: mpsc::UnboundedSender<(u64, EngineEvent)>,
        config: CallConfig,
    ) -> Self {
        let early_candidates =
            CandidateBuffer::new(config.buffer_early_candidates, config.early_candidate_limit);
        Self {
            local_id: signaling.client_id(),
            engine,
            signaling,
            media,
            events,
            scheduler,
            engine_tx,
            config,
            link: None,
            generation: 0,
            peer: None,
            state: ConnectionState::New,
            is_offerer: false,
            established: false,
            remote_description_set: false,
            offer_in_flight: false,
            restart_pending: false,
            restart_attempted: false,
            gave_up: false,
            recovery_timer: None,
            stats_timer: None,
            stats: StatsTracker::new(),
            early_candidates,
            local_candidates: Vec::new(),
            remote_stream: RemoteStream::default(),
        }
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn has_connection(&self) -> bool {
        self.link.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer: self.peer.clone(),
            state: self.state,
            established: self.established,
            generation: self.generation,
            local_candidates: CandidateSummary::from_types(&self.local_candidates),
            remote_tracks: self.remote_stream.tracks.len(),
        }
    }

    /// ICE servers for connection objects created from now on.
    pub fn set_ice_servers(&mut self, servers: Vec<ServerConfig>) {
        info!(count = servers.len(), "ICE servers updated");
        self.config.ice_servers = servers;
    }

    pub async fn start_as_offerer(&mut self, peer: &str) -> ConnectionResult<()> {
        let result = self.try_start_as_offerer(peer).await;
        self.report_failure(&result);
        result
    }

    async fn try_start_as_offerer(&mut self, peer: &str) -> ConnectionResult<()> {
        if !self.media.has_stream() {
            return Err(ConnectionError::MediaUnavailable);
        }
        info!(peer, "starting as offerer");
        self.ensure_link(peer).await?;
        self.is_offerer = true;
        self.send_offer(false).await
    }

    /// Routes a negotiation message. Failures are reported, never fatal.
    pub async fn handle_message(&mut self, message: SignalMessage) -> ConnectionResult<()> {
        let result = match message.kind {
            MessageType::Offer => self.handle_offer(&message).await,
            MessageType::Answer => self.handle_answer(&message).await,
            MessageType::IceCandidate => self.handle_ice_candidate(&message).await,
            kind => {
                debug!(%kind, "not a negotiation message");
                Ok(())
            }
        };
        self.report_failure(&result);
        result
    }

    async fn handle_offer(&mut self, message: &SignalMessage) -> ConnectionResult<()> {
        let Some(from) = message.from.clone() else {
            warn!("offer without sender dropped");
            return Ok(());
        };
        let offer: OfferPayload = message.payload_as()?;

        if self.offer_in_flight {
            warn!(peer = %from, "offer collision, dropping our pending offer");
            self.offer_in_flight = false;
            self.restart_pending = false;
        }

        let reuse = self.link.is_some() && self.peer.as_deref() == Some(from.as_str());
        if !reuse {
            self.ensure_link(&from).await?;
            self.is_offerer = false;
        }
        let link = self.current_link()?;

        if offer.ice_restart {
            info!(peer = %from, "answering ICE restart");
        } else {
            info!(peer = %from, "answering offer");
        }

        link.set_remote_description(offer.sdp)
            .await
            .map_err(|e| ConnectionError::engine("set remote description", e))?;
        self.remote_description_set = true;
        self.flush_early_candidates(&link, &from).await;

        let answer = link
            .create_answer()
            .await
            .map_err(|e| ConnectionError::engine("create answer", e))?;
        link.set_local_description(answer.clone())
            .await
            .map_err(|e| ConnectionError::engine("set local description", e))?;

        if !self
            .signaling
            .send(SignalMessage::answer(&self.local_id, &from, answer))
        {
            return Err(ConnectionError::SendFailed(MessageType::Answer));
        }
        Ok(())
    }

    async fn handle_answer(&mut self, message: &SignalMessage) -> ConnectionResult<()> {
        let link = self.current_link()?;
        let Some(peer) = self.bound_sender(message) else {
            return Ok(());
        };
        let answer: AnswerPayload = message.payload_as()?;

        debug!(peer = %peer, "applying answer");
        link.set_remote_description(answer.sdp)
            .await
            .map_err(|e| ConnectionError::engine("set remote description", e))?;
        self.offer_in_flight = false;
        self.remote_description_set = true;
        self.flush_early_candidates(&link, &peer).await;

        if self.restart_pending {
            self.restart_pending = false;
            info!(peer = %peer, "running deferred ICE restart");
            self.send_offer(true).await?;
        }
        Ok(())
    }

    async fn handle_ice_candidate(&mut self, message: &SignalMessage) -> ConnectionResult<()> {
        let Some(from) = message.from.clone() else {
            warn!("candidate without sender dropped");
            return Ok(());
        };
        let payload: IceCandidatePayload = message.payload_as()?;
        dump_candidate("REMOTE", &payload.candidate);

        let ready = self.link.is_some()
            && self.peer.as_deref() == Some(from.as_str())
            && self.remote_description_set;
        if !ready {
            self.early_candidates.push(&from, payload.candidate);
            return Ok(());
        }

        let link = self.current_link()?;
        link.add_ice_candidate(payload.candidate)
            .await
            .map_err(|e| ConnectionError::engine(ADD_ICE_CANDIDATE, e))
    }

    /// Restarts ICE on the current connection. While an offer is still
    /// waiting for its answer, the restart is parked and runs afterwards.
    pub async fn ice_restart(&mut self) -> ConnectionResult<()> {
        let result = self.try_ice_restart().await;
        self.report_failure(&result);
        result
    }

    async fn try_ice_restart(&mut self) -> ConnectionResult<()> {
        self.current_link()?;
        if self.offer_in_flight {
            info!(peer = ?self.peer, "offer in flight, ICE restart deferred");
            self.restart_pending = true;
            return Ok(());
        }
        info!(peer = ?self.peer, "restarting ICE");
        self.local_candidates.clear();
        self.send_offer(true).await
    }

    /// Tears down the connection object and everything attached to it.
    /// Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.recovery_timer = None;
        self.stats_timer = None;
        self.early_candidates.clear();

        let Some(link) = self.link.take() else {
            self.peer = None;
            return;
        };

        info!(peer = ?self.peer, generation = self.generation, "closing connection");
        // events still queued from this object are now stale
        self.generation += 1;
        if let Err(e) = link.close().await {
            warn!(error = %e, "error while closing connection");
        }
        if !self.remote_stream.tracks.is_empty() {
            self.media.clear_remote_stream();
        }
        self.reset_connection_state();
        self.peer = None;
        self.state = ConnectionState::Closed;
    }

    /// Applies one event from the negotiation engine.
    pub async fn on_engine_event(
        &mut self,
        generation: u64,
        event: EngineEvent,
    ) -> Option<ConnectionNotice> {
        if generation != self.generation || self.link.is_none() {
            trace!(generation, current = self.generation, "stale engine event dropped");
            return None;
        }
        let peer = self.peer.clone()?;

        match event {
            EngineEvent::LocalCandidate(candidate) => {
                self.send_local_candidate(&peer, candidate);
                None
            }
            EngineEvent::GatheringComplete => {
                if let Some(summary) = analyze_candidates(&self.local_candidates) {
                    self.events
                        .publish(CallEvent::IceHealthWarning { peer, summary });
                }
                None
            }
            EngineEvent::RemoteTrack(track) => {
                info!(peer = %peer, kind = ?track.kind, id = %track.id, "remote track");
                self.remote_stream.upsert(track);
                self.media.set_remote_stream(self.remote_stream.clone());
                None
            }
            EngineEvent::StateChanged(state) => self.on_state_change(peer, state).await,
        }
    }

    async fn on_state_change(
        &mut self,
        peer: PeerId,
        state: ConnectionState,
    ) -> Option<ConnectionNotice> {
        if state == self.state {
            return None;
        }
        let previous = std::mem::replace(&mut self.state, state);
        info!(peer = %peer, %previous, current = %state, "connection state changed");
        self.events.publish(CallEvent::ConnectionStateChanged {
            peer: peer.clone(),
            state,
        });

        match state {
            ConnectionState::Connected => {
                self.recovery_timer = None;
                self.restart_attempted = false;
                self.gave_up = false;
                if self.stats_timer.is_none() {
                    self.stats_timer = Some(
                        self.scheduler
                            .every(TimerKind::StatsTick, self.config.stats_interval()),
                    );
                }
                if !self.established {
                    self.established = true;
                    info!(peer = %peer, "connection established");
                    self.events
                        .publish(CallEvent::ConnectionEstablished { peer: peer.clone() });
                    Some(ConnectionNotice::Established(peer))
                } else {
                    info!(peer = %peer, "connection recovered");
                    self.events.publish(CallEvent::ConnectionRecovered { peer });
                    None
                }
            }
            ConnectionState::Disconnected => {
                if self.recovery_timer.is_none() {
                    debug!(peer = %peer, delay = ?self.config.recovery_delay(), "waiting before recovery");
                    self.recovery_timer = Some(
                        self.scheduler
                            .once(TimerKind::RecoveryCheck, self.config.recovery_delay()),
                    );
                }
                None
            }
            ConnectionState::Failed => {
                self.recovery_timer = None;
                self.recover(peer).await
            }
            ConnectionState::Closed => {
                self.recovery_timer = None;
                self.stats_timer = None;
                None
            }
            ConnectionState::New | ConnectionState::Checking => None,
        }
    }

    /// The delayed recovery check fired.
    pub async fn on_recovery_check(&mut self, event: &TimerEvent) -> Option<ConnectionNotice> {
        let live = self
            .recovery_timer
            .as_ref()
            .is_some_and(|timer| timer.matches(event));
        if !live {
            trace!(token = event.token, "stale recovery check ignored");
            return None;
        }
        self.recovery_timer = None;

        let peer = self.peer.clone()?;
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed => self.recover(peer).await,
            state => {
                debug!(peer = %peer, %state, "recovered before check");
                None
            }
        }
    }

    // One ICE restart per outage, then the connection is reported lost.
    // Either side restarts. If both offers cross, the collision rule in
    // handle_offer keeps the incoming one.
    async fn recover(&mut self, peer: PeerId) -> Option<ConnectionNotice> {
        if self.gave_up {
            return None;
        }
        if self.restart_attempted {
            warn!(peer = %peer, "ICE restart did not bring the connection back");
            self.gave_up = true;
            self.events
                .publish(CallEvent::ConnectionLost { peer: peer.clone() });
            return Some(ConnectionNotice::Lost(peer));
        }

        self.restart_attempted = true;
        info!(peer = %peer, offerer = self.is_offerer, "connection still down, restarting ICE");
        if self.ice_restart().await.is_err() {
            self.gave_up = true;
            self.events
                .publish(CallEvent::ConnectionLost { peer: peer.clone() });
            return Some(ConnectionNotice::Lost(peer));
        }
        self.recovery_timer = Some(self.scheduler.once(
            TimerKind::RecoveryCheck,
            self.config.recovery_delay() * RESTART_VERIFY_FACTOR,
        ));
        None
    }

    /// Periodic statistics poll while connected.
    pub async fn on_stats_tick(&mut self, event: &TimerEvent) {
        let live = self
            .stats_timer
            .as_ref()
            .is_some_and(|timer| timer.matches(event));
        if !live || self.state != ConnectionState::Connected {
            return;
        }
        let (Some(link), Some(peer)) = (self.link.clone(), self.peer.clone()) else {
            return;
        };

        let raw = link.stats().await;
        let sample = self.stats.sample(&raw);
        let quality = score(&QualityInputs::from(&sample));
        trace!(peer = %peer, ?sample, %quality, "stats sample");
        if !sample.has_inbound_media() {
            warn!(peer = %peer, "connected but no media received");
        }
        self.events.publish(CallEvent::Stats {
            peer,
            sample,
            quality,
        });
    }

    async fn ensure_link(&mut self, peer: &str) -> ConnectionResult<()> {
        if self.link.is_some() {
            if self.peer.as_deref() == Some(peer) {
                return Ok(());
            }
            info!(old = ?self.peer, new = peer, "peer changed, replacing connection");
            self.close().await;
        }

        self.generation += 1;
        let events = EngineEvents::new(self.generation, self.engine_tx.clone());
        let peer_id = peer.to_owned();
        let link = self
            .engine
            .create_peer(&peer_id, &self.config.ice_servers, events)
            .await
            .map_err(|e| ConnectionError::engine("create peer connection", e))?;

        match self.media.current_stream() {
            Some(stream) => {
                for track in &stream.tracks {
                    if let Err(e) = link.add_track(track).await {
                        let _ = link.close().await;
                        return Err(ConnectionError::engine("add track", e));
                    }
                }
                debug!(peer, tracks = stream.tracks.len(), "local tracks attached");
            }
            None => warn!(peer, "no local stream, connection will be receive-only"),
        }

        self.reset_connection_state();
        self.early_candidates.retain_peer(peer);
        self.link = Some(link);
        self.peer = Some(peer_id);
        self.state = ConnectionState::New;
        debug!(peer, generation = self.generation, "connection object created");
        Ok(())
    }

    async fn send_offer(&mut self, ice_restart: bool) -> ConnectionResult<()> {
        let link = self.current_link()?;
        let peer = self.peer.clone().ok_or(ConnectionError::NoConnection)?;

        let offer = link
            .create_offer(ice_restart)
            .await
            .map_err(|e| ConnectionError::engine("create offer", e))?;
        link.set_local_description(offer.clone())
            .await
            .map_err(|e| ConnectionError::engine("set local description", e))?;

        if !self
            .signaling
            .send(SignalMessage::offer(&self.local_id, &peer, offer, ice_restart))
        {
            return Err(ConnectionError::SendFailed(MessageType::Offer));
        }
        self.offer_in_flight = true;
        debug!(peer = %peer, ice_restart, "offer sent");
        Ok(())
    }

    async fn flush_early_candidates(&mut self, link: &Arc<dyn PeerLink>, peer: &str) {
        let queued = self.early_candidates.take(peer);
        if queued.is_empty() {
            return;
        }
        debug!(peer, count = queued.len(), "applying early candidates");
        for candidate in queued {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                let error = ConnectionError::engine(ADD_ICE_CANDIDATE, e);
                warn!(peer, %error, "early candidate rejected");
                self.events.error(error.kind(), error.to_string());
            }
        }
    }

    fn send_local_candidate(&mut self, peer: &str, candidate: IceCandidate) {
        dump_candidate("LOCAL", &candidate);
        self.local_candidates.push(candidate.candidate_type());
        if !self
            .signaling
            .send(SignalMessage::ice_candidate(&self.local_id, peer, candidate))
        {
            warn!(peer, "local candidate could not be sent");
            self.events
                .error(ErrorKind::Signaling, "failed to send ice-candidate message");
        }
    }

    fn current_link(&self) -> ConnectionResult<Arc<dyn PeerLink>> {
        self.link.clone().ok_or(ConnectionError::NoConnection)
    }

    fn bound_sender(&self, message: &SignalMessage) -> Option<PeerId> {
        match (&self.peer, message.from.as_ref()) {
            (Some(bound), Some(from)) if bound == from => Some(bound.clone()),
            (bound, from) => {
                warn!(?bound, ?from, kind = %message.kind, "message for another connection dropped");
                None
            }
        }
    }

    fn reset_connection_state(&mut self) {
        self.is_offerer = false;
        self.established = false;
        self.remote_description_set = false;
        self.offer_in_flight = false;
        self.restart_pending = false;
        self.restart_attempted = false;
        self.gave_up = false;
        self.recovery_timer = None;
        self.stats_timer = None;
        self.stats.reset();
        self.local_candidates.clear();
        self.remote_stream = RemoteStream::default();
    }

    fn report_failure(&self, result: &ConnectionResult<()>) {
        if let Err(error) = result {
            warn!(peer = ?self.peer, %error, "connection operation failed");
            self.events.error(error.kind(), error.to_string());
        }
    }
}
