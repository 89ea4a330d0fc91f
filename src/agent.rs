//! The single control path of one call session.
//!
//! [`CallAgent`] owns the call session and the connection manager and takes
//! one input at a time from a `select!` loop: user commands, inbound
//! signaling, engine events and timer firings. An input is fully processed,
//! awaited negotiation steps included, before the next one is looked at.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CallConfig;
use crate::error::{CallError, CallResult, ConnectionError, ErrorKind};
use crate::events::{CallEvent, EventBus};
use crate::logger::init_logging;
use crate::media::MediaPort;
use crate::peer::connection::{
    ConnectionCommand, ConnectionInfo, ConnectionManager, ConnectionNotice,
};
use crate::peer::engine::{EngineEvent, NegotiationEngine};
use crate::session::{CallSession, FailureReason, SessionSnapshot};
use crate::signaling::{
    ClientListPayload, Dispatcher, MessageType, PeerId, RegisteredPayload, SignalMessage,
    SignalingPort,
};
use crate::timer::{Scheduler, TimerEvent, TimerKind};

/// Combined view of the call and its connection
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AgentSnapshot {
    pub session: SessionSnapshot,
    pub connection: ConnectionInfo,
}

enum Command {
    Call {
        peer: PeerId,
        reply: oneshot::Sender<CallResult<()>>,
    },
    Cancel {
        reply: oneshot::Sender<CallResult<()>>,
    },
    Accept {
        reply: oneshot::Sender<CallResult<()>>,
    },
    Reject {
        reply: oneshot::Sender<CallResult<()>>,
    },
    EndCall {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<AgentSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Where an inbound message goes
enum Route {
    Session(SignalMessage),
    Registered(SignalMessage),
    Presence(SignalMessage),
}

fn routes() -> Dispatcher<Route> {
    let mut dispatcher = Dispatcher::new();
    for kind in [
        MessageType::CallRequest,
        MessageType::CallResponse,
        MessageType::CallCancel,
        MessageType::CallEnd,
        MessageType::Offer,
        MessageType::Answer,
        MessageType::IceCandidate,
        MessageType::UserOffline,
    ] {
        dispatcher.register(kind, Route::Session);
    }
    dispatcher.register(MessageType::Registered, Route::Registered);
    dispatcher.register(MessageType::ClientList, Route::Presence);
    dispatcher
}

pub struct CallAgent {
    local_id: PeerId,
    session: CallSession,
    connection: ConnectionManager,
    signaling: Arc<dyn SignalingPort>,
    media: Arc<dyn MediaPort>,
    events: EventBus,
    dispatcher: Dispatcher<Route>,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedReceiver<SignalMessage>,
    inbound_open: bool,
    engine_events: mpsc::UnboundedReceiver<(u64, EngineEvent)>,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
}

impl CallAgent {
    /// Connects the signaling port and spawns the agent loop.
    ///
    /// `events` is injected so observers can subscribe before the first
    /// message arrives.
    pub async fn start(
        config: CallConfig,
        signaling: Arc<dyn SignalingPort>,
        media: Arc<dyn MediaPort>,
        engine: Arc<dyn NegotiationEngine>,
        events: EventBus,
    ) -> CallResult<AgentHandle> {
        config.validate()?;
        init_logging(&config.log);

        let inbound = signaling.connect().await?;
        let local_id = signaling.client_id();
        info!(client = %local_id, "call agent starting");

        let (scheduler, timers) = Scheduler::channel();
        let (engine_tx, engine_events) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();

        let session = CallSession::new(
            signaling.clone(),
            media.clone(),
            events.clone(),
            scheduler.clone(),
            config.invite_timeout(),
        );
        let connection = ConnectionManager::new(
            engine,
            signaling.clone(),
            media.clone(),
            events.clone(),
            scheduler,
            engine_tx,
            config,
        );

        let agent = CallAgent {
            local_id: local_id.clone(),
            session,
            connection,
            signaling,
            media,
            events: events.clone(),
            dispatcher: routes(),
            commands,
            inbound,
            inbound_open: true,
            engine_events,
            timers,
        };
        let task = tokio::spawn(agent.run());

        Ok(AgentHandle {
            local_id,
            commands: command_tx,
            events,
            task: Arc::new(task),
        })
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command).await {
                            return;
                        }
                    }
                    None => {
                        debug!("all handles dropped");
                        self.shutdown().await;
                        return;
                    }
                },
                message = self.inbound.recv(), if self.inbound_open => match message {
                    Some(message) => self.on_signal(message).await,
                    None => {
                        warn!("signaling channel closed");
                        self.inbound_open = false;
                        self.events.error(ErrorKind::Signaling, "signaling channel closed");
                    }
                },
                Some((generation, event)) = self.engine_events.recv() => {
                    let notice = self.connection.on_engine_event(generation, event).await;
                    self.on_notice(notice);
                }
                Some(timer) = self.timers.recv() => self.on_timer(timer).await,
            }
        }
    }

    /// Returns `false` once the agent has shut down.
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Call { peer, reply } => {
                let result = self.call(&peer).await;
                let _ = reply.send(result);
            }
            Command::Cancel { reply } => {
                let _ = reply.send(self.session.cancel());
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.session.accept().await);
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.session.reject());
            }
            Command::EndCall { reply } => {
                self.session.end_call();
                self.connection.close().await;
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(AgentSnapshot {
                    session: self.session.snapshot(),
                    connection: self.connection.info(),
                });
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn call(&mut self, peer: &str) -> CallResult<()> {
        if !self.session.is_in_call() && !self.media.has_stream() {
            if let Err(e) = self.media.acquire().await {
                warn!(error = %e, "cannot start a call without local media");
                self.events.error(ErrorKind::Media, e.to_string());
                return Err(CallError::MediaUnavailable);
            }
        }
        self.session.initiate(peer)
    }

    async fn on_signal(&mut self, message: SignalMessage) {
        if message.to.as_deref().is_some_and(|to| to != self.local_id) {
            debug!(kind = %message.kind, to = ?message.to, "message for another client dropped");
            return;
        }
        match self.dispatcher.dispatch(message) {
            Some(Route::Session(message)) => {
                let command = self.session.handle_message(message);
                self.apply(command).await;
            }
            Some(Route::Registered(message)) => self.on_registered(&message),
            Some(Route::Presence(message)) => self.on_client_list(&message),
            None => {}
        }
    }

    async fn apply(&mut self, command: Option<ConnectionCommand>) {
        match command {
            None => {}
            Some(ConnectionCommand::StartAsOfferer(peer)) => self.start_connection(&peer).await,
            Some(ConnectionCommand::Close) => self.connection.close().await,
            Some(ConnectionCommand::Deliver(message)) => {
                let kind = message.kind;
                let Err(e) = self.connection.handle_message(message).await else {
                    return;
                };
                match fatal_reason(kind, &e) {
                    Some(reason) => {
                        if self.session.abort(reason).is_some() {
                            self.connection.close().await;
                        }
                    }
                    None => debug!(%kind, error = %e, "negotiation message not applied"),
                }
            }
        }
    }

    async fn start_connection(&mut self, peer: &str) {
        if !self.media.has_stream() {
            if let Err(e) = self.media.acquire().await {
                warn!(peer, error = %e, "local media lost before offer");
                self.events.error(ErrorKind::Media, e.to_string());
                if self.session.abort(FailureReason::MediaUnavailable).is_some() {
                    self.connection.close().await;
                }
                return;
            }
        }
        if self.connection.start_as_offerer(peer).await.is_err()
            && self.session.abort(FailureReason::ConnectionFailed).is_some()
        {
            self.connection.close().await;
        }
    }

    fn on_notice(&mut self, notice: Option<ConnectionNotice>) {
        match notice {
            Some(ConnectionNotice::Established(peer)) => {
                if self.session.peer() == Some(peer.as_str()) {
                    self.session.on_connection_established();
                }
            }
            Some(ConnectionNotice::Lost(peer)) => {
                warn!(peer = %peer, "connection lost, waiting for the user to end the call");
            }
            None => {}
        }
    }

    async fn on_timer(&mut self, timer: TimerEvent) {
        match timer.kind {
            TimerKind::InviteTimeout => {
                self.session.on_invite_timeout(&timer);
            }
            TimerKind::RecoveryCheck => {
                let notice = self.connection.on_recovery_check(&timer).await;
                self.on_notice(notice);
            }
            TimerKind::StatsTick => self.connection.on_stats_tick(&timer).await,
        }
    }

    fn on_registered(&mut self, message: &SignalMessage) {
        match message.payload_as::<RegisteredPayload>() {
            Ok(registered) if !registered.ice_servers.is_empty() => {
                self.connection.set_ice_servers(registered.ice_servers);
            }
            Ok(_) => debug!("registered without ICE servers, keeping configured ones"),
            Err(e) => warn!(error = %e, "malformed registered message"),
        }
    }

    fn on_client_list(&self, message: &SignalMessage) {
        match message.payload_as::<ClientListPayload>() {
            Ok(list) => {
                let clients = list
                    .clients
                    .into_iter()
                    .map(|c| c.id)
                    .filter(|id| *id != self.local_id)
                    .collect();
                self.events.publish(CallEvent::PresenceUpdated { clients });
            }
            Err(e) => warn!(error = %e, "malformed client-list message"),
        }
    }

    async fn shutdown(&mut self) {
        info!(client = %self.local_id, "call agent stopping");
        self.session.end_call();
        self.connection.close().await;
        self.signaling.disconnect().await;
    }
}

/// Cloneable front door to a running [`CallAgent`]
#[derive(Clone)]
pub struct AgentHandle {
    local_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus,
    task: Arc<JoinHandle<()>>,
}

impl AgentHandle {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn call(&self, peer: impl Into<PeerId>) -> CallResult<()> {
        let peer = peer.into();
        self.request(|reply| Command::Call { peer, reply }).await?
    }

    pub async fn cancel(&self) -> CallResult<()> {
        self.request(|reply| Command::Cancel { reply }).await?
    }

    pub async fn accept(&self) -> CallResult<()> {
        self.request(|reply| Command::Accept { reply }).await?
    }

    pub async fn reject(&self) -> CallResult<()> {
        self.request(|reply| Command::Reject { reply }).await?
    }

    /// Hangs up whatever is going on. Safe to call in any state.
    pub async fn end_call(&self) -> CallResult<()> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    pub async fn snapshot(&self) -> CallResult<AgentSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) -> CallResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> CallResult<T> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(command(reply)).is_err() {
            error!("call agent is gone");
            return Err(CallError::AgentStopped);
        }
        rx.await.map_err(|_| CallError::AgentStopped)
    }
}

/// Negotiation failures that leave the call unusable. Rejected answers and
/// candidates are reported but the call carries on.
fn fatal_reason(kind: MessageType, error: &ConnectionError) -> Option<FailureReason> {
    match (kind, error) {
        (_, ConnectionError::SendFailed(_)) => Some(FailureReason::SendFailed),
        (MessageType::Offer, ConnectionError::Engine { .. }) => {
            Some(FailureReason::ConnectionFailed)
        }
        _ => None,
    }
}
