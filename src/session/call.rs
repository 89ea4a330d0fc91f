use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::state::{CallState, FailureReason, SessionSnapshot};
use crate::error::{CallError, CallResult};
use crate::events::{CallEvent, EventBus};
use crate::media::MediaPort;
use crate::peer::connection::ConnectionCommand;
use crate::signaling::{
    CallResponsePayload, DeclineReason, MessageType, PeerId, SignalMessage, SignalingPort,
    UserOfflinePayload,
};
use crate::timer::{ScheduledTask, Scheduler, TimerEvent, TimerKind};

/// Call negotiation state machine for one local client.
///
/// The session never touches the peer connection. Whatever the connection
/// manager has to do is returned as a [`ConnectionCommand`].
pub struct CallSession {
    local_id: PeerId,
    state: CallState,
    peer: Option<PeerId>,
    accepted: bool,
    invite_timer: Option<ScheduledTask>,
    invite_timeout: Duration,
    signaling: Arc<dyn SignalingPort>,
    media: Arc<dyn MediaPort>,
    events: EventBus,
    scheduler: Scheduler,
}

impl CallSession {
    pub fn new(
        signaling: Arc<dyn SignalingPort>,
        media: Arc<dyn MediaPort>,
        events: EventBus,
        scheduler: Scheduler,
        invite_timeout: Duration,
    ) -> Self {
        Self {
            local_id: signaling.client_id(),
            state: CallState::Idle,
            peer: None,
            accepted: false,
            invite_timer: None,
            invite_timeout,
            signaling,
            media,
            events,
            scheduler,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn is_in_call(&self) -> bool {
        self.state != CallState::Idle
    }

    pub fn has_pending_invite_timer(&self) -> bool {
        self.invite_timer.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            local_id: self.local_id.clone(),
            peer: self.peer.clone(),
            state: self.state,
            in_call: self.is_in_call(),
            accepted: self.accepted,
        }
    }

    /// Invites `peer` and arms the invite timer.
    pub fn initiate(&mut self, peer: &str) -> CallResult<()> {
        if self.state != CallState::Idle {
            return Err(self.invalid("initiate"));
        }
        if peer == self.local_id {
            return Err(CallError::SelfCall);
        }
        if !self.media.has_stream() {
            return Err(CallError::MediaUnavailable);
        }

        info!(peer, "initiating call");
        self.peer = Some(peer.to_owned());
        self.transition(CallState::Calling);

        if !self
            .signaling
            .send(SignalMessage::call_request(&self.local_id, peer))
        {
            self.publish_failure(FailureReason::SendFailed);
            self.reset();
            return Err(CallError::SendFailed(MessageType::CallRequest));
        }

        self.invite_timer = Some(
            self.scheduler
                .once(TimerKind::InviteTimeout, self.invite_timeout),
        );
        Ok(())
    }

    /// Withdraws our own pending invite.
    pub fn cancel(&mut self) -> CallResult<()> {
        if self.state != CallState::Calling {
            return Err(self.invalid("cancel"));
        }
        let Some(peer) = self.peer.clone() else {
            return Err(self.invalid("cancel"));
        };

        info!(peer = %peer, "cancelling call");
        let sent = self
            .signaling
            .send(SignalMessage::call_cancel(&self.local_id, &peer, "cancelled"));
        self.reset();
        if !sent {
            return Err(CallError::SendFailed(MessageType::CallCancel));
        }
        Ok(())
    }

    /// Accepts the incoming call, acquiring local media first if needed.
    ///
    /// The session stays in `Receiving` until the connection is established.
    pub async fn accept(&mut self) -> CallResult<()> {
        if self.state != CallState::Receiving || self.accepted {
            return Err(self.invalid("accept"));
        }
        let Some(peer) = self.peer.clone() else {
            return Err(self.invalid("accept"));
        };

        if !self.media.has_stream() {
            if let Err(e) = self.media.acquire().await {
                warn!(peer = %peer, error = %e, "no local media, declining call");
                self.signaling.send(SignalMessage::call_response(
                    &self.local_id,
                    &peer,
                    false,
                    Some(DeclineReason::Rejected),
                ));
                self.publish_failure(FailureReason::MediaUnavailable);
                self.reset();
                return Err(CallError::MediaUnavailable);
            }
        }

        if !self.signaling.send(SignalMessage::call_response(
            &self.local_id,
            &peer,
            true,
            None,
        )) {
            self.publish_failure(FailureReason::SendFailed);
            self.reset();
            return Err(CallError::SendFailed(MessageType::CallResponse));
        }

        info!(peer = %peer, "call accepted, waiting for offer");
        self.accepted = true;
        Ok(())
    }

    pub fn reject(&mut self) -> CallResult<()> {
        if self.state != CallState::Receiving || self.accepted {
            return Err(self.invalid("reject"));
        }
        let Some(peer) = self.peer.clone() else {
            return Err(self.invalid("reject"));
        };

        info!(peer = %peer, "rejecting call");
        let sent = self.signaling.send(SignalMessage::call_response(
            &self.local_id,
            &peer,
            false,
            Some(DeclineReason::Rejected),
        ));
        self.reset();
        if !sent {
            return Err(CallError::SendFailed(MessageType::CallResponse));
        }
        Ok(())
    }

    /// Local hangup. Safe in any state; a no-op when idle.
    pub fn end_call(&mut self) -> Option<ConnectionCommand> {
        let peer = self.peer.clone()?;
        info!(peer = %peer, state = %self.state, "ending call");
        if !self
            .signaling
            .send(SignalMessage::call_end(&self.local_id, &peer, "hangup"))
        {
            warn!(peer = %peer, "call-end could not be sent");
        }
        self.reset();
        Some(ConnectionCommand::Close)
    }

    /// Ends the call because something below the call protocol failed.
    pub fn abort(&mut self, reason: FailureReason) -> Option<ConnectionCommand> {
        let peer = self.peer.clone()?;
        warn!(peer = %peer, ?reason, "aborting call");
        self.signaling
            .send(SignalMessage::call_end(&self.local_id, &peer, reason.as_wire()));
        self.publish_failure(reason);
        self.reset();
        Some(ConnectionCommand::Close)
    }

    /// Returns `true` when the event was our live invite timer.
    pub fn on_invite_timeout(&mut self, event: &TimerEvent) -> bool {
        let live = self
            .invite_timer
            .as_ref()
            .is_some_and(|timer| timer.matches(event));
        if !live || self.state != CallState::Calling {
            debug!(token = event.token, "stale invite timer ignored");
            return false;
        }

        if let Some(peer) = self.peer.clone() {
            info!(peer = %peer, "invite timed out");
            self.signaling
                .send(SignalMessage::call_cancel(&self.local_id, &peer, "timeout"));
        }
        self.publish_failure(FailureReason::Timeout);
        self.reset();
        true
    }

    /// The connection manager reported a working connection.
    pub fn on_connection_established(&mut self) {
        match self.state {
            CallState::Connecting | CallState::Connected => self.transition(CallState::Connected),
            CallState::Receiving if self.accepted => self.transition(CallState::Connected),
            state => debug!(%state, "establishment ignored"),
        }
    }

    /// Applies one inbound message to the call state.
    pub fn handle_message(&mut self, message: SignalMessage) -> Option<ConnectionCommand> {
        if message.kind == MessageType::UserOffline {
            return self.handle_user_offline(&message);
        }

        let Some(from) = message.from.clone() else {
            warn!(kind = %message.kind, "message without sender dropped");
            return None;
        };

        if message.kind == MessageType::CallRequest {
            self.handle_call_request(from);
            return None;
        }

        if self.peer.as_deref() != Some(from.as_str()) {
            debug!(
                kind = %message.kind,
                from = %from,
                bound = ?self.peer,
                "message from unbound peer dropped"
            );
            return None;
        }

        match message.kind {
            MessageType::CallResponse => {
                self.handle_call_response(&message);
                self.connection_start()
            }
            MessageType::CallCancel => {
                info!(peer = %from, "peer cancelled the call");
                self.events.publish(CallEvent::CallCancelled { peer: from });
                self.reset();
                Some(ConnectionCommand::Close)
            }
            MessageType::CallEnd => {
                info!(peer = %from, "peer hung up");
                self.events.publish(CallEvent::RemoteHangup { peer: from });
                self.reset();
                Some(ConnectionCommand::Close)
            }
            kind if kind.is_negotiation() => Some(ConnectionCommand::Deliver(message)),
            kind => {
                debug!(%kind, "not a call message");
                None
            }
        }
    }

    fn handle_call_request(&mut self, from: PeerId) {
        if self.state != CallState::Idle {
            info!(from = %from, state = %self.state, "busy, declining call request");
            self.signaling.send(SignalMessage::call_response(
                &self.local_id,
                &from,
                false,
                Some(DeclineReason::Busy),
            ));
            return;
        }
        if from == self.local_id {
            warn!("call request from ourselves ignored");
            return;
        }

        info!(from = %from, "incoming call");
        self.peer = Some(from.clone());
        self.accepted = false;
        self.transition(CallState::Receiving);
        self.events.publish(CallEvent::IncomingCall { from });
    }

    fn handle_call_response(&mut self, message: &SignalMessage) {
        if self.state != CallState::Calling {
            debug!(state = %self.state, "call-response outside of calling ignored");
            return;
        }
        let response: CallResponsePayload = match message.payload_as() {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "malformed call-response dropped");
                return;
            }
        };

        self.invite_timer = None;
        if response.accepted {
            info!(peer = ?self.peer, "call accepted by peer");
            self.transition(CallState::Connecting);
        } else {
            let reason = match response.reason {
                Some(DeclineReason::Busy) => FailureReason::Busy,
                _ => FailureReason::Rejected,
            };
            info!(peer = ?self.peer, ?reason, "call declined by peer");
            self.publish_failure(reason);
            self.reset();
        }
    }

    fn connection_start(&self) -> Option<ConnectionCommand> {
        match (self.state, &self.peer) {
            (CallState::Connecting, Some(peer)) => {
                Some(ConnectionCommand::StartAsOfferer(peer.clone()))
            }
            _ => None,
        }
    }

    fn handle_user_offline(&mut self, message: &SignalMessage) -> Option<ConnectionCommand> {
        let offline: UserOfflinePayload = match message.payload_as() {
            Ok(offline) => offline,
            Err(e) => {
                warn!(error = %e, "malformed user-offline dropped");
                return None;
            }
        };
        if self.peer.as_deref() != Some(offline.client_id.as_str()) {
            debug!(client = %offline.client_id, "unrelated client went offline");
            return None;
        }

        info!(peer = %offline.client_id, "peer went offline");
        self.publish_failure(FailureReason::PeerOffline);
        self.reset();
        Some(ConnectionCommand::Close)
    }

    fn publish_failure(&self, reason: FailureReason) {
        if let Some(peer) = &self.peer {
            self.events.publish(CallEvent::CallFailed {
                peer: peer.clone(),
                reason,
            });
        }
    }

    fn transition(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        let previous = std::mem::replace(&mut self.state, next);
        debug!(%previous, current = %next, peer = ?self.peer, "call state changed");
        self.events.publish(CallEvent::CallStateChanged {
            previous,
            current: next,
            peer: self.peer.clone(),
        });
    }

    // Only path back to Idle. Cancels the invite timer.
    fn reset(&mut self) {
        self.invite_timer = None;
        self.accepted = false;
        self.transition(CallState::Idle);
        self.peer = None;
    }

    fn invalid(&self, operation: &'static str) -> CallError {
        CallError::InvalidState {
            operation,
            state: self.state,
        }
    }
}
