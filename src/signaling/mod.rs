//! Signaling wire model and the transport contract.
//!
//! Every message has the shape `{type, from, to, payload}`. The `type` decides
//! whether the call session or the connection manager handles it.

pub mod relay;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::SignalingError;
use crate::peer::types::{CandidateType, IceCandidate, ServerConfig, SessionDescription};
use crate::utils::now_millis;

pub type PeerId = String;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    CallRequest,
    CallResponse,
    CallCancel,
    CallEnd,
    Offer,
    Answer,
    IceCandidate,
    UserOffline,
    Registered,
    ClientList,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallRequest => "call-request",
            Self::CallResponse => "call-response",
            Self::CallCancel => "call-cancel",
            Self::CallEnd => "call-end",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::UserOffline => "user-offline",
            Self::Registered => "registered",
            Self::ClientList => "client-list",
            Self::Unknown => "unknown",
        }
    }

    /// Types a relay forwards from one client to another
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            Self::CallRequest
                | Self::CallResponse
                | Self::CallCancel
                | Self::CallEnd
                | Self::Offer
                | Self::Answer
                | Self::IceCandidate
        )
    }

    /// Types consumed by the connection manager rather than the call session
    pub fn is_negotiation(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl SignalMessage {
    pub fn new(kind: MessageType, from: &str, to: &str, payload: impl Serialize) -> Self {
        Self {
            kind,
            from: Some(from.to_owned()),
            to: Some(to.to_owned()),
            payload: serde_json::to_value(payload).unwrap_or_default(),
        }
    }

    pub fn call_request(from: &str, to: &str) -> Self {
        Self::new(
            MessageType::CallRequest,
            from,
            to,
            CallRequestPayload {
                timestamp: now_millis(),
            },
        )
    }

    pub fn call_response(from: &str, to: &str, accepted: bool, reason: Option<DeclineReason>) -> Self {
        Self::new(
            MessageType::CallResponse,
            from,
            to,
            CallResponsePayload { accepted, reason },
        )
    }

    pub fn call_cancel(from: &str, to: &str, reason: &str) -> Self {
        Self::new(
            MessageType::CallCancel,
            from,
            to,
            ReasonPayload {
                reason: reason.to_owned(),
            },
        )
    }

    pub fn call_end(from: &str, to: &str, reason: &str) -> Self {
        Self::new(
            MessageType::CallEnd,
            from,
            to,
            ReasonPayload {
                reason: reason.to_owned(),
            },
        )
    }

    pub fn offer(from: &str, to: &str, sdp: SessionDescription, ice_restart: bool) -> Self {
        Self::new(
            MessageType::Offer,
            from,
            to,
            OfferPayload {
                sdp,
                timestamp: now_millis(),
                ice_restart,
            },
        )
    }

    pub fn answer(from: &str, to: &str, sdp: SessionDescription) -> Self {
        Self::new(
            MessageType::Answer,
            from,
            to,
            AnswerPayload {
                sdp,
                timestamp: now_millis(),
            },
        )
    }

    pub fn ice_candidate(from: &str, to: &str, candidate: IceCandidate) -> Self {
        let candidate_type = candidate.candidate_type();
        Self::new(
            MessageType::IceCandidate,
            from,
            to,
            IceCandidatePayload {
                candidate,
                candidate_type,
            },
        )
    }

    pub fn user_offline(client_id: &str) -> Self {
        Self {
            kind: MessageType::UserOffline,
            from: Some("server".to_owned()),
            to: None,
            payload: serde_json::to_value(UserOfflinePayload {
                client_id: client_id.to_owned(),
            })
            .unwrap_or_default(),
        }
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn is_from(&self, peer: &str) -> bool {
        self.from.as_deref() == Some(peer)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CallRequestPayload {
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeclineReason {
    Busy,
    Rejected,
    #[serde(other)]
    Other,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CallResponsePayload {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DeclineReason>,
}

/// Payload of `call-cancel` and `call-end`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReasonPayload {
    #[serde(default)]
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub sdp: SessionDescription,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ice_restart: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub sdp: SessionDescription,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: IceCandidate,
    #[serde(default = "unknown_candidate_type")]
    pub candidate_type: CandidateType,
}

fn unknown_candidate_type() -> CandidateType {
    CandidateType::Unknown
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserOfflinePayload {
    pub client_id: PeerId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    #[serde(default)]
    pub ice_servers: Vec<ServerConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientEntry {
    pub id: PeerId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ClientListPayload {
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
}

/// Message transport towards the relay.
///
/// `send` returns `false` when the channel is not open; callers treat that as
/// a failure of whatever operation produced the message.
#[async_trait]
pub trait SignalingPort: Send + Sync {
    fn client_id(&self) -> PeerId;

    /// Opens the channel and returns the stream of inbound messages.
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn send(&self, message: SignalMessage) -> bool;
}

type Handler<R> = Box<dyn Fn(SignalMessage) -> R + Send + Sync>;

/// Per-message-type handler table.
///
/// A handler turns a message into `R`; the owner decides what to do with it.
pub struct Dispatcher<R = ()> {
    handlers: HashMap<MessageType, Handler<R>>,
}

impl<R> Default for Dispatcher<R> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<R> Dispatcher<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: MessageType, handler: F)
    where
        F: Fn(SignalMessage) -> R + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    pub fn handles(&self, kind: MessageType) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Returns `None` when no handler is registered for the message type.
    pub fn dispatch(&self, message: SignalMessage) -> Option<R> {
        match self.handlers.get(&message.kind) {
            Some(handler) => Some(handler(message)),
            None => {
                warn!(kind = %message.kind, from = ?message.from, "unhandled signaling message");
                None
            }
        }
    }
}
