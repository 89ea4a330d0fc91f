//! Error types for every layer of the call stack.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::CallState;
use crate::signaling::MessageType;

/// Result type for call-protocol operations
pub type CallResult<T> = Result<T, CallError>;

/// Result type for connection lifecycle operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Errors raised by the call negotiation state machine and the agent front door.
#[derive(Debug, Error)]
pub enum CallError {
    /// The operation is not valid in the current call state
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },

    /// No local media could be obtained
    #[error("local media is unavailable")]
    MediaUnavailable,

    /// Attempted to call our own client id
    #[error("cannot call yourself")]
    SelfCall,

    /// The signaling channel refused the message
    #[error("failed to send {0} message")]
    SendFailed(MessageType),

    /// The agent loop has stopped and can no longer take commands
    #[error("call agent is not running")]
    AgentStopped,

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised while establishing or maintaining a peer connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// An answer or candidate arrived but no connection object exists
    #[error("no peer connection")]
    NoConnection,

    /// `start_as_offerer` was invoked without local media
    #[error("local media is unavailable")]
    MediaUnavailable,

    /// A negotiation engine primitive failed
    #[error("{operation} failed: {source}")]
    Engine {
        operation: &'static str,
        #[source]
        source: EngineError,
    },

    /// The signaling channel refused the message
    #[error("failed to send {0} message")]
    SendFailed(MessageType),

    /// The inbound payload did not match the expected shape
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Operation name used for candidate application failures
pub(crate) const ADD_ICE_CANDIDATE: &str = "add ICE candidate";

impl ConnectionError {
    pub(crate) fn engine(operation: &'static str, source: EngineError) -> Self {
        Self::Engine { operation, source }
    }

    /// Classification used when the error is published to the application
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Engine {
                operation: ADD_ICE_CANDIDATE,
                ..
            } => ErrorKind::Ice,
            Self::NoConnection | Self::Engine { .. } | Self::Payload(_) => ErrorKind::Negotiation,
            Self::MediaUnavailable => ErrorKind::Media,
            Self::SendFailed(_) => ErrorKind::Signaling,
        }
    }
}

/// Errors surfaced by a negotiation engine implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Webrtc(#[from] webrtc::Error),

    /// The description type cannot be applied by this engine
    #[error("unsupported session description: {0}")]
    UnsupportedDescription(String),

    #[error("{0}")]
    Other(String),
}

/// Errors raised by signaling transports.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("client {0} is already connected")]
    AlreadyConnected(String),
}

/// Errors raised by the media collaborator.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Error classification published with [`crate::events::CallEvent::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Signaling,
    Negotiation,
    Ice,
    Media,
    Stats,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Signaling => "signaling",
            Self::Negotiation => "negotiation",
            Self::Ice => "ice",
            Self::Media => "media",
            Self::Stats => "stats",
        };
        f.write_str(name)
    }
}
