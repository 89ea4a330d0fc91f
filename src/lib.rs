pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod quality;
pub mod session;
pub mod signaling;
pub mod timer;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use agent::{AgentHandle, AgentSnapshot, CallAgent};
pub use config::{CallConfig, LogConfig};
pub use error::{CallError, CallResult, ErrorKind};
pub use events::{CallEvent, EventBus};
pub use media::{LocalStream, MediaPort, RemoteStream};
pub use peer::RtcEngine;
pub use quality::Quality;
pub use session::{CallState, FailureReason};
pub use signaling::relay::LocalRelay;
pub use signaling::{SignalMessage, SignalingPort};
