pub mod connection;
pub mod engine;
pub mod ice;
pub mod rtc;
pub mod stats;
pub mod types;

pub use connection::{ConnectionCommand, ConnectionInfo, ConnectionManager, ConnectionNotice};
pub use engine::{EngineEvent, EngineEvents, NegotiationEngine, PeerLink};
pub use rtc::RtcEngine;
pub use stats::{StatsSample, StatsTracker};
pub use types::{ConnectionState, IceCandidate, ServerConfig, SessionDescription};
