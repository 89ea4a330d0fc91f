// Runtime configuration for a call agent.
// Logging is on by default only in debug builds.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::peer::types::{IceServerKind, ServerConfig};

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Public STUN servers used when nothing else is configured
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Logging switch and filter directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    /// `EnvFilter` directive, overridden by `RUST_LOG` when set
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: LOGGING_ENABLED,
            filter: "peercall=debug,webrtc=warn".into(),
        }
    }
}

/// Timers, ICE servers and candidate handling for one call agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub invite_timeout_ms: u64,
    pub stats_interval_ms: u64,
    pub recovery_delay_ms: u64,
    /// Queue candidates that arrive before the connection can take them.
    /// `false` drops them with a warning instead.
    pub buffer_early_candidates: bool,
    pub early_candidate_limit: usize,
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
    pub log: LogConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            invite_timeout_ms: 30_000,
            stats_interval_ms: 2_000,
            recovery_delay_ms: 3_000,
            buffer_early_candidates: true,
            early_candidate_limit: 32,
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            ice_candidate_pool_size: 10,
            log: LogConfig::default(),
        }
    }
}

impl CallConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: CallConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_millis(self.invite_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    /// Replace the ICE servers after validating them.
    pub fn set_ice_servers(&mut self, servers: Vec<ServerConfig>) -> Result<(), ConfigError> {
        validate_ice_servers(&servers)?;
        self.ice_servers = servers;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.invite_timeout_ms == 0 {
            return Err(ConfigError::invalid("invite_timeout_ms must be positive"));
        }
        if self.stats_interval_ms == 0 {
            return Err(ConfigError::invalid("stats_interval_ms must be positive"));
        }
        if self.recovery_delay_ms == 0 {
            return Err(ConfigError::invalid("recovery_delay_ms must be positive"));
        }
        if self.buffer_early_candidates && self.early_candidate_limit == 0 {
            return Err(ConfigError::invalid(
                "early_candidate_limit must be positive when buffering is enabled",
            ));
        }
        validate_ice_servers(&self.ice_servers)
    }
}

fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.trim().is_empty() {
            return Err(ConfigError::invalid(format!(
                "ICE server {} has an empty url",
                server.id
            )));
        }
        if server.kind == IceServerKind::Turn
            && (server.username.is_none() || server.credential.is_none())
        {
            return Err(ConfigError::invalid(format!(
                "TURN server {} requires username and credential",
                server.id
            )));
        }
    }
    Ok(())
}
