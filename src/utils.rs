use crate::peer::types::{IceServerKind, ServerConfig};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Wall-clock milliseconds, used for `timestamp` payload fields
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Prepends the protocol scheme to an ICE server URL when it is missing
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
        || config.url.starts_with("stuns:")
    {
        config.url.clone()
    } else {
        let scheme = match config.kind {
            IceServerKind::Turn => "turn:",
            IceServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: IceServerKind, url: &str) -> ServerConfig {
        ServerConfig {
            id: "s".into(),
            kind,
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn timestamps_are_epoch_millis() {
        // 2020-09-13 in milliseconds
        assert!(now_millis() > 1_600_000_000_000);
    }

    #[test]
    fn scheme_is_added_by_kind() {
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Turn, "relay.example.org:3478")),
            "turn:relay.example.org:3478"
        );
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Stun, "stun.example.org")),
            "stun:stun.example.org"
        );
    }

    #[test]
    fn existing_scheme_is_kept() {
        let url = "turns:relay.example.org:443?transport=tcp";
        assert_eq!(add_ice_url_scheme(&server(IceServerKind::Turn, url)), url);
    }

    #[test]
    fn random_ids_are_hex() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_id());
    }
}
