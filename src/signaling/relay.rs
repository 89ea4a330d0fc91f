//! In-process signaling relay.
//!
//! Routes messages between registered clients the same way the relay server
//! does: registration is answered with `registered` and a fresh `client-list`,
//! call and negotiation messages go to their `to` client, and a disconnect is
//! announced to everyone else with `user-offline`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    ClientEntry, ClientListPayload, MessageType, PeerId, RegisteredPayload, SignalMessage,
    SignalingPort,
};
use crate::error::SignalingError;
use crate::peer::types::ServerConfig;
use crate::utils::random_id;

const SERVER_ID: &str = "server";

#[derive(Default)]
struct RelayState {
    clients: HashMap<PeerId, mpsc::UnboundedSender<SignalMessage>>,
    ice_servers: Vec<ServerConfig>,
}

/// Shared routing hub; clone it to hand out endpoints
#[derive(Clone, Default)]
pub struct LocalRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// ICE servers announced to every client in its `registered` message.
    pub fn with_ice_servers(servers: Vec<ServerConfig>) -> Self {
        let relay = Self::default();
        relay.lock().ice_servers = servers;
        relay
    }

    pub fn endpoint(&self, id: impl Into<PeerId>) -> RelayEndpoint {
        RelayEndpoint {
            id: id.into(),
            relay: self.clone(),
            connected: AtomicBool::new(false),
        }
    }

    /// Endpoint with a generated `client_<hex>` id
    pub fn anonymous_endpoint(&self) -> RelayEndpoint {
        self.endpoint(format!("client_{}", random_id()))
    }

    pub fn clients(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.lock().clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, id: &str) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError> {
        let mut state = self.lock();
        if state.clients.contains_key(id) {
            return Err(SignalingError::AlreadyConnected(id.to_owned()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let registered = server_message(
            MessageType::Registered,
            id,
            RegisteredPayload {
                ice_servers: state.ice_servers.clone(),
            },
        );
        let _ = tx.send(registered);
        state.clients.insert(id.to_owned(), tx);
        info!(client = id, total = state.clients.len(), "client registered");
        broadcast_client_list(&state);
        Ok(rx)
    }

    fn unregister(&self, id: &str) {
        let mut state = self.lock();
        if state.clients.remove(id).is_none() {
            return;
        }
        info!(client = id, total = state.clients.len(), "client disconnected");
        for (other, tx) in &state.clients {
            let mut offline = SignalMessage::user_offline(id);
            offline.to = Some(other.clone());
            let _ = tx.send(offline);
        }
        broadcast_client_list(&state);
    }

    fn route(&self, message: SignalMessage) -> bool {
        let state = self.lock();
        let Some(from) = message.from.as_deref() else {
            warn!(kind = %message.kind, "message without sender dropped");
            return false;
        };
        if !state.clients.contains_key(from) {
            warn!(client = from, "message from unregistered client dropped");
            return false;
        }
        if !message.kind.is_relayed() {
            debug!(kind = %message.kind, client = from, "non-relayed message ignored");
            return true;
        }
        let target = message.to.as_deref().unwrap_or_default();
        match state.clients.get(target) {
            Some(tx) => {
                debug!(kind = %message.kind, from, to = target, "relaying message");
                if tx.send(message.clone()).is_err() {
                    warn!(to = target, "target channel closed");
                }
            }
            None => warn!(kind = %message.kind, from, to = target, "target client not found"),
        }
        true
    }
}

fn server_message(kind: MessageType, to: &str, payload: impl serde::Serialize) -> SignalMessage {
    SignalMessage {
        kind,
        from: Some(SERVER_ID.to_owned()),
        to: Some(to.to_owned()),
        payload: serde_json::to_value(payload).unwrap_or(Value::Null),
    }
}

fn broadcast_client_list(state: &RelayState) {
    let mut clients: Vec<ClientEntry> = state
        .clients
        .keys()
        .map(|id| ClientEntry { id: id.clone() })
        .collect();
    clients.sort_by(|a, b| a.id.cmp(&b.id));
    let payload = ClientListPayload { clients };
    for (id, tx) in &state.clients {
        let _ = tx.send(server_message(MessageType::ClientList, id, &payload));
    }
}

/// One client's connection to a [`LocalRelay`]
pub struct RelayEndpoint {
    id: PeerId,
    relay: LocalRelay,
    connected: AtomicBool,
}

#[async_trait]
impl SignalingPort for RelayEndpoint {
    fn client_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::AlreadyConnected(self.id.clone()));
        }
        let rx = self.relay.register(&self.id)?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.relay.unregister(&self.id);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, mut message: SignalMessage) -> bool {
        if !self.is_connected() {
            warn!(kind = %message.kind, "signaling channel not open");
            return false;
        }
        if message.from.is_none() {
            message.from = Some(self.id.clone());
        }
        self.relay.route(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::UserOfflinePayload;

    fn drain(rx: &mut mpsc::UnboundedReceiver<SignalMessage>) -> Vec<SignalMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn register_announces_ice_servers_and_presence() {
        let relay = LocalRelay::with_ice_servers(crate::config::DEFAULT_ICE_SERVERS.clone());
        let alice = relay.endpoint("alice");
        let mut rx = alice.connect().await.unwrap();

        let msgs = drain(&mut rx);
        assert_eq!(msgs[0].kind, MessageType::Registered);
        let registered: RegisteredPayload = msgs[0].payload_as().unwrap();
        assert_eq!(registered.ice_servers.len(), 2);
        assert_eq!(msgs[1].kind, MessageType::ClientList);
    }

    #[tokio::test]
    async fn relays_to_target_and_drops_unknown() {
        let relay = LocalRelay::new();
        let alice = relay.endpoint("alice");
        let bob = relay.endpoint("bob");
        let _alice_rx = alice.connect().await.unwrap();
        let mut bob_rx = bob.connect().await.unwrap();
        drain(&mut bob_rx);

        assert!(alice.send(SignalMessage::call_request("alice", "bob")));
        assert!(alice.send(SignalMessage::call_request("alice", "carol")));

        let msgs = drain(&mut bob_rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageType::CallRequest);
        assert!(msgs[0].is_from("alice"));
    }

    #[tokio::test]
    async fn disconnect_notifies_others() {
        let relay = LocalRelay::new();
        let alice = relay.endpoint("alice");
        let bob = relay.endpoint("bob");
        let mut alice_rx = alice.connect().await.unwrap();
        let _bob_rx = bob.connect().await.unwrap();
        drain(&mut alice_rx);

        bob.disconnect().await;
        bob.disconnect().await;

        let msgs = drain(&mut alice_rx);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].kind, MessageType::UserOffline);
        let offline: UserOfflinePayload = msgs[0].payload_as().unwrap();
        assert_eq!(offline.client_id, "bob");
        assert_eq!(msgs[1].kind, MessageType::ClientList);
        assert_eq!(relay.clients(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn send_fails_when_not_connected() {
        let relay = LocalRelay::new();
        let alice = relay.endpoint("alice");
        assert!(!alice.send(SignalMessage::call_request("alice", "bob")));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let relay = LocalRelay::new();
        let first = relay.endpoint("alice");
        let second = relay.endpoint("alice");
        let _rx = first.connect().await.unwrap();
        assert!(matches!(
            second.connect().await,
            Err(SignalingError::AlreadyConnected(_))
        ));
    }

    #[test]
    fn anonymous_ids_are_prefixed() {
        let relay = LocalRelay::new();
        assert!(relay.anonymous_endpoint().client_id().starts_with("client_"));
    }
}
