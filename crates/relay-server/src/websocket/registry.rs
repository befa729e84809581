//! Session registry: admitted connections, identity takeover, and event
//! fan-out to matching listener registrations.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use relay_core::ids::{ClientId, ConnectionId, ListenerKey};
use relay_wire::WireMessage;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::metrics::{EVENTS_DELIVERED_TOTAL, WS_TAKEOVERS_TOTAL};

use super::connection::Connection;

/// All currently admitted connections, indexed by connection ID.
pub struct SessionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a handshaken connection.
    ///
    /// If another live connection already holds the same client identity,
    /// the newer one wins: the old connection is terminated and removed.
    /// Returns the evicted connection, if any.
    pub async fn admit(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let client_id = connection.client_id();
        let mut conns = self.connections.write().await;

        let stale = client_id.as_ref().and_then(|id| {
            conns
                .values()
                .find(|c| c.id != connection.id && c.client_id().as_ref() == Some(id))
                .cloned()
        });
        if let Some(old) = &stale {
            info!(
                client_id = %client_id.as_ref().map_or("", |c| c.as_str()),
                old_connection = %old.id,
                new_connection = %connection.id,
                "identity takeover, evicting stale connection"
            );
            counter!(WS_TAKEOVERS_TOTAL).increment(1);
            old.terminate();
            let _ = conns.remove(&old.id);
        }

        let _ = conns.insert(connection.id.clone(), connection);
        stale
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, connection_id: &ConnectionId) {
        let mut conns = self.connections.write().await;
        let _ = conns.remove(connection_id);
    }

    /// Look up a connection by ID.
    pub async fn get(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    /// Look up the live connection for a client identity.
    pub async fn find_by_client(&self, client_id: &ClientId) -> Option<Arc<Connection>> {
        let conns = self.connections.read().await;
        conns
            .values()
            .find(|c| c.client_id().as_ref() == Some(client_id))
            .cloned()
    }

    /// Number of admitted connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Fan an event out to every registration for `event_name` whose
    /// `filterInfo` the predicate accepts.
    ///
    /// One frame is sent per matching registration, keyed by the
    /// registration key, so a connection holding several matching
    /// registrations receives the event once per key. Returns the number
    /// of frames delivered.
    pub async fn emit<F>(&self, event_name: &str, predicate: F, body: &Value) -> usize
    where
        F: Fn(&Value) -> bool,
    {
        let conns = self.connections.read().await;
        let mut delivered = 0usize;
        for conn in conns.values() {
            for reg in conn.listeners_for(event_name) {
                if !predicate(&reg.filter_info) {
                    continue;
                }
                let event = WireMessage::Event {
                    key: reg.key.clone(),
                    body: body.clone(),
                };
                if conn.send_message(&event) {
                    delivered += 1;
                } else {
                    warn!(connection_id = %conn.id, key = %reg.key, "failed to enqueue event");
                }
            }
        }
        debug!(event_name, delivered, "event fan-out");
        counter!(EVENTS_DELIVERED_TOTAL).increment(delivered as u64);
        delivered
    }

    /// Deliver an event body directly to a set of registration keys,
    /// wherever they live. Returns the number of frames delivered.
    pub async fn deliver_to_keys(&self, keys: &[ListenerKey], body: &Value) -> usize {
        let conns = self.connections.read().await;
        let mut delivered = 0usize;
        for key in keys {
            let Some(conn) = conns.values().find(|c| c.has_listener(key)) else {
                debug!(key = %key, "no connection holds listener key");
                continue;
            };
            let event = WireMessage::Event {
                key: key.clone(),
                body: body.clone(),
            };
            if conn.send_message(&event) {
                delivered += 1;
            }
        }
        counter!(EVENTS_DELIVERED_TOTAL).increment(delivered as u64);
        delivered
    }

    /// Push a reload notice to every connection (or, when `client_name`
    /// is set, let clients decide whether it addresses them).
    pub async fn notify_reload(&self, client_name: Option<String>, changed_file_set: Vec<String>) {
        let message = WireMessage::ClientReload {
            client_name,
            changed_file_set,
        };
        let conns = self.connections.read().await;
        for conn in conns.values() {
            if !conn.send_message(&message) {
                warn!(connection_id = %conn.id, "failed to enqueue reload notice");
            }
        }
    }

    /// Terminate every session (used during shutdown).
    pub async fn terminate_all(&self) {
        let conns = self.connections.read().await;
        for conn in conns.values() {
            conn.terminate();
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
