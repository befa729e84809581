//! Per-socket connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use relay_core::ids::{ClientId, ConnectionId, ListenerKey};
use relay_wire::{WireMessage, encode_frame};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics::WS_SEND_DROPS_TOTAL;

/// One event-listener registration held by a connection.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRegistration {
    /// Caller-chosen registration key, echoed in every delivered event.
    pub key: ListenerKey,
    /// Event name this registration subscribes to.
    pub event_name: String,
    /// Opaque filter payload evaluated by emitters.
    pub filter_info: Value,
}

/// Represents one connected client socket.
pub struct Connection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Client identity declared during the admission handshake.
    client_id: Mutex<Option<ClientId>>,
    /// Send channel to this socket's write task.
    tx: mpsc::Sender<Arc<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has responded since the last ping.
    pub is_alive: AtomicBool,
    /// Count of messages dropped due to a full channel.
    pub dropped_messages: AtomicU64,
    /// Listener registrations held by this connection.
    listeners: Mutex<Vec<ListenerRegistration>>,
    /// Cancelled to terminate the session (takeover, eviction, shutdown).
    cancel: CancellationToken,
}

impl Connection {
    /// Create a new connection.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            client_id: Mutex::new(None),
            tx,
            connected_at: Instant::now(),
            is_alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Bind the client identity declared at handshake.
    pub fn bind_client(&self, client_id: ClientId) {
        *self.client_id.lock() = Some(client_id);
    }

    /// The bound client identity, if the handshake completed.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id.lock().clone()
    }

    /// Enqueue a text frame for this socket.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            counter!(WS_SEND_DROPS_TOTAL).increment(1);
            false
        }
    }

    /// Serialize a wire message and enqueue it.
    pub fn send_message(&self, message: &WireMessage) -> bool {
        match encode_frame(message) {
            Ok(frame) => self.send(Arc::new(frame)),
            Err(_) => false,
        }
    }

    /// Enqueue a text frame, waiting for channel capacity.
    ///
    /// Correlated responses must use this path: dropping one of their
    /// frames would strand the peer's request forever, so a slow reader
    /// applies backpressure here instead. Returns `false` once the
    /// session's write half is gone.
    pub async fn send_awaiting(&self, frame: Arc<String>) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    /// Serialize a wire message and enqueue it, waiting for capacity.
    pub async fn send_message_awaiting(&self, message: &WireMessage) -> bool {
        match encode_frame(message) {
            Ok(frame) => self.send_awaiting(Arc::new(frame)).await,
            Err(_) => false,
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong or any inbound traffic).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Add (or replace, by key) a listener registration.
    pub fn add_listener(&self, registration: ListenerRegistration) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|r| r.key != registration.key);
        listeners.push(registration);
    }

    /// Remove a listener registration by key. Returns whether it existed.
    pub fn remove_listener(&self, key: &ListenerKey) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|r| r.key != *key);
        listeners.len() != before
    }

    /// Snapshot the registrations for one event name.
    pub fn listeners_for(&self, event_name: &str) -> Vec<ListenerRegistration> {
        self.listeners
            .lock()
            .iter()
            .filter(|r| r.event_name == event_name)
            .cloned()
            .collect()
    }

    /// Whether this connection holds the given registration key.
    pub fn has_listener(&self, key: &ListenerKey) -> bool {
        self.listeners.lock().iter().any(|r| r.key == *key)
    }

    /// Snapshot of every registration on this connection.
    pub fn listener_snapshot(&self) -> Vec<ListenerRegistration> {
        self.listeners.lock().clone()
    }

    /// Token cancelled when this session must terminate.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Terminate the session owning this connection.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
