//! Client-side listener table.
//!
//! The table is the source of truth for re-registration: after a reconnect
//! the controller replays every entry to the new server session.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::ids::ListenerKey;
use serde_json::Value;
use tracing::debug;

/// Callback invoked with each delivered event body.
pub type ListenerFn = Arc<dyn Fn(Value) + Send + Sync>;

/// What gets replayed to the server after a reconnect.
#[derive(Clone, Debug)]
pub struct ReplayInfo {
    /// Registration key.
    pub key: ListenerKey,
    /// Subscribed event name.
    pub event_name: String,
    /// Opaque filter payload.
    pub filter_info: Value,
}

struct ListenerEntry {
    event_name: String,
    filter_info: Value,
    callback: ListenerFn,
}

/// All local listener registrations, keyed by registration key.
#[derive(Default)]
pub struct ListenerTable {
    entries: Mutex<HashMap<ListenerKey, ListenerEntry>>,
}

impl ListenerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace, by key) a registration.
    pub fn insert(
        &self,
        key: ListenerKey,
        event_name: String,
        filter_info: Value,
        callback: ListenerFn,
    ) {
        let _ = self.entries.lock().insert(
            key,
            ListenerEntry {
                event_name,
                filter_info,
                callback,
            },
        );
    }

    /// Remove a registration. Returns whether it existed.
    pub fn remove(&self, key: &ListenerKey) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Invoke the callback registered under `key` with an event body.
    ///
    /// Events for unknown keys are dropped; they race with unregistration.
    pub fn dispatch(&self, key: &ListenerKey, body: Value) -> bool {
        let callback = {
            let entries = self.entries.lock();
            entries.get(key).map(|e| e.callback.clone())
        };
        match callback {
            Some(callback) => {
                callback(body);
                true
            }
            None => {
                debug!(key = %key, "event for unknown listener key dropped");
                false
            }
        }
    }

    /// Snapshot for reconnect replay.
    pub fn snapshot(&self) -> Vec<ReplayInfo> {
        self.entries
            .lock()
            .iter()
            .map(|(key, entry)| ReplayInfo {
                key: key.clone(),
                event_name: entry.event_name.clone(),
                filter_info: entry.filter_info.clone(),
            })
            .collect()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
