//! In-flight request table: correlation ids to response slots.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ClientError;

/// Progress of a split transfer, reported per chunk in both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes sent or received so far.
    pub transferred: u64,
    /// Total bytes of the serialized message.
    pub total: u64,
}

/// Per-chunk progress callback.
pub type ProgressFn = Arc<dyn Fn(TransferProgress) + Send + Sync>;

struct PendingEntry {
    tx: oneshot::Sender<Result<Value, ClientError>>,
    progress: Option<ProgressFn>,
}

/// Requests awaiting their correlated response.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for a correlation id.
    pub fn insert(
        &self,
        uuid: String,
        progress: Option<ProgressFn>,
    ) -> oneshot::Receiver<Result<Value, ClientError>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.entries.lock().insert(uuid, PendingEntry { tx, progress });
        rx
    }

    /// Resolve a correlation id with its outcome.
    ///
    /// A response carrying an id nobody is waiting on is dropped; late
    /// responses after a reconnect land here.
    pub fn resolve(&self, uuid: &str, result: Result<Value, ClientError>) -> bool {
        let Some(entry) = self.entries.lock().remove(uuid) else {
            debug!(uuid, "response for unknown correlation id ignored");
            return false;
        };
        let _ = entry.tx.send(result);
        true
    }

    /// Fire the progress callback for a correlation id, if registered.
    pub fn progress(&self, uuid: &str, transferred: u64, total: u64) {
        let entries = self.entries.lock();
        if let Some(callback) = entries.get(uuid).and_then(|e| e.progress.clone()) {
            drop(entries);
            callback(TransferProgress { transferred, total });
        }
    }

    /// Drop a slot without resolving it (send failure after insert).
    pub fn forget(&self, uuid: &str) {
        let _ = self.entries.lock().remove(uuid);
    }

    /// Fail every in-flight request (socket loss, close).
    pub fn reject_all(&self, make_error: impl Fn() -> ClientError) {
        let entries: Vec<PendingEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            let _ = entry.tx.send(Err(make_error()));
        }
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn insert_and_resolve() {
        let pending = PendingRequests::new();
        let rx = pending.insert("r1".into(), None);
        assert!(pending.resolve("r1", Ok(json!(42))));
        assert_eq!(rx.await.unwrap().unwrap(), json!(42));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn resolve_with_error() {
        let pending = PendingRequests::new();
        let rx = pending.insert("r1".into(), None);
        let _ = pending.resolve("r1", Err(ClientError::NotConnected));
        assert!(matches!(
            rx.await.unwrap(),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn unknown_id_is_ignored() {
        let pending = PendingRequests::new();
        assert!(!pending.resolve("ghost", Ok(json!(null))));
    }

    #[tokio::test]
    async fn resolve_is_at_most_once() {
        let pending = PendingRequests::new();
        let _rx = pending.insert("r1".into(), None);
        assert!(pending.resolve("r1", Ok(json!(1))));
        assert!(!pending.resolve("r1", Ok(json!(2))));
    }

    #[tokio::test]
    async fn reject_all_fails_everything() {
        let pending = PendingRequests::new();
        let rx1 = pending.insert("r1".into(), None);
        let rx2 = pending.insert("r2".into(), None);
        pending.reject_all(|| ClientError::Closed);
        assert!(matches!(rx1.await.unwrap(), Err(ClientError::Closed)));
        assert!(matches!(rx2.await.unwrap(), Err(ClientError::Closed)));
        assert!(pending.is_empty());
    }

    #[test]
    fn progress_fires_registered_callback() {
        let pending = PendingRequests::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = seen.clone();
        let _rx = pending.insert(
            "r1".into(),
            Some(Arc::new(move |p: TransferProgress| {
                seen_cb.store(p.transferred, Ordering::Relaxed);
            })),
        );
        pending.progress("r1", 512, 1024);
        assert_eq!(seen.load(Ordering::Relaxed), 512);
    }

    #[test]
    fn progress_without_callback_is_noop() {
        let pending = PendingRequests::new();
        let _rx = pending.insert("r1".into(), None);
        pending.progress("r1", 1, 2);
        pending.progress("ghost", 1, 2);
    }

    #[test]
    fn forget_drops_slot() {
        let pending = PendingRequests::new();
        let _rx = pending.insert("r1".into(), None);
        pending.forget("r1");
        assert!(pending.is_empty());
    }
}
