//! Reassembly of messages sent as ordered chunk sequences.
//!
//! Transfers are keyed by `(connection, message id)`. Chunks may arrive in
//! any order; completion is recognized exactly when the accumulated byte
//! length equals the declared full size, at which point chunks are
//! concatenated strictly by index and the transfer state is deleted
//! (at-most-once reassembly). Distinct transfer ids never contend.

use std::collections::BTreeMap;

use dashmap::DashMap;
use relay_core::ids::ConnectionId;

use crate::error::WireError;
use crate::message::WireMessage;

/// Progress report returned by [`SplitAccumulator::push`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitProgress {
    /// Total bytes received so far (for progress reporting only).
    pub completed_size: u64,
    /// Whether the transfer completed with this chunk.
    pub is_completed: bool,
    /// The reassembled text, present exactly once on completion.
    pub full_text: Option<String>,
}

struct Transfer {
    full_size: u64,
    received: u64,
    chunks: BTreeMap<u64, String>,
}

enum Outcome {
    Progress(u64),
    Complete,
    Mismatch(u64),
    Overflow(u64),
}

/// Per-transfer chunk accumulator shared by one endpoint.
#[derive(Default)]
pub struct SplitAccumulator {
    transfers: DashMap<(ConnectionId, String), Transfer>,
}

impl SplitAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self {
            transfers: DashMap::new(),
        }
    }

    /// Record one chunk of a transfer.
    ///
    /// A full-size mismatch or an overflow past the declared size is a
    /// protocol violation: the transfer is aborted and its partial state
    /// purged so a misbehaving peer cannot grow memory unboundedly.
    pub fn push(
        &self,
        connection: &ConnectionId,
        message_id: &str,
        full_size: u64,
        index: u64,
        chunk: &str,
    ) -> Result<SplitProgress, WireError> {
        let key = (connection.clone(), message_id.to_owned());

        let outcome = {
            let mut entry = self.transfers.entry(key.clone()).or_insert_with(|| Transfer {
                full_size,
                received: 0,
                chunks: BTreeMap::new(),
            });
            let transfer = entry.value_mut();
            if transfer.full_size != full_size {
                Outcome::Mismatch(transfer.full_size)
            } else {
                // Replacing a duplicate index must not double-count bytes.
                if let Some(old) = transfer.chunks.insert(index, chunk.to_owned()) {
                    transfer.received -= old.len() as u64;
                }
                transfer.received += chunk.len() as u64;
                if transfer.received > transfer.full_size {
                    Outcome::Overflow(transfer.received)
                } else if transfer.received == transfer.full_size {
                    Outcome::Complete
                } else {
                    Outcome::Progress(transfer.received)
                }
            }
        };

        match outcome {
            Outcome::Progress(received) => Ok(SplitProgress {
                completed_size: received,
                is_completed: false,
                full_text: None,
            }),
            Outcome::Complete => {
                let Some((_, transfer)) = self.transfers.remove(&key) else {
                    // Raced with a purge; treat as an abandoned transfer.
                    return Ok(SplitProgress {
                        completed_size: 0,
                        is_completed: false,
                        full_text: None,
                    });
                };
                let mut full_text = String::with_capacity(transfer.received as usize);
                for piece in transfer.chunks.values() {
                    full_text.push_str(piece);
                }
                Ok(SplitProgress {
                    completed_size: transfer.received,
                    is_completed: true,
                    full_text: Some(full_text),
                })
            }
            Outcome::Mismatch(expected) => {
                let _ = self.transfers.remove(&key);
                Err(WireError::SizeMismatch {
                    expected,
                    got: full_size,
                })
            }
            Outcome::Overflow(received) => {
                let _ = self.transfers.remove(&key);
                Err(WireError::TransferOverflow {
                    received,
                    full_size,
                })
            }
        }
    }

    /// Drop every in-flight transfer owned by a connection.
    pub fn purge_connection(&self, connection: &ConnectionId) {
        self.transfers.retain(|(owner, _), _| owner != connection);
    }

    /// Number of in-flight transfers (all connections).
    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }
}

// ── Chunking helpers (sending side) ─────────────────────────────────

/// Split text into chunks of at most `chunk_size` bytes on char boundaries.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = chunk_size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            // A single char wider than chunk_size still goes out whole.
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        chunks.push(rest[..end].to_owned());
        rest = &rest[end..];
    }
    chunks
}

/// Build the `request-split` frame sequence for a serialized request.
pub fn split_request_frames(uuid: &str, serialized: &str, chunk_size: usize) -> Vec<WireMessage> {
    chunk_text(serialized, chunk_size)
        .into_iter()
        .enumerate()
        .map(|(index, body)| WireMessage::RequestSplit {
            uuid: uuid.to_owned(),
            index: index as u64,
            full_size: serialized.len() as u64,
            body,
        })
        .collect()
}

/// Build the `response-split` frame sequence for a serialized response.
pub fn split_response_frames(
    req_uuid: &str,
    serialized: &str,
    chunk_size: usize,
) -> Vec<WireMessage> {
    chunk_text(serialized, chunk_size)
        .into_iter()
        .enumerate()
        .map(|(index, body)| WireMessage::ResponseSplit {
            req_uuid: req_uuid.to_owned(),
            full_size: serialized.len() as u64,
            index: index as u64,
            body,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    fn push_all(
        acc: &SplitAccumulator,
        connection: &ConnectionId,
        id: &str,
        full: &str,
        order: &[usize],
        chunk_size: usize,
    ) -> Option<String> {
        let chunks = chunk_text(full, chunk_size);
        let mut result = None;
        for &i in order {
            let progress = acc
                .push(connection, id, full.len() as u64, i as u64, &chunks[i])
                .unwrap();
            if progress.is_completed {
                result = progress.full_text;
            }
        }
        result
    }

    #[test]
    fn in_order_reassembly() {
        let acc = SplitAccumulator::new();
        let text = "abcdefghij";
        let out = push_all(&acc, &conn("c1"), "m1", text, &[0, 1, 2, 3, 4], 2);
        assert_eq!(out.as_deref(), Some(text));
        assert_eq!(acc.active_transfers(), 0);
    }

    #[test]
    fn reversed_order_reassembly() {
        let acc = SplitAccumulator::new();
        let text = "the quick brown fox jumps over";
        let n = chunk_text(text, 7).len();
        let order: Vec<usize> = (0..n).rev().collect();
        let out = push_all(&acc, &conn("c1"), "m1", text, &order, 7);
        assert_eq!(out.as_deref(), Some(text));
    }

    #[test]
    fn interleaved_transfer_ids_are_independent() {
        let acc = SplitAccumulator::new();
        let c = conn("c1");
        let a = "aaaaaaaa";
        let b = "bbbbbbbbbbbb";
        let a_chunks = chunk_text(a, 4);
        let b_chunks = chunk_text(b, 4);

        let p = acc.push(&c, "a", a.len() as u64, 0, &a_chunks[0]).unwrap();
        assert!(!p.is_completed);
        let p = acc.push(&c, "b", b.len() as u64, 2, &b_chunks[2]).unwrap();
        assert!(!p.is_completed);
        let p = acc.push(&c, "a", a.len() as u64, 1, &a_chunks[1]).unwrap();
        assert_eq!(p.full_text.as_deref(), Some(a));
        let p = acc.push(&c, "b", b.len() as u64, 0, &b_chunks[0]).unwrap();
        assert!(!p.is_completed);
        let p = acc.push(&c, "b", b.len() as u64, 1, &b_chunks[1]).unwrap();
        assert_eq!(p.full_text.as_deref(), Some(b));
    }

    #[test]
    fn same_message_id_on_different_connections_is_independent() {
        let acc = SplitAccumulator::new();
        let text = "payload!";
        let chunks = chunk_text(text, 4);
        let p1 = acc.push(&conn("c1"), "m", 8, 0, &chunks[0]).unwrap();
        let p2 = acc.push(&conn("c2"), "m", 8, 0, &chunks[0]).unwrap();
        assert!(!p1.is_completed);
        assert!(!p2.is_completed);
        assert_eq!(acc.active_transfers(), 2);
    }

    #[test]
    fn completed_size_tracks_received_bytes() {
        let acc = SplitAccumulator::new();
        let c = conn("c1");
        let p = acc.push(&c, "m", 10, 1, "67890").unwrap();
        assert_eq!(p.completed_size, 5);
        let p = acc.push(&c, "m", 10, 0, "12345").unwrap();
        assert_eq!(p.completed_size, 10);
        assert_eq!(p.full_text.as_deref(), Some("1234567890"));
    }

    #[test]
    fn duplicate_index_does_not_double_count() {
        let acc = SplitAccumulator::new();
        let c = conn("c1");
        let p = acc.push(&c, "m", 10, 0, "12345").unwrap();
        assert_eq!(p.completed_size, 5);
        let p = acc.push(&c, "m", 10, 0, "12345").unwrap();
        assert_eq!(p.completed_size, 5);
        assert!(!p.is_completed);
    }

    #[test]
    fn full_size_mismatch_aborts_and_purges() {
        let acc = SplitAccumulator::new();
        let c = conn("c1");
        let _ = acc.push(&c, "m", 10, 0, "12345").unwrap();
        let err = acc.push(&c, "m", 12, 1, "67890").unwrap_err();
        assert_matches!(err, WireError::SizeMismatch { expected: 10, got: 12 });
        assert_eq!(acc.active_transfers(), 0);

        // The next push starts a fresh transfer, never appending stale data.
        let p = acc.push(&c, "m", 4, 0, "abcd").unwrap();
        assert_eq!(p.full_text.as_deref(), Some("abcd"));
    }

    #[test]
    fn overflow_aborts_and_purges() {
        let acc = SplitAccumulator::new();
        let c = conn("c1");
        let _ = acc.push(&c, "m", 6, 0, "1234").unwrap();
        let err = acc.push(&c, "m", 6, 1, "56789").unwrap_err();
        assert_matches!(err, WireError::TransferOverflow { received: 9, full_size: 6 });
        assert_eq!(acc.active_transfers(), 0);
    }

    #[test]
    fn push_after_completion_starts_fresh() {
        let acc = SplitAccumulator::new();
        let c = conn("c1");
        let p = acc.push(&c, "m", 2, 0, "ok").unwrap();
        assert!(p.is_completed);
        // Same id again: a brand-new transfer, not an append to stale data.
        let p = acc.push(&c, "m", 4, 0, "ab").unwrap();
        assert!(!p.is_completed);
        assert_eq!(p.completed_size, 2);
    }

    #[test]
    fn purge_connection_drops_only_that_connections_transfers() {
        let acc = SplitAccumulator::new();
        let _ = acc.push(&conn("c1"), "m1", 10, 0, "x").unwrap();
        let _ = acc.push(&conn("c1"), "m2", 10, 0, "x").unwrap();
        let _ = acc.push(&conn("c2"), "m1", 10, 0, "x").unwrap();
        acc.purge_connection(&conn("c1"));
        assert_eq!(acc.active_transfers(), 1);
    }

    // ── Chunking ────────────────────────────────────────────────────

    #[test]
    fn chunk_text_covers_input_exactly() {
        let text = "hello world, hello world";
        let chunks = chunk_text(text, 5);
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().all(|c| c.len() <= 5));
    }

    #[test]
    fn chunk_text_respects_char_boundaries() {
        let text = "héllo wörld ünïcode"; // multibyte chars
        let chunks = chunk_text(text, 3);
        assert_eq!(chunks.concat(), text);
        for c in &chunks {
            assert!(std::str::from_utf8(c.as_bytes()).is_ok());
        }
    }

    #[test]
    fn chunk_text_handles_empty_input() {
        assert!(chunk_text("", 8).is_empty());
    }

    #[test]
    fn request_frames_are_contiguous_and_cover_payload() {
        let serialized = r#"{"name":"request","uuid":"u","command":"Echo.say","params":["hi"]}"#;
        let frames = split_request_frames("u", serialized, 16);
        let mut rebuilt = String::new();
        for (i, frame) in frames.iter().enumerate() {
            let WireMessage::RequestSplit {
                uuid,
                index,
                full_size,
                body,
            } = frame
            else {
                panic!("expected request-split, got {frame:?}");
            };
            assert_eq!(uuid, "u");
            assert_eq!(*index, i as u64);
            assert_eq!(*full_size, serialized.len() as u64);
            rebuilt.push_str(body);
        }
        assert_eq!(rebuilt, serialized);
    }

    #[test]
    fn response_frames_echo_req_uuid() {
        let frames = split_response_frames("r9", "0123456789", 4);
        assert_eq!(frames.len(), 3);
        for frame in &frames {
            assert_matches!(frame, WireMessage::ResponseSplit { req_uuid, .. } if req_uuid == "r9");
        }
    }

    // ── Property: any arrival order reassembles byte-identically ────

    proptest! {
        #[test]
        fn any_permutation_reassembles(
            text in "[a-zA-Z0-9 ]{1,200}",
            chunk_size in 1usize..16,
            seed in 0u64..1000,
        ) {
            let acc = SplitAccumulator::new();
            let c = conn("p1");
            let chunks = chunk_text(&text, chunk_size);

            // Deterministic shuffle from the seed.
            let mut order: Vec<usize> = (0..chunks.len()).collect();
            let mut state = seed.wrapping_add(1);
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state >> 33) as usize % (i + 1);
                order.swap(i, j);
            }

            let mut completed = None;
            for &i in &order {
                let progress = acc
                    .push(&c, "m", text.len() as u64, i as u64, &chunks[i])
                    .unwrap();
                if progress.is_completed {
                    completed = progress.full_text;
                }
            }
            prop_assert_eq!(completed.as_deref(), Some(text.as_str()));
            prop_assert_eq!(acc.active_transfers(), 0);
        }
    }
}
