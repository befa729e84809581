//! Chunked upload staging.
//!
//! Control flows over ordinary requests (`upload.hash`, `upload.open`,
//! `upload.commit`); data arrives as binary frames parsed by
//! [`relay_wire::parse_upload_frame`]. Chunks are staged into a
//! `<path>.part` file and renamed into place atomically on commit, so a
//! dropped connection never leaves a half-written file at the target path.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use metrics::counter;
use relay_core::ids::{ConnectionId, UploadId};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, warn};

use crate::metrics::{UPLOAD_BYTES_TOTAL, UPLOADS_COMMITTED_TOTAL};

/// Why an upload operation failed.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// No open upload with that ID on this connection.
    #[error("unknown upload id")]
    NotFound,

    /// A chunk would write past the declared size.
    #[error("chunk at offset {offset} overruns declared size {expected}")]
    Overflow {
        /// Offset of the offending chunk.
        offset: u64,
        /// Declared total size.
        expected: u64,
    },

    /// Commit requested before every byte arrived.
    #[error("upload incomplete: {written} of {expected} bytes written")]
    Incomplete {
        /// Bytes written so far.
        written: u64,
        /// Declared total size.
        expected: u64,
    },

    /// Filesystem failure.
    #[error("upload io error: {0}")]
    Io(#[from] std::io::Error),
}

struct UploadState {
    target_path: PathBuf,
    part_path: PathBuf,
    expected_length: u64,
    written: u64,
}

/// In-flight uploads, keyed by `(connection, upload id)` so one client can
/// never write into another's transfer.
pub struct UploadManager {
    uploads: DashMap<(ConnectionId, UploadId), UploadState>,
}

impl UploadManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            uploads: DashMap::new(),
        }
    }

    /// SHA-256 of the file at `path` as lowercase hex, or `None` if the
    /// file does not exist or cannot be read.
    pub async fn hash_of(path: &Path) -> Option<String> {
        let data = fs::read(path).await.ok()?;
        Some(sha256_hex(&data))
    }

    /// Open an upload: create parent directories and a truncated staging
    /// file, and hand back the upload ID for subsequent data frames.
    pub async fn open(
        &self,
        connection: &ConnectionId,
        target_path: PathBuf,
        expected_length: u64,
    ) -> Result<UploadId, UploadError> {
        if let Some(parent) = target_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let part_path = part_path_for(&target_path);
        let _ = fs::File::create(&part_path).await?;

        let id = UploadId::new();
        debug!(upload_id = %id, path = %target_path.display(), expected_length, "upload opened");
        let _ = self.uploads.insert(
            (connection.clone(), id.clone()),
            UploadState {
                target_path,
                part_path,
                expected_length,
                written: 0,
            },
        );
        Ok(id)
    }

    /// Write one chunk at its declared offset. Returns total bytes written.
    pub async fn write_chunk(
        &self,
        connection: &ConnectionId,
        id: &UploadId,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, UploadError> {
        let key = (connection.clone(), id.clone());
        let (part_path, expected) = {
            let state = self.uploads.get(&key).ok_or(UploadError::NotFound)?;
            (state.part_path.clone(), state.expected_length)
        };

        let end = offset.saturating_add(data.len() as u64);
        if end > expected {
            // Protocol violation: abort the transfer and clean up staging.
            if let Some((_, state)) = self.uploads.remove(&key) {
                let _ = fs::remove_file(&state.part_path).await;
            }
            return Err(UploadError::Overflow { offset, expected });
        }

        let mut file = fs::OpenOptions::new().write(true).open(&part_path).await?;
        let _ = file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        counter!(UPLOAD_BYTES_TOTAL).increment(data.len() as u64);

        let mut state = self.uploads.get_mut(&key).ok_or(UploadError::NotFound)?;
        state.written = state.written.max(end);
        Ok(state.written)
    }

    /// Verify completeness and atomically move the staging file into place.
    pub async fn commit(
        &self,
        connection: &ConnectionId,
        id: &UploadId,
    ) -> Result<PathBuf, UploadError> {
        let key = (connection.clone(), id.clone());
        {
            let state = self.uploads.get(&key).ok_or(UploadError::NotFound)?;
            if state.written != state.expected_length {
                return Err(UploadError::Incomplete {
                    written: state.written,
                    expected: state.expected_length,
                });
            }
        }
        let (_, state) = self.uploads.remove(&key).ok_or(UploadError::NotFound)?;
        fs::rename(&state.part_path, &state.target_path).await?;
        counter!(UPLOADS_COMMITTED_TOTAL).increment(1);
        debug!(upload_id = %id, path = %state.target_path.display(), "upload committed");
        Ok(state.target_path)
    }

    /// Drop every in-flight upload for a connection and delete its
    /// staging files.
    pub async fn purge_connection(&self, connection: &ConnectionId) {
        let stale: Vec<(ConnectionId, UploadId)> = self
            .uploads
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|(conn, _)| conn == connection)
            .collect();
        for key in stale {
            if let Some((_, state)) = self.uploads.remove(&key) {
                warn!(upload_id = %key.1, "discarding in-flight upload");
                let _ = fs::remove_file(&state.part_path).await;
            }
        }
    }

    /// Number of in-flight uploads across all connections.
    pub fn active_uploads(&self) -> usize {
        self.uploads.len()
    }
}

impl Default for UploadManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn part_path_for(target: &Path) -> PathBuf {
    let mut os: OsString = target.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}
