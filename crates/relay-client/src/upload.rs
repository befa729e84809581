//! Chunked file upload with hash-based skipping.
//!
//! Control flows over ordinary requests; data goes out as binary frames.
//! Before transferring anything the client asks the server for the hash of
//! the existing file and skips the transfer entirely on a match.

use std::path::Path;

use relay_core::ids::UploadId;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::controller::ConnectionController;
use crate::error::ClientError;
use crate::pending::{ProgressFn, TransferProgress};

/// How an upload finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The server already had identical content; nothing was sent.
    Skipped,
    /// Content was transferred and committed.
    Uploaded {
        /// Bytes transferred.
        bytes: u64,
    },
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl ConnectionController {
    /// Upload a local file to a server-side path.
    ///
    /// The optional progress callback fires after each data chunk (and
    /// once, complete, when the transfer is skipped).
    pub async fn upload(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<ProgressFn>,
    ) -> Result<UploadOutcome, ClientError> {
        let data = tokio::fs::read(local).await?;
        let total = data.len() as u64;
        let local_hash = sha256_hex(&data);

        let remote_hash = self.request("upload.hash", vec![json!(remote)]).await?;
        if remote_hash.as_str() == Some(local_hash.as_str()) {
            if let Some(progress) = &progress {
                progress(TransferProgress {
                    transferred: total,
                    total,
                });
            }
            return Ok(UploadOutcome::Skipped);
        }

        let opened = self
            .request("upload.open", vec![json!(remote), json!(total)])
            .await?;
        let upload_id = opened
            .as_str()
            .map(UploadId::from)
            .ok_or_else(|| ClientError::Protocol("upload.open must return an id".into()))?;

        let chunk_size = self.inner().config.chunk_size.max(1);
        let mut sent = 0u64;
        for chunk in data.chunks(chunk_size) {
            let frame = relay_wire::encode_upload_frame(&upload_id, sent, chunk);
            self.inner().send_binary(frame).await?;
            sent += chunk.len() as u64;
            if let Some(progress) = &progress {
                progress(TransferProgress {
                    transferred: sent,
                    total,
                });
            }
        }

        let _ = self
            .request("upload.commit", vec![json!(upload_id.as_str())])
            .await?;
        Ok(UploadOutcome::Uploaded { bytes: total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sha256_hex_empty() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn outcome_equality() {
        assert_eq!(UploadOutcome::Skipped, UploadOutcome::Skipped);
        assert_ne!(
            UploadOutcome::Skipped,
            UploadOutcome::Uploaded { bytes: 1 }
        );
    }
}
