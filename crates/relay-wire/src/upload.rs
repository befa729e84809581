//! Binary data frames for the chunked upload sub-protocol.
//!
//! Upload data travels outside the request/response correlation: each binary
//! WebSocket frame is a `u32` big-endian header length, a JSON header
//! `{uploadId, offset}`, then the raw chunk bytes written at that offset.

use relay_core::ids::UploadId;
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// JSON header preceding the chunk bytes in a data frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFrameHeader {
    /// Upload this chunk belongs to.
    pub upload_id: UploadId,
    /// Byte offset the chunk is written at.
    pub offset: u64,
}

/// Encode one data frame.
pub fn encode_upload_frame(upload_id: &UploadId, offset: u64, data: &[u8]) -> Vec<u8> {
    let header = UploadFrameHeader {
        upload_id: upload_id.clone(),
        offset,
    };
    // Header serialization of two plain fields cannot fail.
    let header_bytes = serde_json::to_vec(&header).unwrap_or_default();
    let mut frame = Vec::with_capacity(4 + header_bytes.len() + data.len());
    frame.extend_from_slice(&u32::try_from(header_bytes.len()).unwrap_or(0).to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(data);
    frame
}

/// Parse one data frame into its header and chunk bytes.
pub fn parse_upload_frame(frame: &[u8]) -> Result<(UploadFrameHeader, &[u8]), WireError> {
    if frame.len() < 4 {
        return Err(WireError::InvalidUploadFrame("frame shorter than length prefix".into()));
    }
    let header_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let body_start = 4 + header_len;
    if frame.len() < body_start {
        return Err(WireError::InvalidUploadFrame(format!(
            "declared header length {header_len} exceeds frame size {}",
            frame.len()
        )));
    }
    let header: UploadFrameHeader = serde_json::from_slice(&frame[4..body_start])
        .map_err(|e| WireError::InvalidUploadFrame(format!("bad header: {e}")))?;
    Ok((header, &frame[body_start..]))
}
