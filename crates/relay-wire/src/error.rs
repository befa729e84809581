//! Wire-level error type.

/// Errors raised while encoding, decoding, or reassembling frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Frame is not valid JSON or does not match any message kind.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    /// A value envelope carried a `__type__` tag outside the supported set.
    #[error("unrecognized value envelope tag '{0}'")]
    UnknownEnvelopeTag(String),

    /// A recognized envelope carried malformed `data`.
    #[error("malformed value envelope: {0}")]
    InvalidEnvelope(String),

    /// Chunks of the same transfer declared different full sizes.
    #[error("split transfer size mismatch: expected {expected}, got {got}")]
    SizeMismatch {
        /// Size declared by the first chunk.
        expected: u64,
        /// Conflicting size declared by a later chunk.
        got: u64,
    },

    /// Binary upload data frame failed to parse.
    #[error("invalid upload frame: {0}")]
    InvalidUploadFrame(String),

    /// Accumulated bytes exceeded the declared full size.
    #[error("split transfer overflow: {received} bytes received for declared size {full_size}")]
    TransferOverflow {
        /// Bytes accumulated so far.
        received: u64,
        /// Size declared for the transfer.
        full_size: u64,
    },
}
