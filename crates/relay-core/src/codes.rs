//! Machine-readable error codes carried in error response bodies.

/// Command string matched neither a built-in nor a `service.method` pattern.
pub const BAD_COMMAND: &str = "BAD_COMMAND";
/// Method invocation threw; the connection stays open.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Malformed frame, fullSize mismatch, or other wire-level violation.
pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
/// Request issued or resolved while the socket is down.
pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
/// Auth token replay rejected by the host hook.
pub const AUTH_FAILED: &str = "AUTH_FAILED";
/// Upload control or data frame failed.
pub const UPLOAD_ERROR: &str = "UPLOAD_ERROR";
