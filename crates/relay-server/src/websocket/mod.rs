//! WebSocket transport: per-connection state, the session registry,
//! command dispatch, upload staging, and the session lifecycle.

pub mod connection;
pub mod dispatch;
pub mod registry;
pub mod session;
pub mod upload;
