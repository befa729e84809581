//! # relay-server
//!
//! The server half of the relay transport: one multiplexed WebSocket per
//! client carries requests, responses, and pushed events. The server admits
//! connections via an identity handshake, dispatches commands to a pluggable
//! invoker, fans events out to matching listener registrations, and accepts
//! chunked file uploads over binary frames.

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod invoke;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use invoke::{AuthHook, InvokeContext, InvokeError, MethodInvoker, NullInvoker};
pub use server::{AppState, RelayServer};
pub use shutdown::ShutdownCoordinator;
