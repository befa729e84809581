//! # relay-client
//!
//! The client half of the relay transport: a [`ConnectionController`] owns
//! one WebSocket, correlates requests with responses, re-registers listeners
//! and replays the auth token after reconnecting, and uploads files in
//! binary chunks with hash-based skipping.

#![deny(unsafe_code)]

pub mod config;
pub mod controller;
pub mod error;
pub mod listeners;
pub mod pending;
pub mod state;
pub mod upload;

pub use config::ClientConfig;
pub use controller::{ConnectionController, ReloadFn};
pub use error::ClientError;
pub use listeners::ListenerFn;
pub use pending::{ProgressFn, TransferProgress};
pub use state::ConnectionState;
pub use upload::UploadOutcome;
