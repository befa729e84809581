//! Pluggable command invocation.
//!
//! Commands of the form `serviceName.methodName` that are not built-ins are
//! handed to a [`MethodInvoker`]. The transport owns correlation, framing,
//! and error shaping; the invoker owns application semantics.

use async_trait::async_trait;
use relay_core::ids::{ClientId, ConnectionId};
use serde_json::Value;

/// Call-site context passed to the invoker with every command.
#[derive(Clone, Debug)]
pub struct InvokeContext {
    /// The physical connection the request arrived on.
    pub connection_id: ConnectionId,
    /// The client identity declared at handshake.
    pub client_id: ClientId,
}

/// Why a command invocation failed.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The service or method does not exist.
    #[error("unknown command '{command}'")]
    UnknownCommand {
        /// The command as received.
        command: String,
    },

    /// The command exists but failed.
    #[error("{message}")]
    Failed {
        /// Human-readable failure message.
        message: String,
        /// Diagnostic detail, surfaced to clients only outside production.
        detail: Option<String>,
    },
}

impl InvokeError {
    /// Build a plain failure without diagnostic detail.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            detail: None,
        }
    }
}

/// Application-defined command dispatch target.
#[async_trait]
pub trait MethodInvoker: Send + Sync {
    /// Invoke `service.method` with positional params.
    async fn invoke(
        &self,
        service: &str,
        method: &str,
        params: Vec<Value>,
        ctx: &InvokeContext,
    ) -> Result<Value, InvokeError>;
}

/// Authentication hook consulted by `auth.resume`.
///
/// The transport never interprets tokens; it only replays them here.
#[async_trait]
pub trait AuthHook: Send + Sync {
    /// Return `true` if the token identifies a valid principal.
    async fn verify(&self, token: &str, ctx: &InvokeContext) -> bool;
}

/// Invoker that knows no commands. Useful for transport-only deployments
/// and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullInvoker;

#[async_trait]
impl MethodInvoker for NullInvoker {
    async fn invoke(
        &self,
        service: &str,
        method: &str,
        _params: Vec<Value>,
        _ctx: &InvokeContext,
    ) -> Result<Value, InvokeError> {
        Err(InvokeError::UnknownCommand {
            command: format!("{service}.{method}"),
        })
    }
}
