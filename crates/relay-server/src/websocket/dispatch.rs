//! Command dispatch: built-in commands plus the pluggable invoker.
//!
//! Every request resolves to exactly one response frame carrying the
//! request's correlation id. Failures become typed error responses; the
//! connection itself stays open.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use relay_core::codes;
use relay_core::ids::{ClientId, ListenerKey};
use relay_wire::{ErrorBody, WireMessage};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::invoke::{AuthHook, InvokeContext, InvokeError, MethodInvoker};
use crate::metrics::{RPC_ERRORS_TOTAL, RPC_REQUESTS_TOTAL, RPC_REQUEST_DURATION_SECONDS};

use super::connection::{Connection, ListenerRegistration};
use super::registry::SessionRegistry;
use super::upload::{UploadError, UploadManager};

/// Everything a request needs to be dispatched.
pub struct DispatchContext {
    /// The connection the request arrived on.
    pub connection: Arc<Connection>,
    /// Registry for listener commands.
    pub registry: Arc<SessionRegistry>,
    /// Upload staging for `upload.*` commands.
    pub uploads: Arc<UploadManager>,
    /// Application command target.
    pub invoker: Arc<dyn MethodInvoker>,
    /// Optional auth hook behind `auth.resume`.
    pub auth: Option<Arc<dyn AuthHook>>,
    /// Whether error responses omit diagnostic detail.
    pub production: bool,
}

impl DispatchContext {
    fn invoke_context(&self) -> InvokeContext {
        InvokeContext {
            connection_id: self.connection.id.clone(),
            client_id: self.connection.client_id().unwrap_or_else(ClientId::new),
        }
    }
}

/// Dispatch one request and build its response frame.
pub async fn handle_request(
    uuid: &str,
    command: &str,
    params: Vec<Value>,
    ctx: &DispatchContext,
) -> WireMessage {
    let started = Instant::now();
    counter!(RPC_REQUESTS_TOTAL, "command" => command.to_owned()).increment(1);

    let result = route(command, params, ctx).await;
    histogram!(RPC_REQUEST_DURATION_SECONDS, "command" => command.to_owned())
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(body) => WireMessage::response_success(uuid, body),
        Err(error) => {
            counter!(
                RPC_ERRORS_TOTAL,
                "command" => command.to_owned(),
                "code" => error.code.clone()
            )
            .increment(1);
            debug!(command, code = %error.code, "request failed");
            WireMessage::response_error(uuid, error)
        }
    }
}

async fn route(
    command: &str,
    params: Vec<Value>,
    ctx: &DispatchContext,
) -> Result<Value, ErrorBody> {
    match command {
        "listener.register" => listener_register(params, ctx),
        "listener.unregister" => listener_unregister(params, ctx),
        "listener.list" => listener_list(params, ctx),
        "listener.emit" => listener_emit(params, ctx).await,
        "auth.resume" => auth_resume(params, ctx).await,
        "upload.hash" => upload_hash(params).await,
        "upload.open" => upload_open(params, ctx).await,
        "upload.commit" => upload_commit(params, ctx).await,
        other => invoke_app(other, params, ctx).await,
    }
}

// ── Built-in: listeners ─────────────────────────────────────────────

fn listener_register(params: Vec<Value>, ctx: &DispatchContext) -> Result<Value, ErrorBody> {
    let key = string_param(&params, 0, "key")?;
    let event_name = string_param(&params, 1, "eventName")?;
    let filter_info = params.get(2).cloned().unwrap_or(Value::Null);
    ctx.connection.add_listener(ListenerRegistration {
        key: ListenerKey::from(key.as_str()),
        event_name,
        filter_info,
    });
    Ok(json!(key))
}

fn listener_unregister(params: Vec<Value>, ctx: &DispatchContext) -> Result<Value, ErrorBody> {
    let key = string_param(&params, 0, "key")?;
    let removed = ctx.connection.remove_listener(&ListenerKey::from(key.as_str()));
    Ok(json!(removed))
}

fn listener_list(params: Vec<Value>, ctx: &DispatchContext) -> Result<Value, ErrorBody> {
    let event_name = string_param(&params, 0, "eventName")?;
    let registrations = ctx.connection.listeners_for(&event_name);
    serde_json::to_value(registrations)
        .map_err(|e| internal_error(format!("serialize registrations: {e}"), ctx.production))
}

async fn listener_emit(params: Vec<Value>, ctx: &DispatchContext) -> Result<Value, ErrorBody> {
    let keys = params
        .first()
        .and_then(Value::as_array)
        .ok_or_else(|| protocol_error("param 0 'keys' must be an array"))?;
    let keys: Vec<ListenerKey> = keys
        .iter()
        .map(|k| {
            k.as_str()
                .map(ListenerKey::from)
                .ok_or_else(|| protocol_error("listener keys must be strings"))
        })
        .collect::<Result<_, _>>()?;
    let body = params.get(1).cloned().unwrap_or(Value::Null);
    let delivered = ctx.registry.deliver_to_keys(&keys, &body).await;
    Ok(json!(delivered))
}

// ── Built-in: auth ──────────────────────────────────────────────────

async fn auth_resume(params: Vec<Value>, ctx: &DispatchContext) -> Result<Value, ErrorBody> {
    let token = string_param(&params, 0, "token")?;
    match &ctx.auth {
        // No hook installed: the transport does not interpret tokens.
        None => Ok(json!(true)),
        Some(hook) => {
            if hook.verify(&token, &ctx.invoke_context()).await {
                Ok(json!(true))
            } else {
                warn!(connection_id = %ctx.connection.id, "auth token rejected");
                Err(ErrorBody::new(codes::AUTH_FAILED, "auth token rejected"))
            }
        }
    }
}

// ── Built-in: uploads ───────────────────────────────────────────────

async fn upload_hash(params: Vec<Value>) -> Result<Value, ErrorBody> {
    let path = string_param(&params, 0, "path")?;
    match UploadManager::hash_of(&PathBuf::from(path)).await {
        Some(hash) => Ok(json!(hash)),
        None => Ok(Value::Null),
    }
}

async fn upload_open(params: Vec<Value>, ctx: &DispatchContext) -> Result<Value, ErrorBody> {
    let path = string_param(&params, 0, "path")?;
    let size = params
        .get(1)
        .and_then(Value::as_u64)
        .ok_or_else(|| protocol_error("param 1 'size' must be a non-negative integer"))?;
    let id = ctx
        .uploads
        .open(&ctx.connection.id, PathBuf::from(path), size)
        .await
        .map_err(|e| upload_error(&e, ctx.production))?;
    Ok(json!(id.as_str()))
}

async fn upload_commit(params: Vec<Value>, ctx: &DispatchContext) -> Result<Value, ErrorBody> {
    let id = string_param(&params, 0, "uploadId")?;
    let path = ctx
        .uploads
        .commit(&ctx.connection.id, &relay_core::ids::UploadId::from(id.as_str()))
        .await
        .map_err(|e| upload_error(&e, ctx.production))?;
    Ok(json!(path.display().to_string()))
}

// ── Application commands ────────────────────────────────────────────

async fn invoke_app(
    command: &str,
    params: Vec<Value>,
    ctx: &DispatchContext,
) -> Result<Value, ErrorBody> {
    let Some((service, method)) = command.split_once('.') else {
        return Err(ErrorBody::new(
            codes::BAD_COMMAND,
            format!("malformed command '{command}'"),
        ));
    };
    if service.is_empty() || method.is_empty() {
        return Err(ErrorBody::new(
            codes::BAD_COMMAND,
            format!("malformed command '{command}'"),
        ));
    }

    ctx.invoker
        .invoke(service, method, params, &ctx.invoke_context())
        .await
        .map_err(|e| match e {
            InvokeError::UnknownCommand { command } => {
                ErrorBody::new(codes::BAD_COMMAND, format!("unknown command '{command}'"))
            }
            InvokeError::Failed { message, detail } => {
                let body = ErrorBody::new(codes::INTERNAL_ERROR, message);
                match detail {
                    Some(detail) if !ctx.production => body.with_stack(detail),
                    _ => body,
                }
            }
        })
}

// ── Error shaping ───────────────────────────────────────────────────

fn string_param(params: &[Value], index: usize, name: &str) -> Result<String, ErrorBody> {
    params
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| protocol_error(&format!("param {index} '{name}' must be a string")))
}

fn protocol_error(message: &str) -> ErrorBody {
    ErrorBody::new(codes::PROTOCOL_ERROR, message)
}

fn internal_error(message: String, production: bool) -> ErrorBody {
    let body = ErrorBody::new(codes::INTERNAL_ERROR, "internal error");
    if production { body } else { body.with_stack(message) }
}

fn upload_error(error: &UploadError, production: bool) -> ErrorBody {
    let body = ErrorBody::new(codes::UPLOAD_ERROR, error.to_string());
    if production {
        body
    } else {
        body.with_stack(format!("{error:?}"))
    }
}
