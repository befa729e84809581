//! WebSocket session lifecycle — one connected client from upgrade
//! through disconnect.
//!
//! 1. Identity handshake: send `client-get-id`, wait (bounded) for
//!    `client-get-id-response`, then admit the connection and send
//!    `connected`.
//! 2. Dispatch incoming requests (including reassembled split requests)
//!    and forward responses, events, and pings via the send channel.
//! 3. Evict clients that miss a full heartbeat cycle.
//! 4. Clean up registry, split, and upload state on disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use relay_core::codes;
use relay_core::ids::{ClientId, ConnectionId};
use relay_wire::{
    ErrorBody, SplitAccumulator, WireMessage, decode_frame, encode_frame, parse_upload_frame,
    split_response_frames,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::invoke::{AuthHook, MethodInvoker};
use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
    WS_HEARTBEAT_EVICTIONS_TOTAL,
};

use super::connection::Connection;
use super::dispatch::{DispatchContext, handle_request};
use super::registry::SessionRegistry;
use super::upload::UploadManager;

/// Shared collaborators for every session.
pub struct SessionDeps {
    /// Admitted connections.
    pub registry: Arc<SessionRegistry>,
    /// Reassembly state for split requests.
    pub accumulator: Arc<SplitAccumulator>,
    /// Upload staging.
    pub uploads: Arc<UploadManager>,
    /// Application command target.
    pub invoker: Arc<dyn MethodInvoker>,
    /// Optional auth hook.
    pub auth: Option<Arc<dyn AuthHook>>,
    /// Server configuration.
    pub config: ServerConfig,
}

/// Run a WebSocket session for one upgraded socket.
#[instrument(skip_all, fields(connection_id))]
pub async fn run_session(ws: WebSocket, deps: Arc<SessionDeps>, shutdown: CancellationToken) {
    let connection_id = ConnectionId::new();
    tracing::Span::current().record("connection_id", connection_id.as_str());

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Identity handshake, bounded by the configured timeout.
    let handshake_frame = match encode_frame(&WireMessage::ClientGetId) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "failed to encode handshake frame");
            return;
        }
    };
    if ws_tx.send(Message::Text(handshake_frame.into())).await.is_err() {
        return;
    }
    let handshake_timeout = Duration::from_millis(deps.config.handshake_timeout_ms);
    let Some(client_id) = await_client_id(&mut ws_rx, handshake_timeout).await else {
        info!("handshake failed, closing socket");
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    };

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(1024);
    let connection = Arc::new(Connection::new(connection_id.clone(), send_tx));
    connection.bind_client(client_id.clone());

    let connection_start = std::time::Instant::now();
    info!(client_id = %client_id, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    // Admission may evict a stale connection holding the same identity.
    let _ = deps.registry.admit(connection.clone()).await;

    if let Ok(frame) = encode_frame(&WireMessage::Connected) {
        let _ = ws_tx.send(Message::Text(frame.into())).await;
    }

    // Outbound forwarder with periodic Ping frames and heartbeat eviction.
    let cancel = connection.cancel_token();
    let outbound_conn = connection.clone();
    let outbound_cancel = cancel.clone();
    let outbound_shutdown = shutdown.clone();
    let ping_every = Duration::from_millis(deps.config.heartbeat_interval_ms);
    let outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    match msg {
                        Some(frame) => {
                            if ws_tx.send(Message::Text(frame.as_str().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    // Evict a client that stayed silent for a whole cycle.
                    if !outbound_conn.check_alive() {
                        warn!("client missed a heartbeat cycle, disconnecting");
                        counter!(WS_HEARTBEAT_EVICTIONS_TOTAL).increment(1);
                        outbound_conn.terminate();
                        break;
                    }
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                () = outbound_cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                () = outbound_shutdown.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Inbound loop. Terminates on socket close, session cancellation
    // (takeover, heartbeat eviction), or server shutdown.
    let ctx = DispatchContext {
        connection: connection.clone(),
        registry: deps.registry.clone(),
        uploads: deps.uploads.clone(),
        invoker: deps.invoker.clone(),
        auth: deps.auth.clone(),
        production: deps.config.production,
    };
    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = cancel.cancelled() => break,
            () = shutdown.cancelled() => break,
        };
        let Some(Ok(msg)) = msg else { break };
        connection.mark_alive();

        match msg {
            Message::Text(text) => {
                handle_text_frame(text.as_str(), &deps, &ctx).await;
            }
            Message::Binary(data) => {
                handle_data_frame(&data, &deps, &connection.id).await;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                info!("client sent close frame");
                break;
            }
        }
    }

    // Clean up
    info!(client_id = %client_id, dropped = connection.drop_count(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(connection_start.elapsed().as_secs_f64());
    connection.terminate();
    outbound.abort();
    deps.registry.remove(&connection.id).await;
    deps.accumulator.purge_connection(&connection.id);
    deps.uploads.purge_connection(&connection.id).await;
}

/// Read frames until the client declares its identity.
///
/// Any first protocol frame other than `client-get-id-response` fails the
/// handshake, as does the timeout.
async fn await_client_id<S>(ws_rx: &mut S, timeout: Duration) -> Option<ClientId>
where
    S: StreamExt<Item = Result<Message, axum::Error>> + Unpin,
{
    let wait = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let text = match msg {
                Message::Text(t) => t,
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => return None,
            };
            return match decode_frame(text.as_str()) {
                Ok(WireMessage::ClientGetIdResponse { body }) => Some(ClientId::from(body)),
                Ok(other) => {
                    warn!(kind = other.kind(), "unexpected frame during handshake");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "undecodable frame during handshake");
                    None
                }
            };
        }
        None
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}

/// Handle one inbound protocol frame.
async fn handle_text_frame(text: &str, deps: &Arc<SessionDeps>, ctx: &DispatchContext) {
    match decode_frame(text) {
        Ok(WireMessage::Request {
            uuid,
            command,
            params,
        }) => {
            let response = handle_request(&uuid, &command, params, ctx).await;
            send_response(deps, ctx, &uuid, &response).await;
        }
        Ok(WireMessage::RequestSplit {
            uuid,
            index,
            full_size,
            body,
        }) => match deps
            .accumulator
            .push(&ctx.connection.id, &uuid, full_size, index, &body)
        {
            Ok(progress) => {
                if let Some(full_text) = progress.full_text {
                    handle_reassembled(&full_text, &uuid, deps, ctx).await;
                }
            }
            Err(e) => {
                warn!(error = %e, uuid, "split request aborted");
                let error = WireMessage::response_error(
                    &uuid,
                    ErrorBody::new(codes::PROTOCOL_ERROR, e.to_string()),
                );
                let _ = ctx.connection.send_message_awaiting(&error).await;
            }
        },
        // Late or duplicate handshake answer; identity is already bound.
        Ok(WireMessage::ClientGetIdResponse { .. }) => {
            debug!("duplicate client-get-id-response ignored");
        }
        // Kinds only the server sends; a client echoing them is noise.
        Ok(other) => {
            debug!(kind = other.kind(), "ignoring server-only frame from client");
        }
        Err(e) => {
            warn!(error = %e, "undecodable frame");
            let error = WireMessage::response_error(
                "unknown",
                ErrorBody::new(codes::PROTOCOL_ERROR, e.to_string()),
            );
            let _ = ctx.connection.send_message_awaiting(&error).await;
        }
    }
}

/// Dispatch a request reassembled from split frames.
async fn handle_reassembled(
    full_text: &str,
    transfer_uuid: &str,
    deps: &Arc<SessionDeps>,
    ctx: &DispatchContext,
) {
    match decode_frame(full_text) {
        Ok(WireMessage::Request {
            uuid,
            command,
            params,
        }) => {
            let response = handle_request(&uuid, &command, params, ctx).await;
            send_response(deps, ctx, &uuid, &response).await;
        }
        Ok(other) => {
            warn!(kind = other.kind(), "split transfer did not contain a request");
            let error = WireMessage::response_error(
                transfer_uuid,
                ErrorBody::new(codes::PROTOCOL_ERROR, "split transfer must carry a request"),
            );
            let _ = ctx.connection.send_message_awaiting(&error).await;
        }
        Err(e) => {
            warn!(error = %e, "reassembled request undecodable");
            let error = WireMessage::response_error(
                transfer_uuid,
                ErrorBody::new(codes::PROTOCOL_ERROR, e.to_string()),
            );
            let _ = ctx.connection.send_message_awaiting(&error).await;
        }
    }
}

/// Handle one binary upload data frame.
async fn handle_data_frame(data: &[u8], deps: &Arc<SessionDeps>, connection_id: &ConnectionId) {
    let (header, chunk) = match parse_upload_frame(data) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, len = data.len(), "bad upload data frame");
            return;
        }
    };
    if let Err(e) = deps
        .uploads
        .write_chunk(connection_id, &header.upload_id, header.offset, chunk)
        .await
    {
        // Surfaced to the client again at commit time.
        warn!(error = %e, upload_id = %header.upload_id, "upload chunk rejected");
    }
}

/// Send a response, splitting it when it exceeds the threshold.
///
/// Responses take the awaiting send path: under outbound backpressure
/// the dispatcher waits for channel capacity rather than dropping
/// chunks, which would strand the correlated request on the peer.
async fn send_response(
    deps: &Arc<SessionDeps>,
    ctx: &DispatchContext,
    req_uuid: &str,
    response: &WireMessage,
) {
    let Ok(serialized) = encode_frame(response) else {
        warn!(req_uuid, "failed to serialize response");
        return;
    };
    if serialized.len() <= deps.config.effective_split_threshold() {
        if !ctx.connection.send_awaiting(Arc::new(serialized)).await {
            debug!(req_uuid, "session ended before the response was sent");
        }
        return;
    }
    for frame in split_response_frames(req_uuid, &serialized, deps.config.chunk_size) {
        if !ctx.connection.send_message_awaiting(&frame).await {
            debug!(req_uuid, "session ended mid split response");
            return;
        }
    }
}
