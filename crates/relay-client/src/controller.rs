//! The connection controller: one logical connection that survives socket
//! loss.
//!
//! A background driver task owns the physical WebSocket. It answers the
//! server's identity handshake, resolves responses against the pending
//! table, dispatches events to the listener table, and reconnects with
//! exponential backoff when the socket drops. After every reconnect it
//! replays the stored auth token and re-registers every listener, so
//! callers only observe a gap in delivery, never lost registrations.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use relay_core::codes;
use relay_core::ids::{ClientId, ConnectionId, ListenerKey};
use relay_wire::{
    ErrorBody, ResponseState, SplitAccumulator, WireMessage, decode_frame, encode_frame,
    split_request_frames,
};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::listeners::{ListenerFn, ListenerTable};
use crate::pending::{PendingRequests, ProgressFn};
use crate::state::ConnectionState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback fired when the server pushes a reload notice addressed to
/// this client (or to everyone).
pub type ReloadFn = Arc<dyn Fn(Option<String>, Vec<String>) + Send + Sync>;

enum OutFrame {
    Text(String),
    Binary(Vec<u8>),
    Pong(Vec<u8>),
}

pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    client_id: ClientId,
    pending: PendingRequests,
    listeners: ListenerTable,
    accumulator: SplitAccumulator,
    auth_token: Mutex<Option<String>>,
    reload: Mutex<Option<ReloadFn>>,
    out_tx: mpsc::Sender<OutFrame>,
    state_tx: watch::Sender<ConnectionState>,
    close: CancellationToken,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send_replace(state);
    }

    async fn send_text(&self, frame: String) -> Result<(), ClientError> {
        self.out_tx
            .send(OutFrame::Text(frame))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    pub(crate) async fn send_binary(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        self.out_tx
            .send(OutFrame::Binary(frame))
            .await
            .map_err(|_| ClientError::NotConnected)
    }
}

/// Client endpoint of the relay transport.
pub struct ConnectionController {
    inner: Arc<Inner>,
    driver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionController").finish_non_exhaustive()
    }
}

impl ConnectionController {
    /// Connect and wait until the server admits the session.
    ///
    /// Connection attempts follow the configured backoff; when every
    /// attempt fails this returns [`ClientError::RetriesExhausted`].
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let client_id = config.client_id.clone().unwrap_or_default();
        let (out_tx, out_rx) = mpsc::channel(1024);
        let (state_tx, mut state_rx) = watch::channel(ConnectionState::Connecting);

        let inner = Arc::new(Inner {
            config,
            client_id,
            pending: PendingRequests::new(),
            listeners: ListenerTable::new(),
            accumulator: SplitAccumulator::new(),
            auth_token: Mutex::new(None),
            reload: Mutex::new(None),
            out_tx,
            state_tx,
            close: CancellationToken::new(),
        });
        let driver = tokio::spawn(drive(inner.clone(), out_rx));

        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Connected => break,
                ConnectionState::Failed => {
                    return Err(ClientError::RetriesExhausted {
                        attempts: inner.config.retry.max_retries,
                    });
                }
                ConnectionState::Closed => return Err(ClientError::Closed),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(ClientError::Closed);
            }
        }

        Ok(Self {
            inner,
            driver: tokio::sync::Mutex::new(Some(driver)),
        })
    }

    /// The stable identity declared to the server.
    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Issue a command and wait for its correlated response.
    pub async fn request(&self, command: &str, params: Vec<Value>) -> Result<Value, ClientError> {
        issue_request(&self.inner, command.to_owned(), params, None).await
    }

    /// Issue a command with a per-chunk progress callback, fired for both
    /// split sending and split receiving.
    pub async fn request_with_progress(
        &self,
        command: &str,
        params: Vec<Value>,
        progress: ProgressFn,
    ) -> Result<Value, ClientError> {
        issue_request(&self.inner, command.to_owned(), params, Some(progress)).await
    }

    /// Authenticate now and store the token for replay after reconnects.
    pub async fn authenticate(&self, token: &str) -> Result<Value, ClientError> {
        *self.inner.auth_token.lock() = Some(token.to_owned());
        self.request("auth.resume", vec![json!(token)]).await
    }

    /// Store a token for replay without verifying it now.
    pub fn set_auth_token(&self, token: &str) {
        *self.inner.auth_token.lock() = Some(token.to_owned());
    }

    /// Register an event listener on the server and locally.
    ///
    /// The returned key identifies the registration for removal, and is
    /// echoed in every delivered event. Registrations survive reconnects.
    pub async fn add_listener(
        &self,
        event_name: &str,
        filter_info: Value,
        callback: ListenerFn,
    ) -> Result<ListenerKey, ClientError> {
        let key = ListenerKey::new();
        // Local first, so an event delivered immediately after the server
        // registers the key still finds its callback.
        self.inner.listeners.insert(
            key.clone(),
            event_name.to_owned(),
            filter_info.clone(),
            callback,
        );
        let params = vec![json!(key.as_str()), json!(event_name), filter_info];
        match issue_request(&self.inner, "listener.register".into(), params, None).await {
            Ok(_) => Ok(key),
            Err(e) => {
                let _ = self.inner.listeners.remove(&key);
                Err(e)
            }
        }
    }

    /// Remove a listener locally and on the server.
    pub async fn remove_listener(&self, key: &ListenerKey) -> Result<bool, ClientError> {
        let existed = self.inner.listeners.remove(key);
        let _ = self
            .request("listener.unregister", vec![json!(key.as_str())])
            .await?;
        Ok(existed)
    }

    /// Install the reload callback.
    pub fn on_reload(&self, callback: ReloadFn) {
        *self.inner.reload.lock() = Some(callback);
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Close the connection permanently and fail all in-flight requests.
    pub async fn close(&self) {
        self.inner.close.cancel();
        self.inner.pending.reject_all(|| ClientError::Closed);
        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

pub(crate) use issue::issue_request;

mod issue {
    use super::{
        Arc, ClientError, Inner, ProgressFn, Value, WireMessage, encode_frame,
        split_request_frames,
    };

    /// Send one request and await its response.
    pub(crate) async fn issue_request(
        inner: &Arc<Inner>,
        command: String,
        params: Vec<Value>,
        progress: Option<ProgressFn>,
    ) -> Result<Value, ClientError> {
        if !inner.state_tx.borrow().is_connected() {
            return Err(ClientError::NotConnected);
        }
        let uuid = uuid::Uuid::now_v7().to_string();
        let message = WireMessage::Request {
            uuid: uuid.clone(),
            command,
            params,
        };
        let serialized = encode_frame(&message)?;
        let rx = inner.pending.insert(uuid.clone(), progress);

        let sent = if serialized.len() > inner.config.effective_split_threshold() {
            send_split(inner, &uuid, &serialized).await
        } else {
            inner.send_text(serialized).await
        };
        if let Err(e) = sent {
            inner.pending.forget(&uuid);
            return Err(e);
        }

        rx.await.map_err(|_| ClientError::Closed)?
    }

    async fn send_split(
        inner: &Arc<Inner>,
        uuid: &str,
        serialized: &str,
    ) -> Result<(), ClientError> {
        let total = serialized.len() as u64;
        let mut sent = 0u64;
        for frame in split_request_frames(uuid, serialized, inner.config.chunk_size) {
            if let WireMessage::RequestSplit { body, .. } = &frame {
                sent += body.len() as u64;
            }
            inner.send_text(encode_frame(&frame)?).await?;
            inner.pending.progress(uuid, sent, total);
        }
        Ok(())
    }
}

// ── Driver ──────────────────────────────────────────────────────────

enum SocketEnd {
    /// Explicit close; never reconnect.
    Closed,
    /// Socket lost; `connected` says whether admission completed.
    Dropped { connected: bool },
}

async fn drive(inner: Arc<Inner>, mut out_rx: mpsc::Receiver<OutFrame>) {
    let mut ever_connected = false;
    let mut failures = 0u32;

    loop {
        if inner.close.is_cancelled() {
            inner.set_state(ConnectionState::Closed);
            break;
        }

        // A connect attempt can stall for the full OS timeout against an
        // unresponsive endpoint; close() must still return promptly.
        let attempt = tokio::select! {
            result = connect_async(inner.config.url.as_str()) => result,
            () = inner.close.cancelled() => {
                inner.set_state(ConnectionState::Closed);
                break;
            }
        };
        match attempt {
            Ok((ws, _response)) => {
                let end = run_socket(&inner, ws, &mut out_rx, ever_connected).await;
                inner.pending.reject_all(|| ClientError::NotConnected);
                match end {
                    SocketEnd::Closed => {
                        inner.set_state(ConnectionState::Closed);
                        break;
                    }
                    SocketEnd::Dropped { connected } => {
                        if connected {
                            ever_connected = true;
                            failures = 0;
                            info!("socket lost, reconnecting");
                        } else {
                            failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                failures += 1;
                debug!(error = %e, attempt = failures, "connect attempt failed");
            }
        }

        if failures > inner.config.retry.max_retries {
            warn!(attempts = failures, "retries exhausted, giving up");
            inner.set_state(ConnectionState::Failed);
            inner
                .pending
                .reject_all(|| ClientError::RetriesExhausted { attempts: failures });
            break;
        }

        inner.set_state(if ever_connected {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        if failures > 0 {
            let random: f64 = rand::rng().random();
            let delay = inner.config.retry.delay_ms(failures - 1, random);
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(delay)) => {}
                () = inner.close.cancelled() => {}
            }
        }
    }
}

/// Pump one physical socket until it ends.
async fn run_socket(
    inner: &Arc<Inner>,
    ws: WsStream,
    out_rx: &mut mpsc::Receiver<OutFrame>,
    was_reconnect: bool,
) -> SocketEnd {
    // Scope for split reassembly on this socket; purged when it ends.
    let scope = ConnectionId::new();
    let (mut sink, mut stream) = ws.split();
    let mut connected = false;

    let end = loop {
        tokio::select! {
            () = inner.close.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break SocketEnd::Closed;
            }
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break SocketEnd::Closed };
                let message = match frame {
                    OutFrame::Text(text) => Message::Text(text.into()),
                    OutFrame::Binary(data) => Message::Binary(data.into()),
                    OutFrame::Pong(data) => Message::Pong(data.into()),
                };
                if sink.send(message).await.is_err() {
                    break SocketEnd::Dropped { connected };
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(message)) => {
                        if !handle_frame(inner, &scope, message, &mut connected, was_reconnect) {
                            break SocketEnd::Dropped { connected };
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "socket error");
                        break SocketEnd::Dropped { connected };
                    }
                    None => break SocketEnd::Dropped { connected },
                }
            }
        }
    };
    inner.accumulator.purge_connection(&scope);
    end
}

/// Handle one inbound frame. Returns `false` when the socket is done.
fn handle_frame(
    inner: &Arc<Inner>,
    scope: &ConnectionId,
    message: Message,
    connected: &mut bool,
    was_reconnect: bool,
) -> bool {
    match message {
        Message::Text(text) => {
            handle_text(inner, scope, text.as_str(), connected, was_reconnect);
            true
        }
        Message::Ping(data) => {
            let _ = inner.out_tx.try_send(OutFrame::Pong(data.to_vec()));
            true
        }
        Message::Pong(_) | Message::Frame(_) => true,
        Message::Binary(data) => {
            debug!(len = data.len(), "unexpected binary frame from server");
            true
        }
        Message::Close(_) => false,
    }
}

fn handle_text(
    inner: &Arc<Inner>,
    scope: &ConnectionId,
    text: &str,
    connected: &mut bool,
    was_reconnect: bool,
) {
    match decode_frame(text) {
        Ok(WireMessage::ClientGetId) => {
            let answer = WireMessage::ClientGetIdResponse {
                body: inner.client_id.to_string(),
            };
            if let Ok(frame) = encode_frame(&answer) {
                let _ = inner.out_tx.try_send(OutFrame::Text(frame));
            }
        }
        Ok(WireMessage::Connected) => {
            *connected = true;
            inner.set_state(ConnectionState::Connected);
            info!(client_id = %inner.client_id, "session admitted");
            if was_reconnect {
                let _ = tokio::spawn(replay_recovery(inner.clone()));
            }
        }
        Ok(WireMessage::Response {
            req_uuid,
            state,
            body,
        }) => {
            resolve_response(inner, &req_uuid, state, body);
        }
        Ok(WireMessage::ResponseSplit {
            req_uuid,
            full_size,
            index,
            body,
        }) => match inner.accumulator.push(scope, &req_uuid, full_size, index, &body) {
            Ok(progress) => {
                inner
                    .pending
                    .progress(&req_uuid, progress.completed_size, full_size);
                if let Some(full_text) = progress.full_text {
                    resolve_reassembled(inner, &req_uuid, &full_text);
                }
            }
            Err(e) => {
                warn!(error = %e, req_uuid, "split response aborted");
                let _ = inner
                    .pending
                    .resolve(&req_uuid, Err(ClientError::Protocol(e.to_string())));
            }
        },
        Ok(WireMessage::Event { key, body }) => {
            let _ = inner.listeners.dispatch(&key, body);
        }
        Ok(WireMessage::ClientReload {
            client_name,
            changed_file_set,
        }) => {
            let addressed = client_name
                .as_deref()
                .is_none_or(|name| name == inner.client_id.as_str());
            if addressed {
                let callback = inner.reload.lock().clone();
                if let Some(callback) = callback {
                    callback(client_name, changed_file_set);
                }
            }
        }
        // Kinds only clients send; a server echoing them is noise.
        Ok(other) => {
            debug!(kind = other.kind(), "ignoring client-only frame from server");
        }
        Err(e) => {
            warn!(error = %e, "undecodable frame from server");
        }
    }
}

fn resolve_reassembled(inner: &Arc<Inner>, transfer_uuid: &str, full_text: &str) {
    match decode_frame(full_text) {
        Ok(WireMessage::Response {
            req_uuid,
            state,
            body,
        }) => resolve_response(inner, &req_uuid, state, body),
        Ok(other) => {
            let _ = inner.pending.resolve(
                transfer_uuid,
                Err(ClientError::Protocol(format!(
                    "split transfer carried '{}', expected a response",
                    other.kind()
                ))),
            );
        }
        Err(e) => {
            let _ = inner
                .pending
                .resolve(transfer_uuid, Err(ClientError::Protocol(e.to_string())));
        }
    }
}

fn resolve_response(inner: &Arc<Inner>, req_uuid: &str, state: ResponseState, body: Value) {
    let result = match state {
        ResponseState::Success => Ok(body),
        ResponseState::Error => {
            let error: ErrorBody = serde_json::from_value(body).unwrap_or_else(|_| {
                ErrorBody::new(codes::INTERNAL_ERROR, "malformed error body")
            });
            Err(ClientError::Remote {
                code: error.code,
                message: error.message,
                stack: error.stack,
            })
        }
    };
    let _ = inner.pending.resolve(req_uuid, result);
}

/// Re-establish server-side session state after a reconnect.
///
/// The auth token goes first, then every listener registration. Failures
/// are logged per item and never abort the rest of the replay.
async fn replay_recovery(inner: Arc<Inner>) {
    let token = inner.auth_token.lock().clone();
    if let Some(token) = token {
        if let Err(e) = issue_request(&inner, "auth.resume".into(), vec![json!(token)], None).await
        {
            warn!(error = %e, "auth token replay failed");
        }
    }
    for reg in inner.listeners.snapshot() {
        let params = vec![json!(reg.key.as_str()), json!(reg.event_name), reg.filter_info];
        if let Err(e) =
            issue_request(&inner, "listener.register".into(), params, None).await
        {
            warn!(error = %e, key = %reg.key, "listener re-registration failed");
        }
    }
    info!(listeners = inner.listeners.len(), "recovery replay complete");
}
