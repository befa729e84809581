//! End-to-end tests: a real server on an ephemeral port, a real
//! controller connecting over loopback.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use relay_client::{ClientConfig, ClientError, ConnectionController, ConnectionState, UploadOutcome};
use relay_core::backoff::RetryConfig;
use relay_server::{InvokeContext, InvokeError, MethodInvoker, RelayServer, ServerConfig};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct EchoInvoker;

#[async_trait]
impl MethodInvoker for EchoInvoker {
    async fn invoke(
        &self,
        service: &str,
        method: &str,
        params: Vec<Value>,
        _ctx: &InvokeContext,
    ) -> Result<Value, InvokeError> {
        match (service, method) {
            ("Echo", "say") => Ok(params.into_iter().next().unwrap_or(Value::Null)),
            ("Echo", "blob") => {
                let len = params
                    .first()
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
                Ok(json!("y".repeat(len)))
            }
            ("Echo", "fail") => Err(InvokeError::Failed {
                message: "told to fail".into(),
                detail: Some("at Echo.fail".into()),
            }),
            _ => Err(InvokeError::UnknownCommand {
                command: format!("{service}.{method}"),
            }),
        }
    }
}

async fn boot(config: ServerConfig) -> (String, Arc<RelayServer>) {
    let server = Arc::new(RelayServer::new(config, Arc::new(EchoInvoker)));
    let (addr, _task) = server.listen().await.unwrap();
    (format!("ws://{addr}/ws"), server)
}

async fn boot_default() -> (String, Arc<RelayServer>) {
    boot(ServerConfig::default()).await
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 20,
        base_delay_ms: 10,
        max_delay_ms: 50,
        jitter_factor: 0.0,
    }
}

fn client_config(url: &str) -> ClientConfig {
    ClientConfig {
        retry: fast_retry(),
        ..ClientConfig::new(url)
    }
}

#[tokio::test]
async fn connect_and_echo() {
    let (url, _server) = boot_default().await;
    let client = ConnectionController::connect(client_config(&url))
        .await
        .unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    let answer = client
        .request("Echo.say", vec![json!("hello")])
        .await
        .unwrap();
    assert_eq!(answer, json!("hello"));
    client.close().await;
}

#[tokio::test]
async fn unknown_command_surfaces_remote_error() {
    let (url, _server) = boot_default().await;
    let client = ConnectionController::connect(client_config(&url))
        .await
        .unwrap();

    let err = client
        .request("Missing.method", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.remote_code(), Some("BAD_COMMAND"));
    client.close().await;
}

#[tokio::test]
async fn invoker_failure_carries_stack_detail() {
    let (url, _server) = boot_default().await;
    let client = ConnectionController::connect(client_config(&url))
        .await
        .unwrap();

    let err = client.request("Echo.fail", vec![]).await.unwrap_err();
    match err {
        ClientError::Remote {
            code,
            message,
            stack,
        } => {
            assert_eq!(code, "INTERNAL_ERROR");
            assert_eq!(message, "told to fail");
            assert_eq!(stack.as_deref(), Some("at Echo.fail"));
        }
        other => panic!("expected remote error, got {other}"),
    }
    client.close().await;
}

#[tokio::test]
async fn request_after_close_is_not_connected() {
    let (url, _server) = boot_default().await;
    let client = ConnectionController::connect(client_config(&url))
        .await
        .unwrap();

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);

    let err = client.request("Echo.say", vec![json!(1)]).await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test]
async fn listener_receives_emitted_event() {
    let (url, server) = boot_default().await;
    let client = ConnectionController::connect(client_config(&url))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel::<Value>(8);
    let _key = client
        .add_listener(
            "row-changed",
            json!({"table": "users"}),
            Arc::new(move |body| {
                let _ = tx.try_send(body);
            }),
        )
        .await
        .unwrap();

    let delivered = server
        .registry()
        .emit(
            "row-changed",
            |filter| filter["table"] == "users",
            &json!({"row": 7}),
        )
        .await;
    assert_eq!(delivered, 1);

    let body = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body["row"], 7);
    client.close().await;
}

#[tokio::test]
async fn removed_listener_gets_nothing() {
    let (url, server) = boot_default().await;
    let client = ConnectionController::connect(client_config(&url))
        .await
        .unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_cb = hits.clone();
    let key = client
        .add_listener(
            "saved",
            json!(null),
            Arc::new(move |_| {
                let _ = hits_cb.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .await
        .unwrap();

    assert!(client.remove_listener(&key).await.unwrap());
    let delivered = server.registry().emit("saved", |_| true, &json!(1)).await;
    assert_eq!(delivered, 0);
    assert_eq!(hits.load(Ordering::Relaxed), 0);
    client.close().await;
}

#[tokio::test]
async fn reconnect_replays_listener_registrations() {
    let (url, server) = boot_default().await;
    let client = ConnectionController::connect(client_config(&url))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel::<Value>(32);
    let _key = client
        .add_listener(
            "saved",
            json!(null),
            Arc::new(move |body| {
                let _ = tx.try_send(body);
            }),
        )
        .await
        .unwrap();

    // Kill the server side of the session; the controller reconnects and
    // re-registers on its own.
    let conn = server
        .registry()
        .find_by_client(client.client_id())
        .await
        .unwrap();
    conn.terminate();

    // The old registration may linger briefly while the dead session is
    // torn down, so keep emitting until a frame reaches the new socket.
    let received = timeout(Duration::from_secs(10), async {
        loop {
            let _ = server.registry().emit("saved", |_| true, &json!("again")).await;
            if let Ok(Some(body)) = timeout(Duration::from_millis(100), rx.recv()).await {
                return body;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received, json!("again"));
    assert_eq!(client.state(), ConnectionState::Connected);
    client.close().await;
}

#[tokio::test]
async fn reload_notice_invokes_callback() {
    let (url, server) = boot_default().await;
    let client = ConnectionController::connect(client_config(&url))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel::<(Option<String>, Vec<String>)>(8);
    client.on_reload(Arc::new(move |name, files| {
        let _ = tx.try_send((name, files));
    }));

    // Broadcast (no client name) addresses everyone.
    server
        .registry()
        .notify_reload(None, vec!["src/app.js".into()])
        .await;

    let (name, files) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(name.is_none());
    assert_eq!(files, vec!["src/app.js".to_owned()]);

    // A notice naming a different client is ignored.
    server
        .registry()
        .notify_reload(Some("someone-else".into()), vec!["x.js".into()])
        .await;
    assert!(
        timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err()
    );
    client.close().await;
}

#[tokio::test]
async fn upload_writes_file_then_skips_identical_content() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("local.bin");
    let remote = dir.path().join("remote.bin");
    let content = vec![0x5au8; 10_000];
    std::fs::write(&local, &content).unwrap();

    let (url, _server) = boot_default().await;
    let client = ConnectionController::connect(ClientConfig {
        chunk_size: 1024,
        ..client_config(&url)
    })
    .await
    .unwrap();

    let outcome = client
        .upload(&local, remote.to_str().unwrap(), None)
        .await
        .unwrap();
    assert_eq!(outcome, UploadOutcome::Uploaded { bytes: 10_000 });
    assert_eq!(std::fs::read(&remote).unwrap(), content);

    // Identical content on the second pass: no bytes move.
    let outcome = client
        .upload(&local, remote.to_str().unwrap(), None)
        .await
        .unwrap();
    assert_eq!(outcome, UploadOutcome::Skipped);
    client.close().await;
}

#[tokio::test]
async fn upload_reports_chunked_progress() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("local.bin");
    let remote = dir.path().join("remote.bin");
    std::fs::write(&local, vec![1u8; 100]).unwrap();

    let (url, _server) = boot_default().await;
    let client = ConnectionController::connect(ClientConfig {
        chunk_size: 32,
        ..client_config(&url)
    })
    .await
    .unwrap();

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    let outcome = client
        .upload(
            &local,
            remote.to_str().unwrap(),
            Some(Arc::new(move |p| {
                seen_cb.lock().push(p.transferred);
            })),
        )
        .await
        .unwrap();
    assert_eq!(outcome, UploadOutcome::Uploaded { bytes: 100 });

    let seen = seen.lock();
    assert_eq!(*seen, vec![32, 64, 96, 100]);
    client.close().await;
}

#[tokio::test]
async fn large_response_is_reassembled() {
    let (url, _server) = boot(ServerConfig {
        chunk_size: 128,
        split_threshold: 512,
        ..ServerConfig::default()
    })
    .await;
    let client = ConnectionController::connect(client_config(&url))
        .await
        .unwrap();

    let answer = client
        .request("Echo.blob", vec![json!(4000)])
        .await
        .unwrap();
    assert_eq!(answer.as_str().unwrap().len(), 4000);
    client.close().await;
}

#[tokio::test]
async fn large_request_is_split_with_progress() {
    let (url, _server) = boot_default().await;
    let client = ConnectionController::connect(ClientConfig {
        chunk_size: 256,
        split_threshold: 512,
        ..client_config(&url)
    })
    .await
    .unwrap();

    let payload = "z".repeat(5000);
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_cb = seen.clone();
    let answer = client
        .request_with_progress(
            "Echo.say",
            vec![json!(payload)],
            Arc::new(move |_| {
                let _ = seen_cb.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .await
        .unwrap();
    assert_eq!(answer, json!(payload));
    assert!(seen.load(Ordering::Relaxed) >= 2, "expected chunked sends");
    client.close().await;
}

#[tokio::test]
async fn dead_endpoint_exhausts_retries() {
    let config = ClientConfig {
        retry: RetryConfig {
            max_retries: 2,
            base_delay_ms: 5,
            max_delay_ms: 10,
            jitter_factor: 0.0,
        },
        ..ClientConfig::new("ws://127.0.0.1:9/ws")
    };
    let err = ConnectionController::connect(config).await.unwrap_err();
    assert!(matches!(err, ClientError::RetriesExhausted { .. }));
}

#[tokio::test]
async fn close_interrupts_a_hung_connect_attempt() {
    let server = Arc::new(RelayServer::new(
        ServerConfig::default(),
        Arc::new(EchoInvoker),
    ));
    let (addr, task) = server.listen().await.unwrap();
    let client = ConnectionController::connect(ClientConfig {
        retry: RetryConfig {
            max_retries: 1000,
            base_delay_ms: 5,
            max_delay_ms: 10,
            jitter_factor: 0.0,
        },
        ..ClientConfig::new(&format!("ws://{addr}/ws"))
    })
    .await
    .unwrap();

    // Tear the server down and squat its port with a listener that
    // accepts TCP but never answers the upgrade, so the controller's
    // reconnect attempts hang inside the WebSocket handshake.
    assert!(server.graceful_shutdown(task).await);
    let _squatter = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(listener) = tokio::net::TcpListener::bind(addr).await {
                break listener;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let closed = timeout(Duration::from_secs(2), client.close()).await;
    assert!(closed.is_ok(), "close blocked on an in-flight connect");
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn authenticate_round_trips() {
    let (url, _server) = boot_default().await;
    let client = ConnectionController::connect(client_config(&url))
        .await
        .unwrap();

    // No auth hook installed: any token is accepted.
    let answer = client.authenticate("token-123").await.unwrap();
    assert_eq!(answer, json!(true));
    client.close().await;
}

#[tokio::test]
async fn client_recovers_after_server_side_termination() {
    let (url, server) = boot_default().await;
    let client = ConnectionController::connect(client_config(&url))
        .await
        .unwrap();

    server.registry().terminate_all().await;

    // Requests issued during the gap fail; once the controller reconnects
    // they flow again.
    let answer = timeout(Duration::from_secs(10), async {
        loop {
            match client.request("Echo.say", vec![json!("back")]).await {
                Ok(answer) => return answer,
                Err(_) => tokio::time::sleep(Duration::from_millis(25)).await,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(answer, json!("back"));
    client.close().await;
}
