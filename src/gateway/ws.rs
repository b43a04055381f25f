//! WebSocket bridge and per-connection event poller (§4.5).

use super::queue::MessageQueue;
use super::state::Gateway;
use crate::rpc;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use rand::RngCore;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const AUTH_FAILURE_CLOSE_CODE: u16 = 4403;
pub const UNKNOWN_RELAY_CLOSE_CODE: u16 = 1008;
const BASE_POLL_INTERVAL: Duration = Duration::from_secs(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);
const INTERVAL_BACKOFF_FACTOR: f64 = 1.5;
const MAX_CONSECUTIVE_MISSES: u32 = 5;
const FORCE_RECHECK_AFTER: u32 = 3;

pub fn new_connection_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

struct WsSession {
    gateway: Arc<Gateway>,
    relay_id: String,
    auth_token: Option<String>,
    connection_key: String,
    queue: Arc<MessageQueue>,
    alive: AtomicBool,
}

/// Drives one client WS for its lifetime: spawns the event poller, then
/// loops reading inbound frames into the session's [`MessageQueue`].
pub async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>, relay_id: String, auth_token: Option<String>) {
    let connection_key = new_connection_key();
    gateway.register_ws_session(connection_key.clone(), relay_id.clone()).await;

    let (ws_tx, mut ws_rx) = socket.split_sink_stream();
    let ws_tx = Arc::new(tokio::sync::Mutex::new(ws_tx));

    let session = Arc::new(WsSession {
        gateway: gateway.clone(),
        relay_id: relay_id.clone(),
        auth_token,
        connection_key: connection_key.clone(),
        queue: Arc::new(MessageQueue::new()),
        alive: AtomicBool::new(true),
    });

    let poller_session = session.clone();
    let poller_tx = ws_tx.clone();
    let poller = tokio::spawn(async move { run_event_poller(poller_session, poller_tx).await });

    while let Some(Ok(msg)) = ws_rx.next_message().await {
        if !session.alive.load(Ordering::SeqCst) {
            break;
        }
        let frame: Value = match msg {
            WsMessage::Text(text) => match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue,
            },
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let session = session.clone();
        let tx = ws_tx.clone();
        let queue = session.queue.clone();
        queue
            .enqueue(frame, move |frame| {
                let session = session.clone();
                let tx = tx.clone();
                async move { process_frame(&session, &tx, frame).await }
            })
            .await;
    }

    session.alive.store(false, Ordering::SeqCst);
    session.queue.clear().await;
    gateway.unregister_ws_session(&connection_key).await;
    poller.abort();
}

/// Closes a freshly upgraded socket when the addressed relay isn't known to
/// the gateway (§6 "Invalid relay key") — the upgrade has to succeed before
/// a close frame with an application code can be sent, so this rejects on
/// the first message exchange rather than at the HTTP layer.
pub async fn reject_unknown_relay(mut socket: WebSocket) {
    use futures_util::SinkExt;
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame { code: UNKNOWN_RELAY_CLOSE_CODE, reason: "Invalid relay key".into() })))
        .await;
}

async fn process_frame(session: &WsSession, tx: &Arc<tokio::sync::Mutex<impl WsSink>>, frame: Value) -> Result<(), String> {
    let gateway = &session.gateway;
    let candidates = gateway.relay_candidates(&session.relay_id).await;
    let Some(pk) = gateway.health.find_healthy_peer_for_relay(&gateway.pool, &candidates, false).await else {
        send_notice(tx, "No healthy peers available for this relay").await;
        return Err("no healthy peers".to_string());
    };

    let conn = gateway.pool.get_connection(pk).await.map_err(|e| e.to_string())?;
    let lines = rpc::forward_relay_message(
        &conn,
        &session.relay_id,
        &frame,
        &session.connection_key,
        session.auth_token.as_deref(),
        gateway.config.rpc_timeout,
    )
    .await
    .map_err(|e| e.to_string())?;

    gateway.touch_peer(pk).await;
    gateway.mark_relay_success(&session.relay_id).await;

    for line in lines {
        if rpc::is_auth_failure_frame(&line) {
            close_for_auth_failure(tx).await;
            session.alive.store(false, Ordering::SeqCst);
            return Ok(());
        }
        send_json(tx, &line).await;
    }
    Ok(())
}

async fn run_event_poller(session: Arc<WsSession>, tx: Arc<tokio::sync::Mutex<impl WsSink>>) {
    let mut interval = BASE_POLL_INTERVAL;
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::time::sleep(interval).await;
        if !session.alive.load(Ordering::SeqCst) {
            return;
        }

        let gateway = &session.gateway;
        let candidates = gateway.relay_candidates(&session.relay_id).await;
        let force_recheck = consecutive_failures >= FORCE_RECHECK_AFTER;
        let found = gateway.health.find_healthy_peer_for_relay(&gateway.pool, &candidates, force_recheck).await;

        match found {
            None => {
                if consecutive_failures == 0 {
                    send_notice(&tx, "No healthy peers available for this relay").await;
                }
                consecutive_failures += 1;
                interval = (interval.mul_f64(INTERVAL_BACKOFF_FACTOR)).min(MAX_POLL_INTERVAL);
                if consecutive_failures >= MAX_CONSECUTIVE_MISSES {
                    warn!(relay = %session.relay_id, "poller giving up, resetting pool connections for this relay");
                    for pk in &candidates {
                        gateway.pool.close_connection(*pk).await;
                        gateway.health.forget(*pk).await;
                    }
                }
            }
            Some(pk) => {
                let conn_result = gateway.pool.get_connection(pk).await;
                match conn_result {
                    Ok(conn) => match rpc::poll_events(&conn, &session.relay_id, &session.connection_key, session.auth_token.as_deref(), gateway.config.rpc_timeout).await {
                        Ok(frames) => {
                            for frame in &frames {
                                send_json(&tx, frame).await;
                            }
                            gateway.mark_relay_success(&session.relay_id).await;
                            consecutive_failures = 0;
                            interval = BASE_POLL_INTERVAL;
                        }
                        Err(_) => {
                            consecutive_failures += 1;
                            interval = (interval.mul_f64(INTERVAL_BACKOFF_FACTOR)).min(MAX_POLL_INTERVAL);
                        }
                    },
                    Err(_) => {
                        consecutive_failures += 1;
                        interval = (interval.mul_f64(INTERVAL_BACKOFF_FACTOR)).min(MAX_POLL_INTERVAL);
                    }
                }
            }
        }
    }
}

async fn send_json(tx: &Arc<tokio::sync::Mutex<impl WsSink>>, value: &Value) {
    let text = value.to_string();
    let mut guard = tx.lock().await;
    let _ = guard.send_text(text).await;
}

async fn send_notice(tx: &Arc<tokio::sync::Mutex<impl WsSink>>, message: &str) {
    send_json(tx, &serde_json::json!(["NOTICE", message])).await;
}

async fn close_for_auth_failure(tx: &Arc<tokio::sync::Mutex<impl WsSink>>) {
    info!(code = AUTH_FAILURE_CLOSE_CODE, "closing ws for authentication failure");
    let mut guard = tx.lock().await;
    let _ = guard
        .send_close(CloseFrame { code: AUTH_FAILURE_CLOSE_CODE, reason: "Authentication failed".into() })
        .await;
}

/// Thin seam over `axum`'s split sink so the poller/dispatcher above don't
/// need to know the concrete `SplitSink` type — mirrors the trait-object
/// style `clawd::ipc::event` uses for its broadcaster.
#[async_trait::async_trait]
pub trait WsSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), axum::Error>;
    async fn send_close(&mut self, frame: CloseFrame) -> Result<(), axum::Error>;
}

#[async_trait::async_trait]
impl WsSink for futures_util::stream::SplitSink<WebSocket, WsMessage> {
    async fn send_text(&mut self, text: String) -> Result<(), axum::Error> {
        use futures_util::SinkExt;
        self.send(WsMessage::Text(text.into())).await
    }

    async fn send_close(&mut self, frame: CloseFrame) -> Result<(), axum::Error> {
        use futures_util::SinkExt;
        self.send(WsMessage::Close(Some(frame))).await
    }
}

/// Thin seam over the receive half, so tests can drive `handle_socket`
/// without a real upgraded connection.
#[async_trait::async_trait]
trait WsSource: Send {
    async fn next_message(&mut self) -> Option<Result<WsMessage, axum::Error>>;
}

#[async_trait::async_trait]
impl WsSource for futures_util::stream::SplitStream<WebSocket> {
    async fn next_message(&mut self) -> Option<Result<WsMessage, axum::Error>> {
        use futures_util::StreamExt;
        self.next().await
    }
}

trait SplitSinkStream {
    type Sink: WsSink;
    type Stream: WsSource;
    fn split_sink_stream(self) -> (Self::Sink, Self::Stream);
}

impl SplitSinkStream for WebSocket {
    type Sink = futures_util::stream::SplitSink<WebSocket, WsMessage>;
    type Stream = futures_util::stream::SplitStream<WebSocket>;

    fn split_sink_stream(self) -> (Self::Sink, Self::Stream) {
        use futures_util::StreamExt;
        self.split()
    }
}
