//! End-to-end coverage for the gateway's HTTP/WS surface against an
//! in-process mock relay peer (no real DHT swarm involved).

use gateway::config::{ConfigOverrides, GatewayConfig};
use gateway::gateway::http;
use gateway::gateway::state::JoinSession;
use gateway::protocol::channel::InboundEvent;
use gateway::protocol::codec::{HandshakePayload, ResponseMsg, Role};
use gateway::protocol::router::Router;
use gateway::protocol::{Channel, Message};
use gateway::swarm::LoopbackSwarm;
use gateway::Gateway;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn test_config(port: u16) -> GatewayConfig {
    let dir = std::env::temp_dir().join(format!("gateway-it-{port}-{:?}", std::thread::current().id()));
    let mut cfg = GatewayConfig::load(ConfigOverrides { data_dir: Some(dir), port: Some(port), ..Default::default() }).unwrap();
    cfg.dial_timeout = Duration::from_secs(2);
    cfg.handshake_timeout = Duration::from_secs(2);
    cfg.rpc_timeout = Duration::from_secs(2);
    cfg
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

async fn spawn_gateway(swarm: Arc<LoopbackSwarm>) -> (Arc<Gateway>, u16) {
    let port = free_port();
    let gateway = Arc::new(Gateway::new(test_config(port), "test-gateway-id".to_string(), swarm));
    gateway.pool.initialize().await.unwrap();
    let router = http::router(gateway.clone());
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    tokio::time::sleep(Duration::from_millis(30)).await;
    (gateway, port)
}

fn peer_handshake() -> HandshakePayload {
    HandshakePayload { version: "2.0".to_string(), is_server: true, is_gateway: false, role: Role::Server, capabilities: vec![] }
}

/// A mock relay peer: answers `/identify-gateway` and health checks with
/// 200/healthy, join-challenge and callback routes with a fixed payload,
/// relay-message forwarding with a single `OK` frame, and anything else
/// with a bare 200.
async fn spawn_mock_peer(swarm: &Arc<LoopbackSwarm>, pk: [u8; 32], auth_fails: bool) {
    let mut incoming = swarm.register_peer(pk).await;
    tokio::spawn(async move {
        let stream = incoming.recv().await.unwrap();
        let (channel, mut events) = Channel::open(stream, peer_handshake(), Router::new(), Duration::from_secs(2)).await.unwrap();
        while let Some(InboundEvent::Request(req)) = events.recv().await {
            let (status, body) = if req.path.starts_with("/identify-gateway") {
                (200, None)
            } else if req.path.starts_with("/post/join/") {
                (200, Some(json!({"challenge": "abc", "pubkey": "peerclient"}).to_string().into_bytes()))
            } else if req.path == "/verify-ownership" {
                (200, Some(json!({"token": "session-token-1"}).to_string().into_bytes()))
            } else if req.path == "/finalize-auth" {
                (200, Some(json!({"authenticated": true}).to_string().into_bytes()))
            } else if req.path.starts_with("/post/relay/") {
                let line = if auth_fails {
                    json!(["OK", "evt1", false, "Authentication required"]).to_string()
                } else {
                    json!(["OK", "evt1", true, ""]).to_string()
                };
                (200, Some(line.into_bytes()))
            } else if req.path.starts_with("/get/relay/") {
                (200, Some(b"[]".to_vec()))
            } else {
                (200, Some(b"{}".to_vec()))
            };
            let resp = Message::Response(ResponseMsg { id: req.id, status_code: status, headers: HashMap::new(), body });
            let _ = channel.send_fire_and_forget(resp);
        }
    });
}

#[tokio::test]
async fn liveness_and_health_endpoints_respond() {
    let swarm = Arc::new(LoopbackSwarm::new());
    let (_gateway, port) = spawn_gateway(swarm).await;
    let client = get_json(port, "/").await;
    assert_eq!(client["status"], "ok");
    let health = get_json(port, "/health").await;
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn register_then_ordinary_http_passthrough_reaches_the_peer() {
    let swarm = Arc::new(LoopbackSwarm::new());
    let pk = [0x11u8; 32];
    spawn_mock_peer(&swarm, pk, false).await;
    let (gateway, port) = spawn_gateway(swarm).await;

    let body = json!({ "publicKey": hex::encode(pk), "mode": "hyperswarm", "relays": ["relay-a"] });
    let resp = post_json(port, "/register", &body).await;
    assert_eq!(resp.0, 200);
    assert_eq!(resp.1["status"], "active");

    // give the background identify dial a moment
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gateway.peer(pk).await.is_some());

    let (status, parsed) = post_json(port, "/some/arbitrary/path", &json!({"ping": true})).await;
    assert_eq!(status, 200);
    assert_eq!(parsed, json!({}));
}

#[tokio::test]
async fn join_challenge_then_callbacks_completes() {
    let swarm = Arc::new(LoopbackSwarm::new());
    let pk = [0x22u8; 32];
    spawn_mock_peer(&swarm, pk, false).await;
    let (gateway, port) = spawn_gateway(swarm).await;
    gateway.register_peer(pk, gateway::peer::PeerMode::Hyperswarm, &["relay-b".to_string()], None).await;

    let join_body = json!({ "pubkey": "peerclient" });
    let (status, resp) = post_json(port, "/post/join/relay-b", &join_body).await;
    assert_eq!(status, 200);
    assert_eq!(resp["challenge"], "abc");

    let (status, resp) = post_json(port, "/callback/verify-ownership/relay-b", &json!({"pubkey": "peerclient"})).await;
    assert_eq!(status, 200);
    assert_eq!(resp["token"], "session-token-1");

    let (status, resp) = post_json(port, "/callback/finalize-auth/relay-b", &json!({"pubkey": "peerclient"})).await;
    assert_eq!(status, 200);
    assert_eq!(resp["authenticated"], true);

    // session should be cleared after finalize
    assert!(gateway.take_join_session("peerclient-relay-b").await.is_none());
}

#[tokio::test]
async fn unknown_join_session_is_rejected() {
    let swarm = Arc::new(LoopbackSwarm::new());
    let (_gateway, port) = spawn_gateway(swarm).await;
    let (status, _resp) = post_json(port, "/callback/verify-ownership/relay-z", &json!({"pubkey": "nobody"})).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn debug_connections_reports_peer_and_ws_counts() {
    let swarm = Arc::new(LoopbackSwarm::new());
    let pk = [0x33u8; 32];
    spawn_mock_peer(&swarm, pk, false).await;
    let (gateway, port) = spawn_gateway(swarm).await;
    gateway.register_peer(pk, gateway::peer::PeerMode::Hyperswarm, &["relay-c".to_string()], None).await;

    let body = get_json(port, "/debug/connections").await;
    assert_eq!(body["peerCount"], 1);
    assert_eq!(body["relayCount"], 1);
}

#[tokio::test]
async fn stale_join_sessions_are_swept_by_ttl() {
    let swarm = Arc::new(LoopbackSwarm::new());
    let (gateway, _port) = spawn_gateway(swarm).await;
    gateway
        .store_join_session(
            "stale-key".to_string(),
            JoinSession { peer_public_key: [0u8; 32], created_at: std::time::Instant::now() - Duration::from_secs(301), token: None },
        )
        .await;
    assert!(gateway.take_join_session("stale-key").await.is_none());
}

// ── tiny HTTP client helpers (no reqwest dependency — raw TCP + a JSON read) ──

async fn get_json(port: u16, path: &str) -> Value {
    let (status, body) = raw_request(port, "GET", path, None).await;
    assert_eq!(status, 200);
    body
}

async fn post_json(port: u16, path: &str, body: &Value) -> (u16, Value) {
    raw_request(port, "POST", path, Some(body.to_string())).await
}

async fn raw_request(port: u16, method: &str, path: &str, body: Option<String>) -> (u16, Value) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let body = body.unwrap_or_default();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf);
    let status: u16 = response.lines().next().and_then(|l| l.split_whitespace().nth(1)).and_then(|s| s.parse().ok()).unwrap_or(0);
    let body_start = response.find("\r\n\r\n").map(|i| i + 4).unwrap_or(response.len());
    let body_str = &response[body_start..];
    let parsed = serde_json::from_str(body_str).unwrap_or(Value::Null);
    (status, parsed)
}
