//! WebSocket bridge coverage: relay message forwarding and the
//! authentication-failure close path.

use futures_util::{SinkExt, StreamExt};
use gateway::config::{ConfigOverrides, GatewayConfig};
use gateway::gateway::http;
use gateway::peer::PeerMode;
use gateway::protocol::channel::InboundEvent;
use gateway::protocol::codec::{HandshakePayload, ResponseMsg, Role};
use gateway::protocol::router::Router;
use gateway::protocol::{Channel, Message};
use gateway::swarm::LoopbackSwarm;
use gateway::Gateway;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as TMessage;

fn test_config(port: u16) -> GatewayConfig {
    let dir = std::env::temp_dir().join(format!("gateway-ws-it-{port}-{:?}", std::thread::current().id()));
    let mut cfg = GatewayConfig::load(ConfigOverrides { data_dir: Some(dir), port: Some(port), ..Default::default() }).unwrap();
    cfg.dial_timeout = Duration::from_secs(2);
    cfg.handshake_timeout = Duration::from_secs(2);
    cfg.rpc_timeout = Duration::from_secs(2);
    cfg
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

async fn spawn_gateway_with_peer(auth_fails: bool) -> (Arc<Gateway>, u16, [u8; 32]) {
    let swarm = Arc::new(LoopbackSwarm::new());
    let pk = [0x44u8; 32];
    let mut incoming = swarm.register_peer(pk).await;
    tokio::spawn(async move {
        let stream = incoming.recv().await.unwrap();
        let handshake = HandshakePayload { version: "2.0".into(), is_server: true, is_gateway: false, role: Role::Server, capabilities: vec![] };
        let (channel, mut events) = Channel::open(stream, handshake, Router::new(), Duration::from_secs(2)).await.unwrap();
        while let Some(InboundEvent::Request(req)) = events.recv().await {
            let body = if req.path.starts_with("/post/relay/") {
                let line = if auth_fails {
                    json!(["OK", "evt1", false, "Authentication required"]).to_string()
                } else {
                    json!(["OK", "evt1", true, ""]).to_string()
                };
                Some(line.into_bytes())
            } else {
                None
            };
            let resp = Message::Response(ResponseMsg { id: req.id, status_code: 200, headers: HashMap::new(), body });
            let _ = channel.send_fire_and_forget(resp);
        }
    });

    let port = free_port();
    let gateway = Arc::new(Gateway::new(test_config(port), "test-gateway-id".to_string(), swarm));
    gateway.pool.initialize().await.unwrap();
    gateway.register_peer(pk, PeerMode::Hyperswarm, &["relay-ws".to_string()], None).await;
    let router = http::router(gateway.clone());
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    tokio::time::sleep(Duration::from_millis(30)).await;
    (gateway, port, pk)
}

#[tokio::test]
async fn relay_message_round_trips_over_the_ws_bridge() {
    let (_gateway, port, _pk) = spawn_gateway_with_peer(false).await;
    let url = format!("ws://127.0.0.1:{port}/relay-ws");
    let (mut ws, _resp) = tokio_tungstenite::connect_async(url).await.unwrap();

    ws.send(TMessage::Text(json!(["REQ", "sub1", {}]).to_string())).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    match reply {
        TMessage::Text(text) => {
            let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(parsed[0], "OK");
        }
        other => panic!("expected a text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn authentication_failure_closes_the_socket_with_4403() {
    let (_gateway, port, _pk) = spawn_gateway_with_peer(true).await;
    let url = format!("ws://127.0.0.1:{port}/relay-ws");
    let (mut ws, _resp) = tokio_tungstenite::connect_async(url).await.unwrap();

    ws.send(TMessage::Text(json!(["REQ", "sub1", {}]).to_string())).await.unwrap();

    let close = loop {
        match tokio::time::timeout(Duration::from_secs(2), ws.next()).await.unwrap() {
            Some(Ok(TMessage::Close(frame))) => break frame,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("connection ended without a close frame"),
        }
    };

    let frame = close.expect("close frame carries a reason");
    assert_eq!(u16::from(frame.code), 4403);
}
