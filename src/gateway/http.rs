//! Gateway-local HTTP surface and the passthrough/WS-upgrade fallback (§6).

use super::state::{CallbackStep, Gateway};
use super::ws;
use crate::peer::PeerMode;
use crate::rpc::{self, CallbackUrls};
use crate::swarm::public_key_from_hex;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/health", get(health))
        .route("/register", post(register))
        .route("/post/join/{id}", post(join_challenge))
        .route("/callback/verify-ownership/{id}", post(callback_verify_ownership))
        .route("/callback/finalize-auth/{id}", post(callback_finalize_auth))
        .route("/drive/{id}/{file}", get(drive_file))
        .route("/debug/connections", get(debug_connections))
        .fallback(fallback)
        .with_state(gateway)
}

async fn liveness(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let peers = gateway.all_peers().await.len();
    let relays = gateway.all_relay_ids().await.len();
    Json(json!({ "status": "ok", "peers": peers, "relays": relays, "timestamp": now_millis() }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "mode": "hyperswarm" }))
}

#[derive(Deserialize)]
struct RegisterBody {
    #[serde(rename = "publicKey")]
    public_key: Option<String>,
    mode: Option<String>,
    #[serde(default)]
    relays: Vec<String>,
    #[serde(rename = "relayProfileInfo")]
    relay_profile_info: Option<Value>,
}

async fn register(State(gateway): State<Arc<Gateway>>, Json(body): Json<RegisterBody>) -> Response {
    let Some(public_key_hex) = body.public_key else {
        return bad_request("missing publicKey");
    };
    let Ok(public_key) = public_key_from_hex(&public_key_hex) else {
        return bad_request("invalid publicKey");
    };
    let mode = match body.mode.as_deref() {
        Some("legacy") => PeerMode::Legacy,
        _ => PeerMode::Hyperswarm,
    };

    gateway.register_peer(public_key, mode, &body.relays, body.relay_profile_info).await;

    if matches!(mode, PeerMode::Hyperswarm) {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            if let Err(e) = gateway.pool.get_connection(public_key).await {
                warn!(err = %e, "background dial after registration failed");
            }
        });
    }

    Json(json!({
        "message": "peer registered",
        "driveKey": public_key_hex,
        "status": "active",
        "mode": match mode { PeerMode::Hyperswarm => "hyperswarm", PeerMode::Legacy => "legacy" },
    }))
    .into_response()
}

async fn join_challenge(State(gateway): State<Arc<Gateway>>, Path(identifier): Path<String>, Json(event): Json<Value>) -> Response {
    let Some(pubkey_str) = event.get("pubkey").and_then(Value::as_str).map(str::to_string) else {
        return bad_request("missing event.pubkey");
    };

    let candidates = gateway.relay_candidates(&identifier).await;
    let Some(pk) = gateway.health.find_healthy_peer_for_relay(&gateway.pool, &candidates, false).await else {
        return service_unavailable(&identifier);
    };

    let conn = match gateway.pool.get_connection(pk).await {
        Ok(conn) => conn,
        Err(e) => return upstream_error(&e.to_string()),
    };

    let scheme_host = gateway.public_base_url();
    let callback_urls = CallbackUrls {
        verify_url: format!("{scheme_host}/callback/verify-ownership/{identifier}"),
        final_url: format!("{scheme_host}/callback/finalize-auth/{identifier}"),
    };

    match rpc::forward_join(&conn, &identifier, &json!({ "event": event }), callback_urls, gateway.config.rpc_timeout).await {
        Ok(resp) => {
            let key = format!("{pubkey_str}-{identifier}");
            gateway
                .store_join_session(key, super::state::JoinSession { peer_public_key: pk, created_at: std::time::Instant::now(), token: None })
                .await;
            Json(resp).into_response()
        }
        Err(e) => upstream_error(&e.to_string()),
    }
}

async fn callback_verify_ownership(State(gateway): State<Arc<Gateway>>, Path(identifier): Path<String>, Json(body): Json<Value>) -> Response {
    handle_callback(gateway, identifier, body, CallbackStep::VerifyOwnership).await
}

async fn callback_finalize_auth(State(gateway): State<Arc<Gateway>>, Path(identifier): Path<String>, Json(body): Json<Value>) -> Response {
    handle_callback(gateway, identifier, body, CallbackStep::FinalizeAuth).await
}

async fn handle_callback(gateway: Arc<Gateway>, identifier: String, body: Value, step: CallbackStep) -> Response {
    let Some(pubkey_str) = body.get("pubkey").and_then(Value::as_str) else {
        return bad_request("missing pubkey");
    };
    let key = format!("{pubkey_str}-{identifier}");
    let Some(session) = gateway.take_join_session(&key).await else {
        return bad_request("unknown or expired join session");
    };

    let conn = match gateway.pool.get_connection(session.peer_public_key).await {
        Ok(conn) => conn,
        Err(e) => return upstream_error(&e.to_string()),
    };

    let path_step = match step {
        CallbackStep::VerifyOwnership => "verify-ownership",
        CallbackStep::FinalizeAuth => "finalize-auth",
    };

    match rpc::forward_callback(&conn, path_step, body, gateway.config.rpc_timeout).await {
        Ok(resp) => {
            match step {
                CallbackStep::VerifyOwnership => {
                    if let Some(token) = resp.get("token").and_then(Value::as_str) {
                        gateway.set_join_session_token(&key, token.to_string()).await;
                    }
                }
                CallbackStep::FinalizeAuth => {
                    gateway.clear_join_session(&key).await;
                }
            }
            Json(resp).into_response()
        }
        Err(e) => upstream_error(&e.to_string()),
    }
}

async fn drive_file(State(gateway): State<Arc<Gateway>>, Path((id, file_name)): Path<(String, String)>) -> Response {
    let candidates = gateway.relay_candidates(&id).await;
    let Some(pk) = gateway.health.find_healthy_peer_for_relay(&gateway.pool, &candidates, false).await else {
        return service_unavailable(&id);
    };
    let conn = match gateway.pool.get_connection(pk).await {
        Ok(conn) => conn,
        Err(e) => return upstream_error(&e.to_string()),
    };
    match rpc::file(&conn, &id, &file_name, gateway.config.rpc_timeout).await {
        Ok(resp) => forwarded_response(resp),
        Err(e) => upstream_error(&e.to_string()),
    }
}

async fn debug_connections(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let peers = gateway.all_peers().await;
    let metrics = gateway.health.metrics().snapshot();
    Json(json!({
        "gatewayId": gateway.gateway_id,
        "peerCount": peers.len(),
        "relayCount": gateway.all_relay_ids().await.len(),
        "wsSessions": gateway.ws_session_count().await,
        "metrics": metrics,
    }))
}

async fn fallback(State(gateway): State<Arc<Gateway>>, req: axum::extract::Request) -> Response {
    let is_ws_upgrade = req
        .headers()
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if is_ws_upgrade {
        return handle_ws_upgrade(gateway, req).await;
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let headers = req.headers().clone();
    let body = match axum::body::to_bytes(req.into_body(), 50 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response(),
    };

    ordinary_http_passthrough(gateway, method, &path, headers, body).await
}

async fn handle_ws_upgrade(gateway: Arc<Gateway>, req: axum::extract::Request) -> Response {
    use axum::extract::FromRequestParts;

    let path = req.uri().path().trim_start_matches('/').to_string();
    let query: HashMap<String, String> = req.uri().query().map(crate::protocol::router::parse_query).unwrap_or_default();
    let (mut parts, _body) = req.into_parts();

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &gateway).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let relay_id = match segments.as_slice() {
        [a, b, ..] => format!("{a}:{b}"),
        [a] => a.to_string(),
        [] => return (StatusCode::BAD_REQUEST, "Invalid relay key").into_response(),
    };
    let auth_token = query.get("token").cloned();

    if gateway.relay_snapshot(&relay_id).await.is_none() {
        warn!(relay = %relay_id, "ws upgrade rejected: unknown relay");
        return upgrade.on_upgrade(ws::reject_unknown_relay);
    }

    upgrade.on_upgrade(move |socket| ws::handle_socket(socket, gateway, relay_id, auth_token))
}

async fn ordinary_http_passthrough(gateway: Arc<Gateway>, method: axum::http::Method, path: &str, headers: HeaderMap, body: Bytes) -> Response {
    let hyperswarm_peers: Vec<_> = gateway
        .all_peers()
        .await
        .into_iter()
        .filter(|p| p.mode == PeerMode::Hyperswarm)
        .collect();
    if hyperswarm_peers.is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "no active peers").into_response();
    }

    let pk = {
        use rand::seq::SliceRandom;
        hyperswarm_peers.choose(&mut rand::thread_rng()).map(|p| p.public_key)
    };
    let Some(pk) = pk else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no active peers").into_response();
    };

    let conn = match gateway.pool.get_connection(pk).await {
        Ok(conn) => conn,
        Err(e) => return upstream_error(&e.to_string()),
    };

    let mut header_map = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            header_map.insert(name.to_string(), v.to_string());
        }
    }
    let body_vec = if body.is_empty() { None } else { Some(body.to_vec()) };

    match rpc::forward_http(&conn, method.as_str(), path, header_map, body_vec, gateway.config.rpc_timeout).await {
        Ok(resp) => {
            gateway.touch_peer(pk).await;
            forwarded_response(resp)
        }
        Err(e) => upstream_error(&e.to_string()),
    }
}

fn forwarded_response(resp: rpc::ForwardedResponse) -> Response {
    let mut builder = Response::builder().status(resp.status_code);
    for (name, value) in &resp.headers {
        builder = builder.header(name, value);
    }
    builder.body(axum::body::Body::from(resp.body)).unwrap_or_else(|e| {
        error!(err = %e, "failed to build forwarded response");
        (StatusCode::INTERNAL_SERVER_ERROR, "bad upstream response").into_response()
    })
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn service_unavailable(relay_id: &str) -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": format!("no healthy peers for relay {relay_id}") }))).into_response()
}

fn upstream_error(message: &str) -> Response {
    (StatusCode::BAD_GATEWAY, Json(json!({ "error": message }))).into_response()
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}
