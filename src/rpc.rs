//! Client-side RPC verbs (§4.6) — single-roundtrip requests issued over a
//! peer's [`Channel`], each with its own path/method/body encoding.
//!
//! [`Channel`]: crate::protocol::Channel

use crate::error::DialError;
use crate::peer::PeerConnection;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

fn auth_headers(auth_token: Option<&str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(token) = auth_token {
        headers.insert("x-auth-token".to_string(), token.to_string());
    }
    headers
}

/// A forwarded HTTP response, ready to be written back to the client
/// verbatim (§4.5 "Ordinary HTTP dispatch" step 3).
pub struct ForwardedResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Forward the client's own HTTP request to `peer`, pass-through body and
/// headers (§4.6 "Forward HTTP").
pub async fn forward_http(
    peer: &PeerConnection,
    method: &str,
    path: &str,
    headers: HashMap<String, String>,
    body: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<ForwardedResponse, DialError> {
    let resp = peer.send_request(method, path, headers, body, timeout).await?;
    Ok(ForwardedResponse { status_code: resp.status_code, headers: resp.headers, body: resp.body.unwrap_or_default() })
}

#[derive(Serialize)]
struct RelayMessageBody<'a> {
    message: &'a Value,
    #[serde(rename = "connectionKey")]
    connection_key: &'a str,
}

/// Forward one relay frame for `connectionKey`; the peer's response body is
/// newline-delimited JSON, one line per outbound frame (§4.6 "Forward relay
/// message").
pub async fn forward_relay_message(
    peer: &PeerConnection,
    relay_id: &str,
    message: &Value,
    connection_key: &str,
    auth_token: Option<&str>,
    timeout: Duration,
) -> Result<Vec<Value>, DialError> {
    let path = format!("/post/relay/{relay_id}");
    let body = serde_json::to_vec(&RelayMessageBody { message, connection_key }).ok();
    let resp = peer.send_request("POST", &path, auth_headers(auth_token), body, timeout).await?;
    Ok(parse_newline_delimited(&resp.body.unwrap_or_default()))
}

/// Poll pending events for `connectionKey` (§4.6 "Poll events").
pub async fn poll_events(
    peer: &PeerConnection,
    relay_id: &str,
    connection_key: &str,
    auth_token: Option<&str>,
    timeout: Duration,
) -> Result<Vec<Value>, DialError> {
    let path = format!("/get/relay/{relay_id}/{connection_key}");
    let resp = peer.send_request("GET", &path, auth_headers(auth_token), None, timeout).await?;
    let body = resp.body.unwrap_or_default();
    match serde_json::from_slice::<Vec<Value>>(&body) {
        Ok(events) => Ok(events),
        Err(_) => Ok(parse_newline_delimited(&body)),
    }
}

#[derive(Serialize)]
struct JoinBody<'a> {
    event: &'a Value,
    #[serde(rename = "callbackUrls")]
    callback_urls: CallbackUrls,
}

#[derive(Serialize)]
pub struct CallbackUrls {
    #[serde(rename = "verifyUrl")]
    pub verify_url: String,
    #[serde(rename = "finalUrl")]
    pub final_url: String,
}

/// Forward a join challenge, augmented with this gateway's own callback
/// URLs (§4.5 "Join challenge", §4.6 "Forward join").
pub async fn forward_join(
    peer: &PeerConnection,
    identifier: &str,
    event: &Value,
    callback_urls: CallbackUrls,
    timeout: Duration,
) -> Result<Value, DialError> {
    let path = format!("/post/join/{identifier}");
    let body = serde_json::to_vec(&JoinBody { event, callback_urls }).ok();
    let resp = peer.send_request("POST", &path, HashMap::new(), body, timeout).await?;
    parse_json_body(&resp.body.unwrap_or_default())
}

/// Forward a join-callback body verbatim to the peer (§4.6 "Forward
/// callback"); `step` is `"verify-ownership"` or `"finalize-auth"`.
pub async fn forward_callback(peer: &PeerConnection, step: &str, body: Value, timeout: Duration) -> Result<Value, DialError> {
    let path = format!("/{step}");
    let body_bytes = serde_json::to_vec(&body).ok();
    let resp = peer.send_request("POST", &path, HashMap::new(), body_bytes, timeout).await?;
    parse_json_body(&resp.body.unwrap_or_default())
}

/// Stream a file out of the peer's drive mirror (§4.6 "File").
pub async fn file(peer: &PeerConnection, relay_id: &str, file_name: &str, timeout: Duration) -> Result<ForwardedResponse, DialError> {
    let path = format!("/drive/{relay_id}/{file_name}");
    let resp = peer.send_request("GET", &path, HashMap::new(), None, timeout).await?;
    Ok(ForwardedResponse { status_code: resp.status_code, headers: resp.headers, body: resp.body.unwrap_or_default() })
}

fn parse_newline_delimited(body: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(body)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

fn parse_json_body(body: &[u8]) -> Result<Value, DialError> {
    serde_json::from_slice(body)
        .map_err(|e| DialError::Unreachable(format!("malformed JSON body from peer: {e}")))
}

/// Detects the auth-failure shape the gateway is allowed to notice (§4.5):
/// `["OK", _, false, msg]` where `msg` mentions authentication.
pub fn is_auth_failure_frame(frame: &Value) -> bool {
    let Some(arr) = frame.as_array() else { return false };
    if arr.len() < 4 || arr[0].as_str() != Some("OK") {
        return false;
    }
    if arr[2].as_bool() != Some(false) {
        return false;
    }
    let Some(msg) = arr[3].as_str() else { return false };
    msg.contains("Authentication required") || msg.contains("Invalid authentication")
}
