//! Owns one channel to one backend peer, coordinating the single
//! outstanding dial described in §4.2.
//!
//! The single-flight guarantee falls out of holding a `tokio::sync::Mutex`
//! for the whole connect attempt: the first caller to acquire it performs
//! the dial, every other concurrent caller blocks on the same lock and
//! observes the now-`Connected` state once it is released — callers await
//! the same outcome without a bespoke shared-future primitive.

use crate::error::DialError;
use crate::protocol::codec::HandshakePayload;
use crate::protocol::router::Router;
use crate::protocol::{Channel, Message};
use crate::swarm::{PublicKey, SwarmTransport};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

enum State {
    Idle,
    Connected(Channel),
}

pub struct PeerConnection {
    public_key: PublicKey,
    swarm: Arc<dyn SwarmTransport>,
    state: Mutex<State>,
    last_used: RwLock<Instant>,
    connection_attempts: AtomicU32,
    dial_timeout: Duration,
    handshake_timeout: Duration,
}

impl PeerConnection {
    pub fn new(public_key: PublicKey, swarm: Arc<dyn SwarmTransport>, dial_timeout: Duration, handshake_timeout: Duration) -> Self {
        Self {
            public_key,
            swarm,
            state: Mutex::new(State::Idle),
            last_used: RwLock::new(Instant::now()),
            connection_attempts: AtomicU32::new(0),
            dial_timeout,
            handshake_timeout,
        }
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.read().expect("last_used lock poisoned")
    }

    fn touch(&self) {
        *self.last_used.write().expect("last_used lock poisoned") = Instant::now();
    }

    pub fn connection_attempts(&self) -> u32 {
        self.connection_attempts.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        matches!(&*self.state.lock().await, State::Connected(ch) if !ch.is_closed())
    }

    /// Ensure a live channel, dialing if necessary, and return it.
    pub async fn connect(&self) -> Result<Channel, DialError> {
        let mut guard = self.state.lock().await;
        if let State::Connected(ch) = &*guard {
            if !ch.is_closed() {
                return Ok(ch.clone());
            }
        }

        self.connection_attempts.fetch_add(1, Ordering::SeqCst);

        self.swarm
            .join_peer(self.public_key)
            .await
            .map_err(|e| DialError::Unreachable(e.to_string()))?;

        let stream = tokio::time::timeout(self.dial_timeout, self.swarm.connect(self.public_key))
            .await
            .map_err(|_| DialError::DialTimeout)?
            .map_err(|e| DialError::Unreachable(e.to_string()))?;

        let (channel, mut events) = Channel::open(
            stream,
            HandshakePayload::gateway(),
            Router::new(),
            self.handshake_timeout,
        )
        .await
        .map_err(|_| DialError::HandshakeTimeout)?;

        // Events surfaced on an outbound connection (WsFrame/Telemetry pushed by
        // the peer, or requests matching nothing locally) have no consumer on
        // this side yet; drain them so the channel doesn't back up.
        tokio::spawn(async move { while events.recv().await.is_some() {} });

        *guard = State::Connected(channel.clone());
        drop(guard);

        self.identify(&channel).await;
        self.touch();
        Ok(channel)
    }

    /// `POST /identify-gateway` — best-effort, failure does not fail the dial.
    async fn identify(&self, channel: &Channel) {
        let timestamp = now_millis();
        let body = json!({ "type": "gateway", "timestamp": timestamp });
        let body_bytes = serde_json::to_vec(&body).ok();
        let result = channel
            .send_request(
                "POST",
                "/identify-gateway",
                HashMap::new(),
                body_bytes,
                Duration::from_secs(5),
            )
            .await;
        match result {
            Ok(resp) if resp.status_code == 200 => debug!(pk = %hex::encode(self.public_key), "identify-gateway ok"),
            Ok(resp) => warn!(pk = %hex::encode(self.public_key), status = resp.status_code, "identify-gateway non-200"),
            Err(e) => warn!(pk = %hex::encode(self.public_key), err = %e, "identify-gateway failed (non-fatal)"),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    pub async fn send_request(
        &self,
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<crate::protocol::codec::ResponseMsg, DialError> {
        let channel = self.connect().await?;
        self.touch();
        Ok(channel.send_request(method, path, headers, body, timeout).await?)
    }

    pub async fn health_check(&self, timeout: Duration) -> Result<crate::protocol::codec::HealthResponseMsg, DialError> {
        let channel = self.connect().await?;
        self.touch();
        Ok(channel.health_check(now_millis(), timeout).await?)
    }

    pub fn send_telemetry(&self, payload: serde_json::Value) -> Result<(), DialError> {
        // Telemetry requires an already-open channel; callers that need a
        // guaranteed send should call `connect()` first.
        let guard = self.state.try_lock().map_err(|_| DialError::Unreachable("connection busy".to_string()))?;
        match &*guard {
            State::Connected(ch) => Ok(ch.send_fire_and_forget(Message::Telemetry(payload))?),
            State::Idle => Err(DialError::Unreachable("not connected".to_string())),
        }
    }

    /// Idempotent: drop whatever state we have, release the peer discovery
    /// join, and revert to `Idle`.
    pub async fn destroy(&self) {
        let mut guard = self.state.lock().await;
        if let State::Connected(ch) = std::mem::replace(&mut *guard, State::Idle) {
            ch.close().await;
        }
        drop(guard);
        self.swarm.leave_peer(self.public_key).await;
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
