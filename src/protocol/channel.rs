//! A single logical [`Channel`] multiplexed over one peer byte stream (§4.1).
//!
//! Mirrors `clawd::ipc`'s request/response correlation table: callers get a
//! oneshot future keyed by a per-channel id, a reader task owns the socket
//! and resolves pendings as replies arrive, and channel close fails every
//! outstanding pending with [`ProtocolError::ChannelClosed`].

use super::codec::{HandshakePayload, HealthCheckMsg, HealthResponseMsg, Message, RequestMsg, ResponseMsg};
use super::router::Router;
use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

/// Something the reader task could not correlate to a pending RPC: either a
/// fire-and-forget message, or an inbound request that didn't match a
/// registered route.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Request(RequestMsg),
    WsFrame(serde_json::Value),
    Telemetry(serde_json::Value),
}

struct Pending {
    tx: oneshot::Sender<Result<Message, ProtocolError>>,
}

struct Shared {
    pending: Mutex<HashMap<u32, Pending>>,
    next_request_id: AtomicU32,
    next_health_id: AtomicU32,
    closed: AtomicBool,
    write_tx: mpsc::UnboundedSender<Bytes>,
    tasks: Mutex<Vec<tokio::task::AbortHandle>>,
}

impl Shared {
    async fn fail_all(&self) {
        let mut table = self.pending.lock().await;
        for (_, pending) in table.drain() {
            let _ = pending.tx.send(Err(ProtocolError::ChannelClosed));
        }
    }
}

/// A duplex mux channel. Cheap to clone — clones share the reader task and
/// pending table.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
    router: Arc<Router>,
}

impl Channel {
    /// Perform the handshake and spawn the reader task. Returns the channel
    /// plus a receiver for events the reader could not correlate to a
    /// pending RPC (§4.1 "emitted as a generic event").
    pub async fn open<S>(
        stream: S,
        local: HandshakePayload,
        router: Router,
        handshake_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundEvent>), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let handshake_bytes = serde_json::to_vec(&local)
            .map_err(|e| ProtocolError::HandshakeFailed(e.to_string()))?;
        framed
            .send(Bytes::from(handshake_bytes))
            .await
            .map_err(ProtocolError::Io)?;

        let remote_frame = tokio::time::timeout(handshake_timeout, framed.next())
            .await
            .map_err(|_| ProtocolError::HandshakeFailed("handshake timed out".to_string()))?
            .ok_or_else(|| ProtocolError::HandshakeFailed("stream closed during handshake".to_string()))?
            .map_err(ProtocolError::Io)?;
        let remote: HandshakePayload = serde_json::from_slice(&remote_frame)
            .map_err(|e| ProtocolError::HandshakeFailed(format!("bad remote handshake: {e}")))?;
        debug!(role = ?remote.role, version = %remote.version, "channel handshake complete");

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Bytes>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<InboundEvent>();

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU32::new(1),
            next_health_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            write_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let (mut sink, mut stream_half) = framed.split();
        let writer_shared = shared.clone();
        let writer_handle = tokio::spawn(async move {
            while let Some(bytes) = write_rx.recv().await {
                if sink.send(bytes).await.is_err() {
                    break;
                }
            }
            writer_shared.closed.store(true, Ordering::SeqCst);
        })
        .abort_handle();

        let reader_shared = shared.clone();
        let router = Arc::new(router);
        let reader_router = router.clone();
        let reader_handle = tokio::spawn(async move {
            loop {
                let frame: Option<Result<BytesMut, std::io::Error>> = stream_half.next().await;
                match frame {
                    Some(Ok(bytes)) => match Message::decode(&bytes) {
                        Ok(msg) => dispatch_inbound(&reader_shared, &reader_router, msg, &event_tx).await,
                        Err(e) => warn!(err = %e, "dropping malformed frame"),
                    },
                    Some(Err(e)) => {
                        warn!(err = %e, "channel stream error, closing");
                        break;
                    }
                    None => break,
                }
            }
            reader_shared.closed.store(true, Ordering::SeqCst);
            reader_shared.fail_all().await;
        })
        .abort_handle();

        shared.tasks.lock().await.extend([writer_handle, reader_handle]);

        Ok((Self { shared, router }, event_rx))
    }

    /// Abort the reader/writer tasks, mark closed, and fail every pending
    /// RPC — used when the owning [`PeerConnection`] is destroyed or
    /// replaced for staleness (§4.2 `destroy`, §4.3 stale eviction).
    ///
    /// [`PeerConnection`]: crate::peer::PeerConnection
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        for handle in self.shared.tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.shared.fail_all().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Send a Request (message 0) and await its Response with a timeout.
    pub async fn send_request(
        &self,
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ResponseMsg, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ChannelClosed);
        }
        let id = self.shared.next_request_id.fetch_add(1, Ordering::SeqCst);
        let msg = Message::Request(RequestMsg {
            id,
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body,
        });
        let reply = self.roundtrip(id, msg, timeout).await?;
        match reply {
            Message::Response(resp) => Ok(resp),
            _ => Err(ProtocolError::MalformedFrame("expected Response".to_string())),
        }
    }

    /// Send a HealthCheck (message 3) and await its HealthResponse.
    pub async fn health_check(&self, timestamp: i64, timeout: Duration) -> Result<HealthResponseMsg, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ChannelClosed);
        }
        let id = self.shared.next_health_id.fetch_add(1, Ordering::SeqCst);
        let msg = Message::HealthCheck(HealthCheckMsg { id, timestamp });
        let reply = self.roundtrip(id, msg, timeout).await?;
        match reply {
            Message::HealthResponse(resp) => Ok(resp),
            _ => Err(ProtocolError::MalformedFrame("expected HealthResponse".to_string())),
        }
    }

    /// Fire-and-forget WsFrame or Telemetry (message 2/5) — no correlation.
    pub fn send_fire_and_forget(&self, msg: Message) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ChannelClosed);
        }
        self.shared
            .write_tx
            .send(Bytes::from(msg.encode()))
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    async fn roundtrip(&self, id: u32, msg: Message, timeout: Duration) -> Result<Message, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.shared.pending.lock().await;
            table.insert(id, Pending { tx });
        }
        if self.shared.write_tx.send(Bytes::from(msg.encode())).is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(ProtocolError::ChannelClosed);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ProtocolError::ChannelClosed),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(ProtocolError::RequestTimeout)
            }
        }
    }
}

async fn dispatch_inbound(
    shared: &Arc<Shared>,
    router: &Router,
    msg: Message,
    events: &mpsc::UnboundedSender<InboundEvent>,
) {
    match msg {
        Message::Response(ref resp) => {
            let mut table = shared.pending.lock().await;
            if let Some(pending) = table.remove(&resp.id) {
                let _ = pending.tx.send(Ok(msg));
            }
        }
        Message::HealthResponse(ref resp) => {
            let mut table = shared.pending.lock().await;
            if let Some(pending) = table.remove(&resp.id) {
                let _ = pending.tx.send(Ok(msg));
            }
        }
        Message::Request(req) => {
            // No local handler table is registered on gateway-side channels (the
            // gateway dials out, it doesn't serve inbound requests on them), so a
            // route match is purely informational here; every request surfaces as
            // an event for the owning Connection to decide what, if anything, to
            // do with it.
            if router.route(&req.path).is_none() {
                debug!(path = %req.path, "inbound request matched no registered route");
            }
            let _ = events.send(InboundEvent::Request(req));
        }
        Message::WsFrame(v) => {
            let _ = events.send(InboundEvent::WsFrame(v));
        }
        Message::Telemetry(v) => {
            let _ = events.send(InboundEvent::Telemetry(v));
        }
        Message::HealthCheck(_) => {
            // The gateway never answers health checks itself in this direction;
            // peers poll us, not the other way around, so this is unexpected.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::Role;
    use tokio::io::duplex;

    fn gateway_handshake() -> HandshakePayload {
        HandshakePayload::gateway()
    }

    fn peer_handshake() -> HandshakePayload {
        HandshakePayload {
            version: "2.0".to_string(),
            is_server: true,
            is_gateway: false,
            role: Role::Server,
            capabilities: vec!["http".to_string()],
        }
    }

    #[tokio::test]
    async fn request_roundtrip_over_a_duplex_pipe() {
        let (client_io, server_io) = duplex(64 * 1024);

        let client_fut = Channel::open(client_io, gateway_handshake(), Router::new(), Duration::from_secs(1));
        let server_fut = Channel::open(server_io, peer_handshake(), Router::new(), Duration::from_secs(1));
        let (client_res, server_res) = tokio::join!(client_fut, server_fut);
        let (client, _client_events) = client_res.unwrap();
        let (server, mut server_events) = server_res.unwrap();

        let responder = tokio::spawn(async move {
            match server_events.recv().await {
                Some(InboundEvent::Request(req)) => {
                    let resp = Message::Response(ResponseMsg {
                        id: req.id,
                        status_code: 200,
                        headers: HashMap::new(),
                        body: Some(b"pong".to_vec()),
                    });
                    server.send_fire_and_forget(resp).unwrap();
                }
                other => panic!("unexpected event: {other:?}"),
            }
        });

        let resp = client
            .send_request("GET", "/unmatched", HashMap::new(), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body.as_deref(), Some(b"pong".as_slice()));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn request_times_out_with_no_responder() {
        let (client_io, server_io) = duplex(64 * 1024);
        let client_fut = Channel::open(client_io, gateway_handshake(), Router::new(), Duration::from_secs(1));
        let server_fut = Channel::open(server_io, peer_handshake(), Router::new(), Duration::from_secs(1));
        let (client_res, server_res) = tokio::join!(client_fut, server_fut);
        let (client, _ce) = client_res.unwrap();
        let (_server, _se) = server_res.unwrap();

        let result = client
            .send_request("GET", "/unmatched", HashMap::new(), None, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ProtocolError::RequestTimeout)));
    }

    #[tokio::test]
    async fn closing_the_stream_fails_pending_requests() {
        let (client_io, server_io) = duplex(64 * 1024);
        let client_fut = Channel::open(client_io, gateway_handshake(), Router::new(), Duration::from_secs(1));
        let server_fut = Channel::open(server_io, peer_handshake(), Router::new(), Duration::from_secs(1));
        let (client_res, server_res) = tokio::join!(client_fut, server_fut);
        let (client, _ce) = client_res.unwrap();
        let (server, _se) = server_res.unwrap();

        drop(server);
        let result = client
            .send_request("GET", "/unmatched", HashMap::new(), None, Duration::from_secs(2))
            .await;
        assert!(result.is_err());
    }
}
