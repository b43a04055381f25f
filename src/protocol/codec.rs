//! Message schemas and wire (de)serialization for the six enumerated
//! message types (§4.1).

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable ordering 0..5 — persisted on the wire as a single byte tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    WsFrame = 2,
    HealthCheck = 3,
    HealthResponse = 4,
    Telemetry = 5,
}

impl MessageType {
    fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::WsFrame),
            3 => Ok(Self::HealthCheck),
            4 => Ok(Self::HealthResponse),
            5 => Ok(Self::Telemetry),
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown message type tag {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMsg {
    pub id: u32,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "body_b64")]
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMsg {
    pub id: u32,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "body_b64")]
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckMsg {
    pub id: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponseMsg {
    pub id: u32,
    pub status: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<serde_json::Value>,
}

/// Bodies travel as JSON strings on the wire (base64) since the outer
/// envelope is JSON; this keeps §4.1's schema (`body: bytes|null`) honest
/// without requiring a binary sub-framing.
mod body_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => Some(STANDARD.encode(bytes)).serialize(s),
            None => None::<String>.serialize(s),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt = Option::<String>::deserialize(d)?;
        match opt {
            Some(s) => STANDARD.decode(&s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// A side's role in the handshake, advertised so the remote end can log and
/// (in principle) branch on topology — the gateway never special-cases it
/// beyond logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Gateway,
    GatewayReplica,
    Server,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub version: String,
    #[serde(rename = "isServer")]
    pub is_server: bool,
    #[serde(rename = "isGateway")]
    pub is_gateway: bool,
    pub role: Role,
    pub capabilities: Vec<String>,
}

impl HandshakePayload {
    pub fn gateway() -> Self {
        Self {
            version: super::PROTOCOL_VERSION.to_string(),
            is_server: false,
            is_gateway: true,
            role: Role::Gateway,
            capabilities: vec![
                "http".to_string(),
                "websocket".to_string(),
                "health".to_string(),
                "telemetry".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Request(RequestMsg),
    Response(ResponseMsg),
    WsFrame(serde_json::Value),
    HealthCheck(HealthCheckMsg),
    HealthResponse(HealthResponseMsg),
    Telemetry(serde_json::Value),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::Response(_) => MessageType::Response,
            Message::WsFrame(_) => MessageType::WsFrame,
            Message::HealthCheck(_) => MessageType::HealthCheck,
            Message::HealthResponse(_) => MessageType::HealthResponse,
            Message::Telemetry(_) => MessageType::Telemetry,
        }
    }

    /// Encode as `[tag: u8][json: utf8]` — the body handed to the
    /// length-delimited codec, which prefixes the overall frame length.
    pub fn encode(&self) -> Vec<u8> {
        let (tag, json) = match self {
            Message::Request(m) => (MessageType::Request as u8, serde_json::to_vec(m)),
            Message::Response(m) => (MessageType::Response as u8, serde_json::to_vec(m)),
            Message::WsFrame(m) => (MessageType::WsFrame as u8, serde_json::to_vec(m)),
            Message::HealthCheck(m) => (MessageType::HealthCheck as u8, serde_json::to_vec(m)),
            Message::HealthResponse(m) => (MessageType::HealthResponse as u8, serde_json::to_vec(m)),
            Message::Telemetry(m) => (MessageType::Telemetry as u8, serde_json::to_vec(m)),
        };
        let json = json.unwrap_or_else(|_| b"null".to_vec());
        let mut out = Vec::with_capacity(json.len() + 1);
        out.push(tag);
        out.extend_from_slice(&json);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (tag, json) = bytes
            .split_first()
            .ok_or_else(|| ProtocolError::MalformedFrame("empty frame".to_string()))?;
        let kind = MessageType::from_tag(*tag)?;
        let parse_err = |e: serde_json::Error| ProtocolError::MalformedFrame(e.to_string());
        Ok(match kind {
            MessageType::Request => Message::Request(serde_json::from_slice(json).map_err(parse_err)?),
            MessageType::Response => Message::Response(serde_json::from_slice(json).map_err(parse_err)?),
            MessageType::WsFrame => Message::WsFrame(serde_json::from_slice(json).map_err(parse_err)?),
            MessageType::HealthCheck => {
                Message::HealthCheck(serde_json::from_slice(json).map_err(parse_err)?)
            }
            MessageType::HealthResponse => {
                Message::HealthResponse(serde_json::from_slice(json).map_err(parse_err)?)
            }
            MessageType::Telemetry => Message::Telemetry(serde_json::from_slice(json).map_err(parse_err)?),
        })
    }
}
