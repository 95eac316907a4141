//! Network message types for overlay communication
//!
//! Every frame on the wire is a JSON object in one of two shapes: a request
//! (`action` + `payload`) or a response (`action` + `status` + `message` +
//! `data`). Field names follow the overlay's established wire format.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Magic bytes for frame delimiting
pub const MAGIC: [u8; 4] = [0x43, 0x48, 0x4F, 0x56]; // "CHOV"

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Payload key marking a request that was already forwarded once
pub const ALREADY_ROUTED_KEY: &str = "_yaEnrutado";

/// Frame decoding errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Frame is neither a request nor a response")]
    UnknownShape,
}

// ===== Identity =====

/// Stable peer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// How a peer announces itself during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub peer_id: PeerId,
    pub ip: String,
    pub puerto: u16,
    pub nombre_servidor: String,
}

impl PeerDescriptor {
    pub fn new(peer_id: PeerId, ip: impl Into<String>, puerto: u16, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            ip: ip.into(),
            puerto,
            nombre_servidor: name.into(),
        }
    }

    /// `ip:port` string
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.puerto)
    }
}

// ===== Actions =====

/// Wire action, normalised to lower case
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Handshake,
    Heartbeat,
    DiscoverPeers,
    LocateUser,
    /// Forwarded client request (`retransmitirpeticion`)
    Retransmit,
    SyncRootHash,
    SyncGetIds,
    SyncGetEntity,
    SyncGetAttachment,
    /// Application-defined action
    Custom(String),
}

impl Action {
    /// Parse an action name case-insensitively
    pub fn parse(name: &str) -> Self {
        let normalized = name.trim().to_lowercase();
        match normalized.as_str() {
            "handshake" => Action::Handshake,
            "heartbeat" => Action::Heartbeat,
            "discover_peers" => Action::DiscoverPeers,
            "locate_user" => Action::LocateUser,
            "retransmitirpeticion" => Action::Retransmit,
            "sync_root_hash" => Action::SyncRootHash,
            "sync_get_ids" => Action::SyncGetIds,
            "sync_get_entity" => Action::SyncGetEntity,
            "sync_get_attachment" => Action::SyncGetAttachment,
            _ => Action::Custom(normalized),
        }
    }

    /// Name used on the wire
    pub fn as_str(&self) -> &str {
        match self {
            Action::Handshake => "handshake",
            Action::Heartbeat => "heartbeat",
            Action::DiscoverPeers => "discover_peers",
            Action::LocateUser => "locate_user",
            Action::Retransmit => "retransmitirpeticion",
            Action::SyncRootHash => "sync_root_hash",
            Action::SyncGetIds => "sync_get_ids",
            Action::SyncGetEntity => "sync_get_entity",
            Action::SyncGetAttachment => "sync_get_attachment",
            Action::Custom(name) => name,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Action {
    fn from(name: &str) -> Self {
        Action::parse(name)
    }
}

impl From<String> for Action {
    fn from(name: String) -> Self {
        Action::parse(&name)
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.as_str().to_string()
    }
}

// ===== Envelopes =====

/// A request frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub action: Action,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

impl RequestEnvelope {
    pub fn new(action: impl Into<Action>, payload: Value) -> Self {
        Self {
            action: action.into(),
            payload,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Whether this request was already forwarded by another peer
    pub fn is_already_routed(&self) -> bool {
        is_already_routed(&self.payload)
    }

    /// Set the already-routed flag on the payload
    pub fn mark_routed(&mut self) {
        mark_routed(&mut self.payload);
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// A response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub action: Action,
    pub status: Status,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

impl ResponseEnvelope {
    pub fn success(action: impl Into<Action>, message: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: Status::Success,
            message: message.into(),
            data: None,
            request_id: None,
        }
    }

    pub fn error(action: impl Into<Action>, message: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: Status::Error,
            message: message.into(),
            data: None,
            request_id: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_request_id(mut self, request_id: Option<Uuid>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Data of a successful response, or the error message
    pub fn into_data(self) -> Result<Value, String> {
        match self.status {
            Status::Success => Ok(self.data.unwrap_or(Value::Null)),
            Status::Error => Err(self.message),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

impl Frame {
    /// Decode raw bytes. Objects with `action` and no `status` are tried as
    /// requests first; anything carrying `status` is read as a response.
    pub fn decode(raw: &[u8]) -> Result<Frame, MessageError> {
        let value: Value = serde_json::from_slice(raw)?;
        let object = value.as_object().ok_or(MessageError::UnknownShape)?;

        let has_status = object.contains_key("status");
        if object.contains_key("action") && !has_status {
            if let Ok(request) = serde_json::from_value::<RequestEnvelope>(value.clone()) {
                return Ok(Frame::Request(request));
            }
        }

        if has_status {
            return Ok(Frame::Response(serde_json::from_value(value)?));
        }

        Err(MessageError::UnknownShape)
    }

    pub fn action(&self) -> &Action {
        match self {
            Frame::Request(r) => &r.action,
            Frame::Response(r) => &r.action,
        }
    }
}

// ===== Payloads =====

/// Heartbeat payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub peer_id: PeerId,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Origin section of a retransmission envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginPeer {
    pub peer_id: PeerId,
    pub nombre_servidor: String,
}

/// The client request carried inside a retransmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub action: Action,
    #[serde(default)]
    pub payload: Value,
}

/// Request forwarded on behalf of a client to the peer hosting the target user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetransmissionEnvelope {
    pub peer_origen: OriginPeer,
    pub peer_destino_id: PeerId,
    pub peticion_cliente: ClientRequest,
}

impl RetransmissionEnvelope {
    /// Wrap a client request. The inner payload gains the destination, the
    /// sender and the already-routed flag.
    pub fn wrap(origin: &PeerDescriptor, destination: PeerId, action: Action, payload: Value) -> Self {
        let mut payload = match payload {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(Default::default()),
            other => serde_json::json!({ "value": other }),
        };
        if let Value::Object(map) = &mut payload {
            map.insert("peerDestinoId".into(), Value::String(destination.to_string()));
            map.insert("peerRemitenteId".into(), Value::String(origin.peer_id.to_string()));
        }
        mark_routed(&mut payload);

        Self {
            peer_origen: OriginPeer {
                peer_id: origin.peer_id,
                nombre_servidor: origin.nombre_servidor.clone(),
            },
            peer_destino_id: destination,
            peticion_cliente: ClientRequest { action, payload },
        }
    }

    /// The inner request, flagged as already routed
    pub fn into_request(self) -> RequestEnvelope {
        let mut request = RequestEnvelope::new(self.peticion_cliente.action, self.peticion_cliente.payload);
        request.mark_routed();
        request
    }
}

/// Whether a payload carries the already-routed flag
pub fn is_already_routed(payload: &Value) -> bool {
    payload
        .get(ALREADY_ROUTED_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn mark_routed(payload: &mut Value) {
    if payload.is_null() {
        *payload = Value::Object(Default::default());
    }
    if let Value::Object(map) = payload {
        map.insert(ALREADY_ROUTED_KEY.to_string(), Value::Bool(true));
    }
}
