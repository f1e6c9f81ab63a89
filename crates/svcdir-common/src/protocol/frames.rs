//! Wire frames exchanged on a directory session.
//!
//! Frames are the envelope around opaque request/response payloads. The
//! connection layer only looks at the envelope: correlation ids, session
//! negotiation, keepalives and server-pushed notifications.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error_code::ServiceDirectoryError;
use super::instance::InstanceNotification;

/// Correlation id, unique per outstanding request on a connection.
pub type Xid = u32;

/// Server-assigned session identifier.
pub type SessionId = u64;

/// Protocol revision spoken by this client.
pub const PROTOCOL_VERSION: u32 = 2;

/// Directory operations carried by request frames.
///
/// The connection never interprets these; they are routed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    RegisterInstance,
    UnregisterInstance,
    UpdateOperationalStatus,
    UpdateMetadata,
    LookupService,
    LookupInstance,
    GetAllServices,
    WatchService,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }
}

/// Session negotiation request, always the first frame on a new socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub protocol_version: u32,
    /// Previous session to resume, if any.
    pub session_id: Option<SessionId>,
    pub session_timeout_ms: u64,
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub read_only_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub session_id: SessionId,
    /// Negotiated session timeout; the client must honor this value.
    pub session_timeout_ms: u64,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub xid: Xid,
    pub op: OpCode,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub xid: Xid,
    #[serde(default)]
    pub error: Option<ServiceDirectoryError>,
    #[serde(default)]
    pub payload: Bytes,
}

impl ResponseFrame {
    pub fn success(xid: Xid, payload: impl Into<Bytes>) -> Self {
        Self {
            xid,
            error: None,
            payload: payload.into(),
        }
    }

    pub fn failure(xid: Xid, error: ServiceDirectoryError) -> Self {
        Self {
            xid,
            error: Some(error),
            payload: Bytes::new(),
        }
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect(ConnectRequest),
    Request(RequestFrame),
    Ping,
    Close,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected(ConnectResponse),
    AuthFailed { reason: String },
    Response(ResponseFrame),
    Pong,
    Notification(InstanceNotification),
    SessionExpired,
}
