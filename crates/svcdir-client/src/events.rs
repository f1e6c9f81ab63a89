//! Connection status and session lifecycle events.

use serde::{Deserialize, Serialize};
use std::fmt;
use svcdir_common::{Endpoint, SessionId};

/// Connection state as seen by applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    New,
    Connected,
    ConnectedReadonly,
    /// Terminal.
    Closed,
    AuthFailed,
    /// Transient; a reconnect is in progress.
    NotConnected,
}

impl ConnectionStatus {
    pub fn is_alive(self) -> bool {
        self != ConnectionStatus::Closed
    }

    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::ConnectedReadonly
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::New => "NEW",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::ConnectedReadonly => "CONNECTED_READONLY",
            ConnectionStatus::Closed => "CLOSED",
            ConnectionStatus::AuthFailed => "AUTH_FAILED",
            ConnectionStatus::NotConnected => "NOT_CONNECTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    Created,
    Closed,
    Reopen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatusEvent {
    pub previous: ConnectionStatus,
    pub current: ConnectionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSessionEvent {
    pub event: SessionEvent,
    /// Session the event refers to; for `Closed` this is the session that ended.
    pub session_id: Option<SessionId>,
    pub endpoint: Option<Endpoint>,
}

/// Handle returned by listener registration, used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);
