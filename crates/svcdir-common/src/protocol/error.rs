use thiserror::Error;

use super::endpoint::Endpoint;
use super::error_code::{ErrorCode, ServiceDirectoryError};

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Connect to {endpoint} timed out after {timeout_ms}ms")]
    ConnectTimeout { endpoint: Endpoint, timeout_ms: u64 },

    #[error("No data received within {0}ms")]
    ReadTimeout(u64),

    #[error("Session expired")]
    SessionExpired,

    #[error("Authentication failed on {endpoint}: {reason}")]
    AuthFailed { endpoint: Endpoint, reason: String },

    #[error("Outstanding packet limit of {0} reached")]
    BacklogFull(usize),

    #[error("Connection lost: {0}")]
    ConnectionLoss(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("No candidate instances for service {0}")]
    EmptyCandidates(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Server roster is empty")]
    EmptyRoster,

    #[error("{}", .0.message())]
    Server(ServiceDirectoryError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DirectoryError {
    /// Stable error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            DirectoryError::ConnectTimeout { .. } => ErrorCode::ConnectTimeout,
            DirectoryError::ReadTimeout(_) => ErrorCode::ReadTimeout,
            DirectoryError::SessionExpired => ErrorCode::SessionExpired,
            DirectoryError::AuthFailed { .. } => ErrorCode::AuthenticationFailed,
            DirectoryError::BacklogFull(_) => ErrorCode::RequestBacklogFull,
            DirectoryError::ConnectionLoss(_) | DirectoryError::Io(_) => ErrorCode::ConnectionLoss,
            DirectoryError::ConnectionClosed => ErrorCode::ConnectionClosed,
            DirectoryError::EmptyCandidates(_) => ErrorCode::NoAvailableInstance,
            DirectoryError::Protocol(_) | DirectoryError::Json(_) => ErrorCode::ProtocolError,
            DirectoryError::InvalidEndpoint(_) | DirectoryError::EmptyRoster => {
                ErrorCode::InvalidServerList
            }
            DirectoryError::Server(e) => e.code(),
        }
    }

    /// Converts this failure into the wire error model.
    pub fn to_service_error(&self) -> ServiceDirectoryError {
        match self {
            DirectoryError::Server(e) => e.clone(),
            DirectoryError::ConnectTimeout {
                endpoint,
                timeout_ms,
            } => ServiceDirectoryError::new(
                self.code(),
                [endpoint.to_string(), timeout_ms.to_string()],
            ),
            DirectoryError::ReadTimeout(ms) => {
                ServiceDirectoryError::new(self.code(), [ms.to_string()])
            }
            DirectoryError::BacklogFull(limit) => {
                ServiceDirectoryError::new(self.code(), [limit.to_string()])
            }
            DirectoryError::AuthFailed { endpoint, reason } => {
                ServiceDirectoryError::new(self.code(), [endpoint.to_string(), reason.clone()])
            }
            DirectoryError::EmptyCandidates(service) => {
                ServiceDirectoryError::new(self.code(), [service.clone()])
            }
            DirectoryError::ConnectionLoss(detail)
            | DirectoryError::Protocol(detail)
            | DirectoryError::InvalidEndpoint(detail) => {
                ServiceDirectoryError::new(self.code(), [detail.clone()])
            }
            DirectoryError::Json(e) => ServiceDirectoryError::new(self.code(), [e.to_string()]),
            DirectoryError::Io(e) => ServiceDirectoryError::new(self.code(), [e.to_string()]),
            DirectoryError::EmptyRoster => {
                ServiceDirectoryError::new(self.code(), ["no endpoints configured"])
            }
            DirectoryError::SessionExpired | DirectoryError::ConnectionClosed => {
                ServiceDirectoryError::from_code(self.code())
            }
        }
    }

    /// Whether this failure is an authentication rejection.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, DirectoryError::AuthFailed { .. })
    }
}

impl From<ServiceDirectoryError> for DirectoryError {
    fn from(err: ServiceDirectoryError) -> Self {
        DirectoryError::Server(err)
    }
}

pub type Result<T> = std::result::Result<T, DirectoryError>;
