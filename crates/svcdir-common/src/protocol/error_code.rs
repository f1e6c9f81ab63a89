//! Error codes and the wire error model.
//!
//! A [`ServiceDirectoryError`] carries only a stable [`ErrorCode`] and its
//! substitution parameters. The human-readable message is derived on whichever
//! side renders it, so the rendered string never crosses the wire.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Stable error codes shared by client and server.
///
/// Codes are serialized as their numeric value. Codes this build does not know
/// about decode to [`ErrorCode::Unrecognized`] instead of failing; that
/// variant can only be obtained through `From<u16>`, so every code
/// round-trips through its numeric value unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum ErrorCode {
    ServiceNotExist,
    ServiceInstanceNotExist,
    ServiceInstanceAlreadyExist,
    IllegalArgument,
    IllegalOperationalStatus,
    ConnectionLoss,
    ConnectionClosed,
    SessionExpired,
    ConnectTimeout,
    ReadTimeout,
    AuthenticationFailed,
    RequestBacklogFull,
    InvalidServerList,
    NoAvailableInstance,
    ProtocolError,
    ServerError,
    Unrecognized(UnknownCode),
}

/// A numeric code with no named [`ErrorCode`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnknownCode(u16);

impl UnknownCode {
    pub fn get(self) -> u16 {
        self.0
    }
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::ServiceNotExist => 1001,
            ErrorCode::ServiceInstanceNotExist => 1002,
            ErrorCode::ServiceInstanceAlreadyExist => 1003,
            ErrorCode::IllegalArgument => 1004,
            ErrorCode::IllegalOperationalStatus => 1005,
            ErrorCode::ConnectionLoss => 2001,
            ErrorCode::ConnectionClosed => 2002,
            ErrorCode::SessionExpired => 2003,
            ErrorCode::ConnectTimeout => 2004,
            ErrorCode::ReadTimeout => 2005,
            ErrorCode::AuthenticationFailed => 2006,
            ErrorCode::RequestBacklogFull => 2007,
            ErrorCode::InvalidServerList => 2008,
            ErrorCode::NoAvailableInstance => 3001,
            ErrorCode::ProtocolError => 4001,
            ErrorCode::ServerError => 5001,
            ErrorCode::Unrecognized(code) => code.get(),
        }
    }

    /// Message template with positional `{0}`, `{1}`, ... placeholders.
    pub fn template(self) -> Cow<'static, str> {
        let template = match self {
            ErrorCode::ServiceNotExist => "The Service {0} does not exist.",
            ErrorCode::ServiceInstanceNotExist => {
                "The ServiceInstance {1} does not exist in Service {0}."
            }
            ErrorCode::ServiceInstanceAlreadyExist => {
                "The ServiceInstance {1} already exists in Service {0}."
            }
            ErrorCode::IllegalArgument => "Illegal argument: {0}.",
            ErrorCode::IllegalOperationalStatus => {
                "Illegal OperationalStatus {0} for ServiceInstance {1}."
            }
            ErrorCode::ConnectionLoss => "Connection to the directory server was lost: {0}.",
            ErrorCode::ConnectionClosed => "The directory connection is closed.",
            ErrorCode::SessionExpired => "The directory session has expired.",
            ErrorCode::ConnectTimeout => "Connecting to {0} timed out after {1}ms.",
            ErrorCode::ReadTimeout => "No data received from the directory server within {0}ms.",
            ErrorCode::AuthenticationFailed => "Authentication failed on {0}: {1}.",
            ErrorCode::RequestBacklogFull => "The outstanding request limit of {0} was reached.",
            ErrorCode::InvalidServerList => "Invalid directory server list: {0}.",
            ErrorCode::NoAvailableInstance => "No available instance for Service {0}.",
            ErrorCode::ProtocolError => "Protocol error: {0}.",
            ErrorCode::ServerError => "Directory server error: {0}.",
            ErrorCode::Unrecognized(code) => {
                return Cow::Owned(format!("Unrecognized error code {}.", code.get()));
            }
        };
        Cow::Borrowed(template)
    }
}

impl From<u16> for ErrorCode {
    fn from(code: u16) -> Self {
        match code {
            1001 => ErrorCode::ServiceNotExist,
            1002 => ErrorCode::ServiceInstanceNotExist,
            1003 => ErrorCode::ServiceInstanceAlreadyExist,
            1004 => ErrorCode::IllegalArgument,
            1005 => ErrorCode::IllegalOperationalStatus,
            2001 => ErrorCode::ConnectionLoss,
            2002 => ErrorCode::ConnectionClosed,
            2003 => ErrorCode::SessionExpired,
            2004 => ErrorCode::ConnectTimeout,
            2005 => ErrorCode::ReadTimeout,
            2006 => ErrorCode::AuthenticationFailed,
            2007 => ErrorCode::RequestBacklogFull,
            2008 => ErrorCode::InvalidServerList,
            3001 => ErrorCode::NoAvailableInstance,
            4001 => ErrorCode::ProtocolError,
            5001 => ErrorCode::ServerError,
            other => ErrorCode::Unrecognized(UnknownCode(other)),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u16())
    }
}

/// An error as carried on the wire: a code plus ordered substitution parameters.
///
/// Constructing one never fails, and neither does rendering it.
///
/// # Example
///
/// ```
/// use svcdir_common::{ErrorCode, ServiceDirectoryError};
///
/// let error = ServiceDirectoryError::new(
///     ErrorCode::ServiceInstanceNotExist,
///     ["billing", "10.0.0.7"],
/// );
/// assert_eq!(
///     error.message(),
///     "The ServiceInstance 10.0.0.7 does not exist in Service billing."
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDirectoryError {
    code: ErrorCode,
    #[serde(default)]
    params: Vec<String>,
}

impl ServiceDirectoryError {
    pub fn new<I, S>(code: ErrorCode, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            code,
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code,
            params: Vec::new(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Renders the code's template with the parameters substituted.
    pub fn message(&self) -> String {
        render_template(&self.code.template(), &self.params)
    }
}

impl fmt::Display for ServiceDirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for ServiceDirectoryError {}

/// Positional substitution of `{n}` placeholders.
///
/// Placeholders without a matching parameter, and anything that is not a
/// well-formed `{digits}` placeholder, are copied through literally. Surplus
/// parameters are ignored.
pub fn render_template(template: &str, params: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();

        let substituted = (digits > 0 && after.as_bytes().get(digits) == Some(&b'}'))
            .then(|| after[..digits].parse::<usize>().ok())
            .flatten()
            .and_then(|index| params.get(index));

        match substituted {
            Some(param) => {
                out.push_str(param);
                rest = &after[digits + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
