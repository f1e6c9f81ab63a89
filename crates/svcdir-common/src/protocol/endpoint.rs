//! Directory server endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::DirectoryError;

/// A directory server's host/port pair.
///
/// Endpoints are immutable once parsed. IPv6 hosts are written in brackets
/// (`[::1]:2013`) and stored without them.
///
/// # Example
///
/// ```
/// use svcdir_common::Endpoint;
///
/// let endpoint: Endpoint = "sd1.example.com:2013".parse().unwrap();
/// assert_eq!(endpoint.host(), "sd1.example.com");
/// assert_eq!(endpoint.port(), 2013);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address string suitable for `tokio::net::TcpStream::connect`.
    pub fn socket_addr_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_addr_string())
    }
}

impl FromStr for Endpoint {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || DirectoryError::InvalidEndpoint(s.to_string());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
            let port = rest.strip_prefix(':').ok_or_else(invalid)?;
            (host, port)
        } else {
            s.rsplit_once(':').ok_or_else(invalid)?
        };

        if host.is_empty() || (host.contains(':') && !s.starts_with('[')) {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Endpoint::new(host, port))
    }
}
