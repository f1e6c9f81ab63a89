//! Service instance data model and server-pushed availability notifications.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Operational status reported by a provider's heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationalStatus {
    Up,
    Down,
}

impl OperationalStatus {
    pub fn is_up(self) -> bool {
        self == OperationalStatus::Up
    }
}

impl fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationalStatus::Up => f.write_str("UP"),
            OperationalStatus::Down => f.write_str("DOWN"),
        }
    }
}

/// One registered provider of a service.
///
/// `provider_address` is always the bare address. `provider_id` is either the
/// same address or, for instances registered by legacy clients, the composite
/// `address-port` form kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    pub provider_id: String,
    pub provider_address: String,
    pub uri: String,
    pub status: OperationalStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Milliseconds since the Unix epoch of the last heartbeat seen.
    #[serde(default)]
    pub last_heartbeat_ms: Option<u64>,
}

impl ServiceInstance {
    pub fn new(
        service_name: impl Into<String>,
        provider_address: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        let provider_address = provider_address.into();
        Self {
            service_name: service_name.into(),
            provider_id: provider_address.clone(),
            provider_address,
            uri: uri.into(),
            status: OperationalStatus::Up,
            metadata: HashMap::new(),
            last_heartbeat_ms: None,
        }
    }

    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    pub fn with_status(mut self, status: OperationalStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_up(&self) -> bool {
        self.status.is_up()
    }
}

/// Availability changes pushed by the server over an open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstanceNotification {
    Registered {
        instance: ServiceInstance,
    },
    Updated {
        instance: ServiceInstance,
    },
    Unregistered {
        service_name: String,
        provider_id: String,
    },
    Heartbeat {
        service_name: String,
        /// Raw id as sent by the provider, in either protocol form.
        provider_id: String,
        status: OperationalStatus,
        timestamp_ms: u64,
    },
}

impl InstanceNotification {
    pub fn service_name(&self) -> &str {
        match self {
            InstanceNotification::Registered { instance }
            | InstanceNotification::Updated { instance } => &instance.service_name,
            InstanceNotification::Unregistered { service_name, .. }
            | InstanceNotification::Heartbeat { service_name, .. } => service_name,
        }
    }
}
