//! Provider identity normalization for heartbeats.
//!
//! Legacy providers identify themselves as `address-port`; current providers
//! send the bare address. Both must resolve to the same `provider_address`,
//! while the legacy id is kept verbatim so instance identity stays stable.

use tracing::trace;

/// A provider identity, resolved once from a raw heartbeat id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderIdentity {
    /// Current protocol: the id is the address.
    Address(String),
    /// Legacy protocol: `address-port`, stored verbatim.
    Composite { id: String, address_len: usize },
}

impl ProviderIdentity {
    pub fn provider_address(&self) -> &str {
        match self {
            ProviderIdentity::Address(address) => address,
            ProviderIdentity::Composite { id, address_len } => &id[..*address_len],
        }
    }

    pub fn provider_id(&self) -> &str {
        match self {
            ProviderIdentity::Address(address) => address,
            ProviderIdentity::Composite { id, .. } => id,
        }
    }

    /// Port suffix of a legacy id.
    pub fn port(&self) -> Option<u16> {
        match self {
            ProviderIdentity::Address(_) => None,
            ProviderIdentity::Composite { id, address_len } => id[address_len + 1..].parse().ok(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, ProviderIdentity::Composite { .. })
    }

    pub fn into_pair(self) -> (String, String) {
        (self.provider_address().to_string(), self.provider_id().to_string())
    }
}

/// Derives `(provider_address, provider_id)` from raw heartbeat ids.
///
/// Never fails: anything that is not `<address>-<port>` with a non-empty
/// address and a numeric `u16` port is treated as a plain address.
///
/// # Example
///
/// ```
/// use svcdir_common::HeartbeatNormalizer;
///
/// let normalizer = HeartbeatNormalizer::new();
/// let identity = normalizer.normalize("billing", "10.0.0.7-8080");
/// assert_eq!(identity.provider_address(), "10.0.0.7");
/// assert_eq!(identity.provider_id(), "10.0.0.7-8080");
///
/// let identity = normalizer.normalize("billing", "10.0.0.7");
/// assert_eq!(identity.provider_address(), "10.0.0.7");
/// assert_eq!(identity.provider_id(), "10.0.0.7");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatNormalizer;

impl HeartbeatNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, service_name: &str, raw_provider_id: &str) -> ProviderIdentity {
        let identity = match split_port_suffix(raw_provider_id) {
            Some(address_len) => ProviderIdentity::Composite {
                id: raw_provider_id.to_string(),
                address_len,
            },
            None => ProviderIdentity::Address(raw_provider_id.to_string()),
        };
        trace!(
            service = service_name,
            raw = raw_provider_id,
            address = identity.provider_address(),
            legacy = identity.is_legacy(),
            "normalized provider identity"
        );
        identity
    }
}

/// Byte length of the address part if `raw` ends in `-<u16 port>`.
fn split_port_suffix(raw: &str) -> Option<usize> {
    let (address, port) = raw.rsplit_once('-')?;
    if address.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    port.parse::<u16>().ok()?;
    Some(address.len())
}
