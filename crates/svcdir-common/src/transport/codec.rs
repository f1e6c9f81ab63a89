use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::error::Result;

/// JSON codec for encoding/decoding session frames and opaque payload bodies.
///
/// The generic `encode`/`decode` pair is the `encode(obj) -> bytes` /
/// `decode(bytes, type) -> obj` boundary used by callers that build request
/// payloads.
///
/// # Example
///
/// ```
/// use svcdir_common::transport::JsonCodec;
/// use svcdir_common::{ErrorCode, ServiceDirectoryError};
///
/// let error = ServiceDirectoryError::new(ErrorCode::ServiceNotExist, ["billing"]);
/// let encoded = JsonCodec::encode(&error).unwrap();
/// let decoded: ServiceDirectoryError = JsonCodec::decode(&encoded).unwrap();
/// assert_eq!(decoded, error);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Encode any serializable value to JSON bytes
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Decode JSON bytes into `T`
    pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}
