pub mod endpoint;
pub mod error;
pub mod error_code;
pub mod frames;
pub mod heartbeat;
pub mod instance;


pub use endpoint::Endpoint;
pub use error::{DirectoryError, Result};
pub use error_code::{ErrorCode, ServiceDirectoryError, UnknownCode};
pub use frames::{
    ClientFrame, ConnectRequest, ConnectResponse, Credentials, OpCode, RequestFrame,
    ResponseFrame, ServerFrame, SessionId, Xid, PROTOCOL_VERSION,
};
pub use heartbeat::{HeartbeatNormalizer, ProviderIdentity};
pub use instance::{InstanceNotification, OperationalStatus, ServiceInstance};
