//! Service Directory Client Runtime
//!
//! Connection, session and instance-selection layer for service directory
//! clients. Providers register service instances through a [`Connection`],
//! consumers look them up and pick one with a [`LoadBalancer`].
//!
//! # Components
//!
//! - [`ServerRoster`]: failover-ordered directory server endpoints
//! - [`Connection`]: session handshake, packet queue, timeouts, reconnect
//! - [`Packet`]: one request/response unit with a once-only callback
//! - [`InstanceCache`]: instance lists maintained from pushed notifications
//! - [`RoundRobinLoadBalancer`] / [`HealthAwareLoadBalancer`]: instance selection
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use svcdir_client::{
//!     Connection, ConnectionConfig, InstanceCache, RoundRobinLoadBalancer, ServerRoster,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let roster = Arc::new(ServerRoster::parse(["sd1:2013", "sd2:2013", "sd3:2013"])?);
//! let connection = Connection::new(roster, ConnectionConfig::default());
//!
//! let cache = Arc::new(InstanceCache::new());
//! cache.attach(&connection);
//! connection.connect().await?;
//!
//! let balancer = RoundRobinLoadBalancer::new();
//! let instance = cache.lookup_instance("billing", &balancer)?;
//! println!("calling {}", instance.uri);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
mod dispatch;
pub mod events;
pub mod instance_cache;
pub mod load_balancer;
pub mod packet;
pub mod roster;
mod session;

pub use config::{ConnectionConfig, RetryConfig};
pub use connection::Connection;
pub use events::{
    ClientSessionEvent, ClientStatusEvent, ConnectionStatus, ListenerId, SessionEvent,
};
pub use instance_cache::{InstanceCache, InstanceChangeHandler};
pub use load_balancer::{HealthAwareLoadBalancer, LoadBalancer, RoundRobinLoadBalancer};
pub use packet::{Packet, PacketCallback, PacketTimings};
pub use roster::ServerRoster;
