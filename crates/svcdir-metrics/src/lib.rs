//! Service Directory Packet Latency Instrumentation
//!
//! This crate records how long directory request packets spend in each stage
//! of their lifecycle. A registry is owned by a single connection and is only
//! populated when that connection enables latency collection, so tests and
//! applications can toggle instrumentation per instance.
//!
//! # Architecture
//!
//! - [`LatencyRegistry`]: lock-free per-stage histograms and outcome counters
//! - [`PacketStage`]: the lifecycle span a sample belongs to
//! - [`LatencySnapshot`]: serializable point-in-time view of the registry
//!
//! # Stages
//!
//! | Stage        | Span                         |
//! |--------------|------------------------------|
//! | `queue`      | queued -> written to socket  |
//! | `round_trip` | written -> response received |
//! | `dispatch`   | finished -> callback invoked |
//! | `total`      | created -> callback invoked  |
//!
//! # Usage Example
//!
//! ```rust
//! use svcdir_metrics::{LatencyRegistry, PacketStage};
//! use std::time::Duration;
//!
//! let registry = LatencyRegistry::new();
//! registry.record(PacketStage::RoundTrip, Duration::from_micros(850));
//! registry.record_outcome(true);
//!
//! let snapshot = registry.snapshot();
//! assert_eq!(snapshot.completed, 1);
//! assert_eq!(snapshot.stage(PacketStage::RoundTrip).count, 1);
//! ```
//!
//! Samples are observability only. Nothing in the client reads them back to
//! make decisions.

mod registry;
mod snapshot;

pub use registry::{LatencyRegistry, PacketStage};
pub use snapshot::{LatencySnapshot, StageLatency};
