//! Service Directory Common Types and Framing
//!
//! This crate provides the protocol definitions and framing layer shared by
//! every component of the service directory client runtime.
//!
//! # Overview
//!
//! Providers register service instances with a directory server, consumers
//! look them up and receive live updates. Everything both sides agree on
//! lives here:
//!
//! - **Protocol Layer**: endpoints, wire frames, the error model, service
//!   instances and heartbeat identity normalization
//! - **Transport Layer**: JSON codec and length-prefixed async framing
//!
//! # Architecture
//!
//! The wire protocol is deliberately simple:
//! - **Transport**: one TCP session per logical connection
//! - **Serialization**: JSON
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Max Frame Size**: 16 MiB
//!
//! Request and response payloads are opaque bytes at this layer; only the
//! frame envelope (correlation id, op code, error) is interpreted.
//!
//! # Example
//!
//! ```
//! use svcdir_common::{ErrorCode, ServiceDirectoryError};
//!
//! let error = ServiceDirectoryError::new(ErrorCode::ServiceNotExist, ["billing"]);
//! assert_eq!(error.message(), "The Service billing does not exist.");
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
