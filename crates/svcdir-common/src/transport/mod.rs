//! Service Directory Transport Layer
//!
//! This module provides the codec and framing used to exchange session frames
//! with a directory server.
//!
//! # Architecture
//!
//! - **Transport**: one TCP socket per session, split into reader and writer
//! - **Codec**: JSON serialization for frames and opaque payload bodies
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//!
//! # Components
//!
//! - **[`JsonCodec`]**: Encode/decode frames and payloads
//! - **[`FramedTransport`]**: Async length-prefixed framing over any
//!   `AsyncRead`/`AsyncWrite`
//!
//! # Frame Size Limits
//!
//! Frames larger than [`MAX_FRAME_SIZE`] are rejected in both directions.

pub mod codec;
pub mod tcp;

pub use codec::JsonCodec;
pub use tcp::{FramedTransport, MAX_FRAME_SIZE};
