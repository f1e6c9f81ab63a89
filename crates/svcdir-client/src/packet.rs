//! Request/response packets.
//!
//! A [`Packet`] is shared between the caller that created it and the session
//! driver that carries it. Completion is guarded by a flag under the packet's
//! lock, so whichever path completes it first (response, timeout, close) wins
//! and every later attempt is a no-op.

use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use svcdir_common::{DirectoryError, ErrorCode, OpCode, Result, Xid};

/// Completion callback, invoked exactly once off the caller's task.
pub type PacketCallback = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;

/// Lifecycle timestamps of a packet.
///
/// Used only for latency instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketTimings {
    pub created: Instant,
    pub queued: Option<Instant>,
    pub sent: Option<Instant>,
    pub received: Option<Instant>,
    pub finished: Option<Instant>,
    pub callback_invoked: Option<Instant>,
}

impl PacketTimings {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            queued: None,
            sent: None,
            received: None,
            finished: None,
            callback_invoked: None,
        }
    }
}

struct PacketState {
    timings: PacketTimings,
    completed: bool,
    response: Option<Bytes>,
    error_code: Option<ErrorCode>,
    callback: Option<PacketCallback>,
}

struct PacketInner {
    xid: Xid,
    op: OpCode,
    request: Bytes,
    state: Mutex<PacketState>,
}

/// One outstanding request on a connection.
#[derive(Clone)]
pub struct Packet {
    inner: Arc<PacketInner>,
}

impl Packet {
    pub(crate) fn new(xid: Xid, op: OpCode, request: Bytes, callback: PacketCallback) -> Self {
        Self {
            inner: Arc::new(PacketInner {
                xid,
                op,
                request,
                state: Mutex::new(PacketState {
                    timings: PacketTimings::new(),
                    completed: false,
                    response: None,
                    error_code: None,
                    callback: Some(callback),
                }),
            }),
        }
    }

    pub fn xid(&self) -> Xid {
        self.inner.xid
    }

    pub fn op(&self) -> OpCode {
        self.inner.op
    }

    pub fn request(&self) -> &Bytes {
        &self.inner.request
    }

    pub fn timings(&self) -> PacketTimings {
        self.lock().timings
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    /// Response payload, once completed successfully.
    pub fn response(&self) -> Option<Bytes> {
        self.lock().response.clone()
    }

    /// Failure code, once completed with an error.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.lock().error_code
    }

    pub(crate) fn mark_queued(&self) {
        self.lock().timings.queued = Some(Instant::now());
    }

    pub(crate) fn mark_sent(&self) {
        self.lock().timings.sent = Some(Instant::now());
    }

    pub(crate) fn mark_received(&self) {
        self.lock().timings.received = Some(Instant::now());
    }

    /// Completes the packet if nothing else has.
    ///
    /// Returns the pending callback invocation; `None` if already completed.
    pub(crate) fn complete(&self, result: Result<Bytes>) -> Option<Completion> {
        let mut state = self.lock();
        if state.completed {
            return None;
        }
        state.completed = true;
        state.timings.finished = Some(Instant::now());
        match &result {
            Ok(payload) => state.response = Some(payload.clone()),
            Err(e) => state.error_code = Some(e.code()),
        }
        let callback = state.callback.take()?;
        Some(Completion {
            packet: self.clone(),
            callback,
            result,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PacketState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("xid", &self.inner.xid)
            .field("op", &self.inner.op)
            .field("request_len", &self.inner.request.len())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// A completed packet whose callback has not run yet.
pub(crate) struct Completion {
    packet: Packet,
    callback: PacketCallback,
    result: Result<Bytes>,
}

impl Completion {
    pub(crate) fn packet(&self) -> &Packet {
        &self.packet
    }

    pub(crate) fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Runs the callback and stamps `callback_invoked`.
    pub(crate) fn invoke(self) -> Packet {
        let Completion {
            packet,
            callback,
            result,
        } = self;
        callback(result);
        packet.lock().timings.callback_invoked = Some(Instant::now());
        packet
    }
}

/// Fails a packet with a fresh error built by `reason`.
pub(crate) fn fail_with(
    packet: &Packet,
    reason: impl FnOnce() -> DirectoryError,
) -> Option<Completion> {
    packet.complete(Err(reason()))
}
