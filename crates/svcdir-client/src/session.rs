//! Session handshake and the background session driver.
//!
//! The driver owns the socket of the active session. It writes queued
//! packets in order, matches responses by correlation id, keeps the session
//! alive with pings and watches three clocks:
//!
//! - session timeout: time since the last `pong`
//! - read timeout: time since the last inbound frame
//! - ping interval: time since the last `ping`
//!
//! When a session dies the driver fails its in-flight packets, reconnects
//! through the roster, and resends whatever had not been written yet.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use svcdir_common::transport::FramedTransport;
use svcdir_common::{
    ClientFrame, ConnectRequest, DirectoryError, Endpoint, RequestFrame, Result, ServerFrame,
    SessionId, Xid, PROTOCOL_VERSION,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::{SessionStart, Shared};
use crate::events::ConnectionStatus;
use crate::packet::Packet;

const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_millis(500);
const INBOUND_FRAME_BUFFER: usize = 64;

/// An established, not yet driven, session.
pub(crate) struct Session {
    pub(crate) endpoint: Endpoint,
    pub(crate) session_id: SessionId,
    pub(crate) session_timeout: Duration,
    pub(crate) read_only: bool,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl Session {
    /// Connects and performs the session handshake.
    pub(crate) async fn open(
        endpoint: &Endpoint,
        config: &ConnectionConfig,
        offer: Option<SessionId>,
    ) -> Result<Self> {
        let stream = FramedTransport::connect(endpoint).await?;
        let (mut reader, mut writer) = stream.into_split();

        let request = ConnectRequest {
            protocol_version: PROTOCOL_VERSION,
            session_id: offer,
            session_timeout_ms: config.session_timeout_ms,
            credentials: config.credentials.clone(),
            read_only_allowed: config.read_only_allowed,
        };
        FramedTransport::send_client_frame(&mut writer, &ClientFrame::Connect(request)).await?;

        match FramedTransport::receive_server_frame(&mut reader).await? {
            ServerFrame::Connected(response) => {
                let timeout_ms = if response.session_timeout_ms == 0 {
                    config.session_timeout_ms
                } else {
                    response.session_timeout_ms
                };
                Ok(Self {
                    endpoint: endpoint.clone(),
                    session_id: response.session_id,
                    session_timeout: Duration::from_millis(timeout_ms),
                    read_only: response.read_only,
                    reader,
                    writer,
                })
            }
            ServerFrame::AuthFailed { reason } => Err(DirectoryError::AuthFailed {
                endpoint: endpoint.clone(),
                reason,
            }),
            other => Err(DirectoryError::Protocol(format!(
                "unexpected frame during handshake: {other:?}"
            ))),
        }
    }
}

pub(crate) enum Establish {
    Connected(Session),
    Failed(DirectoryError),
    Shutdown,
}

/// Tries roster endpoints until a session opens or the retry budget runs out.
///
/// Each attempt is bounded by `attempt_timeout`. With a `deadline`, attempts
/// are also cut short at the deadline and no retry starts once its backoff
/// would end past it. Endpoints that rejected our credentials are never tried
/// again.
pub(crate) async fn establish(
    shared: &Shared,
    attempt_timeout: Duration,
    deadline: Option<Instant>,
    offer: Option<SessionId>,
    shutdown: &mut watch::Receiver<bool>,
) -> Establish {
    let retry = &shared.config.retry;
    let timeout_ms = u64::try_from(attempt_timeout.as_millis()).unwrap_or(u64::MAX);
    let mut last_error = None;
    let mut last_endpoint = None;

    for attempt in 0..retry.total_attempts() {
        if *shutdown.borrow_and_update() {
            return Establish::Shutdown;
        }
        if attempt > 0 {
            let pause = retry.backoff(attempt);
            if deadline.is_some_and(|deadline| Instant::now() + pause >= deadline) {
                debug!(attempt, "Connect deadline reached, not retrying");
                return Establish::Failed(deadline_error(last_endpoint, last_error, timeout_ms));
            }
            tokio::select! {
                _ = shutdown.changed() => return Establish::Shutdown,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        let Some(endpoint) = next_endpoint(shared) else {
            break;
        };
        let budget = match deadline {
            Some(deadline) => attempt_timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => attempt_timeout,
        };
        debug!(endpoint = %endpoint, attempt, "Connecting to directory server");
        last_endpoint = Some(endpoint.clone());

        let outcome = tokio::select! {
            _ = shutdown.changed() => return Establish::Shutdown,
            outcome = tokio::time::timeout(budget, Session::open(&endpoint, &shared.config, offer)) => outcome,
        };

        match outcome {
            Ok(Ok(session)) => return Establish::Connected(session),
            Ok(Err(err)) if err.is_auth_failure() => {
                warn!(endpoint = %endpoint, error = %err, "Authentication rejected, skipping endpoint");
                shared.reject_endpoint(&endpoint);
                shared.transition(ConnectionStatus::AuthFailed);
                last_error = Some(err);
            }
            Ok(Err(err)) => {
                warn!(endpoint = %endpoint, attempt, error = %err, "Connect attempt failed");
                last_error = Some(err);
            }
            Err(_) => {
                warn!(endpoint = %endpoint, attempt, "Connect attempt timed out");
                last_error = Some(DirectoryError::ConnectTimeout {
                    endpoint,
                    timeout_ms,
                });
            }
        }
    }

    Establish::Failed(last_error.unwrap_or_else(all_rejected))
}

/// The error reported when the caller's deadline ends establishment.
fn deadline_error(
    endpoint: Option<Endpoint>,
    last_error: Option<DirectoryError>,
    timeout_ms: u64,
) -> DirectoryError {
    match (endpoint, last_error) {
        (_, Some(err @ DirectoryError::ConnectTimeout { .. })) => err,
        (Some(endpoint), _) => DirectoryError::ConnectTimeout {
            endpoint,
            timeout_ms,
        },
        (None, err) => err.unwrap_or_else(all_rejected),
    }
}

fn all_rejected() -> DirectoryError {
    DirectoryError::ConnectionLoss("every endpoint rejected authentication".to_string())
}

fn next_endpoint(shared: &Shared) -> Option<Endpoint> {
    (0..shared.roster.len())
        .map(|_| shared.roster.next())
        .find(|endpoint| !shared.is_auth_rejected(endpoint))
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionFailure {
    ReadTimeout(u64),
    SessionExpired,
    ConnectionLoss(String),
}

impl SessionFailure {
    fn to_error(&self) -> DirectoryError {
        match self {
            SessionFailure::ReadTimeout(ms) => DirectoryError::ReadTimeout(*ms),
            SessionFailure::SessionExpired => DirectoryError::SessionExpired,
            SessionFailure::ConnectionLoss(detail) => DirectoryError::ConnectionLoss(detail.clone()),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Failed(SessionFailure),
}

pub(crate) struct SessionDriver {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedReceiver<Packet>,
    shutdown: watch::Receiver<bool>,
    /// Written, awaiting a response.
    pending: HashMap<Xid, Packet>,
    /// Not (completely) written; resent first on the next session.
    retry: VecDeque<Packet>,
}

impl SessionDriver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        outgoing: mpsc::UnboundedReceiver<Packet>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            shared,
            outgoing,
            shutdown,
            pending: HashMap::new(),
            retry: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self, mut session: Session) {
        loop {
            let failure = match self.drive(session).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(failure) => failure,
            };

            let expired = failure == SessionFailure::SessionExpired;
            for (_, packet) in self.pending.drain() {
                self.shared.fail(&packet, || failure.to_error());
            }
            self.shared.session_lost(expired);

            match self.reconnect(expired).await {
                Some(next) => session = next,
                None => break,
            }
        }
        self.close_out();
    }

    async fn reconnect(&mut self, expired: bool) -> Option<Session> {
        let offer = if expired {
            None
        } else {
            self.shared.state().session_id
        };
        let timeout = self.shared.config.connect_timeout();

        match establish(&self.shared, timeout, None, offer, &mut self.shutdown).await {
            Establish::Connected(session) => {
                self.shared
                    .session_started(&session, SessionStart::Resume(offer));
                Some(session)
            }
            Establish::Failed(err) => {
                error!(error = %err, "Reconnect attempts exhausted, closing connection");
                None
            }
            Establish::Shutdown => None,
        }
    }

    /// Runs one session until it fails or shutdown is requested.
    async fn drive(&mut self, session: Session) -> SessionEnd {
        let Session {
            endpoint,
            session_id,
            session_timeout,
            reader,
            mut writer,
            ..
        } = session;

        let (frame_tx, mut frames) = mpsc::channel(INBOUND_FRAME_BUFFER);
        let reader_task = tokio::spawn(read_frames(reader, frame_tx));

        let read_timeout = self.shared.config.read_timeout();
        let ping_interval = self.shared.config.ping_interval(session_timeout);
        let now = Instant::now();
        let mut last_frame = now;
        let mut last_pong = now;
        let mut last_ping = now;

        debug!(
            endpoint = %endpoint,
            session_id,
            session_timeout_ms = session_timeout.as_millis() as u64,
            "Session driver started"
        );

        let end = 'session: loop {
            if *self.shutdown.borrow_and_update() {
                break 'session SessionEnd::Shutdown;
            }
            while let Some(packet) = self.retry.pop_front() {
                if let Err(end) = self.write_packet(&mut writer, packet).await {
                    break 'session end;
                }
            }

            let deadline = (last_pong + session_timeout)
                .min(last_frame + read_timeout)
                .min(last_ping + ping_interval);

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break 'session SessionEnd::Shutdown,
                frame = frames.recv() => match frame {
                    Some(Ok(frame)) => {
                        last_frame = Instant::now();
                        if let Some(end) = self.handle_frame(frame, &mut last_pong) {
                            break 'session end;
                        }
                    }
                    Some(Err(err)) => {
                        break 'session SessionEnd::Failed(SessionFailure::ConnectionLoss(err.to_string()));
                    }
                    None => {
                        break 'session SessionEnd::Failed(SessionFailure::ConnectionLoss(
                            "session reader stopped".to_string(),
                        ));
                    }
                },
                packet = self.outgoing.recv() => match packet {
                    Some(packet) => {
                        if let Err(end) = self.write_packet(&mut writer, packet).await {
                            break 'session end;
                        }
                    }
                    None => break 'session SessionEnd::Shutdown,
                },
                _ = sleep_until(deadline) => {
                    let now = Instant::now();
                    if now >= last_pong + session_timeout {
                        warn!(endpoint = %endpoint, session_id, "Session expired");
                        break 'session SessionEnd::Failed(SessionFailure::SessionExpired);
                    }
                    if now >= last_frame + read_timeout {
                        warn!(
                            endpoint = %endpoint,
                            session_id,
                            read_timeout_ms = self.shared.config.read_timeout_ms,
                            "No data received, session considered dead"
                        );
                        break 'session SessionEnd::Failed(SessionFailure::ReadTimeout(
                            self.shared.config.read_timeout_ms,
                        ));
                    }
                    if now >= last_ping + ping_interval {
                        last_ping = now;
                        if let Err(err) = FramedTransport::send_client_frame(&mut writer, &ClientFrame::Ping).await {
                            break 'session SessionEnd::Failed(SessionFailure::ConnectionLoss(err.to_string()));
                        }
                    }
                }
            }
        };

        reader_task.abort();
        if matches!(end, SessionEnd::Shutdown) {
            let bye = FramedTransport::send_client_frame(&mut writer, &ClientFrame::Close);
            if tokio::time::timeout(CLOSE_FRAME_TIMEOUT, bye).await.is_err() {
                debug!(endpoint = %endpoint, "Close frame not delivered");
            }
        }
        end
    }

    /// Writes one request frame.
    ///
    /// A packet whose write fails is kept for the next session.
    async fn write_packet(
        &mut self,
        writer: &mut OwnedWriteHalf,
        packet: Packet,
    ) -> std::result::Result<(), SessionEnd> {
        if packet.is_completed() {
            return Ok(());
        }
        let frame = ClientFrame::Request(RequestFrame {
            xid: packet.xid(),
            op: packet.op(),
            payload: packet.request().clone(),
        });

        match FramedTransport::send_client_frame(writer, &frame).await {
            Ok(()) => {
                packet.mark_sent();
                self.pending.insert(packet.xid(), packet);
                Ok(())
            }
            Err(DirectoryError::Protocol(detail)) => {
                // Rejected before touching the socket (oversized frame)
                warn!(xid = packet.xid(), %detail, "Request rejected by framing");
                self.shared.fail(&packet, || DirectoryError::Protocol(detail));
                Ok(())
            }
            Err(err) => {
                debug!(xid = packet.xid(), error = %err, "Write failed, packet kept for retry");
                self.retry.push_back(packet);
                Err(SessionEnd::Failed(SessionFailure::ConnectionLoss(
                    err.to_string(),
                )))
            }
        }
    }

    fn handle_frame(&mut self, frame: ServerFrame, last_pong: &mut Instant) -> Option<SessionEnd> {
        match frame {
            ServerFrame::Response(response) => match self.pending.remove(&response.xid) {
                Some(packet) => {
                    packet.mark_received();
                    let result = match response.error {
                        Some(error) => Err(DirectoryError::Server(error)),
                        None => Ok(response.payload),
                    };
                    self.shared.complete(packet.complete(result));
                }
                None => {
                    warn!(xid = response.xid, "Dropping response with no outstanding packet");
                }
            },
            ServerFrame::Pong => *last_pong = Instant::now(),
            ServerFrame::Notification(notification) => self.shared.notify(notification),
            ServerFrame::SessionExpired => {
                info!("Server reported session expired");
                return Some(SessionEnd::Failed(SessionFailure::SessionExpired));
            }
            ServerFrame::Connected(_) | ServerFrame::AuthFailed { .. } => {
                warn!("Ignoring handshake frame on an established session");
            }
        }
        None
    }

    /// Terminal cleanup: every packet still held fails with `ConnectionClosed`.
    fn close_out(&mut self) {
        self.shared.finish_closed();
        self.outgoing.close();

        for (_, packet) in self.pending.drain() {
            self.shared.fail(&packet, || DirectoryError::ConnectionClosed);
        }
        for packet in self.retry.drain(..) {
            self.shared.fail(&packet, || DirectoryError::ConnectionClosed);
        }
        while let Ok(packet) = self.outgoing.try_recv() {
            self.shared.fail(&packet, || DirectoryError::ConnectionClosed);
        }
        info!("Connection closed");
    }
}

async fn read_frames(mut reader: OwnedReadHalf, frames: mpsc::Sender<Result<ServerFrame>>) {
    loop {
        let frame = match FramedTransport::receive_server_frame(&mut reader).await {
            Err(DirectoryError::Json(err)) => {
                warn!(error = %err, "Discarding undecodable frame");
                continue;
            }
            other => other,
        };
        let failed = frame.is_err();
        if frames.send(frame).await.is_err() || failed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_maps_to_packet_errors() {
        assert!(matches!(
            SessionFailure::ReadTimeout(250).to_error(),
            DirectoryError::ReadTimeout(250)
        ));
        assert!(matches!(
            SessionFailure::SessionExpired.to_error(),
            DirectoryError::SessionExpired
        ));
        assert!(matches!(
            SessionFailure::ConnectionLoss("reset".into()).to_error(),
            DirectoryError::ConnectionLoss(detail) if detail == "reset"
        ));
    }
}
