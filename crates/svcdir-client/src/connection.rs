use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use svcdir_common::{
    DirectoryError, Endpoint, InstanceNotification, OpCode, Result, SessionId, Xid,
};
use svcdir_metrics::{LatencyRegistry, LatencySnapshot};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::dispatch::{Dispatch, Dispatcher, Listeners};
use crate::events::{
    ClientSessionEvent, ClientStatusEvent, ConnectionStatus, ListenerId, SessionEvent,
};
use crate::packet::{Completion, Packet};
use crate::roster::ServerRoster;
use crate::session::{establish, Establish, Session, SessionDriver};

/// Connection state guarded by one lock; every transition goes through it.
#[derive(Debug)]
pub(crate) struct ConnState {
    pub(crate) status: ConnectionStatus,
    pub(crate) session_id: Option<SessionId>,
    pub(crate) endpoint: Option<Endpoint>,
    pub(crate) session_timeout: Option<Duration>,
}

/// How a freshly opened session relates to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionStart {
    /// First session of this connection.
    Initial,
    /// Reconnect; carries the session id that was offered, if any.
    Resume(Option<SessionId>),
}

/// State shared between the public handle and the session driver.
pub(crate) struct Shared {
    pub(crate) config: ConnectionConfig,
    pub(crate) roster: Arc<ServerRoster>,
    state: Mutex<ConnState>,
    events: mpsc::UnboundedSender<Dispatch>,
    outgoing: mpsc::UnboundedSender<Packet>,
    outstanding: Arc<AtomicUsize>,
    next_xid: AtomicU32,
    auth_rejected: Mutex<HashSet<Endpoint>>,
    pub(crate) shutdown: watch::Sender<bool>,
    latency: Option<Arc<LatencyRegistry>>,
}

impl Shared {
    pub(crate) fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.state().status
    }

    /// Moves to `to`, publishing the event while the state lock is held so
    /// listeners observe transitions in order. `Closed` is terminal.
    pub(crate) fn transition_locked(&self, state: &mut ConnState, to: ConnectionStatus) -> bool {
        let previous = state.status;
        if previous == to || previous == ConnectionStatus::Closed {
            return false;
        }
        state.status = to;
        info!(from = %previous, to = %to, "Connection status changed");
        let _ = self.events.send(Dispatch::Status(ClientStatusEvent {
            previous,
            current: to,
        }));
        true
    }

    pub(crate) fn transition(&self, to: ConnectionStatus) -> bool {
        let mut state = self.state();
        self.transition_locked(&mut state, to)
    }

    pub(crate) fn emit_session_locked(
        &self,
        state: &ConnState,
        event: SessionEvent,
        session_id: Option<SessionId>,
    ) {
        let _ = self.events.send(Dispatch::Session(ClientSessionEvent {
            event,
            session_id,
            endpoint: state.endpoint.clone(),
        }));
    }

    /// Hands a completed packet to the dispatcher.
    pub(crate) fn complete(&self, completion: Option<Completion>) {
        if let Some(completion) = completion {
            if self.events.send(Dispatch::Completion(completion)).is_err() {
                // Dispatcher is gone; the callback is dropped with the completion
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    pub(crate) fn fail(&self, packet: &Packet, reason: impl FnOnce() -> DirectoryError) {
        self.complete(crate::packet::fail_with(packet, reason));
    }

    pub(crate) fn notify(&self, notification: InstanceNotification) {
        let _ = self.events.send(Dispatch::Notification(notification));
    }

    pub(crate) fn is_auth_rejected(&self, endpoint: &Endpoint) -> bool {
        self.auth_rejected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(endpoint)
    }

    pub(crate) fn reject_endpoint(&self, endpoint: &Endpoint) {
        self.auth_rejected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(endpoint.clone());
    }

    /// Records a newly opened session and publishes its events.
    ///
    /// Session `Closed` goes out before the status change, `Created` and
    /// `Reopen` after it.
    pub(crate) fn session_started(&self, session: &Session, start: SessionStart) {
        let mut state = self.state();
        let status = if session.read_only {
            ConnectionStatus::ConnectedReadonly
        } else {
            ConnectionStatus::Connected
        };
        let new_id = session.session_id;

        state.endpoint = Some(session.endpoint.clone());
        state.session_timeout = Some(session.session_timeout);
        state.session_id = Some(new_id);

        match start {
            SessionStart::Initial => {
                self.transition_locked(&mut state, status);
                info!(endpoint = %session.endpoint, session_id = new_id, "Session created");
                self.emit_session_locked(&state, SessionEvent::Created, Some(new_id));
            }
            SessionStart::Resume(Some(previous)) if previous == new_id => {
                self.transition_locked(&mut state, status);
                info!(endpoint = %session.endpoint, session_id = new_id, "Session resumed");
            }
            SessionStart::Resume(Some(previous)) => {
                info!(
                    endpoint = %session.endpoint,
                    previous,
                    session_id = new_id,
                    "Server issued a new session"
                );
                self.emit_session_locked(&state, SessionEvent::Closed, Some(previous));
                self.transition_locked(&mut state, status);
                self.emit_session_locked(&state, SessionEvent::Reopen, Some(new_id));
            }
            SessionStart::Resume(None) => {
                self.transition_locked(&mut state, status);
                info!(endpoint = %session.endpoint, session_id = new_id, "Session reopened");
                self.emit_session_locked(&state, SessionEvent::Reopen, Some(new_id));
            }
        }
        drop(state);
        self.roster.mark_connected(&session.endpoint);
    }

    /// Session ended without a clean close.
    ///
    /// An expired session is forgotten (and reported `Closed`) so the next
    /// handshake asks for a fresh one; otherwise the id is kept for resume.
    pub(crate) fn session_lost(&self, expired: bool) {
        let mut state = self.state();
        if expired {
            if let Some(id) = state.session_id.take() {
                self.emit_session_locked(&state, SessionEvent::Closed, Some(id));
            }
        }
        state.endpoint = None;
        self.transition_locked(&mut state, ConnectionStatus::NotConnected);
    }

    /// Terminal transition; reports the open session as `Closed` if any.
    pub(crate) fn finish_closed(&self) {
        let mut state = self.state();
        if let Some(id) = state.session_id.take() {
            self.emit_session_locked(&state, SessionEvent::Closed, Some(id));
        }
        state.endpoint = None;
        state.session_timeout = None;
        self.transition_locked(&mut state, ConnectionStatus::Closed);
    }

    fn next_xid(&self) -> Xid {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }
}

/// A resilient session to one directory server out of a roster.
///
/// Requests are queued with [`send`](Connection::send) and written by a
/// background session driver in enqueue order. Responses are matched by
/// correlation id, and every packet callback runs exactly once on the
/// connection's dispatcher task. Connection loss triggers reconnect with
/// failover through the roster; packets not yet written are carried over to
/// the next session.
///
/// Must be created inside a Tokio runtime.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use svcdir_client::{Connection, ConnectionConfig, ServerRoster};
/// use svcdir_common::OpCode;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let roster = Arc::new(ServerRoster::parse(["sd1:2013", "sd2:2013"])?);
/// let connection = Connection::new(roster, ConnectionConfig::default());
/// connection.connect().await?;
///
/// let reply = connection
///     .submit(OpCode::LookupService, &br#"{"name":"billing"}"#[..])
///     .await?;
/// println!("{} bytes", reply.len());
///
/// connection.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    shared: Arc<Shared>,
    listeners: Arc<Listeners>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Packet>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Connection {
    pub fn new(roster: Arc<ServerRoster>, config: ConnectionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let listeners = Arc::new(Listeners::default());
        let outstanding = Arc::new(AtomicUsize::new(0));
        let latency = config
            .latency_collection
            .then(|| Arc::new(LatencyRegistry::new()));

        let dispatcher = Dispatcher::new(
            Arc::clone(&listeners),
            Arc::clone(&outstanding),
            latency.clone(),
        );
        tokio::spawn(dispatcher.run(events_rx));

        let shared = Arc::new(Shared {
            config,
            roster,
            state: Mutex::new(ConnState {
                status: ConnectionStatus::New,
                session_id: None,
                endpoint: None,
                session_timeout: None,
            }),
            events: events_tx,
            outgoing: outgoing_tx,
            outstanding,
            next_xid: AtomicU32::new(1),
            auth_rejected: Mutex::new(HashSet::new()),
            shutdown,
            latency,
        });

        Self {
            shared,
            listeners,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            driver: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Parses `host:port` strings into a roster and creates a connection.
    pub fn with_servers<I, S>(servers: I, config: ConnectionConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let roster = ServerRoster::parse(servers)?;
        Ok(Self::new(Arc::new(roster), config))
    }

    /// Connects using the configured connect timeout.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with_timeout(self.shared.config.connect_timeout())
            .await
    }

    /// Opens the first session, failing over through the roster.
    ///
    /// Blocks for at most `timeout` overall, retrying endpoints within the
    /// retry configuration's budget, and fails with `ConnectTimeout` when the
    /// deadline passes first. Packets queued by [`send`](Self::send) before a
    /// failed connect are failed with the connect error. Once connected,
    /// reconnects are handled in the background and this returns `Ok`
    /// immediately.
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        let status = self.status();
        if status == ConnectionStatus::Closed {
            return Err(DirectoryError::ConnectionClosed);
        }

        let Some(mut outgoing) = self.take_outgoing() else {
            return if status.is_connected() {
                Ok(())
            } else {
                Err(DirectoryError::ConnectionLoss(
                    "reconnect already in progress".to_string(),
                ))
            };
        };

        let mut shutdown = self.shared.shutdown.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        match establish(&self.shared, timeout, Some(deadline), None, &mut shutdown).await {
            Establish::Connected(session) => {
                self.shared.session_started(&session, SessionStart::Initial);
                let driver = SessionDriver::new(Arc::clone(&self.shared), outgoing, shutdown);
                let handle = tokio::spawn(driver.run(session));
                *self.lock_driver() = Some(handle);
                Ok(())
            }
            Establish::Failed(err) => {
                if self.status() != ConnectionStatus::AuthFailed {
                    self.shared.transition(ConnectionStatus::NotConnected);
                }
                warn!(error = %err, "Could not connect to any directory server");
                while let Ok(packet) = outgoing.try_recv() {
                    self.shared.fail(&packet, || connect_failure(&err));
                }
                *self.lock_outgoing() = Some(outgoing);
                Err(err)
            }
            Establish::Shutdown => {
                *self.lock_outgoing() = Some(outgoing);
                Err(DirectoryError::ConnectionClosed)
            }
        }
    }

    /// Queues a request; `callback` runs exactly once on the dispatcher.
    ///
    /// Never waits on the network. Fails immediately with `BacklogFull` when
    /// the outstanding-packet limit is reached and with `ConnectionClosed`
    /// after the connection closed. A packet queued before the first session
    /// opens waits for [`connect`](Self::connect) and fails with its error if
    /// that connect fails.
    pub fn send<F>(&self, op: OpCode, payload: impl Into<Bytes>, callback: F) -> Result<Packet>
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        let shared = &self.shared;
        if !shared.status().is_alive() {
            return Err(DirectoryError::ConnectionClosed);
        }

        let limit = shared.config.max_outstanding_packets;
        let reserved = shared
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            });
        if reserved.is_err() {
            debug!(limit, "Rejecting request, backlog full");
            return Err(DirectoryError::BacklogFull(limit));
        }

        let packet = Packet::new(shared.next_xid(), op, payload.into(), Box::new(callback));
        packet.mark_queued();
        if shared.outgoing.send(packet.clone()).is_err() {
            shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(DirectoryError::ConnectionClosed);
        }
        trace!(xid = packet.xid(), op = ?op, "Packet queued");
        Ok(packet)
    }

    /// Sends a request and waits for its response.
    pub async fn submit(&self, op: OpCode, payload: impl Into<Bytes>) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.send(op, payload, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| DirectoryError::ConnectionClosed)?
    }

    /// Closes the connection; idempotent.
    ///
    /// Every outstanding packet fails with `ConnectionClosed`.
    pub async fn close(&self) {
        self.shared.shutdown.send_replace(true);
        let _guard = self.connect_lock.lock().await;

        let driver = self.lock_driver().take();
        if let Some(handle) = driver {
            if let Err(e) = handle.await {
                warn!(error = %e, "Session driver task failed");
            }
        }
        self.shared.finish_closed();
        self.drain_unsent();
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    pub fn is_alive(&self) -> bool {
        self.status().is_alive()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.state().session_id
    }

    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.shared.state().endpoint.clone()
    }

    /// Session timeout granted by the server for the current session.
    pub fn negotiated_session_timeout(&self) -> Option<Duration> {
        self.shared.state().session_timeout
    }

    /// Queued plus in-flight packets.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Latency snapshot; `None` unless latency collection is enabled.
    pub fn latency_snapshot(&self) -> Option<LatencySnapshot> {
        self.shared.latency.as_ref().map(|r| r.snapshot())
    }

    pub fn roster(&self) -> &Arc<ServerRoster> {
        &self.shared.roster
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn on_status_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ClientStatusEvent) + Send + Sync + 'static,
    {
        self.listeners.add_status(Arc::new(listener))
    }

    pub fn on_session_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ClientSessionEvent) + Send + Sync + 'static,
    {
        self.listeners.add_session(Arc::new(listener))
    }

    pub fn on_notification<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&InstanceNotification) + Send + Sync + 'static,
    {
        self.listeners.add_notification(Arc::new(listener))
    }

    /// Returns `false` if the id was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    fn take_outgoing(&self) -> Option<mpsc::UnboundedReceiver<Packet>> {
        self.lock_outgoing().take()
    }

    /// Fails packets queued on a connection that never handed its queue to
    /// a session driver.
    fn drain_unsent(&self) {
        if let Some(mut outgoing) = self.take_outgoing() {
            outgoing.close();
            while let Ok(packet) = outgoing.try_recv() {
                self.shared
                    .fail(&packet, || DirectoryError::ConnectionClosed);
            }
        }
    }

    fn lock_outgoing(&self) -> MutexGuard<'_, Option<mpsc::UnboundedReceiver<Packet>>> {
        self.outgoing_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_driver(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.driver.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The error handed to packets that were queued when the initial connect failed.
fn connect_failure(err: &DirectoryError) -> DirectoryError {
    match err {
        DirectoryError::ConnectTimeout {
            endpoint,
            timeout_ms,
        } => DirectoryError::ConnectTimeout {
            endpoint: endpoint.clone(),
            timeout_ms: *timeout_ms,
        },
        other => DirectoryError::ConnectionLoss(other.to_string()),
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The driver observes this and closes out its own session
        self.shared.shutdown.send_replace(true);
        if self.lock_driver().is_none() {
            self.shared.finish_closed();
        }
        self.drain_unsent();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Connection")
            .field("status", &state.status)
            .field("session_id", &state.session_id)
            .field("endpoint", &state.endpoint)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn unreachable_roster() -> Arc<ServerRoster> {
        // Port 1 on localhost is reserved and refuses connections
        Arc::new(ServerRoster::new(vec![Endpoint::new("127.0.0.1", 1)]).unwrap())
    }

    #[tokio::test]
    async fn test_new_connection_state() {
        let connection = Connection::new(unreachable_roster(), ConnectionConfig::default());
        assert_eq!(connection.status(), ConnectionStatus::New);
        assert!(connection.is_alive());
        assert!(!connection.is_connected());
        assert_eq!(connection.session_id(), None);
        assert_eq!(connection.current_endpoint(), None);
        assert_eq!(connection.outstanding(), 0);
        assert!(connection.latency_snapshot().is_none());
    }

    #[tokio::test]
    async fn test_backlog_limit_rejects_sends() {
        let config = ConnectionConfig {
            max_outstanding_packets: 2,
            ..Default::default()
        };
        let connection = Connection::new(unreachable_roster(), config);

        connection.send(OpCode::LookupService, Bytes::new(), |_| {}).unwrap();
        connection.send(OpCode::LookupService, Bytes::new(), |_| {}).unwrap();
        let third = connection.send(OpCode::LookupService, Bytes::new(), |_| {});
        assert!(matches!(third, Err(DirectoryError::BacklogFull(2))));
        assert_eq!(connection.outstanding(), 2);
    }

    #[tokio::test]
    async fn test_close_before_connect_fails_queued_packets() {
        let connection = Connection::new(unreachable_roster(), ConnectionConfig::default());
        let statuses = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        connection.on_status_change(move |e| sink.lock().unwrap().push((e.previous, e.current)));

        let (tx, rx) = oneshot::channel();
        connection
            .send(OpCode::RegisterInstance, Bytes::new(), move |result| {
                let _ = tx.send(result);
            })
            .unwrap();

        connection.close().await;
        connection.close().await;

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(DirectoryError::ConnectionClosed)));
        assert_eq!(connection.status(), ConnectionStatus::Closed);
        assert!(matches!(
            connection.send(OpCode::RegisterInstance, Bytes::new(), |_| {}),
            Err(DirectoryError::ConnectionClosed)
        ));
        assert!(matches!(
            connection.connect().await,
            Err(DirectoryError::ConnectionClosed)
        ));

        // The status event was dispatched ahead of the packet callback
        assert_eq!(
            *statuses.lock().unwrap(),
            [(ConnectionStatus::New, ConnectionStatus::Closed)]
        );
        assert_eq!(connection.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_last_error() {
        let config = ConnectionConfig {
            retry: crate::RetryConfig {
                max_retries: 1,
                initial_backoff_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let connection = Connection::new(unreachable_roster(), config);

        let result = connection.connect().await;
        assert!(matches!(result, Err(DirectoryError::ConnectionLoss(_))));
        assert_eq!(connection.status(), ConnectionStatus::NotConnected);
        assert!(connection.is_alive());
    }

    #[tokio::test]
    async fn test_failed_connect_fails_queued_packets() {
        let config = ConnectionConfig {
            retry: crate::RetryConfig {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let connection = Connection::new(unreachable_roster(), config);

        let (tx, rx) = oneshot::channel();
        connection
            .send(OpCode::LookupService, Bytes::new(), move |result| {
                let _ = tx.send(result);
            })
            .unwrap();
        assert_eq!(connection.outstanding(), 1);

        assert!(connection.connect().await.is_err());

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(DirectoryError::ConnectionLoss(_))));
        assert_eq!(connection.outstanding(), 0);
        assert_eq!(connection.status(), ConnectionStatus::NotConnected);

        // The connection stays usable for a later attempt
        assert!(connection.send(OpCode::LookupService, Bytes::new(), |_| {}).is_ok());
        assert_eq!(connection.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_listener_removal() {
        let connection = Connection::new(unreachable_roster(), ConnectionConfig::default());
        let id = connection.on_session_event(|_| {});
        assert!(connection.remove_listener(id));
        assert!(!connection.remove_listener(id));
    }
}
