//! Scriptable in-process directory server for integration tests.
//!
//! Each accepted connection is served according to the next [`Mode`] of the
//! script (the last mode repeats). Frames can be pushed to every live
//! connection, and connections can be dropped to simulate server failures.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use svcdir_client::{ClientSessionEvent, ClientStatusEvent, Connection};
use svcdir_common::transport::FramedTransport;
use svcdir_common::{
    ClientFrame, ConnectRequest, ConnectResponse, Endpoint, ErrorCode, RequestFrame,
    ResponseFrame, ServerFrame, ServiceDirectoryError,
};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Payload that makes the server answer with a `ServiceNotExist` error.
pub const ERROR_PAYLOAD: &[u8] = b"error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Echo request payloads, answer pings.
    Normal,
    /// Answer the handshake with `auth_failed`.
    RejectAuth,
    /// Accept the socket and read the handshake, then never reply.
    Stall,
    /// Complete the handshake, then never send anything.
    Silent,
    /// Echo requests but ignore pings.
    NoPong,
    /// Hold requests until this many arrived, then answer newest first.
    ReverseResponses(usize),
    /// Precede every response with one for an unknown correlation id.
    StrayResponse,
}

#[derive(Debug, Clone)]
pub struct ServerScript {
    modes: Vec<Mode>,
    session_timeout_ms: Option<u64>,
    resume_sessions: bool,
    read_only: bool,
}

impl ServerScript {
    pub fn new(modes: impl Into<Vec<Mode>>) -> Self {
        Self {
            modes: modes.into(),
            session_timeout_ms: None,
            resume_sessions: true,
            read_only: false,
        }
    }

    /// Negotiate this session timeout instead of the requested one.
    pub fn session_timeout_ms(mut self, ms: u64) -> Self {
        self.session_timeout_ms = Some(ms);
        self
    }

    /// Always issue a new session id, even when one is offered.
    pub fn without_resume(mut self) -> Self {
        self.resume_sessions = false;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[derive(Debug, Clone)]
enum Control {
    Push(ServerFrame),
    DropAll,
}

struct ServerState {
    script: ServerScript,
    next_session_id: AtomicU64,
    connections: AtomicUsize,
    handshakes: Mutex<Vec<ConnectRequest>>,
    requests: Mutex<Vec<RequestFrame>>,
    pings: AtomicUsize,
}

impl ServerState {
    fn mode_for(&self, index: usize) -> Mode {
        let modes = &self.script.modes;
        modes
            .get(index)
            .or_else(|| modes.last())
            .copied()
            .unwrap_or(Mode::Normal)
    }
}

pub struct FakeDirectoryServer {
    endpoint: Endpoint,
    state: Arc<ServerState>,
    control: broadcast::Sender<Control>,
    accept_task: JoinHandle<()>,
}

impl FakeDirectoryServer {
    pub async fn start(script: ServerScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (control, _) = broadcast::channel(16);

        let state = Arc::new(ServerState {
            script,
            next_session_id: AtomicU64::new(100),
            connections: AtomicUsize::new(0),
            handshakes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            pings: AtomicUsize::new(0),
        });

        let accept_state = Arc::clone(&state);
        let accept_control = control.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let index = accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let mode = accept_state.mode_for(index);
                tokio::spawn(serve(
                    stream,
                    mode,
                    Arc::clone(&accept_state),
                    accept_control.subscribe(),
                ));
            }
        });

        Self {
            endpoint: Endpoint::new("127.0.0.1", port),
            state,
            control,
            accept_task,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> Vec<ConnectRequest> {
        self.state.handshakes.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<RequestFrame> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Sends a frame on every live connection.
    pub fn push(&self, frame: ServerFrame) {
        let _ = self.control.send(Control::Push(frame));
    }

    /// Closes every live connection; the listener keeps accepting.
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::DropAll);
    }

    /// Closes every connection and stops listening.
    pub async fn shutdown(&mut self) {
        self.accept_task.abort();
        let _ = (&mut self.accept_task).await;
        self.drop_connections();
    }
}

impl Drop for FakeDirectoryServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = self.control.send(Control::DropAll);
    }
}

/// A port nothing listens on.
pub async fn dead_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Endpoint::new("127.0.0.1", port)
}

async fn serve(
    stream: TcpStream,
    mode: Mode,
    state: Arc<ServerState>,
    mut control: broadcast::Receiver<Control>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let request = match FramedTransport::receive_client_frame(&mut reader).await {
        Ok(ClientFrame::Connect(request)) => request,
        _ => return,
    };
    state.handshakes.lock().unwrap().push(request.clone());

    match mode {
        Mode::Stall => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                _ = control.recv() => {}
            }
            return;
        }
        Mode::RejectAuth => {
            let _ = FramedTransport::send_server_frame(
                &mut writer,
                &ServerFrame::AuthFailed {
                    reason: "bad secret".to_string(),
                },
            )
            .await;
            return;
        }
        _ => {}
    }

    let session_id = match request.session_id {
        Some(id) if state.script.resume_sessions => id,
        _ => state.next_session_id.fetch_add(1, Ordering::SeqCst),
    };
    let connected = ServerFrame::Connected(ConnectResponse {
        session_id,
        session_timeout_ms: state
            .script
            .session_timeout_ms
            .unwrap_or(request.session_timeout_ms),
        read_only: state.script.read_only,
    });
    if FramedTransport::send_server_frame(&mut writer, &connected)
        .await
        .is_err()
    {
        return;
    }

    let (frame_tx, frames) = mpsc::channel(64);
    let reader_task = tokio::spawn(async move {
        while let Ok(frame) = FramedTransport::receive_client_frame(&mut reader).await {
            if frame_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    session_loop(&mut writer, mode, &state, frames, &mut control).await;
    reader_task.abort();
}

async fn session_loop(
    writer: &mut OwnedWriteHalf,
    mode: Mode,
    state: &ServerState,
    mut frames: mpsc::Receiver<ClientFrame>,
    control: &mut broadcast::Receiver<Control>,
) {
    let mut held: Vec<RequestFrame> = Vec::new();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { return };
                let outcome = match frame {
                    ClientFrame::Ping => {
                        state.pings.fetch_add(1, Ordering::SeqCst);
                        match mode {
                            Mode::Silent | Mode::NoPong => Ok(()),
                            _ => send(writer, ServerFrame::Pong).await,
                        }
                    }
                    ClientFrame::Close => return,
                    ClientFrame::Connect(_) => Ok(()),
                    ClientFrame::Request(request) => {
                        state.requests.lock().unwrap().push(request.clone());
                        match mode {
                            Mode::Silent => Ok(()),
                            Mode::ReverseResponses(n) => {
                                held.push(request);
                                let mut result = Ok(());
                                if held.len() >= n {
                                    for request in held.drain(..).rev() {
                                        result = result.and(send(writer, respond(&request)).await);
                                    }
                                }
                                result
                            }
                            Mode::StrayResponse => {
                                let stray = ServerFrame::Response(ResponseFrame::success(
                                    request.xid.wrapping_add(10_000),
                                    Bytes::from_static(b"stray"),
                                ));
                                match send(writer, stray).await {
                                    Ok(()) => send(writer, respond(&request)).await,
                                    Err(()) => Err(()),
                                }
                            }
                            _ => send(writer, respond(&request)).await,
                        }
                    }
                };
                if outcome.is_err() {
                    return;
                }
            }
            message = control.recv() => match message {
                Ok(Control::Push(frame)) => {
                    if send(writer, frame).await.is_err() {
                        return;
                    }
                }
                Ok(Control::DropAll) | Err(_) => return,
            }
        }
    }
}

fn respond(request: &RequestFrame) -> ServerFrame {
    if request.payload.as_ref() == ERROR_PAYLOAD {
        ServerFrame::Response(ResponseFrame::failure(
            request.xid,
            ServiceDirectoryError::new(ErrorCode::ServiceNotExist, ["billing"]),
        ))
    } else {
        ServerFrame::Response(ResponseFrame::success(request.xid, request.payload.clone()))
    }
}

async fn send(writer: &mut OwnedWriteHalf, frame: ServerFrame) -> Result<(), ()> {
    FramedTransport::send_server_frame(writer, &frame)
        .await
        .map_err(|_| ())
}

/// Records status and session events as strings, in delivery order.
///
/// Status events look like `status:NEW->CONNECTED`, session events like
/// `session:Created:100`.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn attach(connection: &Connection) -> Self {
        let log = Self::default();

        let sink = Arc::clone(&log.events);
        connection.on_status_change(move |e: &ClientStatusEvent| {
            sink.lock()
                .unwrap()
                .push(format!("status:{}->{}", e.previous, e.current));
        });
        let sink = Arc::clone(&log.events);
        connection.on_session_event(move |e: &ClientSessionEvent| {
            let id = e.session_id.map(|id| id.to_string()).unwrap_or_default();
            sink.lock()
                .unwrap()
                .push(format!("session:{:?}:{}", e.event, id));
        });
        log
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, entry: &str) {
        let events = Arc::clone(&self.events);
        let entry_owned = entry.to_string();
        wait_until(entry, move || events.lock().unwrap().contains(&entry_owned)).await;
    }
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
