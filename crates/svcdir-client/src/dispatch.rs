//! Per-connection event dispatcher.
//!
//! Status events, session events, instance notifications and packet
//! callbacks all flow through one unbounded channel into a single task, so
//! they are delivered in the order they were produced and never on the
//! caller's task. Listener and callback panics are caught and logged.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use svcdir_common::InstanceNotification;
use svcdir_metrics::{LatencyRegistry, PacketStage};
use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::events::{ClientSessionEvent, ClientStatusEvent, ListenerId};
use crate::packet::Completion;

pub(crate) type StatusListener = Arc<dyn Fn(&ClientStatusEvent) + Send + Sync>;
pub(crate) type SessionListener = Arc<dyn Fn(&ClientSessionEvent) + Send + Sync>;
pub(crate) type NotificationListener = Arc<dyn Fn(&InstanceNotification) + Send + Sync>;

pub(crate) enum Dispatch {
    Status(ClientStatusEvent),
    Session(ClientSessionEvent),
    Notification(InstanceNotification),
    Completion(Completion),
}

#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    status: Vec<(ListenerId, StatusListener)>,
    session: Vec<(ListenerId, SessionListener)>,
    notification: Vec<(ListenerId, NotificationListener)>,
}

/// Registered listeners, invoked in registration order.
#[derive(Default)]
pub(crate) struct Listeners {
    inner: Mutex<ListenerSet>,
}

impl Listeners {
    fn lock(&self) -> MutexGuard<'_, ListenerSet> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(set: &mut ListenerSet) -> ListenerId {
        set.next_id += 1;
        ListenerId(set.next_id)
    }

    pub(crate) fn add_status(&self, listener: StatusListener) -> ListenerId {
        let mut set = self.lock();
        let id = Self::next_id(&mut set);
        set.status.push((id, listener));
        id
    }

    pub(crate) fn add_session(&self, listener: SessionListener) -> ListenerId {
        let mut set = self.lock();
        let id = Self::next_id(&mut set);
        set.session.push((id, listener));
        id
    }

    pub(crate) fn add_notification(&self, listener: NotificationListener) -> ListenerId {
        let mut set = self.lock();
        let id = Self::next_id(&mut set);
        set.notification.push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut set = self.lock();
        let before = set.status.len() + set.session.len() + set.notification.len();
        set.status.retain(|(i, _)| *i != id);
        set.session.retain(|(i, _)| *i != id);
        set.notification.retain(|(i, _)| *i != id);
        before != set.status.len() + set.session.len() + set.notification.len()
    }

    // Listeners are cloned out so none runs under the registry lock.
    fn status(&self) -> Vec<StatusListener> {
        self.lock().status.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    fn session(&self) -> Vec<SessionListener> {
        self.lock().session.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    fn notification(&self) -> Vec<NotificationListener> {
        self.lock()
            .notification
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }
}

pub(crate) struct Dispatcher {
    listeners: Arc<Listeners>,
    outstanding: Arc<AtomicUsize>,
    latency: Option<Arc<LatencyRegistry>>,
}

impl Dispatcher {
    pub(crate) fn new(
        listeners: Arc<Listeners>,
        outstanding: Arc<AtomicUsize>,
        latency: Option<Arc<LatencyRegistry>>,
    ) -> Self {
        Self {
            listeners,
            outstanding,
            latency,
        }
    }

    /// Runs until every sender is dropped.
    pub(crate) async fn run(self, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
        while let Some(item) = rx.recv().await {
            self.dispatch(item);
        }
        trace!("Dispatcher stopped");
    }

    fn dispatch(&self, item: Dispatch) {
        match item {
            Dispatch::Status(event) => {
                for listener in self.listeners.status() {
                    guarded("status listener", || listener(&event));
                }
            }
            Dispatch::Session(event) => {
                for listener in self.listeners.session() {
                    guarded("session listener", || listener(&event));
                }
            }
            Dispatch::Notification(notification) => {
                for listener in self.listeners.notification() {
                    guarded("notification listener", || listener(&notification));
                }
            }
            Dispatch::Completion(completion) => self.complete(completion),
        }
    }

    fn complete(&self, completion: Completion) {
        // Release the backlog slot before the caller can observe the result
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        let xid = completion.packet().xid();
        let success = completion.is_success();
        let packet = completion.packet().clone();
        guarded("packet callback", move || {
            completion.invoke();
        });
        trace!(xid, success, "Packet callback invoked");

        if let Some(registry) = &self.latency {
            let t = packet.timings();
            if let (Some(queued), Some(sent)) = (t.queued, t.sent) {
                registry.record(PacketStage::Queue, sent.saturating_duration_since(queued));
            }
            if let (Some(sent), Some(received)) = (t.sent, t.received) {
                registry.record(
                    PacketStage::RoundTrip,
                    received.saturating_duration_since(sent),
                );
            }
            if let (Some(finished), Some(invoked)) = (t.finished, t.callback_invoked) {
                registry.record(
                    PacketStage::Dispatch,
                    invoked.saturating_duration_since(finished),
                );
            }
            if let Some(invoked) = t.callback_invoked {
                registry.record(PacketStage::Total, invoked.saturating_duration_since(t.created));
            }
            registry.record_outcome(success);
        }
    }
}

fn guarded(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(target: "svcdir_client::dispatch", "{} panicked; continuing", what);
    }
}
