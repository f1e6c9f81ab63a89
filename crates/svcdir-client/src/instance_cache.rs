use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use svcdir_common::{
    HeartbeatNormalizer, InstanceNotification, ProviderIdentity, Result, ServiceInstance,
};
use tracing::debug;

use crate::connection::Connection;
use crate::events::{ListenerId, SessionEvent};
use crate::load_balancer::LoadBalancer;

/// Receives availability changes for one service.
///
/// Calls may repeat for the same logical change (for example after the
/// cache is rebuilt on session reopen); implementations must tolerate that.
pub trait InstanceChangeHandler: Send + Sync {
    fn service_instance_available(&self, _instance: &ServiceInstance) {}

    fn service_instance_unavailable(&self, _instance: &ServiceInstance) {}

    /// URI or metadata changed while availability did not.
    fn service_instance_change(&self, _instance: &ServiceInstance) {}
}

#[derive(Debug)]
enum Change {
    Available(ServiceInstance),
    Unavailable(ServiceInstance),
    Changed(ServiceInstance),
}

/// In-memory view of service instances, built from server-pushed events.
///
/// Instances are keyed by service name, then provider id. Heartbeat ids go
/// through [`HeartbeatNormalizer`], so legacy `address-port` ids and bare
/// addresses resolve to the same provider.
#[derive(Default)]
pub struct InstanceCache {
    services: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn InstanceChangeHandler>>>>,
    normalizer: HeartbeatNormalizer,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the cache from a connection's notifications and clears it when
    /// the session closes.
    pub fn attach(self: &Arc<Self>, connection: &Connection) -> [ListenerId; 2] {
        let cache = Arc::clone(self);
        let notifications = connection.on_notification(move |n| cache.apply(n));

        let cache = Arc::clone(self);
        let sessions = connection.on_session_event(move |event| {
            if event.event == SessionEvent::Closed {
                cache.clear();
            }
        });
        [notifications, sessions]
    }

    /// Registers a handler for one service; handlers run in registration order.
    pub fn add_handler(&self, service_name: impl Into<String>, handler: Arc<dyn InstanceChangeHandler>) {
        self.write_handlers()
            .entry(service_name.into())
            .or_default()
            .push(handler);
    }

    pub fn remove_handlers(&self, service_name: &str) {
        self.write_handlers().remove(service_name);
    }

    /// Applies one server notification.
    pub fn apply(&self, notification: &InstanceNotification) {
        let service = notification.service_name().to_string();
        let changes = {
            let mut services = self.write_services();
            match notification {
                InstanceNotification::Registered { instance }
                | InstanceNotification::Updated { instance } => {
                    let instance = self.normalized(instance.clone());
                    let list = services.entry(service.clone()).or_default();
                    upsert(list, instance)
                }
                InstanceNotification::Unregistered { provider_id, .. } => {
                    let identity = self.normalizer.normalize(&service, provider_id);
                    match services.get_mut(&service) {
                        Some(list) => remove(list, &identity),
                        None => Vec::new(),
                    }
                }
                InstanceNotification::Heartbeat {
                    provider_id,
                    status,
                    timestamp_ms,
                    ..
                } => {
                    let identity = self.normalizer.normalize(&service, provider_id);
                    let found = services.get_mut(&service).and_then(|list| {
                        let idx = find(list, &identity)?;
                        Some(&mut list[idx])
                    });
                    match found {
                        Some(instance) => {
                            instance.last_heartbeat_ms = Some(*timestamp_ms);
                            if instance.status == *status {
                                Vec::new()
                            } else {
                                instance.status = *status;
                                if status.is_up() {
                                    vec![Change::Available(instance.clone())]
                                } else {
                                    vec![Change::Unavailable(instance.clone())]
                                }
                            }
                        }
                        None => {
                            debug!(
                                service = %service,
                                provider_id = %provider_id,
                                "Heartbeat for unknown provider ignored"
                            );
                            Vec::new()
                        }
                    }
                }
            }
        };
        self.fire(&service, changes);
    }

    /// Replaces a service's instance list (e.g. from a lookup response),
    /// notifying handlers of the differences.
    pub fn update_service(&self, service_name: &str, instances: Vec<ServiceInstance>) {
        let changes = {
            let mut services = self.write_services();
            let list = services.entry(service_name.to_string()).or_default();
            let mut changes = Vec::new();

            for old in list.iter() {
                let still_present = instances.iter().any(|i| i.provider_id == old.provider_id);
                if !still_present && old.is_up() {
                    changes.push(Change::Unavailable(old.clone()));
                }
            }
            list.retain(|old| instances.iter().any(|i| i.provider_id == old.provider_id));
            for instance in instances {
                changes.extend(upsert(list, self.normalized(instance)));
            }
            changes
        };
        self.fire(service_name, changes);
    }

    /// UP instances of a service.
    pub fn candidates(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.read_services()
            .get(service_name)
            .map(|list| list.iter().filter(|i| i.is_up()).cloned().collect())
            .unwrap_or_default()
    }

    /// All known instances of a service, regardless of status.
    pub fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.read_services()
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_services().keys().cloned().collect();
        names.sort();
        names
    }

    /// Picks one UP instance of the service.
    pub fn lookup_instance(
        &self,
        service_name: &str,
        balancer: &dyn LoadBalancer,
    ) -> Result<ServiceInstance> {
        balancer.vote(service_name, &self.candidates(service_name))
    }

    pub fn clear(&self) {
        let mut services = self.write_services();
        if !services.is_empty() {
            debug!(services = services.len(), "Instance cache cleared");
        }
        services.clear();
    }

    /// Derives `provider_address` from `provider_id`, which wins on conflict.
    fn normalized(&self, mut instance: ServiceInstance) -> ServiceInstance {
        let identity = self
            .normalizer
            .normalize(&instance.service_name, &instance.provider_id);
        if instance.provider_address != identity.provider_address() {
            debug!(
                provider_id = %instance.provider_id,
                reported = %instance.provider_address,
                derived = identity.provider_address(),
                "Correcting provider address"
            );
            instance.provider_address = identity.provider_address().to_string();
        }
        instance
    }

    fn fire(&self, service_name: &str, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        let handlers: Vec<Arc<dyn InstanceChangeHandler>> = self
            .read_handlers()
            .get(service_name)
            .cloned()
            .unwrap_or_default();

        for change in &changes {
            debug!(service = service_name, change = ?change, "Instance change");
            for handler in &handlers {
                match change {
                    Change::Available(i) => handler.service_instance_available(i),
                    Change::Unavailable(i) => handler.service_instance_unavailable(i),
                    Change::Changed(i) => handler.service_instance_change(i),
                }
            }
        }
    }

    fn read_services(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<ServiceInstance>>> {
        self.services.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_services(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<ServiceInstance>>> {
        self.services.write().unwrap_or_else(|p| p.into_inner())
    }

    fn read_handlers(
        &self,
    ) -> RwLockReadGuard<'_, HashMap<String, Vec<Arc<dyn InstanceChangeHandler>>>> {
        self.handlers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_handlers(
        &self,
    ) -> RwLockWriteGuard<'_, HashMap<String, Vec<Arc<dyn InstanceChangeHandler>>>> {
        self.handlers.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Provider id match first, then a unique provider address match.
fn find(list: &[ServiceInstance], identity: &ProviderIdentity) -> Option<usize> {
    if let Some(idx) = list
        .iter()
        .position(|i| i.provider_id == identity.provider_id())
    {
        return Some(idx);
    }
    let mut matches = list
        .iter()
        .enumerate()
        .filter(|(_, i)| i.provider_address == identity.provider_address());
    let (idx, _) = matches.next()?;
    matches.next().is_none().then_some(idx)
}

fn upsert(list: &mut Vec<ServiceInstance>, mut instance: ServiceInstance) -> Vec<Change> {
    match list.iter().position(|i| i.provider_id == instance.provider_id) {
        None => {
            let change = instance.is_up().then(|| Change::Available(instance.clone()));
            list.push(instance);
            change.into_iter().collect()
        }
        Some(idx) => {
            let old = &list[idx];
            if instance.last_heartbeat_ms.is_none() {
                instance.last_heartbeat_ms = old.last_heartbeat_ms;
            }
            let mut changes = Vec::new();
            match (old.is_up(), instance.is_up()) {
                (true, false) => changes.push(Change::Unavailable(instance.clone())),
                (false, true) => changes.push(Change::Available(instance.clone())),
                _ => {}
            }
            if old.uri != instance.uri || old.metadata != instance.metadata {
                changes.push(Change::Changed(instance.clone()));
            }
            list[idx] = instance;
            changes
        }
    }
}

fn remove(list: &mut Vec<ServiceInstance>, identity: &ProviderIdentity) -> Vec<Change> {
    match find(list, identity) {
        Some(idx) => {
            let removed = list.remove(idx);
            if removed.is_up() {
                vec![Change::Unavailable(removed)]
            } else {
                Vec::new()
            }
        }
        None => Vec::new(),
    }
}
