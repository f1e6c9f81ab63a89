use dashmap::DashMap;
use svcdir_common::{DirectoryError, Result, ServiceInstance};
use tracing::debug;

/// Selects one instance from a service's candidate list.
///
/// Implementations must be safe to call from many tasks at once.
pub trait LoadBalancer: Send + Sync {
    fn vote(&self, service_name: &str, candidates: &[ServiceInstance]) -> Result<ServiceInstance>;
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    next: usize,
    len: usize,
}

/// Round-robin load balancer with one cursor per service name.
///
/// Each `vote` returns `candidates[cursor mod len]` and advances the cursor
/// while holding the map shard's write lock, so concurrent votes for the same
/// service never lose or duplicate an increment. Unrelated services usually
/// land on different shards and do not contend.
///
/// # Example
///
/// ```
/// use svcdir_client::{LoadBalancer, RoundRobinLoadBalancer};
/// use svcdir_common::ServiceInstance;
///
/// let lb = RoundRobinLoadBalancer::new();
/// let candidates = vec![
///     ServiceInstance::new("billing", "10.0.0.1", "http://10.0.0.1"),
///     ServiceInstance::new("billing", "10.0.0.2", "http://10.0.0.2"),
/// ];
/// assert_eq!(lb.vote("billing", &candidates).unwrap().provider_address, "10.0.0.1");
/// assert_eq!(lb.vote("billing", &candidates).unwrap().provider_address, "10.0.0.2");
/// ```
#[derive(Debug, Default)]
pub struct RoundRobinLoadBalancer {
    cursors: DashMap<String, Cursor>,
}

impl RoundRobinLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of services with a cursor.
    pub fn service_count(&self) -> usize {
        self.cursors.len()
    }

    /// Drops the cursor of a service, e.g. after it disappears.
    pub fn forget(&self, service_name: &str) {
        self.cursors.remove(service_name);
    }

    fn advance(cursor: &mut Cursor, service_name: &str, len: usize) -> usize {
        if cursor.len != len {
            debug!(
                service = service_name,
                previous = cursor.len,
                current = len,
                "Candidate set resized"
            );
            cursor.len = len;
        }
        let idx = cursor.next % len;
        cursor.next = (idx + 1) % len;
        idx
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn vote(&self, service_name: &str, candidates: &[ServiceInstance]) -> Result<ServiceInstance> {
        let len = candidates.len();
        if len == 0 {
            return Err(DirectoryError::EmptyCandidates(service_name.to_string()));
        }

        let idx = match self.cursors.get_mut(service_name) {
            Some(mut cursor) => Self::advance(&mut cursor, service_name, len),
            None => {
                let mut cursor = self
                    .cursors
                    .entry(service_name.to_string())
                    .or_insert(Cursor { next: 0, len });
                Self::advance(&mut cursor, service_name, len)
            }
        };
        Ok(candidates[idx].clone())
    }
}

/// Filters candidates down to UP instances before delegating.
#[derive(Debug, Default)]
pub struct HealthAwareLoadBalancer<L> {
    inner: L,
}

impl<L: LoadBalancer> HealthAwareLoadBalancer<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

impl<L: LoadBalancer> LoadBalancer for HealthAwareLoadBalancer<L> {
    fn vote(&self, service_name: &str, candidates: &[ServiceInstance]) -> Result<ServiceInstance> {
        let healthy: Vec<ServiceInstance> =
            candidates.iter().filter(|c| c.is_up()).cloned().collect();
        if healthy.is_empty() {
            return Err(DirectoryError::EmptyCandidates(service_name.to_string()));
        }
        self.inner.vote(service_name, &healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;
    use svcdir_common::OperationalStatus;

    fn instances(n: usize) -> Vec<ServiceInstance> {
        (0..n)
            .map(|i| {
                let addr = format!("10.0.0.{i}");
                ServiceInstance::new("billing", addr.clone(), format!("http://{addr}:8080"))
            })
            .collect()
    }

    #[test]
    fn test_round_robin() {
        let lb = RoundRobinLoadBalancer::new();
        let candidates = instances(3);

        let picks: Vec<String> = (0..4)
            .map(|_| lb.vote("billing", &candidates).unwrap().provider_address)
            .collect();
        assert_eq!(picks, ["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.0"]);
    }

    #[test]
    fn test_empty_candidates() {
        let lb = RoundRobinLoadBalancer::new();
        let result = lb.vote("billing", &[]);
        assert!(matches!(result, Err(DirectoryError::EmptyCandidates(s)) if s == "billing"));
    }

    #[test]
    fn test_services_have_independent_cursors() {
        let lb = RoundRobinLoadBalancer::new();
        let candidates = instances(2);

        assert_eq!(lb.vote("a", &candidates).unwrap().provider_address, "10.0.0.0");
        assert_eq!(lb.vote("a", &candidates).unwrap().provider_address, "10.0.0.1");
        assert_eq!(lb.vote("b", &candidates).unwrap().provider_address, "10.0.0.0");
        assert_eq!(lb.service_count(), 2);

        lb.forget("a");
        assert_eq!(lb.vote("a", &candidates).unwrap().provider_address, "10.0.0.0");
    }

    #[test]
    fn test_cursor_survives_same_size_replacement() {
        let lb = RoundRobinLoadBalancer::new();
        let first = instances(3);
        lb.vote("billing", &first).unwrap();

        let mut replaced = instances(3);
        replaced[1].uri = "http://moved".into();
        assert_eq!(lb.vote("billing", &replaced).unwrap().uri, "http://moved");
    }

    #[test]
    fn test_cursor_stays_in_bounds_on_shrink() {
        let lb = RoundRobinLoadBalancer::new();
        let large = instances(5);
        for _ in 0..4 {
            lb.vote("billing", &large).unwrap();
        }

        let small = instances(2);
        for _ in 0..10 {
            let picked = lb.vote("billing", &small).unwrap();
            assert!(small.contains(&picked));
        }
    }

    #[test]
    fn test_concurrent_votes_are_fair() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1_001;
        const K: usize = 7;

        let lb = Arc::new(RoundRobinLoadBalancer::new());
        let candidates = Arc::new(instances(K));
        let mut handles = vec![];

        for _ in 0..THREADS {
            let lb = Arc::clone(&lb);
            let candidates = Arc::clone(&candidates);
            handles.push(thread::spawn(move || {
                let mut counts: HashMap<String, usize> = HashMap::new();
                for _ in 0..PER_THREAD {
                    let picked = lb.vote("billing", &candidates).unwrap();
                    *counts.entry(picked.provider_address).or_default() += 1;
                }
                counts
            }));
        }

        let mut totals: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for (addr, count) in handle.join().unwrap() {
                *totals.entry(addr).or_default() += count;
            }
        }

        let n = THREADS * PER_THREAD;
        assert_eq!(totals.values().sum::<usize>(), n);
        assert_eq!(totals.len(), K);
        for count in totals.values() {
            assert!(*count == n / K || *count == n.div_ceil(K), "count {count}");
        }
    }

    #[test]
    fn test_health_aware_skips_down_instances() {
        let lb = HealthAwareLoadBalancer::new(RoundRobinLoadBalancer::new());
        let mut candidates = instances(3);
        candidates[1].status = OperationalStatus::Down;

        let picks: Vec<String> = (0..4)
            .map(|_| lb.vote("billing", &candidates).unwrap().provider_address)
            .collect();
        assert_eq!(picks, ["10.0.0.0", "10.0.0.2", "10.0.0.0", "10.0.0.2"]);
    }

    #[test]
    fn test_health_aware_all_down() {
        let lb = HealthAwareLoadBalancer::new(RoundRobinLoadBalancer::new());
        let candidates: Vec<ServiceInstance> = instances(2)
            .into_iter()
            .map(|i| i.with_status(OperationalStatus::Down))
            .collect();

        assert!(matches!(
            lb.vote("billing", &candidates),
            Err(DirectoryError::EmptyCandidates(_))
        ));
    }
}
