use std::sync::{Mutex, MutexGuard};
use svcdir_common::{DirectoryError, Endpoint, Result};
use tracing::{debug, info};

/// Failover-ordered set of directory server endpoints.
///
/// Hands out endpoints round-robin. The endpoint of the most recent
/// successful connection is skipped once on the following `next()` call when
/// more than one endpoint is configured, so a reconnect always moves to a
/// different server.
///
/// `update` swaps the whole set under the same lock `next` reads through, so
/// a concurrent `next` sees either the old or the new set.
#[derive(Debug)]
pub struct ServerRoster {
    inner: Mutex<RosterState>,
}

#[derive(Debug)]
struct RosterState {
    endpoints: Vec<Endpoint>,
    cursor: usize,
    avoid: Option<Endpoint>,
}

impl ServerRoster {
    /// Creates a roster; an empty list is a configuration error.
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(DirectoryError::EmptyRoster);
        }
        Ok(Self {
            inner: Mutex::new(RosterState {
                endpoints,
                cursor: 0,
                avoid: None,
            }),
        })
    }

    /// Parses `host:port` strings (IPv6 hosts in brackets).
    ///
    /// # Example
    ///
    /// ```
    /// use svcdir_client::ServerRoster;
    ///
    /// let roster = ServerRoster::parse(["sd1:2013", "[::1]:2013"]).unwrap();
    /// assert_eq!(roster.next().to_string(), "sd1:2013");
    /// ```
    pub fn parse<I, S>(servers: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(parse_servers(servers)?)
    }

    /// Next endpoint to try.
    pub fn next(&self) -> Endpoint {
        let mut state = self.lock();
        let len = state.endpoints.len();
        let avoid = state.avoid.take();

        let mut idx = state.cursor % len;
        if len > 1 && avoid.as_ref() == Some(&state.endpoints[idx]) {
            idx = (idx + 1) % len;
        }
        state.cursor = (idx + 1) % len;
        state.endpoints[idx].clone()
    }

    /// Records the endpoint a session was just established on.
    pub fn mark_connected(&self, endpoint: &Endpoint) {
        self.lock().avoid = Some(endpoint.clone());
    }

    /// Atomically replaces the endpoint set.
    ///
    /// The cursor restarts at the first endpoint; the last connected endpoint
    /// is still avoided if it remains in the new set.
    pub fn update(&self, endpoints: Vec<Endpoint>) -> Result<()> {
        if endpoints.is_empty() {
            return Err(DirectoryError::EmptyRoster);
        }
        let mut state = self.lock();
        info!(
            previous = state.endpoints.len(),
            current = endpoints.len(),
            "Server roster updated"
        );
        state.endpoints = endpoints;
        state.cursor = 0;
        Ok(())
    }

    pub fn update_from_strings<I, S>(&self, servers: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.update(parse_servers(servers)?)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.lock().endpoints.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().endpoints.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, RosterState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parse_servers<I, S>(servers: I) -> Result<Vec<Endpoint>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let endpoints = servers
        .into_iter()
        .map(|s| s.as_ref().trim().parse::<Endpoint>())
        .collect::<Result<Vec<_>>>()?;
    debug!(count = endpoints.len(), "Parsed server list");
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn roster(names: &[&str]) -> ServerRoster {
        ServerRoster::new(names.iter().map(|n| Endpoint::new(*n, 2013)).collect()).unwrap()
    }

    #[test]
    fn test_empty_roster_rejected_at_construction() {
        assert!(matches!(
            ServerRoster::new(vec![]),
            Err(DirectoryError::EmptyRoster)
        ));
        assert!(matches!(
            ServerRoster::parse(Vec::<String>::new()),
            Err(DirectoryError::EmptyRoster)
        ));
    }

    #[test]
    fn test_round_robin() {
        let roster = roster(&["a", "b", "c"]);
        assert_eq!(roster.next().host(), "a");
        assert_eq!(roster.next().host(), "b");
        assert_eq!(roster.next().host(), "c");
        assert_eq!(roster.next().host(), "a");
    }

    #[test]
    fn test_failover_cycle_closes_after_k_failures() {
        for k in 2..6 {
            let names: Vec<String> = (0..k).map(|i| format!("sd{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let roster = roster(&refs);

            let first = roster.next();
            for _ in 1..k {
                roster.next();
            }
            assert_eq!(roster.next(), first, "k = {k}");
        }
    }

    #[test]
    fn test_reconnect_moves_off_connected_endpoint() {
        let roster = roster(&["a", "b", "c"]);
        let first = roster.next();
        roster.mark_connected(&first);
        assert_eq!(roster.next().host(), "b");

        // After an update the cursor restarts at "a", which is still avoided
        roster.mark_connected(&Endpoint::new("a", 2013));
        roster
            .update(vec![Endpoint::new("a", 2013), Endpoint::new("d", 2013)])
            .unwrap();
        assert_eq!(roster.next().host(), "d");
        assert_eq!(roster.next().host(), "a");
    }

    #[test]
    fn test_single_endpoint_is_reused() {
        let roster = roster(&["only"]);
        let ep = roster.next();
        roster.mark_connected(&ep);
        assert_eq!(roster.next(), ep);
    }

    #[test]
    fn test_update_rejects_empty_and_keeps_old_set() {
        let roster = roster(&["a", "b"]);
        assert!(roster.update(vec![]).is_err());
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_parse_server_list() {
        let roster = ServerRoster::parse(["sd1:2013", " sd2:2014 ", "[::1]:2015"]).unwrap();
        let endpoints = roster.endpoints();
        assert_eq!(endpoints[1], Endpoint::new("sd2", 2014));
        assert_eq!(endpoints[2].host(), "::1");

        assert!(matches!(
            ServerRoster::parse(["sd1"]),
            Err(DirectoryError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_concurrent_next_sees_consistent_sets() {
        let old: Vec<Endpoint> = (0..3).map(|i| Endpoint::new("old", 1000 + i)).collect();
        let new: Vec<Endpoint> = (0..5).map(|i| Endpoint::new("new", 2000 + i)).collect();
        let roster = Arc::new(ServerRoster::new(old.clone()).unwrap());

        let valid: HashSet<Endpoint> = old.iter().chain(new.iter()).cloned().collect();
        let mut handles = vec![];
        for _ in 0..4 {
            let roster = Arc::clone(&roster);
            handles.push(thread::spawn(move || {
                (0..500).map(|_| roster.next()).collect::<Vec<_>>()
            }));
        }
        for i in 0..50 {
            let set = if i % 2 == 0 { new.clone() } else { old.clone() };
            roster.update(set).unwrap();
        }

        for handle in handles {
            for ep in handle.join().unwrap() {
                assert!(valid.contains(&ep));
            }
        }
    }
}
