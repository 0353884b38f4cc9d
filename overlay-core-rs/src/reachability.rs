//! Reachability table for multi-hop routing
//!
//! Maps a destination node to one or more routes ordered by priority (lower
//! wins). A route either names a concrete transport binding or delegates to a
//! networking hub, which is resolved through the same table.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::types::NodeId;

/// How a destination is reached
#[derive(Debug, Clone)]
pub enum RouteTarget<T> {
    /// Through an outbound connection
    Client(T),
    /// Through inbound connections of a server, looked up by destination
    Server(T),
    /// Through another node, resolved recursively
    Hub(NodeId),
}

impl<T> RouteTarget<T> {
    pub fn hub(&self) -> Option<&NodeId> {
        match self {
            RouteTarget::Hub(hub) => Some(hub),
            _ => None,
        }
    }

    /// The transport of a concrete binding
    pub fn transport(&self) -> Option<&T> {
        match self {
            RouteTarget::Client(t) | RouteTarget::Server(t) => Some(t),
            RouteTarget::Hub(_) => None,
        }
    }
}

/// One routing entry
#[derive(Debug, Clone)]
pub struct Reachability<T> {
    pub destination: NodeId,
    pub priority: u8,
    pub target: RouteTarget<T>,
    pub expires: Option<DateTime<Utc>>,
}

impl<T> Reachability<T> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

/// Result of walking a hub chain
#[derive(Debug, Clone)]
pub struct Resolution<T> {
    /// The concrete binding reached, if any
    pub route: Option<Reachability<T>>,
    /// The node id resolution ended on
    pub terminal: NodeId,
    /// Whether the chain came back to an id it had already visited
    pub looped: bool,
}

/// Concurrent routing table
#[derive(Debug)]
pub struct ReachabilityTable<T> {
    routes: DashMap<NodeId, Vec<Reachability<T>>>,
}

impl<T: Clone> ReachabilityTable<T> {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    /// Insert a route, replacing any existing route for `destination` at the same priority
    pub fn add_static_route(
        &self,
        destination: NodeId,
        target: RouteTarget<T>,
        priority: u8,
        expires: Option<DateTime<Utc>>,
    ) {
        let entry = Reachability {
            destination: destination.clone(),
            priority,
            target,
            expires,
        };

        // The shard lock is held for the whole read-modify-write
        let mut routes = self.routes.entry(destination.clone()).or_default();
        match routes.iter().position(|r| r.priority >= priority) {
            Some(i) if routes[i].priority == priority => {
                debug!("Replacing route to {} at priority {}", destination, priority);
                routes[i] = entry;
            }
            Some(i) => routes.insert(i, entry),
            None => routes.push(entry),
        }
    }

    /// Remove routes for `destination`.
    ///
    /// Without filters every route for the destination goes. With a hub and/or
    /// priority only the matching routes are removed; the key disappears once
    /// its list is empty.
    pub fn remove_static_route(&self, destination: &NodeId, hub: Option<&NodeId>, priority: Option<u8>) {
        if hub.is_none() && priority.is_none() {
            self.routes.remove(destination);
            return;
        }

        if let Some(mut routes) = self.routes.get_mut(destination) {
            routes.retain(|r| {
                let hub_matches = hub.map_or(true, |h| r.target.hub() == Some(h));
                let priority_matches = priority.map_or(true, |p| r.priority == p);
                !(hub_matches && priority_matches)
            });
        }
        self.routes.remove_if(destination, |_, routes| routes.is_empty());
    }

    /// Best concrete route for `destination`, following hubs
    pub fn resolve(&self, destination: &NodeId) -> Option<Reachability<T>> {
        self.resolve_chain(destination).route
    }

    /// Walk the hub chain for `destination`
    pub fn resolve_chain(&self, destination: &NodeId) -> Resolution<T> {
        let now = Utc::now();
        let mut visited = HashSet::new();
        let mut current = destination.clone();

        loop {
            if !visited.insert(current.clone()) {
                warn!("Routing loop while resolving {} (revisited {})", destination, current);
                return Resolution {
                    route: None,
                    terminal: current,
                    looped: true,
                };
            }

            let best = self.routes.get(&current).and_then(|routes| {
                routes.iter().find(|r| !r.is_expired(now)).cloned()
            });

            if let Some(hub) = best.as_ref().and_then(|route| route.target.hub()) {
                debug!("{} is reachable via hub {}", current, hub);
                current = hub.clone();
                continue;
            }

            return Resolution {
                route: best,
                terminal: current,
                looped: false,
            };
        }
    }

    /// All routes currently known for `destination`, in priority order
    pub fn routes(&self, destination: &NodeId) -> Vec<Reachability<T>> {
        self.routes
            .get(destination)
            .map(|routes| routes.value().clone())
            .unwrap_or_default()
    }

    /// Destinations with at least one route
    pub fn destinations(&self) -> Vec<NodeId> {
        self.routes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drop expired routes; returns how many were removed
    pub fn remove_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        self.routes.retain(|_, routes| {
            let before = routes.len();
            routes.retain(|r| !r.is_expired(now));
            removed += before - routes.len();
            !routes.is_empty()
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<T: Clone> Default for ReachabilityTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[test]
    fn test_priority_order_and_fallback() {
        let table = ReachabilityTable::new();
        table.add_static_route(id("CSMS"), RouteTarget::Client("backup"), 1, None);
        table.add_static_route(id("CSMS"), RouteTarget::Client("primary"), 0, None);

        let route = table.resolve(&id("CSMS")).unwrap();
        assert_eq!(route.target.transport(), Some(&"primary"));

        table.remove_static_route(&id("CSMS"), None, Some(0));
        let route = table.resolve(&id("CSMS")).unwrap();
        assert_eq!(route.target.transport(), Some(&"backup"));
        assert_eq!(route.priority, 1);
    }

    #[test]
    fn test_same_priority_is_replaced() {
        let table = ReachabilityTable::new();
        table.add_static_route(id("CS1"), RouteTarget::Client("old"), 0, None);
        table.add_static_route(id("CS1"), RouteTarget::Client("new"), 0, None);

        assert_eq!(table.routes(&id("CS1")).len(), 1);
        assert_eq!(table.resolve(&id("CS1")).unwrap().target.transport(), Some(&"new"));
    }

    #[test]
    fn test_hub_chain_resolves_to_concrete_binding() {
        let table = ReachabilityTable::new();
        table.add_static_route(id("CS7"), RouteTarget::Hub(id("NN2")), 0, None);
        table.add_static_route(id("NN2"), RouteTarget::Hub(id("NN1")), 0, None);
        table.add_static_route(id("NN1"), RouteTarget::Server("server"), 0, None);

        let resolution = table.resolve_chain(&id("CS7"));
        assert!(!resolution.looped);
        assert_eq!(resolution.terminal, id("NN1"));
        assert_eq!(resolution.route.unwrap().target.transport(), Some(&"server"));
    }

    #[test]
    fn test_hub_cycle_terminates() {
        let table: ReachabilityTable<&str> = ReachabilityTable::new();
        table.add_static_route(id("A"), RouteTarget::Hub(id("B")), 0, None);
        table.add_static_route(id("B"), RouteTarget::Hub(id("C")), 0, None);
        table.add_static_route(id("C"), RouteTarget::Hub(id("A")), 0, None);

        let resolution = table.resolve_chain(&id("A"));
        assert!(resolution.looped);
        assert!(resolution.route.is_none());
        assert!(table.resolve(&id("B")).is_none());
    }

    #[test]
    fn test_unknown_destination_and_dead_end_hub() {
        let table: ReachabilityTable<&str> = ReachabilityTable::new();
        assert!(table.resolve(&id("nobody")).is_none());

        table.add_static_route(id("CS1"), RouteTarget::Hub(id("NN9")), 0, None);
        let resolution = table.resolve_chain(&id("CS1"));
        assert!(resolution.route.is_none());
        assert!(!resolution.looped);
        assert_eq!(resolution.terminal, id("NN9"));
    }

    #[test]
    fn test_remove_by_hub_keeps_other_routes() {
        let table = ReachabilityTable::new();
        table.add_static_route(id("CS1"), RouteTarget::Hub(id("NN1")), 0, None);
        table.add_static_route(id("CS1"), RouteTarget::Hub(id("NN2")), 1, None);
        table.add_static_route(id("CS1"), RouteTarget::Client("direct"), 2, None);

        table.remove_static_route(&id("CS1"), Some(&id("NN1")), None);
        let routes = table.routes(&id("CS1"));
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].target.hub(), Some(&id("NN2")));

        table.remove_static_route(&id("CS1"), Some(&id("NN2")), Some(1));
        table.remove_static_route(&id("CS1"), None, Some(2));
        assert!(table.is_empty());
    }

    #[test]
    fn test_expired_routes_are_skipped() {
        let table = ReachabilityTable::new();
        let past = Utc::now() - chrono::Duration::seconds(5);
        table.add_static_route(id("CS1"), RouteTarget::Client("stale"), 0, Some(past));
        table.add_static_route(id("CS1"), RouteTarget::Client("fresh"), 1, None);

        assert_eq!(table.resolve(&id("CS1")).unwrap().target.transport(), Some(&"fresh"));
        assert_eq!(table.remove_expired(), 1);
        assert_eq!(table.routes(&id("CS1")).len(), 1);
    }

    #[test]
    fn test_concurrent_upserts_do_not_lose_priorities() {
        let table = Arc::new(ReachabilityTable::new());
        let handles: Vec<_> = (0..8u8)
            .map(|priority| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        table.add_static_route(id("CSMS"), RouteTarget::Client(priority), priority, None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let routes = table.routes(&id("CSMS"));
        let priorities: Vec<u8> = routes.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, (0..8).collect::<Vec<_>>());
    }
}
