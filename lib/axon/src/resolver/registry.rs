//! The resolver's mutable state: node and service entries plus the graph
//! edge sets. All mutation happens through `handle`, driven by the single
//! request/reply fibre, so no locking is needed here.

use crate::message::{Graph, GraphLink, NodeId, Request, Response};
use indexmap::IndexSet;
use hashbrown::HashMap;
use quark::logging;
use quark::logging::Logger;
use std::time::{Duration, Instant};

/// Node names nobody may claim. `make_unique_node_name` skips over them.
const RESERVED_NODE_NAME: &str = "node";

pub const DEFAULT_ONLINE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NodeEntry {
    pub name: String,
    pub node_id: NodeId,
    pub last_heartbeat: Instant,
    pub services: Vec<String>,
}

pub struct ServiceEntry {
    pub name: String,
    pub node_name: String,
    pub sock_addr: String,
}

type Edge = (String, String);

pub struct Registry {
    nodes_by_name: HashMap<String, NodeEntry>,
    names_by_key: HashMap<String, String>,
    services_by_name: HashMap<String, ServiceEntry>,

    node_publishes_topic: IndexSet<Edge>,
    node_subscribes_topic: IndexSet<Edge>,
    node_offers_service: IndexSet<Edge>,
    node_uses_service: IndexSet<Edge>,

    online_timeout: Duration,
    log: Logger,
}

impl Registry {
    pub fn new(online_timeout: Duration, log: Logger) -> Registry {
        Registry {
            nodes_by_name: HashMap::new(),
            names_by_key: HashMap::new(),
            services_by_name: HashMap::new(),
            node_publishes_topic: IndexSet::new(),
            node_subscribes_topic: IndexSet::new(),
            node_offers_service: IndexSet::new(),
            node_uses_service: IndexSet::new(),
            online_timeout,
            log,
        }
    }

    pub fn set_online_timeout(&mut self, timeout: Duration) {
        self.online_timeout = timeout;
    }

    pub fn node_name_exists(&self, name: &str) -> bool {
        name == RESERVED_NODE_NAME || self.nodes_by_name.contains_key(name)
    }

    /// Returns the requested name if free, otherwise the first `name-k`
    /// suffix not taken by a live node. An empty request falls back to the
    /// reserved base name.
    pub fn make_unique_node_name(&self, requested: &str) -> String {
        let base = if requested.is_empty() {
            RESERVED_NODE_NAME
        } else {
            requested
        };

        let mut candidate = base.to_string();
        let mut suffix = 1;
        while self.node_name_exists(&candidate) {
            candidate = format!("{}-{}", base, suffix);
            suffix += 1;
        }
        candidate
    }

    /// Dispatches one request against the registry. Returns the response
    /// and whether the graph changed (the caller republishes on change).
    /// `time_usec` is the resolver's wall clock, echoed in heartbeat
    /// replies; `self_name` is the resolver node's own name, exempt from
    /// sweeping.
    pub fn handle(
        &mut self,
        request: &Request,
        xsub_addr: &str,
        xpub_addr: &str,
        self_name: &str,
        time_usec: i64,
    ) -> (Response, bool) {
        match request {
            Request::AnnounceNode { node_id, node_name } => {
                self.handle_announce_node(node_id, node_name, xsub_addr, xpub_addr)
            }
            Request::ShutdownNode { node_name } => self.handle_shutdown_node(node_name),
            Request::AnnounceService {
                node_name,
                service_name,
                sock_addr,
            } => self.handle_announce_service(node_name, service_name, sock_addr),
            Request::ResolveService { service_name } => {
                (self.handle_resolve_service(service_name), false)
            }
            Request::Heartbeat { node_id } => self.handle_heartbeat(node_id, self_name, time_usec),
            Request::NodeTopic {
                node_name,
                topic_name,
                reverse,
                active,
            } => {
                let changed = self.set_topic_edge(node_name, topic_name, *reverse, *active);
                (Response::NodeTopic {}, changed)
            }
            Request::NodeService {
                node_name,
                service_name,
                reverse,
                active,
            } => {
                let changed = self.set_service_edge(node_name, service_name, *reverse, *active);
                (Response::NodeService {}, changed)
            }
            Request::GetGraph {} => (Response::GetGraph { graph: self.graph() }, false),
        }
    }

    /// Registers the node under a unique name. The same machine identity
    /// may not announce twice.
    pub fn handle_announce_node(
        &mut self,
        node_id: &NodeId,
        node_name: &str,
        xsub_addr: &str,
        xpub_addr: &str,
    ) -> (Response, bool) {
        let key = node_id.key();
        if self.names_by_key.contains_key(&key) {
            logging::error!(self.log, "a node with the same id already exists"; "key" => %key);
            return (
                Response::AnnounceNode {
                    ok: false,
                    node_name: String::new(),
                    xsub_sock_addr: String::new(),
                    xpub_sock_addr: String::new(),
                },
                false,
            );
        }

        let assigned = self.make_unique_node_name(node_name);
        self.nodes_by_name.insert(
            assigned.clone(),
            NodeEntry {
                name: assigned.clone(),
                node_id: node_id.clone(),
                last_heartbeat: Instant::now(),
                services: Vec::new(),
            },
        );
        self.names_by_key.insert(key.clone(), assigned.clone());

        logging::info!(self.log, "new node has joined"; "node" => %assigned, "key" => %key);
        (
            Response::AnnounceNode {
                ok: true,
                node_name: assigned,
                xsub_sock_addr: xsub_addr.to_string(),
                xpub_sock_addr: xpub_addr.to_string(),
            },
            true,
        )
    }

    fn handle_shutdown_node(&mut self, node_name: &str) -> (Response, bool) {
        if !self.nodes_by_name.contains_key(node_name) {
            logging::error!(self.log, "shutdown for unknown node"; "node" => node_name);
            return (Response::ShutdownNode { ok: false }, false);
        }

        self.purge_node(node_name);
        logging::info!(self.log, "node has left"; "node" => node_name);
        (Response::ShutdownNode { ok: true }, true)
    }

    /// Service names are globally unique. A name held by a node that has
    /// missed the liveness window is reclaimed: the stale node is purged
    /// first and the announce proceeds.
    pub fn handle_announce_service(
        &mut self,
        node_name: &str,
        service_name: &str,
        sock_addr: &str,
    ) -> (Response, bool) {
        let mut graph_changed = false;

        if let Some(existing) = self.services_by_name.get(service_name) {
            let owner = existing.node_name.clone();
            let owner_stale = self
                .nodes_by_name
                .get(&owner)
                .map(|entry| entry.last_heartbeat.elapsed() > self.online_timeout)
                .unwrap_or(true);

            if owner_stale && owner != node_name {
                logging::info!(self.log, "reclaiming service from stale node";
                               "service" => service_name, "stale_node" => %owner);
                self.purge_node(&owner);
                graph_changed = true;
            } else {
                logging::error!(self.log, "a service with this name already exists";
                                "service" => service_name, "node" => %owner);
                return (Response::AnnounceService { ok: false }, false);
            }
        }

        let entry = match self.nodes_by_name.get_mut(node_name) {
            Some(entry) => entry,
            None => {
                logging::error!(self.log, "service announce from unknown node"; "node" => node_name);
                return (Response::AnnounceService { ok: false }, graph_changed);
            }
        };
        entry.services.push(service_name.to_string());

        self.services_by_name.insert(
            service_name.to_string(),
            ServiceEntry {
                name: service_name.to_string(),
                node_name: node_name.to_string(),
                sock_addr: sock_addr.to_string(),
            },
        );

        logging::info!(self.log, "node announced service";
                       "node" => node_name, "service" => service_name, "addr" => sock_addr);
        (Response::AnnounceService { ok: true }, graph_changed)
    }

    fn handle_resolve_service(&self, service_name: &str) -> Response {
        match self.services_by_name.get(service_name) {
            Some(entry) => {
                logging::trace!(self.log, "resolution";
                                "service" => service_name, "addr" => %entry.sock_addr);
                Response::ResolveService {
                    ok: true,
                    sock_addr: entry.sock_addr.clone(),
                }
            }
            None => {
                logging::error!(self.log, "failed to resolve service"; "service" => service_name);
                Response::ResolveService {
                    ok: false,
                    sock_addr: String::new(),
                }
            }
        }
    }

    fn handle_heartbeat(
        &mut self,
        node_id: &NodeId,
        self_name: &str,
        time_usec: i64,
    ) -> (Response, bool) {
        let mut graph_changed = false;

        if node_id.is_sentinel() {
            graph_changed = self.sweep(self_name);
        } else {
            let name = match self.names_by_key.get(&node_id.key()) {
                Some(name) => name.clone(),
                None => {
                    logging::error!(self.log, "heartbeat from an invalid node id";
                                    "key" => node_id.key());
                    return (
                        Response::Heartbeat {
                            ok: false,
                            time_usec,
                        },
                        false,
                    );
                }
            };
            if let Some(entry) = self.nodes_by_name.get_mut(&name) {
                entry.last_heartbeat = Instant::now();
            }
        }

        (
            Response::Heartbeat {
                ok: true,
                time_usec,
            },
            graph_changed,
        )
    }

    fn set_topic_edge(&mut self, node: &str, topic: &str, reverse: bool, active: bool) -> bool {
        let edge = (node.to_string(), topic.to_string());
        let set = if reverse {
            &mut self.node_subscribes_topic
        } else {
            &mut self.node_publishes_topic
        };

        let changed = if active {
            set.insert(edge)
        } else {
            set.shift_remove(&edge)
        };

        if changed {
            let relation = match (reverse, active) {
                (false, true) => "publishes",
                (false, false) => "stops publishing",
                (true, true) => "subscribes to",
                (true, false) => "stops subscribing to",
            };
            logging::info!(self.log, "graph: topic relation changed";
                           "node" => node, "relation" => relation, "topic" => topic);
        }
        changed
    }

    fn set_service_edge(&mut self, node: &str, service: &str, reverse: bool, active: bool) -> bool {
        let edge = (node.to_string(), service.to_string());
        let set = if reverse {
            &mut self.node_uses_service
        } else {
            &mut self.node_offers_service
        };

        let changed = if active {
            set.insert(edge)
        } else {
            set.shift_remove(&edge)
        };

        if changed {
            let relation = match (reverse, active) {
                (false, true) => "offers",
                (false, false) => "stops offering",
                (true, true) => "uses",
                (true, false) => "stops using",
            };
            logging::info!(self.log, "graph: service relation changed";
                           "node" => node, "relation" => relation, "service" => service);
        }
        changed
    }

    /// Purges every node whose heartbeat is older than the liveness
    /// window, except the resolver itself. Returns true when anything was
    /// removed.
    pub fn sweep(&mut self, self_name: &str) -> bool {
        let expired: Vec<String> = self
            .nodes_by_name
            .values()
            .filter(|entry| {
                entry.name != self_name && entry.last_heartbeat.elapsed() > self.online_timeout
            })
            .map(|entry| entry.name.clone())
            .collect();

        for name in &expired {
            logging::info!(self.log, "node disconnected due to timeout"; "node" => %name);
            self.purge_node(name);
        }
        !expired.is_empty()
    }

    /// Removes the node entry, its services, and every graph edge that
    /// references it.
    pub fn purge_node(&mut self, node_name: &str) {
        if let Some(entry) = self.nodes_by_name.remove(node_name) {
            for service in &entry.services {
                self.services_by_name.remove(service);
            }
            self.names_by_key.remove(&entry.node_id.key());
        }

        self.node_publishes_topic
            .retain(|(node, _)| node != node_name);
        self.node_subscribes_topic
            .retain(|(node, _)| node != node_name);
        self.node_offers_service
            .retain(|(node, _)| node != node_name);
        self.node_uses_service.retain(|(node, _)| node != node_name);
    }

    /// Snapshot of nodes and edges. Node order is sorted for stable
    /// output; edges keep insertion order.
    pub fn graph(&self) -> Graph {
        let mut nodes: Vec<String> = self.nodes_by_name.keys().cloned().collect();
        nodes.sort();

        let link = |(node, other): &Edge, reversed: bool| GraphLink {
            node_name: node.clone(),
            other_name: other.clone(),
            reversed,
        };

        let mut node_topic: Vec<GraphLink> = self
            .node_publishes_topic
            .iter()
            .map(|edge| link(edge, false))
            .collect();
        node_topic.extend(self.node_subscribes_topic.iter().map(|edge| link(edge, true)));

        let mut node_service: Vec<GraphLink> = self
            .node_offers_service
            .iter()
            .map(|edge| link(edge, false))
            .collect();
        node_service.extend(self.node_uses_service.iter().map(|edge| link(edge, true)));

        Graph {
            nodes,
            node_topic,
            node_service,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quark::logging;

    fn registry() -> Registry {
        Registry::new(DEFAULT_ONLINE_TIMEOUT, logging::null())
    }

    fn node_id(n: u32) -> NodeId {
        NodeId {
            host_id: "box1".to_string(),
            process_id: n,
            thread_id: "main".to_string(),
        }
    }

    fn announce(reg: &mut Registry, id: u32, name: &str) -> String {
        match reg.handle_announce_node(&node_id(id), name, "tcp://x:1", "tcp://x:2") {
            (
                Response::AnnounceNode {
                    ok: true, node_name, ..
                },
                _,
            ) => node_name,
            other => panic!("announce failed: {:?}", other.0),
        }
    }

    #[test]
    fn test_unique_name_assignment() {
        let mut reg = registry();
        assert_eq!(announce(&mut reg, 1, "worker"), "worker");
        assert_eq!(announce(&mut reg, 2, "worker"), "worker-1");
        assert_eq!(announce(&mut reg, 3, "worker"), "worker-2");
    }

    #[test]
    fn test_reserved_name() {
        let reg = registry();
        assert_eq!(reg.make_unique_node_name("node"), "node-1");
        assert_eq!(reg.make_unique_node_name(""), "node-1");
    }

    #[test]
    fn test_double_announce_same_identity() {
        let mut reg = registry();
        announce(&mut reg, 1, "worker");
        let (response, _) =
            reg.handle_announce_node(&node_id(1), "other", "tcp://x:1", "tcp://x:2");
        assert!(matches!(response, Response::AnnounceNode { ok: false, .. }));
    }

    #[test]
    fn test_service_announce_and_resolve() {
        let mut reg = registry();
        announce(&mut reg, 1, "worker");

        let (response, _) = reg.handle_announce_service("worker", "sum", "tcp://box1:4000");
        assert!(matches!(response, Response::AnnounceService { ok: true }));

        // Duplicate service name from a live node is refused.
        announce(&mut reg, 2, "other");
        let (response, _) = reg.handle_announce_service("other", "sum", "tcp://box1:4001");
        assert!(matches!(response, Response::AnnounceService { ok: false }));

        match reg.handle_resolve_service("sum") {
            Response::ResolveService { ok, sock_addr } => {
                assert!(ok);
                assert_eq!(sock_addr, "tcp://box1:4000");
            }
            other => panic!("unexpected {:?}", other),
        }

        match reg.handle_resolve_service("missing") {
            Response::ResolveService { ok, .. } => assert!(!ok),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_service_reclaim_from_stale_node() {
        let mut reg = registry();
        reg.set_online_timeout(Duration::from_millis(0));
        announce(&mut reg, 1, "stale");
        reg.handle_announce_service("stale", "sum", "tcp://box1:4000");

        announce(&mut reg, 2, "fresh");
        std::thread::sleep(Duration::from_millis(5));
        // Keep "fresh" alive; "stale" has timed out (zero window).
        reg.handle_heartbeat(&node_id(2), "resolver", 0);

        let (response, _) = reg.handle_announce_service("fresh", "sum", "tcp://box1:5000");
        assert!(matches!(response, Response::AnnounceService { ok: true }));
        assert!(!reg.node_name_exists("stale"));

        match reg.handle_resolve_service("sum") {
            Response::ResolveService { ok, sock_addr } => {
                assert!(ok);
                assert_eq!(sock_addr, "tcp://box1:5000");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sweep_purges_silent_nodes() {
        let mut reg = registry();
        reg.set_online_timeout(Duration::from_millis(10));
        announce(&mut reg, 1, "quiet");
        reg.handle_announce_service("quiet", "svc", "tcp://box1:4000");
        reg.set_topic_edge("quiet", "telemetry", false, true);

        std::thread::sleep(Duration::from_millis(25));
        let changed = reg.sweep("resolver");
        assert!(changed);

        let graph = reg.graph();
        assert!(graph.nodes.is_empty());
        assert!(graph.node_topic.is_empty());
        assert!(matches!(
            reg.handle_resolve_service("svc"),
            Response::ResolveService { ok: false, .. }
        ));

        // Identity key is free again.
        assert_eq!(announce(&mut reg, 1, "quiet"), "quiet");
    }

    #[test]
    fn test_sweep_spares_the_resolver() {
        let mut reg = registry();
        reg.set_online_timeout(Duration::from_millis(0));
        announce(&mut reg, 1, "resolver");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!reg.sweep("resolver"));
        assert!(reg.node_name_exists("resolver"));
    }

    #[test]
    fn test_heartbeat_updates_last_seen() {
        let mut reg = registry();
        reg.set_online_timeout(Duration::from_millis(40));
        announce(&mut reg, 1, "worker");

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(20));
            let (response, _) = reg.handle_heartbeat(&node_id(1), "resolver", 123);
            assert!(matches!(response, Response::Heartbeat { ok: true, .. }));
            assert!(!reg.sweep("resolver"));
        }

        let (response, _) = reg.handle_heartbeat(&node_id(9), "resolver", 123);
        assert!(matches!(response, Response::Heartbeat { ok: false, .. }));
    }

    #[test]
    fn test_sentinel_heartbeat_triggers_sweep() {
        let mut reg = registry();
        reg.set_online_timeout(Duration::from_millis(5));
        announce(&mut reg, 1, "quiet");
        std::thread::sleep(Duration::from_millis(15));

        let (response, changed) = reg.handle_heartbeat(&NodeId::sentinel(), "resolver", 77);
        assert!(matches!(response, Response::Heartbeat { ok: true, time_usec: 77 }));
        assert!(changed);
        assert!(!reg.node_name_exists("quiet"));
    }

    #[test]
    fn test_edges_are_deduplicated() {
        let mut reg = registry();
        assert!(reg.set_topic_edge("a", "t", false, true));
        assert!(!reg.set_topic_edge("a", "t", false, true));
        assert!(reg.set_topic_edge("a", "t", true, true));
        assert!(reg.set_topic_edge("a", "t", false, false));
        assert!(!reg.set_topic_edge("a", "t", false, false));

        let graph = reg.graph();
        assert_eq!(graph.node_topic.len(), 1);
        assert!(graph.node_topic[0].reversed);
    }

    #[test]
    fn test_graph_snapshot() {
        let mut reg = registry();
        announce(&mut reg, 1, "pub1");
        announce(&mut reg, 2, "sub1");
        reg.set_topic_edge("pub1", "T", false, true);
        reg.set_topic_edge("sub1", "T", true, true);
        reg.set_service_edge("pub1", "S", false, true);
        reg.set_service_edge("sub1", "S", true, true);

        let graph = reg.graph();
        assert_eq!(graph.nodes, vec!["pub1".to_string(), "sub1".to_string()]);
        assert_eq!(graph.node_topic.len(), 2);
        assert_eq!(graph.node_service.len(), 2);
        assert!(graph.node_topic.contains(&GraphLink {
            node_name: "pub1".to_string(),
            other_name: "T".to_string(),
            reversed: false,
        }));
        assert!(graph.node_service.contains(&GraphLink {
            node_name: "sub1".to_string(),
            other_name: "S".to_string(),
            reversed: true,
        }));
    }
}
