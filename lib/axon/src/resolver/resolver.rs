//! The resolver service. It is itself a node with well-known endpoints: on
//! top of the node lifecycle it runs the `resolv` request/reply endpoint
//! (TCP plus an in-process shortcut for its own fibres), the XSUB/XPUB
//! broker proxy, the liveness sweeper, and the graph publisher.

use crate::error::{Error, Result};
use crate::global;
use crate::message::{Message, NodeId, Request, Response};
use crate::net::stream;
use crate::node::{Node, NodeState};
use crate::publisher::Publisher;
use crate::resolver::broker::Broker;
use crate::resolver::client::Client;
use crate::resolver::registry::{Registry, DEFAULT_ONLINE_TIMEOUT};
use crate::socket::{Role, Socket};
use quark::logging;
use quark::logging::Logger;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_PORT: u16 = 22000;

const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
const SWEEPER_READ_TIMEOUT: Duration = Duration::from_secs(2);
const DRAIN_POLL: Duration = Duration::from_millis(50);
const STOP_POLL_SLICE: Duration = Duration::from_millis(50);

pub struct Resolver {
    node: Node,
    registry: Registry,
    srv: Socket,
    graph_pub: Publisher,
    graph_pub_ready: bool,

    port: u16,
    resolv_addr: String,
    inproc_addr: String,
    xsub_proxy_addr: String,
    xpub_proxy_addr: String,

    fibre_stop: Arc<AtomicBool>,
    proxy: Option<thread::JoinHandle<()>>,
    sweeper: Option<thread::JoinHandle<()>>,

    log: Logger,
}

impl Resolver {
    /// A resolver on the configured port (`B0_RESOLVER_PORT`, default
    /// 22000). Port 0 selects a free port at init.
    pub fn new() -> Resolver {
        Resolver::with_logger(logging::init(global::console_level()))
    }

    pub fn with_logger(log: Logger) -> Resolver {
        let node = Node::with_logger("resolver", log.clone());
        let log = log.new(logging::o!("service" => "resolv"));

        Resolver {
            registry: Registry::new(DEFAULT_ONLINE_TIMEOUT, log.clone()),
            srv: Socket::new(Role::Rep, "resolv", log.clone()),
            graph_pub: Publisher::new("graph", false, log.clone()),
            graph_pub_ready: false,
            port: quark::env::get_int("B0_RESOLVER_PORT", i64::from(DEFAULT_PORT)) as u16,
            resolv_addr: String::new(),
            inproc_addr: String::new(),
            xsub_proxy_addr: String::new(),
            xpub_proxy_addr: String::new(),
            fibre_stop: Arc::new(AtomicBool::new(false)),
            proxy: None,
            sweeper: None,
            node,
            log,
        }
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Window after which a silent node is considered dead.
    pub fn set_online_timeout(&mut self, timeout: Duration) {
        self.registry.set_online_timeout(timeout);
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// The `resolv` endpoint clients should connect to, valid after init.
    pub fn address(&self) -> &str {
        &self.resolv_addr
    }

    pub fn xsub_proxy_addr(&self) -> &str {
        &self.xsub_proxy_addr
    }

    pub fn xpub_proxy_addr(&self) -> &str {
        &self.xpub_proxy_addr
    }

    pub fn shutdown_requested(&self) -> bool {
        self.node.shutdown_requested()
    }

    /// Brings up the whole coordination plane: the `resolv` endpoint on TCP
    /// and inproc, the broker proxy, the self-announce, the heartbeat and
    /// sweeper fibres, and the graph publisher.
    pub fn init(&mut self) -> Result<()> {
        if self.node.state() != NodeState::Created {
            return Err(Error::InvalidStateTransition {
                op: "init",
                state: self.node.state().as_str(),
            });
        }

        let host = self.node.host_id().to_string();

        if self.port == 0 {
            self.port = stream::free_tcp_port().map_err(Error::write)?;
        }
        self.resolv_addr = stream::tcp_addr(&host, self.port);
        let inproc_name = format!("resolv/{}", self.port);
        self.inproc_addr = format!("inproc://{}", inproc_name);

        self.srv.set_node_name("resolver");
        self.srv.bind(&format!("tcp://*:{}", self.port))?;
        self.srv.bind(&self.inproc_addr)?;

        // Broker proxy fibre: bound here so the addresses exist before any
        // announce response advertises them.
        let broker = Broker::bind(&host, self.fibre_stop.clone(), self.log.clone())?;
        self.xsub_proxy_addr = broker.xsub_addr().to_string();
        self.xpub_proxy_addr = broker.xpub_addr().to_string();
        logging::trace!(self.log, "proxy endpoints";
                        "xsub" => %self.xsub_proxy_addr, "xpub" => %self.xpub_proxy_addr);
        self.proxy = Some(thread::spawn(move || broker.run()));

        // Announce ourselves by calling the handler directly; going through
        // the service would deadlock before the spin loop runs.
        let (response, _) = self.registry.handle_announce_node(
            self.node.node_id(),
            self.node.name(),
            &self.xsub_proxy_addr,
            &self.xpub_proxy_addr,
        );
        match response {
            Response::AnnounceNode {
                ok: true,
                node_name,
                xsub_sock_addr,
                xpub_sock_addr,
            } => {
                self.node
                    .set_assigned(&node_name, &xsub_sock_addr, &xpub_sock_addr);
            }
            _ => return Err(Error::RequestDenied("announce_node".to_string())),
        }

        // The node's own fibres reach `resolv` through the in-process
        // shortcut.
        self.node.set_resolver_address(&self.inproc_addr);
        self.node.start_heartbeat();
        self.node.init_children()?;

        self.graph_pub.set_remote_address(&self.xsub_proxy_addr);
        self.graph_pub.sock_mut().set_node_name(self.node.name());
        self.graph_pub.sock_mut().connect()?;
        self.graph_pub_ready = true;

        // The graph publisher does not notify the graph itself; record the
        // edge directly.
        let node_name = self.node.name().to_string();
        self.handle_local(Request::NodeTopic {
            node_name,
            topic_name: "graph".to_string(),
            reverse: false,
            active: true,
        });

        self.start_sweeper();

        self.node.mark_ready();
        logging::info!(self.log, "ready"; "addr" => %self.resolv_addr);
        Ok(())
    }

    /// Sweeper fibre: a sentinel heartbeat to our own endpoint every 500 ms
    /// makes the request fibre purge timed-out nodes.
    fn start_sweeper(&mut self) {
        let stop = self.fibre_stop.clone();
        let addr = self.inproc_addr.clone();
        let log = self.log.clone();

        self.sweeper = Some(thread::spawn(move || {
            let mut client = Client::with_address(&addr, log.clone());
            client.set_read_timeout(Some(SWEEPER_READ_TIMEOUT));
            let sentinel = NodeId::sentinel();

            'sweep: while !stop.load(Ordering::SeqCst) && !global::quit_requested() {
                if let Err(err) = client.send_heartbeat(&sentinel) {
                    if !stop.load(Ordering::SeqCst) {
                        logging::debug!(log, "sweeper heartbeat failed"; "error" => %err);
                    }
                    break 'sweep;
                }

                let deadline = Instant::now() + SWEEP_INTERVAL;
                while Instant::now() < deadline {
                    if stop.load(Ordering::SeqCst) || global::quit_requested() {
                        break 'sweep;
                    }
                    thread::sleep(STOP_POLL_SLICE);
                }
            }

            client.cleanup();
        }));
    }

    /// Runs one request through the registry and republishes the graph when
    /// the edge or node set changed.
    fn handle_local(&mut self, request: Request) -> Response {
        let (response, graph_changed) = self.registry.handle(
            &request,
            &self.xsub_proxy_addr,
            &self.xpub_proxy_addr,
            &self.node.name().to_string(),
            quark::time::timestamp_usec(),
        );
        if graph_changed {
            self.publish_graph();
        }
        response
    }

    /// Publishes the full graph snapshot on the `graph` topic. Subscribers
    /// always receive complete snapshots, never deltas.
    fn publish_graph(&mut self) {
        if !self.graph_pub_ready {
            return;
        }
        let graph = self.registry.graph();
        if let Err(err) = self.graph_pub.publish_msg(&graph) {
            logging::warn!(self.log, "graph publish failed"; "error" => %err);
        }
    }

    /// Snapshot of the current graph, served locally.
    pub fn graph(&self) -> crate::message::Graph {
        self.registry.graph()
    }

    /// Serves the request mailbox once, waiting briefly for traffic.
    pub fn spin_once(&mut self) -> Result<()> {
        self.node.spin_once()?;

        if self.srv.poll(Some(DRAIN_POLL))? {
            loop {
                self.serve_one()?;
                if !self.srv.poll(Some(Duration::from_millis(0)))? {
                    break;
                }
            }
        }
        Ok(())
    }

    fn serve_one(&mut self) -> Result<()> {
        let request = match self.srv.read_raw() {
            Ok((payload, content_type)) => {
                if content_type != Request::TYPE {
                    logging::warn!(self.log, "request with unexpected content type";
                                   "content_type" => %content_type);
                    None
                } else {
                    match Request::from_bytes(&payload) {
                        Ok(request) => Some(request),
                        Err(err) => {
                            logging::warn!(self.log, "unparseable request"; "error" => %err);
                            None
                        }
                    }
                }
            }
            Err(err) => {
                logging::warn!(self.log, "failed to read request"; "error" => %err);
                None
            }
        };

        let written = match request {
            Some(request) => {
                let response = self.handle_local(request);
                self.srv.write_msg(&response)
            }
            // Keep the requester from waiting on a broken exchange.
            None => self.srv.write_raw(&[], ""),
        };

        // A requester that vanished mid-exchange must not take the
        // resolver down with it.
        if let Err(err) = written {
            logging::warn!(self.log, "failed to write reply"; "error" => %err);
        }
        Ok(())
    }

    /// Serves until shutdown is requested, then cleans up.
    pub fn spin(&mut self) -> Result<()> {
        if self.node.state() != NodeState::Ready {
            return Err(Error::InvalidStateTransition {
                op: "spin",
                state: self.node.state().as_str(),
            });
        }

        while !self.node.shutdown_requested() {
            self.spin_once()?;
        }

        logging::info!(self.log, "resolver shutdown requested");
        self.cleanup()
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.node.shutdown()
    }

    /// Stops the fibres, closes the endpoints, and terminates the node.
    /// Idempotent after the first completed run.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.node.state() == NodeState::Terminated {
            return Ok(());
        }
        if self.node.state() != NodeState::Ready {
            return Err(Error::InvalidStateTransition {
                op: "cleanup",
                state: self.node.state().as_str(),
            });
        }

        self.fibre_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.join();
        }

        self.node.stop_heartbeat();
        self.node.cleanup_children();

        self.graph_pub_ready = false;
        self.graph_pub.sock_mut().disconnect();

        if let Some(handle) = self.proxy.take() {
            let _ = handle.join();
        }

        self.srv.unbind();
        self.node.resolv_mut().cleanup();
        self.node.set_terminated();

        logging::info!(self.log, "resolver terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Graph;
    use crate::node::Node;
    use std::sync::mpsc;
    use std::sync::Mutex;

    struct ResolverFixture {
        addr: String,
        stop: Arc<AtomicBool>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl ResolverFixture {
        fn start(online_timeout: Option<Duration>) -> ResolverFixture {
            let (tx, rx) = mpsc::channel();
            let stop = Arc::new(AtomicBool::new(false));
            let thread_stop = stop.clone();

            let handle = thread::spawn(move || {
                let mut resolver = Resolver::with_logger(logging::null());
                resolver.set_port(0);
                if let Some(timeout) = online_timeout {
                    resolver.set_online_timeout(timeout);
                }
                resolver.init().expect("resolver init failed");
                tx.send(resolver.address().to_string()).unwrap();

                while !thread_stop.load(Ordering::SeqCst) {
                    resolver.spin_once().expect("resolver spin failed");
                }
                resolver.cleanup().expect("resolver cleanup failed");
            });

            let addr = rx
                .recv_timeout(Duration::from_secs(10))
                .expect("resolver did not come up");
            ResolverFixture {
                addr,
                stop,
                handle: Some(handle),
            }
        }

        fn client(&self) -> Client {
            Client::with_address(&self.addr, logging::null())
        }

        fn node(&self, name: &str) -> Node {
            let mut node = Node::with_logger(name, logging::null());
            node.set_resolver_address(&self.addr);
            node.set_announce_timeout(Some(Duration::from_secs(10)));
            node
        }
    }

    impl Drop for ResolverFixture {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn node_id(n: u32) -> NodeId {
        NodeId {
            host_id: "testbox".to_string(),
            process_id: n,
            thread_id: "main".to_string(),
        }
    }

    #[test]
    fn test_name_collision_over_the_wire() {
        let fixture = ResolverFixture::start(None);

        let mut first = fixture.client();
        let (name, xsub, xpub) = first.announce_node(&node_id(1), "worker").unwrap();
        assert_eq!(name, "worker");
        assert!(xsub.starts_with("tcp://"));
        assert!(xpub.starts_with("tcp://"));

        let mut second = fixture.client();
        let (name, _, _) = second.announce_node(&node_id(2), "worker").unwrap();
        assert_eq!(name, "worker-1");
    }

    // A node's machine key includes its creation thread, and the resolver
    // rejects duplicate keys; every node in these tests therefore lives on
    // its own thread.
    #[test]
    fn test_pub_sub_roundtrip() {
        let fixture = ResolverFixture::start(None);

        let received: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        let stop = Arc::new(AtomicBool::new(false));
        let pub_stop = stop.clone();
        let addr = fixture.addr.clone();

        let publisher = thread::spawn(move || {
            let mut pub_node = Node::with_logger("echo-pub", logging::null());
            pub_node.set_resolver_address(&addr);
            let chatter = pub_node.advertise("chatter").unwrap();
            pub_node.init().unwrap();

            // Publish until told to stop; the subscription takes a moment
            // to propagate through the broker.
            while !pub_stop.load(Ordering::SeqCst) {
                pub_node.publish(chatter, b"hello", "text").unwrap();
                thread::sleep(Duration::from_millis(10));
            }
            pub_node.cleanup().unwrap();
        });

        let mut sub_node = fixture.node("echo-sub");
        sub_node
            .subscribe("chatter", move |topic, payload, _| {
                sink.lock()
                    .unwrap()
                    .push((topic.to_string(), String::from_utf8_lossy(payload).into_owned()));
            })
            .unwrap();
        sub_node.init().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut delivered = false;
        while Instant::now() < deadline {
            sub_node.spin_once().unwrap();
            if !received.lock().unwrap().is_empty() {
                delivered = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        stop.store(true, Ordering::SeqCst);
        publisher.join().unwrap();

        assert!(delivered, "no message made it through the broker");
        assert_eq!(
            received.lock().unwrap()[0],
            ("chatter".to_string(), "hello".to_string())
        );

        sub_node.cleanup().unwrap();
    }

    #[test]
    fn test_service_call() {
        let fixture = ResolverFixture::start(None);

        let stop = Arc::new(AtomicBool::new(false));
        let server_stop = stop.clone();
        let addr = fixture.addr.clone();
        let (ready_tx, ready_rx) = mpsc::channel();

        let server = thread::spawn(move || {
            let mut node = Node::with_logger("summer", logging::null());
            node.set_resolver_address(&addr);
            node.advertise_service("sum", |request, _| {
                let value: serde_json::Value = serde_json::from_slice(request).unwrap();
                let sum = value["a"].as_i64().unwrap() + value["b"].as_i64().unwrap();
                (
                    serde_json::to_vec(&serde_json::json!({ "c": sum })).unwrap(),
                    "application/json".to_string(),
                )
            })
            .unwrap();
            node.init().unwrap();
            ready_tx.send(()).unwrap();

            while !server_stop.load(Ordering::SeqCst) {
                node.spin_once().unwrap();
                thread::sleep(Duration::from_millis(5));
            }
            node.cleanup().unwrap();
        });

        ready_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        let mut client_node = fixture.node("adder");
        let sum = client_node.service_client("sum").unwrap();
        client_node.init().unwrap();
        client_node
            .service_client_mut(sum)
            .set_read_timeout(Some(Duration::from_secs(5)));

        let (reply, content_type) = client_node
            .call(sum, br#"{"a":100,"b":35}"#, "application/json")
            .unwrap();
        assert_eq!(content_type, "application/json");
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value["c"], 135);

        client_node.cleanup().unwrap();
        stop.store(true, Ordering::SeqCst);
        server.join().unwrap();
    }

    #[test]
    fn test_unknown_service_resolution_fails() {
        let fixture = ResolverFixture::start(None);

        let mut client = fixture.client();
        let err = client.resolve_service("nowhere").unwrap_err();
        assert_eq!(err, Error::NameResolution("nowhere".to_string()));
    }

    #[test]
    fn test_heartbeat_timeout_purges_node() {
        let fixture = ResolverFixture::start(Some(Duration::from_secs(1)));

        // Announce without ever heartbeating.
        let mut client = fixture.client();
        let (name, _, _) = client.announce_node(&node_id(7), "mortal").unwrap();
        assert_eq!(name, "mortal");

        let graph = client.get_graph().unwrap();
        assert!(graph.nodes.contains(&"mortal".to_string()));

        // The sweeper runs every 500 ms; after the 1 s window the node is
        // purged.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut purged = false;
        while Instant::now() < deadline {
            thread::sleep(Duration::from_millis(250));
            let graph = client.get_graph().unwrap();
            if !graph.nodes.contains(&"mortal".to_string()) {
                purged = true;
                break;
            }
        }
        assert!(purged, "silent node was never purged");
    }

    fn saw_talker_link(node: &mut Node, id: crate::node::SubscriberId) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let result = node
                .subscriber_mut(id)
                .read_timeout(Duration::from_millis(200));
            if let Ok((_, payload, content_type)) = result {
                if content_type != Graph::TYPE {
                    continue;
                }
                let graph = Graph::from_bytes(&payload).unwrap();
                let hit = graph.node_topic.iter().any(|link| {
                    link.node_name == "talker" && link.other_name == "T" && !link.reversed
                });
                if hit {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    fn test_graph_event_reaches_all_subscribers() {
        let fixture = ResolverFixture::start(None);

        let mut watcher_a = fixture.node("watcher-a");
        let graph_a = watcher_a.subscribe_manual("graph").unwrap();
        watcher_a.init().unwrap();

        // Second watcher on its own thread (one node per thread).
        let addr = fixture.addr.clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let watcher_b = thread::spawn(move || {
            let mut node = Node::with_logger("watcher-b", logging::null());
            node.set_resolver_address(&addr);
            let graph_b = node.subscribe_manual("graph").unwrap();
            node.init().unwrap();
            ready_tx.send(()).unwrap();

            let hit = saw_talker_link(&mut node, graph_b);
            node.cleanup().unwrap();
            hit
        });
        ready_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        // A publisher attaching on topic T mutates the graph, which gets
        // republished to every `graph` subscriber.
        let stop = Arc::new(AtomicBool::new(false));
        let talker_stop = stop.clone();
        let addr = fixture.addr.clone();
        let talker = thread::spawn(move || {
            let mut node = Node::with_logger("talker", logging::null());
            node.set_resolver_address(&addr);
            node.advertise("T").unwrap();
            node.init().unwrap();
            while !talker_stop.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(20));
            }
            node.cleanup().unwrap();
        });

        assert!(
            saw_talker_link(&mut watcher_a, graph_a),
            "watcher-a missed the graph event"
        );
        assert!(watcher_b.join().unwrap(), "watcher-b missed the graph event");

        stop.store(true, Ordering::SeqCst);
        talker.join().unwrap();
        watcher_a.cleanup().unwrap();
    }

    #[test]
    fn test_shutdown_removes_node_from_graph() {
        let fixture = ResolverFixture::start(None);

        let mut node = fixture.node("transient");
        node.advertise("blip").unwrap();
        node.init().unwrap();

        let mut client = fixture.client();
        let graph = client.get_graph().unwrap();
        assert!(graph.nodes.contains(&"transient".to_string()));

        node.cleanup().unwrap();

        let graph = client.get_graph().unwrap();
        assert!(!graph.nodes.contains(&"transient".to_string()));
        assert!(graph
            .node_topic
            .iter()
            .all(|link| link.node_name != "transient"));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let fixture = ResolverFixture::start(None);

        let mut node = fixture.node("fleeting");
        node.init().unwrap();
        node.cleanup().unwrap();
        node.cleanup().unwrap();
        assert_eq!(node.state(), NodeState::Terminated);
    }
}
