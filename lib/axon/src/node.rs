//! The node runtime: lifecycle state machine, child socket registries, the
//! spin loop, and the heartbeat fibre feeding the time-sync state.

use crate::error::{Error, Result};
use crate::global;
use crate::message::{LogEntry, Message, NodeId};
use crate::publisher::Publisher;
use crate::resolver;
use crate::service_client::ServiceClient;
use crate::service_server::ServiceServer;
use crate::subscriber::Subscriber;
use quark::logging;
use quark::logging::{Level, Logger};
use quark::time::TimeSync;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub type PublisherId = usize;
pub type SubscriberId = usize;
pub type ServiceClientId = usize;
pub type ServiceServerId = usize;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_READ_TIMEOUT: Duration = Duration::from_secs(3);
const STOP_POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Ready,
    Terminated,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Created => "Created",
            NodeState::Ready => "Ready",
            NodeState::Terminated => "Terminated",
        }
    }
}

pub struct Node {
    name: String,
    state: NodeState,
    node_id: NodeId,

    resolv: resolver::Client,
    xpub_sock_addr: String,
    xsub_sock_addr: String,

    publishers: Vec<Publisher>,
    service_clients: Vec<ServiceClient>,
    service_servers: Vec<ServiceServer>,
    subscribers: Vec<Subscriber>,

    timesync: Arc<TimeSync>,
    shutdown_flag: Arc<AtomicBool>,
    heartbeat_stop: Arc<AtomicBool>,
    heartbeat: Option<thread::JoinHandle<()>>,

    owner_thread: thread::ThreadId,
    log: Logger,
    log_pub: Option<Publisher>,
}

impl Node {
    /// A node with the requested name (remapped per the global options) and
    /// a console logger at the configured level. The SIGINT handler is
    /// installed on first use.
    pub fn new(name: &str) -> Node {
        Node::with_logger(name, logging::init(global::console_level()))
    }

    pub fn with_logger(name: &str, log: Logger) -> Node {
        global::setup_quit_handler();

        let host_id = hostname_id();
        let name = global::remap_node_name(name, &host_id);
        let node_id = NodeId {
            host_id,
            process_id: std::process::id(),
            thread_id: format!("{:?}", thread::current().id()),
        };

        let log = log.new(logging::o!("node" => name.clone()));
        let resolv = resolver::Client::new(log.clone());
        let log_pub = Publisher::new("log", false, log.clone());

        Node {
            name,
            state: NodeState::Created,
            node_id,
            resolv,
            xpub_sock_addr: String::new(),
            xsub_sock_addr: String::new(),
            publishers: Vec::new(),
            service_clients: Vec::new(),
            service_servers: Vec::new(),
            subscribers: Vec::new(),
            timesync: Arc::new(TimeSync::new(TimeSync::DEFAULT_MAX_SLOPE)),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            heartbeat_stop: Arc::new(AtomicBool::new(false)),
            heartbeat: None,
            owner_thread: thread::current().id(),
            log,
            log_pub: Some(log_pub),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn host_id(&self) -> &str {
        &self.node_id.host_id
    }

    pub fn xpub_sock_addr(&self) -> &str {
        &self.xpub_sock_addr
    }

    pub fn xsub_sock_addr(&self) -> &str {
        &self.xsub_sock_addr
    }

    pub fn logger(&self) -> &Logger {
        &self.log
    }

    /// Overrides the resolver endpoint taken from the environment.
    pub fn set_resolver_address(&mut self, addr: &str) {
        self.resolv.set_resolver_address(addr);
    }

    /// Deadline for the announce exchange during init.
    pub fn set_announce_timeout(&mut self, timeout: Option<Duration>) {
        self.resolv.set_announce_timeout(timeout);
    }

    fn check_state(&self, op: &'static str, expected: NodeState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidStateTransition {
                op,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    /// Registers a publisher on `topic`. Only allowed before init.
    pub fn advertise(&mut self, topic: &str) -> Result<PublisherId> {
        self.check_state("advertise", NodeState::Created)?;
        let topic = global::remap_topic_name(topic, self.host_id(), &self.name);
        self.publishers
            .push(Publisher::new(&topic, true, self.log.clone()));
        Ok(self.publishers.len() - 1)
    }

    /// Registers a callback-mode subscriber on `topic`. The callback runs on
    /// this node's fibre during spin and must not block indefinitely.
    pub fn subscribe<F>(&mut self, topic: &str, callback: F) -> Result<SubscriberId>
    where
        F: FnMut(&str, &[u8], &str) + Send + 'static,
    {
        self.add_subscriber(topic, Some(Box::new(callback)))
    }

    /// Registers a manual-mode subscriber; the caller polls and reads
    /// through `subscriber_mut`.
    pub fn subscribe_manual(&mut self, topic: &str) -> Result<SubscriberId> {
        self.add_subscriber(topic, None)
    }

    fn add_subscriber(
        &mut self,
        topic: &str,
        callback: Option<crate::subscriber::Callback>,
    ) -> Result<SubscriberId> {
        self.check_state("subscribe", NodeState::Created)?;
        let topic = global::remap_topic_name(topic, self.host_id(), &self.name);
        self.subscribers
            .push(Subscriber::new(&topic, callback, true, self.log.clone()));
        Ok(self.subscribers.len() - 1)
    }

    /// Registers a client for `service`.
    pub fn service_client(&mut self, service: &str) -> Result<ServiceClientId> {
        self.check_state("service_client", NodeState::Created)?;
        let service = global::remap_service_name(service, self.host_id(), &self.name);
        self.service_clients
            .push(ServiceClient::new(&service, true, self.log.clone()));
        Ok(self.service_clients.len() - 1)
    }

    /// Registers a callback-mode server for `service`. The handler runs on
    /// this node's fibre during spin; requests are strictly serialized.
    pub fn advertise_service<F>(&mut self, service: &str, callback: F) -> Result<ServiceServerId>
    where
        F: FnMut(&[u8], &str) -> (Vec<u8>, String) + Send + 'static,
    {
        self.add_service_server(service, Some(Box::new(callback)))
    }

    /// Registers a manual-mode server; the caller polls, reads and writes
    /// through `service_server_mut`.
    pub fn advertise_service_manual(&mut self, service: &str) -> Result<ServiceServerId> {
        self.add_service_server(service, None)
    }

    fn add_service_server(
        &mut self,
        service: &str,
        callback: Option<crate::service_server::Callback>,
    ) -> Result<ServiceServerId> {
        self.check_state("advertise_service", NodeState::Created)?;
        let service = global::remap_service_name(service, self.host_id(), &self.name);
        self.service_servers
            .push(ServiceServer::new(&service, callback, true, self.log.clone()));
        Ok(self.service_servers.len() - 1)
    }

    pub fn publisher_mut(&mut self, id: PublisherId) -> &mut Publisher {
        &mut self.publishers[id]
    }

    pub fn subscriber_mut(&mut self, id: SubscriberId) -> &mut Subscriber {
        &mut self.subscribers[id]
    }

    pub fn service_client_mut(&mut self, id: ServiceClientId) -> &mut ServiceClient {
        &mut self.service_clients[id]
    }

    pub fn service_server_mut(&mut self, id: ServiceServerId) -> &mut ServiceServer {
        &mut self.service_servers[id]
    }

    /// Publishes on a previously advertised topic.
    pub fn publish(&mut self, id: PublisherId, payload: &[u8], content_type: &str) -> Result<()> {
        self.publishers[id].publish(payload, content_type)
    }

    pub fn publish_msg<M: Message>(&mut self, id: PublisherId, msg: &M) -> Result<()> {
        self.publishers[id].publish_msg(msg)
    }

    /// Synchronous service call through a previously created client.
    pub fn call(
        &mut self,
        id: ServiceClientId,
        request: &[u8],
        content_type: &str,
    ) -> Result<(Vec<u8>, String)> {
        self.service_clients[id].call(request, content_type)
    }

    pub fn call_msg<Rq: Message, Rsp: Message>(
        &mut self,
        id: ServiceClientId,
        request: &Rq,
    ) -> Result<Rsp> {
        self.service_clients[id].call_msg(request)
    }

    /// Initialization contract, in order: announce to the resolver, start
    /// the heartbeat fibre, then initialize the children.
    pub fn init(&mut self) -> Result<()> {
        self.check_state("init", NodeState::Created)?;
        logging::debug!(self.log, "initialization");

        self.announce()?;
        self.start_heartbeat();
        self.init_children()?;

        self.state = NodeState::Ready;
        logging::debug!(self.log, "initialization complete");
        Ok(())
    }

    pub(crate) fn announce(&mut self) -> Result<()> {
        let (assigned, xsub, xpub) = self.resolv.announce_node(&self.node_id, &self.name)?;
        if assigned != self.name {
            logging::warn!(self.log, "resolver changed this node name";
                           "requested" => %self.name, "assigned" => %assigned);
        }
        self.set_assigned(&assigned, &xsub, &xpub);
        Ok(())
    }

    /// Adopts the name and broker endpoints granted by the resolver and
    /// connects the log-topic publisher.
    pub(crate) fn set_assigned(&mut self, name: &str, xsub_addr: &str, xpub_addr: &str) {
        self.name = name.to_string();
        self.xsub_sock_addr = xsub_addr.to_string();
        self.xpub_sock_addr = xpub_addr.to_string();

        let log = self.log.clone();
        let mut keep = true;
        if let Some(log_pub) = &mut self.log_pub {
            log_pub.set_remote_address(xsub_addr);
            match log_pub.sock_mut().connect() {
                Ok(()) => log_pub.sock_mut().set_node_name(name),
                Err(err) => {
                    logging::warn!(log, "log topic unavailable"; "error" => %err);
                    keep = false;
                }
            }
        }
        if !keep {
            self.log_pub = None;
        }
    }

    pub(crate) fn init_children(&mut self) -> Result<()> {
        logging::debug!(self.log, "initializing publishers");
        let name = self.name.clone();
        let xsub = self.xsub_sock_addr.clone();
        let xpub = self.xpub_sock_addr.clone();
        let host = self.node_id.host_id.clone();

        for publisher in &mut self.publishers {
            publisher.init(&mut self.resolv, &name, &xsub)?;
        }
        logging::debug!(self.log, "initializing service clients");
        for client in &mut self.service_clients {
            client.init(&mut self.resolv, &name)?;
        }
        logging::debug!(self.log, "initializing service servers");
        for server in &mut self.service_servers {
            server.init(&mut self.resolv, &name, &host)?;
        }
        logging::debug!(self.log, "initializing subscribers");
        for subscriber in &mut self.subscribers {
            subscriber.init(&mut self.resolv, &name, &xpub)?;
        }
        Ok(())
    }

    /// Starts the heartbeat fibre. It owns its own resolver client, sends
    /// one beat per second, and feeds the reply clock (corrected by half
    /// the round trip) into the time-sync state. It stops on shutdown or
    /// when the resolver refuses the beat.
    pub(crate) fn start_heartbeat(&mut self) {
        logging::trace!(self.log, "starting heartbeat thread");

        let timesync = self.timesync.clone();
        let shutdown = self.shutdown_flag.clone();
        let stop = self.heartbeat_stop.clone();
        let node_id = self.node_id.clone();
        let addr = self.resolv.resolver_address().to_string();
        let log = self.log.clone();

        self.heartbeat = Some(thread::spawn(move || {
            let mut client = resolver::Client::with_address(&addr, log.clone());
            client.set_read_timeout(Some(HEARTBEAT_READ_TIMEOUT));

            let stopped = || {
                shutdown.load(Ordering::SeqCst)
                    || stop.load(Ordering::SeqCst)
                    || global::quit_requested()
            };

            'beat: while !stopped() {
                match client.send_heartbeat(&node_id) {
                    Ok(remote_usec) => timesync.update_time(remote_usec),
                    Err(err) => {
                        logging::debug!(log, "heartbeat failed"; "error" => %err);
                        break 'beat;
                    }
                }

                let deadline = Instant::now() + HEARTBEAT_INTERVAL;
                while Instant::now() < deadline {
                    if stopped() {
                        break 'beat;
                    }
                    thread::sleep(STOP_POLL_SLICE);
                }
            }

            client.cleanup();
            logging::info!(log, "heartbeat thread terminating");
        }));
    }

    pub(crate) fn stop_heartbeat(&mut self) {
        self.heartbeat_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.join();
        }
    }

    pub(crate) fn mark_ready(&mut self) {
        self.state = NodeState::Ready;
    }

    pub(crate) fn resolv_mut(&mut self) -> &mut resolver::Client {
        &mut self.resolv
    }

    /// Drains each subscriber's mailbox, then each service server's.
    pub fn spin_once(&mut self) -> Result<()> {
        self.check_state("spin_once", NodeState::Ready)?;

        for subscriber in &mut self.subscribers {
            subscriber.spin_once()?;
        }
        for server in &mut self.service_servers {
            server.spin_once()?;
        }
        Ok(())
    }

    /// Spins at `rate_hz` until shutdown is requested, then cleans up.
    pub fn spin(&mut self, rate_hz: f64) -> Result<()> {
        self.check_state("spin", NodeState::Ready)?;

        let pause = Duration::from_secs_f64(1.0 / rate_hz);
        while !self.shutdown_requested() {
            self.spin_once()?;
            thread::sleep(pause);
        }

        logging::info!(self.log, "node shutdown requested");
        self.cleanup()
    }

    /// Requests a cooperative stop of the spin loop.
    pub fn shutdown(&mut self) -> Result<()> {
        self.check_state("shutdown", NodeState::Ready)?;
        logging::debug!(self.log, "shutting down");
        self.shutdown_flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// True when this node or the whole process was asked to stop.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst) || global::quit_requested()
    }

    /// Cleanup contract: stop the heartbeat fibre, clean children in
    /// reverse init order, notify the resolver, close the resolver client.
    /// Calling it again after completion is a no-op.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.state == NodeState::Terminated {
            return Ok(());
        }
        self.check_state("cleanup", NodeState::Ready)?;

        self.stop_heartbeat();

        // Bound the remaining resolver exchanges so cleanup terminates even
        // when the resolver is already gone.
        self.resolv.set_read_timeout(Some(Duration::from_secs(5)));
        self.cleanup_children();

        logging::trace!(self.log, "notifying node shutdown to resolver");
        let name = self.name.clone();
        if let Err(err) = self.resolv.notify_shutdown(&name) {
            logging::warn!(self.log, "shutdown notify failed"; "error" => %err);
        }
        self.resolv.cleanup();

        self.state = NodeState::Terminated;
        Ok(())
    }

    pub(crate) fn cleanup_children(&mut self) {
        let name = self.name.clone();

        logging::debug!(self.log, "cleanup subscribers");
        for subscriber in &mut self.subscribers {
            let _ = subscriber.cleanup(&mut self.resolv, &name);
        }
        logging::debug!(self.log, "cleanup service servers");
        for server in &mut self.service_servers {
            let _ = server.cleanup(&mut self.resolv, &name);
        }
        logging::debug!(self.log, "cleanup service clients");
        for client in &mut self.service_clients {
            let _ = client.cleanup(&mut self.resolv, &name);
        }
        logging::debug!(self.log, "cleanup publishers");
        for publisher in &mut self.publishers {
            let _ = publisher.cleanup(&mut self.resolv, &name);
        }

        if let Some(log_pub) = &mut self.log_pub {
            log_pub.sock_mut().disconnect();
        }
    }

    pub(crate) fn set_terminated(&mut self) {
        self.state = NodeState::Terminated;
    }

    /// Local wall clock in microseconds, unadjusted.
    pub fn hardware_time_usec(&self) -> i64 {
        self.timesync.hardware_time_usec()
    }

    /// Wall clock adjusted by the smoothed resolver offset.
    pub fn time_usec(&self) -> i64 {
        self.timesync.time_usec()
    }

    /// Writes to the console logger and, once announced, publishes a log
    /// entry on the `log` topic. Publishing is skipped off the owning
    /// thread; sockets are not shared across fibres.
    pub fn log(&mut self, level: Level, message: &str) {
        log_at(&self.log, level, message);

        if thread::current().id() != self.owner_thread {
            return;
        }
        if let Some(log_pub) = &mut self.log_pub {
            let entry = LogEntry {
                node_name: self.name.clone(),
                level: level.as_str().to_lowercase(),
                message: message.to_string(),
                time_usec: self.timesync.time_usec(),
            };
            let _ = log_pub.publish_msg(&entry);
        }
    }
}

fn log_at(log: &Logger, level: Level, message: &str) {
    match level {
        Level::Trace => logging::trace!(log, "{}", message),
        Level::Debug => logging::debug!(log, "{}", message),
        Level::Info => logging::info!(log, "{}", message),
        Level::Warning => logging::warn!(log, "{}", message),
        Level::Error => logging::error!(log, "{}", message),
        Level::Critical => logging::crit!(log, "{}", message),
    }
}

/// Public host name advertised in announced endpoints.
pub fn hostname_id() -> String {
    let configured = quark::env::get("B0_HOST_ID");
    if !configured.is_empty() {
        return configured;
    }
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}
