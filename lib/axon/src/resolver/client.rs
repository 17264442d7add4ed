//! Typed request/reply facade over the resolver's `resolv` endpoint. All
//! coordinator operations travel through this one multiplexed service.

use crate::error::{Error, Result};
use crate::message::{Graph, Message, NodeId, Request, Response};
use crate::socket::{Role, Socket};
use quark::logging;
use quark::logging::Logger;
use std::time::Duration;

pub const DEFAULT_RESOLVER_ADDR: &str = "tcp://localhost:22000";

/// Reads the resolver endpoint from the environment, honoring the legacy
/// variable with a deprecation warning.
pub fn resolver_address_from_env(log: &Logger) -> String {
    let legacy = quark::env::get("BWF_RESOLVER");
    if !legacy.is_empty() {
        logging::warn!(log, "BWF_RESOLVER variable is deprecated. Use B0_RESOLVER instead.");
        return legacy;
    }
    quark::env::get_or("B0_RESOLVER", DEFAULT_RESOLVER_ADDR)
}

pub struct Client {
    sock: Socket,
    announce_timeout: Option<Duration>,
    log: Logger,
}

impl Client {
    /// A client pointed at the endpoint configured in the environment.
    pub fn new(log: Logger) -> Client {
        let addr = resolver_address_from_env(&log);
        Client::with_address(&addr, log)
    }

    pub fn with_address(addr: &str, log: Logger) -> Client {
        let mut sock = Socket::new(Role::Req, "resolv", log.clone());
        sock.set_remote_address(addr);
        Client {
            sock,
            announce_timeout: None,
            log,
        }
    }

    pub fn resolver_address(&self) -> &str {
        self.sock.remote_address()
    }

    pub fn set_resolver_address(&mut self, addr: &str) {
        self.sock.set_remote_address(addr);
    }

    /// Deadline applied to the announce exchange only; `None` waits
    /// indefinitely.
    pub fn set_announce_timeout(&mut self, timeout: Option<Duration>) {
        self.announce_timeout = timeout;
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.sock.set_read_timeout(timeout);
    }

    pub fn set_node_name(&mut self, node_name: &str) {
        self.sock.set_node_name(node_name);
    }

    pub fn logger(&self) -> &Logger {
        &self.log
    }

    pub fn cleanup(&mut self) {
        self.sock.disconnect();
    }

    fn call(&mut self, request: &Request) -> Result<Response> {
        let (payload, content_type) = self.sock.request(&request.to_bytes()?, Request::TYPE)?;
        if content_type != Response::TYPE {
            return Err(Error::MessageTypeMismatch {
                expected: Response::TYPE.to_string(),
                received: content_type,
            });
        }
        Response::from_bytes(&payload)
    }

    /// Announces the node and returns `(assigned_name, xsub, xpub)`. The
    /// read runs under the announce timeout; failure here aborts node
    /// startup.
    pub fn announce_node(
        &mut self,
        node_id: &NodeId,
        node_name: &str,
    ) -> Result<(String, String, String)> {
        let old_timeout = self.sock.read_timeout();
        self.sock.set_read_timeout(self.announce_timeout);

        logging::trace!(self.log, "announcing node to resolver"; "node" => node_name);
        let result = self.call(&Request::AnnounceNode {
            node_id: node_id.clone(),
            node_name: node_name.to_string(),
        });

        self.sock.set_read_timeout(old_timeout);

        match result? {
            Response::AnnounceNode {
                ok,
                node_name,
                xsub_sock_addr,
                xpub_sock_addr,
            } => {
                if !ok {
                    return Err(Error::RequestDenied("announce_node".to_string()));
                }
                logging::trace!(self.log, "announce complete";
                                "assigned" => %node_name,
                                "xsub" => %xsub_sock_addr,
                                "xpub" => %xpub_sock_addr);
                Ok((node_name, xsub_sock_addr, xpub_sock_addr))
            }
            other => Err(unexpected_response("announce_node", &other)),
        }
    }

    /// Tells the resolver this node is leaving.
    pub fn notify_shutdown(&mut self, node_name: &str) -> Result<()> {
        match self.call(&Request::ShutdownNode {
            node_name: node_name.to_string(),
        })? {
            Response::ShutdownNode { ok } => {
                if !ok {
                    return Err(Error::RequestDenied("shutdown_node".to_string()));
                }
                Ok(())
            }
            other => Err(unexpected_response("shutdown_node", &other)),
        }
    }

    /// One heartbeat. Returns the resolver clock corrected by half the
    /// round trip, ready to feed the time-sync state.
    pub fn send_heartbeat(&mut self, node_id: &NodeId) -> Result<i64> {
        let send_time = quark::time::timestamp_usec();

        match self.call(&Request::Heartbeat {
            node_id: node_id.clone(),
        })? {
            Response::Heartbeat { ok, time_usec } => {
                if !ok {
                    return Err(Error::RequestDenied("heartbeat".to_string()));
                }
                let rtt = quark::time::timestamp_usec() - send_time;
                Ok(time_usec + rtt / 2)
            }
            other => Err(unexpected_response("heartbeat", &other)),
        }
    }

    /// Registers a service endpoint. Service names are network-unique.
    pub fn announce_service(
        &mut self,
        node_name: &str,
        service_name: &str,
        sock_addr: &str,
    ) -> Result<()> {
        match self.call(&Request::AnnounceService {
            node_name: node_name.to_string(),
            service_name: service_name.to_string(),
            sock_addr: sock_addr.to_string(),
        })? {
            Response::AnnounceService { ok } => {
                if !ok {
                    return Err(Error::RequestDenied(format!(
                        "announce_service '{}'",
                        service_name
                    )));
                }
                Ok(())
            }
            other => Err(unexpected_response("announce_service", &other)),
        }
    }

    /// Looks up the address a service was announced under.
    pub fn resolve_service(&mut self, service_name: &str) -> Result<String> {
        match self.call(&Request::ResolveService {
            service_name: service_name.to_string(),
        })? {
            Response::ResolveService { ok, sock_addr } => {
                if !ok {
                    return Err(Error::NameResolution(service_name.to_string()));
                }
                logging::trace!(self.log, "resolved service";
                                "service" => service_name, "addr" => %sock_addr);
                Ok(sock_addr)
            }
            other => Err(unexpected_response("resolve_service", &other)),
        }
    }

    /// Graph notification for a topic relation. `reverse = true` means
    /// subscribing, `active = false` means the relation is ending.
    pub fn notify_topic(
        &mut self,
        node_name: &str,
        topic_name: &str,
        reverse: bool,
        active: bool,
    ) -> Result<()> {
        match self.call(&Request::NodeTopic {
            node_name: node_name.to_string(),
            topic_name: topic_name.to_string(),
            reverse,
            active,
        })? {
            Response::NodeTopic {} => Ok(()),
            other => Err(unexpected_response("node_topic", &other)),
        }
    }

    /// Graph notification for a service relation. `reverse = true` means
    /// using, `active = false` means the relation is ending.
    pub fn notify_service(
        &mut self,
        node_name: &str,
        service_name: &str,
        reverse: bool,
        active: bool,
    ) -> Result<()> {
        match self.call(&Request::NodeService {
            node_name: node_name.to_string(),
            service_name: service_name.to_string(),
            reverse,
            active,
        })? {
            Response::NodeService {} => Ok(()),
            other => Err(unexpected_response("node_service", &other)),
        }
    }

    /// Snapshot of the current network graph.
    pub fn get_graph(&mut self) -> Result<Graph> {
        match self.call(&Request::GetGraph {})? {
            Response::GetGraph { graph } => Ok(graph),
            other => Err(unexpected_response("get_graph", &other)),
        }
    }
}

fn unexpected_response(op: &str, response: &Response) -> Error {
    Error::MessageParse(format!(
        "unexpected response to {}: {:?}",
        op, response
    ))
}
