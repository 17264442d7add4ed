//! Service client: resolves the service name to an address and offers a
//! synchronous call over a request socket.

use crate::error::{Error, Result};
use crate::message::Message;
use crate::resolver::Client;
use crate::socket::{Role, Socket};
use quark::logging;
use quark::logging::Logger;
use std::time::Duration;

pub struct ServiceClient {
    sock: Socket,
    notify_graph: bool,
}

impl ServiceClient {
    pub(crate) fn new(service: &str, notify_graph: bool, log: Logger) -> ServiceClient {
        ServiceClient {
            sock: Socket::new(Role::Req, service, log),
            notify_graph,
        }
    }

    pub fn service_name(&self) -> &str {
        self.sock.name()
    }

    /// Preconfigures the remote address, skipping resolver lookup.
    pub fn set_remote_address(&mut self, addr: &str) {
        self.sock.set_remote_address(addr);
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.sock.set_read_timeout(timeout);
    }

    pub fn set_compression(&mut self, algorithm: &str, level: i32) {
        self.sock.set_compression(algorithm, level);
    }

    /// Resolves the service unless an address was preconfigured, then
    /// notifies the graph of the use relation.
    pub(crate) fn init(&mut self, resolv: &mut Client, node_name: &str) -> Result<()> {
        self.sock.set_node_name(node_name);

        if self.sock.remote_address().is_empty() {
            let addr = resolv.resolve_service(self.sock.name())?;
            self.sock.set_remote_address(&addr);
        }
        self.sock.connect()?;

        if self.notify_graph {
            resolv.notify_service(node_name, self.sock.name(), true, true)?;
        }
        Ok(())
    }

    pub(crate) fn cleanup(&mut self, resolv: &mut Client, node_name: &str) -> Result<()> {
        if self.notify_graph {
            if let Err(err) = resolv.notify_service(node_name, self.sock.name(), true, false) {
                logging::warn!(resolv.logger(), "graph notify failed during cleanup";
                               "service" => self.sock.name(), "error" => %err);
            }
        }
        self.sock.disconnect();
        Ok(())
    }

    /// Writes the request and reads the reply under the socket's
    /// read-timeout. On a timeout the remote state is unknown; the caller
    /// may retry.
    pub fn call(&mut self, request: &[u8], content_type: &str) -> Result<(Vec<u8>, String)> {
        self.sock.request(request, content_type)
    }

    /// Typed call: checks the reply's content-type tag before parsing.
    pub fn call_msg<Rq: Message, Rsp: Message>(&mut self, request: &Rq) -> Result<Rsp> {
        let (payload, content_type) = self.call(&request.to_bytes()?, Rq::TYPE)?;
        if content_type != Rsp::TYPE {
            return Err(Error::MessageTypeMismatch {
                expected: Rsp::TYPE.to_string(),
                received: content_type,
            });
        }
        Rsp::from_bytes(&payload)
    }
}
