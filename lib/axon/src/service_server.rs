//! Service server: binds a free TCP port, announces `(name, address)` to
//! the resolver, and serves one request at a time in strict request/reply
//! alternation.

use crate::error::{Error, Result};
use crate::net::stream;
use crate::resolver::Client;
use crate::socket::{Role, Socket};
use quark::logging;
use quark::logging::Logger;
use std::time::Duration;

pub type Callback = Box<dyn FnMut(&[u8], &str) -> (Vec<u8>, String) + Send>;

pub struct ServiceServer {
    sock: Socket,
    callback: Option<Callback>,
    bind_addr: String,
    remote_addr: String,
    notify_graph: bool,
    log: Logger,
}

impl ServiceServer {
    pub(crate) fn new(
        service: &str,
        callback: Option<Callback>,
        notify_graph: bool,
        log: Logger,
    ) -> ServiceServer {
        ServiceServer {
            sock: Socket::new(Role::Rep, service, log.clone()),
            callback,
            bind_addr: String::new(),
            remote_addr: String::new(),
            notify_graph,
            log,
        }
    }

    pub fn service_name(&self) -> &str {
        self.sock.name()
    }

    /// The address clients connect to, valid after init.
    pub fn remote_address(&self) -> &str {
        &self.remote_addr
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.sock.set_read_timeout(timeout);
    }

    /// Binds a free TCP port on this host, announces the endpoint, and
    /// notifies the graph of the offer relation.
    pub(crate) fn init(
        &mut self,
        resolv: &mut Client,
        node_name: &str,
        host_id: &str,
    ) -> Result<()> {
        self.sock.set_node_name(node_name);

        let port = stream::free_tcp_port().map_err(Error::write)?;
        self.bind_addr = format!("tcp://*:{}", port);
        self.remote_addr = stream::tcp_addr(host_id, port);
        self.sock.bind(&self.bind_addr)?;
        logging::debug!(self.log, "service bound";
                        "service" => self.sock.name(), "addr" => %self.bind_addr);

        resolv.announce_service(node_name, self.sock.name(), &self.remote_addr)?;

        if self.notify_graph {
            resolv.notify_service(node_name, self.sock.name(), false, true)?;
        }
        Ok(())
    }

    pub(crate) fn cleanup(&mut self, resolv: &mut Client, node_name: &str) -> Result<()> {
        if self.notify_graph {
            if let Err(err) = resolv.notify_service(node_name, self.sock.name(), false, false) {
                logging::warn!(resolv.logger(), "graph notify failed during cleanup";
                               "service" => self.sock.name(), "error" => %err);
            }
        }
        self.sock.unbind();
        Ok(())
    }

    /// Drains the request mailbox, invoking the handler once per request.
    /// A request that fails to decode still gets a reply, so the requester
    /// is never left waiting on a broken exchange.
    pub(crate) fn spin_once(&mut self) -> Result<()> {
        let callback = match &mut self.callback {
            Some(callback) => callback,
            None => return Ok(()),
        };

        while self.sock.poll(Some(Duration::from_millis(0)))? {
            let (reply, reply_type) = match self.sock.read_raw() {
                Ok((request, content_type)) => callback(&request, &content_type),
                Err(err) => {
                    logging::warn!(self.log, "malformed service request";
                                   "service" => self.sock.name(), "error" => %err);
                    (Vec::new(), String::new())
                }
            };
            self.sock.write_raw(&reply, &reply_type)?;
        }

        Ok(())
    }

    /// Manual mode: true when a request is waiting.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.sock.poll(timeout)
    }

    /// Manual mode: reads the next request.
    pub fn read(&mut self) -> Result<(Vec<u8>, String)> {
        self.sock.read_raw()
    }

    /// Manual mode: writes the reply to the request last read.
    pub fn write(&mut self, reply: &[u8], content_type: &str) -> Result<()> {
        self.sock.write_raw(reply, content_type)
    }
}
