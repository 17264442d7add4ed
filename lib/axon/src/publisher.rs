//! Topic publisher. Connects to the broker's XSUB endpoint; every publish
//! carries the topic name as the header frame.

use crate::error::Result;
use crate::message::Message;
use crate::resolver::Client;
use crate::socket::{Role, Socket};
use quark::logging;
use quark::logging::Logger;

pub struct Publisher {
    sock: Socket,
    notify_graph: bool,
}

impl Publisher {
    pub(crate) fn new(topic: &str, notify_graph: bool, log: Logger) -> Publisher {
        let mut sock = Socket::new(Role::Pub, topic, log);
        sock.set_has_header(true);
        Publisher { sock, notify_graph }
    }

    pub fn topic_name(&self) -> &str {
        self.sock.name()
    }

    pub fn set_remote_address(&mut self, addr: &str) {
        self.sock.set_remote_address(addr);
    }

    pub fn set_compression(&mut self, algorithm: &str, level: i32) {
        self.sock.set_compression(algorithm, level);
    }

    pub(crate) fn sock_mut(&mut self) -> &mut Socket {
        &mut self.sock
    }

    /// Connects to the broker and notifies the graph of the new publish
    /// relation.
    pub(crate) fn init(
        &mut self,
        resolv: &mut Client,
        node_name: &str,
        xsub_addr: &str,
    ) -> Result<()> {
        self.sock.set_node_name(node_name);
        if self.sock.remote_address().is_empty() {
            self.sock.set_remote_address(xsub_addr);
        }
        self.sock.connect()?;

        if self.notify_graph {
            resolv.notify_topic(node_name, self.sock.name(), false, true)?;
        }
        Ok(())
    }

    pub(crate) fn cleanup(&mut self, resolv: &mut Client, node_name: &str) -> Result<()> {
        if self.notify_graph {
            if let Err(err) = resolv.notify_topic(node_name, self.sock.name(), false, false) {
                logging::warn!(resolv.logger(), "graph notify failed during cleanup";
                               "topic" => self.sock.name(), "error" => %err);
            }
        }
        self.sock.disconnect();
        Ok(())
    }

    /// Publishes one payload under this publisher's topic.
    pub fn publish(&mut self, payload: &[u8], content_type: &str) -> Result<()> {
        self.sock.write_raw(payload, content_type)
    }

    pub fn publish_msg<M: Message>(&mut self, msg: &M) -> Result<()> {
        self.sock.write_msg(msg)
    }
}
