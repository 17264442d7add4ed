//! Topic subscriber. Connects to the broker's XPUB endpoint with a prefix
//! filter equal to the topic name; the wrapper then applies an exact-match
//! filter after receive, so two subscribers on prefix-sharing topics in one
//! process do not cross-deliver.

use crate::error::{Error, Result};
use crate::message::Message;
use crate::resolver::Client;
use crate::socket::{Role, Socket};
use quark::logging;
use quark::logging::Logger;
use std::io;
use std::time::Duration;

pub type Callback = Box<dyn FnMut(&str, &[u8], &str) + Send>;

pub struct Subscriber {
    sock: Socket,
    callback: Option<Callback>,
    notify_graph: bool,
    log: Logger,
}

impl Subscriber {
    pub(crate) fn new(
        topic: &str,
        callback: Option<Callback>,
        notify_graph: bool,
        log: Logger,
    ) -> Subscriber {
        let mut sock = Socket::new(Role::Sub, topic, log.clone());
        sock.set_has_header(true);
        Subscriber {
            sock,
            callback,
            notify_graph,
            log,
        }
    }

    pub fn topic_name(&self) -> &str {
        self.sock.name()
    }

    pub fn set_remote_address(&mut self, addr: &str) {
        self.sock.set_remote_address(addr);
    }

    pub fn set_conflate(&mut self, conflate: bool) {
        self.sock.set_conflate(conflate);
    }

    pub(crate) fn init(
        &mut self,
        resolv: &mut Client,
        node_name: &str,
        xpub_addr: &str,
    ) -> Result<()> {
        self.sock.set_node_name(node_name);
        if self.sock.remote_address().is_empty() {
            self.sock.set_remote_address(xpub_addr);
        }
        self.sock.connect()?;

        if self.notify_graph {
            resolv.notify_topic(node_name, self.sock.name(), true, true)?;
        }
        Ok(())
    }

    pub(crate) fn cleanup(&mut self, resolv: &mut Client, node_name: &str) -> Result<()> {
        if self.notify_graph {
            if let Err(err) = resolv.notify_topic(node_name, self.sock.name(), true, false) {
                logging::warn!(resolv.logger(), "graph notify failed during cleanup";
                               "topic" => self.sock.name(), "error" => %err);
            }
        }
        self.sock.disconnect();
        Ok(())
    }

    /// Drains every available message and hands exact topic matches to the
    /// callback. With conflate set, only the most recent match is delivered.
    pub(crate) fn spin_once(&mut self) -> Result<()> {
        if self.callback.is_none() {
            return Ok(());
        }

        let conflate = self.sock.conflate();
        let mut latest: Option<(String, Vec<u8>, String)> = None;

        while self.sock.poll(Some(Duration::from_millis(0)))? {
            let (topic, payload, content_type) = self.sock.read_with_topic()?;
            if topic != self.sock.name() {
                logging::trace!(self.log, "skipping prefix-matched message";
                                "topic" => %topic, "filter" => self.sock.name());
                continue;
            }
            if conflate {
                latest = Some((topic, payload, content_type));
            } else {
                let callback = self.callback.as_mut().expect("Callback checked above");
                callback(&topic, &payload, &content_type);
            }
        }

        if let Some((topic, payload, content_type)) = latest {
            let callback = self.callback.as_mut().expect("Callback checked above");
            callback(&topic, &payload, &content_type);
        }

        Ok(())
    }

    /// Manual mode: true when a message is waiting.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.sock.poll(timeout)
    }

    /// Manual mode: reads the next message on this subscriber's topic,
    /// skipping prefix-only matches, up to the socket read timeout per
    /// attempt.
    pub fn read(&mut self) -> Result<(String, Vec<u8>, String)> {
        loop {
            let (topic, payload, content_type) = self.sock.read_with_topic()?;
            if topic == self.sock.name() {
                return Ok((topic, payload, content_type));
            }
            logging::trace!(self.log, "skipping prefix-matched message";
                            "topic" => %topic, "filter" => self.sock.name());
        }
    }

    /// Reads and parses a typed message from the topic.
    pub fn read_msg<M: Message>(&mut self) -> Result<(String, M)> {
        let (topic, payload, content_type) = self.read()?;
        if content_type != M::TYPE {
            return Err(Error::MessageTypeMismatch {
                expected: M::TYPE.to_string(),
                received: content_type,
            });
        }
        Ok((topic, M::from_bytes(&payload)?))
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.sock.set_read_timeout(timeout);
    }

    /// Read with an overall deadline, for callers that poll explicitly.
    pub fn read_timeout(&mut self, timeout: Duration) -> Result<(String, Vec<u8>, String)> {
        if !self.sock.poll(Some(timeout))? {
            return Err(Error::SocketRead(io::ErrorKind::TimedOut));
        }
        let old_timeout = self.sock.read_timeout();
        self.sock.set_read_timeout(Some(timeout));
        let result = self.read();
        self.sock.set_read_timeout(old_timeout);
        result
    }
}
