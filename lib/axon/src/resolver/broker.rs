//! The XSUB/XPUB forwarding proxy. Publishers connect to the XSUB side,
//! subscribers to the XPUB side where they install prefix filters; frames
//! flow XSUB to XPUB without interpretation beyond the topic prefix match.
//! One poll loop owns every connection for the resolver's lifetime.

use crate::error::{Error, Result};
use crate::net::buffer::Buffer;
use crate::net::frame;
use crate::net::stream;
use crate::socket::{SUBSCRIBE, UNSUBSCRIBE};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use quark::logging;
use quark::logging::Logger;
use std::io;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const XSUB_LISTENER: Token = Token(0);
const XPUB_LISTENER: Token = Token(1);
const CONN_BASE: usize = 2;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-subscriber egress bound. A subscriber that falls this far behind
/// starts losing messages rather than stalling the proxy.
const MAX_EGRESS_BUFFER: usize = 8 * 1024 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ConnKind {
    Publisher,
    Subscriber,
}

struct Conn {
    stream: TcpStream,
    kind: ConnKind,
    rbuf: Buffer,
    wbuf: Buffer,
    filters: Vec<Vec<u8>>,
    wants_writable: bool,
}

pub struct Broker {
    poll: Poll,
    events: Events,
    xsub_listener: TcpListener,
    xpub_listener: TcpListener,
    xsub_addr: String,
    xpub_addr: String,
    conns: Vec<Option<Conn>>,
    shutdown: Arc<AtomicBool>,
    log: Logger,
}

impl Broker {
    /// Binds both proxy sides on free TCP ports. The advertised addresses
    /// carry `host_id` so remote nodes can reach them.
    pub fn bind(host_id: &str, shutdown: Arc<AtomicBool>, log: Logger) -> Result<Broker> {
        let poll = Poll::new().map_err(Error::read)?;

        let any = "0.0.0.0:0".parse().expect("Literal address must parse");
        let mut xsub_listener = TcpListener::bind(any).map_err(Error::write)?;
        let mut xpub_listener = TcpListener::bind(any).map_err(Error::write)?;

        let xsub_port = xsub_listener.local_addr().map_err(Error::write)?.port();
        let xpub_port = xpub_listener.local_addr().map_err(Error::write)?.port();

        poll.registry()
            .register(&mut xsub_listener, XSUB_LISTENER, Interest::READABLE)
            .map_err(Error::read)?;
        poll.registry()
            .register(&mut xpub_listener, XPUB_LISTENER, Interest::READABLE)
            .map_err(Error::read)?;

        let xsub_addr = stream::tcp_addr(host_id, xsub_port);
        let xpub_addr = stream::tcp_addr(host_id, xpub_port);
        logging::debug!(log, "broker bound"; "xsub" => %xsub_addr, "xpub" => %xpub_addr);

        Ok(Broker {
            poll,
            events: Events::with_capacity(1024),
            xsub_listener,
            xpub_listener,
            xsub_addr,
            xpub_addr,
            conns: Vec::new(),
            shutdown,
            log,
        })
    }

    pub fn xsub_addr(&self) -> &str {
        &self.xsub_addr
    }

    pub fn xpub_addr(&self) -> &str {
        &self.xpub_addr
    }

    /// Forwards frames until shutdown is requested.
    pub fn run(mut self) {
        logging::trace!(self.log, "running XSUB/XPUB proxy");

        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(err) = self.poll.poll(&mut self.events, Some(POLL_INTERVAL)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(self.log, "broker poll failed"; "error" => %err);
                break;
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|event| (event.token(), event.is_readable(), event.is_writable()))
                .collect();

            for (token, readable, writable) in ready {
                match token {
                    XSUB_LISTENER => self.accept(ConnKind::Publisher),
                    XPUB_LISTENER => self.accept(ConnKind::Subscriber),
                    Token(raw) => {
                        let index = raw - CONN_BASE;
                        if writable {
                            self.flush(index);
                        }
                        if readable {
                            self.drain(index);
                        }
                    }
                }
            }
        }

        logging::info!(self.log, "XSUB/XPUB proxy has terminated");
    }

    fn accept(&mut self, kind: ConnKind) {
        loop {
            let listener = match kind {
                ConnKind::Publisher => &self.xsub_listener,
                ConnKind::Subscriber => &self.xpub_listener,
            };
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let index = match self.conns.iter().position(|slot| slot.is_none()) {
                        Some(index) => index,
                        None => {
                            self.conns.push(None);
                            self.conns.len() - 1
                        }
                    };
                    let token = Token(CONN_BASE + index);
                    if let Err(err) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        logging::warn!(self.log, "broker registration failed"; "error" => %err);
                        continue;
                    }
                    logging::debug!(self.log, "broker accepted";
                                    "kind" => ?kind, "peer" => %peer, "slot" => index);
                    self.conns[index] = Some(Conn {
                        stream,
                        kind,
                        rbuf: Buffer::new(),
                        wbuf: Buffer::new(),
                        filters: Vec::new(),
                        wants_writable: false,
                    });
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "broker accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    /// Reads everything available on one connection and dispatches the
    /// complete messages.
    fn drain(&mut self, index: usize) {
        let mut messages = Vec::new();
        let mut broken = false;

        let kind = {
            let conn = match &mut self.conns[index] {
                Some(conn) => conn,
                None => return,
            };

            loop {
                match conn.rbuf.ingress(&mut conn.stream) {
                    Ok(0) => {
                        broken = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        logging::debug!(self.log, "broker read failed"; "error" => %err);
                        broken = true;
                        break;
                    }
                }
            }

            loop {
                match frame::parse_message(conn.rbuf.as_slice()) {
                    Ok(Some((frames, consumed))) => {
                        conn.rbuf.advance(consumed);
                        messages.push(frames);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        logging::debug!(self.log, "broker stream corrupt"; "error" => %err);
                        broken = true;
                        break;
                    }
                }
            }

            conn.kind
        };

        // Dispatch whatever arrived intact before the connection broke.
        for frames in messages {
            match kind {
                ConnKind::Publisher => self.forward(&frames),
                ConnKind::Subscriber => self.update_filters(index, &frames),
            }
        }

        if broken {
            self.close(index);
        }
    }

    /// Fans one published message out to every subscriber whose filter
    /// prefix-matches the topic frame.
    fn forward(&mut self, frames: &[Vec<u8>]) {
        if frames.is_empty() {
            return;
        }
        let topic = &frames[0];
        let encoded = frame::encode_message(frames);

        for index in 0..self.conns.len() {
            let matches = match &self.conns[index] {
                Some(conn) if conn.kind == ConnKind::Subscriber => conn
                    .filters
                    .iter()
                    .any(|filter| topic.starts_with(filter.as_slice())),
                _ => false,
            };
            if !matches {
                continue;
            }

            let overflow = {
                let conn = self.conns[index].as_mut().expect("Slot checked above");
                if conn.wbuf.len() + encoded.len() > MAX_EGRESS_BUFFER {
                    true
                } else {
                    conn.wbuf.extend(&encoded);
                    false
                }
            };

            if overflow {
                logging::debug!(self.log, "slow subscriber, dropping message"; "slot" => index);
            } else {
                self.flush(index);
            }
        }
    }

    /// Applies one subscription control message from a subscriber.
    fn update_filters(&mut self, index: usize, frames: &[Vec<u8>]) {
        let conn = match &mut self.conns[index] {
            Some(conn) => conn,
            None => return,
        };
        let control = match frames.first() {
            Some(control) if !control.is_empty() => control,
            _ => return,
        };

        let prefix = control[1..].to_vec();
        match control[0] {
            SUBSCRIBE => {
                logging::debug!(self.log, "subscription installed";
                                "slot" => index,
                                "prefix" => String::from_utf8_lossy(&prefix).into_owned());
                if !conn.filters.contains(&prefix) {
                    conn.filters.push(prefix);
                }
            }
            UNSUBSCRIBE => {
                conn.filters.retain(|filter| filter != &prefix);
            }
            other => {
                logging::debug!(self.log, "unknown subscription control"; "byte" => other);
            }
        }
    }

    /// Pushes buffered egress to the wire, adjusting the writable interest
    /// to match whether anything is left.
    fn flush(&mut self, index: usize) {
        let mut close = false;

        if let Some(conn) = &mut self.conns[index] {
            while !conn.wbuf.is_empty() {
                match conn.stream.write(conn.wbuf.as_slice()) {
                    Ok(0) => {
                        close = true;
                        break;
                    }
                    Ok(count) => conn.wbuf.advance(count),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        logging::debug!(self.log, "broker write failed"; "error" => %err);
                        close = true;
                        break;
                    }
                }
            }

            if !close {
                let needs_writable = !conn.wbuf.is_empty();
                if needs_writable != conn.wants_writable {
                    let interest = if needs_writable {
                        Interest::READABLE | Interest::WRITABLE
                    } else {
                        Interest::READABLE
                    };
                    let token = Token(CONN_BASE + index);
                    if self
                        .poll
                        .registry()
                        .reregister(&mut conn.stream, token, interest)
                        .is_ok()
                    {
                        conn.wants_writable = needs_writable;
                    }
                }
            }
        }

        if close {
            self.close(index);
        }
    }

    fn close(&mut self, index: usize) {
        if let Some(mut conn) = self.conns[index].take() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            logging::debug!(self.log, "broker connection closed"; "slot" => index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::stream::MsgStream;
    use std::thread;

    fn start_broker() -> (String, String, Arc<AtomicBool>, thread::JoinHandle<()>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let broker = Broker::bind("127.0.0.1", shutdown.clone(), logging::null()).unwrap();
        let xsub = broker.xsub_addr().to_string();
        let xpub = broker.xpub_addr().to_string();
        let handle = thread::spawn(move || broker.run());
        (xsub, xpub, shutdown, handle)
    }

    fn subscribe(xpub: &str, prefix: &[u8]) -> MsgStream {
        let mut sub = MsgStream::connect(xpub, Some(Duration::from_secs(2))).unwrap();
        let mut filter = vec![SUBSCRIBE];
        filter.extend_from_slice(prefix);
        sub.send(&[filter], None).unwrap();
        sub
    }

    #[test]
    fn test_fan_out_to_matching_subscribers() {
        let (xsub, xpub, shutdown, handle) = start_broker();

        let mut sub_a1 = subscribe(&xpub, b"A");
        let mut sub_a2 = subscribe(&xpub, b"A");
        let mut sub_b = subscribe(&xpub, b"B");

        let mut publisher = MsgStream::connect(&xsub, Some(Duration::from_secs(2))).unwrap();

        // The subscription control messages race the publish; retry until
        // both matching subscribers have seen a message.
        let message = vec![b"A".to_vec(), b"payload".to_vec()];
        let mut got_a1 = false;
        let mut got_a2 = false;
        for _ in 0..50 {
            publisher.send(&message, None).unwrap();
            thread::sleep(Duration::from_millis(20));
            if !got_a1 && sub_a1.poll(Some(Duration::from_millis(1))).unwrap() {
                assert_eq!(sub_a1.recv(None).unwrap(), message);
                got_a1 = true;
            }
            if !got_a2 && sub_a2.poll(Some(Duration::from_millis(1))).unwrap() {
                assert_eq!(sub_a2.recv(None).unwrap(), message);
                got_a2 = true;
            }
            if got_a1 && got_a2 {
                break;
            }
        }
        assert!(got_a1 && got_a2, "fan-out did not reach both subscribers");

        // The B subscriber saw nothing.
        assert!(!sub_b.poll(Some(Duration::from_millis(50))).unwrap());

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_prefix_filtering() {
        let (xsub, xpub, shutdown, handle) = start_broker();

        let mut sub = subscribe(&xpub, b"sensor");
        let mut publisher = MsgStream::connect(&xsub, Some(Duration::from_secs(2))).unwrap();

        let matching = vec![b"sensor/temp".to_vec(), b"22".to_vec()];
        let other = vec![b"motor".to_vec(), b"off".to_vec()];

        let mut received = None;
        for _ in 0..50 {
            publisher.send(&other, None).unwrap();
            publisher.send(&matching, None).unwrap();
            if sub.poll(Some(Duration::from_millis(20))).unwrap() {
                received = Some(sub.recv(None).unwrap());
                break;
            }
        }

        // Prefix match delivered the sensor message and only it.
        assert_eq!(received.expect("no message delivered"), matching);

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let (xsub, xpub, shutdown, handle) = start_broker();

        let mut sub = subscribe(&xpub, b"T");
        let mut publisher = MsgStream::connect(&xsub, Some(Duration::from_secs(2))).unwrap();

        let message = vec![b"T".to_vec(), b"x".to_vec()];
        let mut delivered = false;
        for _ in 0..50 {
            publisher.send(&message, None).unwrap();
            if sub.poll(Some(Duration::from_millis(20))).unwrap() {
                sub.recv(None).unwrap();
                delivered = true;
                break;
            }
        }
        assert!(delivered);

        let mut filter = vec![UNSUBSCRIBE];
        filter.extend_from_slice(b"T");
        sub.send(&[filter], None).unwrap();
        thread::sleep(Duration::from_millis(100));

        // Drain anything in flight from before the unsubscribe, then
        // confirm silence.
        while sub.poll(Some(Duration::from_millis(20))).unwrap() {
            sub.recv(None).unwrap();
        }
        publisher.send(&message, None).unwrap();
        assert!(!sub.poll(Some(Duration::from_millis(100))).unwrap());

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
