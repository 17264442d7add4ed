//! The concrete socket wrapper. One `Socket` type covers the four roles
//! (request, reply, publish, subscribe) configured by a small enum, wraps
//! every payload in an envelope, optionally prepends the topic header frame,
//! and funnels all option knobs in one place.

use crate::envelope::{Envelope, Part};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::net::inproc;
use crate::net::stream::{self, MsgStream};
use quark::logging;
use quark::logging::Logger;
use std::io;
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Req,
    Rep,
    Pub,
    Sub,
}

/// Option knobs passed through to the transport. Knobs without a TCP
/// counterpart (backlog, immediate, high-water marks) are carried for
/// interface parity and consulted by the layers that can honor them.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub linger: Option<Duration>,
    pub backlog: i32,
    pub immediate: bool,
    pub conflate: bool,
    pub read_hwm: i32,
    pub write_hwm: i32,
}

impl Default for SocketOptions {
    fn default() -> SocketOptions {
        SocketOptions {
            read_timeout: None,
            write_timeout: None,
            linger: Some(Duration::from_millis(5000)),
            backlog: 100,
            immediate: false,
            conflate: false,
            read_hwm: 1000,
            write_hwm: 1000,
        }
    }
}

/// Frame prefix a subscriber sends to install a topic filter.
pub const SUBSCRIBE: u8 = 0x01;
/// Frame prefix a subscriber sends to drop a topic filter.
pub const UNSUBSCRIBE: u8 = 0x00;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
const CONNECT_ATTEMPT_LIMIT: Duration = Duration::from_millis(1000);
const REP_POLL_SLICE: Duration = Duration::from_millis(1);

enum ReplyTo {
    Conn(usize),
    Inproc(mpsc::Sender<Vec<Vec<u8>>>),
}

pub struct Socket {
    role: Role,
    name: String,
    node_name: String,
    has_header: bool,
    remote_addr: String,
    compression_algorithm: String,
    compression_level: i32,
    options: SocketOptions,

    // Connected endpoint (req / pub / sub)
    stream: Option<MsgStream>,
    inproc_tx: Option<inproc::InprocClient>,

    // Bound endpoint (rep)
    listener: Option<TcpListener>,
    inproc_rx: Option<inproc::InprocServer>,
    inproc_name: Option<String>,
    conns: Vec<Option<MsgStream>>,
    pending: Option<(Vec<Vec<u8>>, ReplyTo)>,
    reply_to: Option<ReplyTo>,

    log: Logger,
}

impl Socket {
    pub fn new(role: Role, name: &str, log: Logger) -> Socket {
        Socket {
            role,
            name: name.to_string(),
            node_name: String::new(),
            has_header: false,
            remote_addr: String::new(),
            compression_algorithm: String::new(),
            compression_level: quark::compress::DEFAULT_LEVEL,
            options: SocketOptions::default(),
            stream: None,
            inproc_tx: None,
            listener: None,
            inproc_rx: None,
            inproc_name: None,
            conns: Vec::new(),
            pending: None,
            reply_to: None,
            log,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn set_node_name(&mut self, node_name: &str) {
        self.node_name = node_name.to_string();
    }

    pub fn has_header(&self) -> bool {
        self.has_header
    }

    pub fn set_has_header(&mut self, has_header: bool) {
        self.has_header = has_header;
    }

    pub fn set_compression(&mut self, algorithm: &str, level: i32) {
        self.compression_algorithm = algorithm.to_string();
        self.compression_level = level;
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_addr
    }

    pub fn set_remote_address(&mut self, addr: &str) {
        self.remote_addr = addr.to_string();
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.options.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.options.read_timeout = timeout;
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.options.write_timeout
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.options.write_timeout = timeout;
    }

    pub fn linger(&self) -> Option<Duration> {
        self.options.linger
    }

    pub fn set_linger(&mut self, period: Option<Duration>) {
        self.options.linger = period;
    }

    pub fn backlog(&self) -> i32 {
        self.options.backlog
    }

    pub fn set_backlog(&mut self, backlog: i32) {
        self.options.backlog = backlog;
    }

    pub fn immediate(&self) -> bool {
        self.options.immediate
    }

    pub fn set_immediate(&mut self, immediate: bool) {
        self.options.immediate = immediate;
    }

    pub fn conflate(&self) -> bool {
        self.options.conflate
    }

    pub fn set_conflate(&mut self, conflate: bool) {
        self.options.conflate = conflate;
    }

    pub fn read_hwm(&self) -> i32 {
        self.options.read_hwm
    }

    pub fn set_read_hwm(&mut self, hwm: i32) {
        self.options.read_hwm = hwm;
    }

    pub fn write_hwm(&self) -> i32 {
        self.options.write_hwm
    }

    pub fn set_write_hwm(&mut self, hwm: i32) {
        self.options.write_hwm = hwm;
    }

    /// Connects to the configured remote address. Request sockets connect
    /// lazily on first use instead; publish/subscribe sockets connect here,
    /// and subscribe sockets install their topic filter.
    pub fn connect(&mut self) -> Result<()> {
        if self.remote_addr.is_empty() {
            return Err(Error::InvalidAddress("remote address not set".to_string()));
        }

        logging::trace!(self.log, "connecting"; "socket" => %self.name, "addr" => %self.remote_addr);

        match self.role {
            Role::Req => {
                // Lazy, mirrors the transport's asynchronous connect. The
                // connection is raised by the first request.
                Ok(())
            }
            Role::Pub | Role::Sub => {
                let mut stream = self.connect_with_retry()?;
                if self.role == Role::Sub {
                    let mut filter = vec![SUBSCRIBE];
                    filter.extend_from_slice(self.name.as_bytes());
                    stream.send(&[filter], self.options.write_timeout)?;
                }
                self.stream = Some(stream);
                Ok(())
            }
            Role::Rep => Err(Error::InvalidAddress(
                "reply sockets bind, they do not connect".to_string(),
            )),
        }
    }

    /// Disconnects from the remote endpoint. A subscribe socket removes its
    /// topic filter first, best effort.
    pub fn disconnect(&mut self) {
        logging::trace!(self.log, "disconnecting"; "socket" => %self.name, "addr" => %self.remote_addr);

        if self.role == Role::Sub {
            if let Some(stream) = &mut self.stream {
                let mut filter = vec![UNSUBSCRIBE];
                filter.extend_from_slice(self.name.as_bytes());
                let _ = stream.send(&[filter], Some(Duration::from_millis(100)));
            }
        }

        self.stream = None;
        self.inproc_tx = None;
    }

    /// Binds a reply socket to a `tcp://` or `inproc://` endpoint. One of
    /// each may be active at a time.
    pub fn bind(&mut self, addr: &str) -> Result<()> {
        if self.role != Role::Rep {
            return Err(Error::InvalidAddress(
                "only reply sockets bind".to_string(),
            ));
        }

        if let Some(name) = stream::inproc_name(addr) {
            self.inproc_rx = Some(inproc::bind(name)?);
            self.inproc_name = Some(name.to_string());
            logging::debug!(self.log, "bound"; "socket" => %self.name, "addr" => addr);
            return Ok(());
        }

        let target = stream::parse_tcp_addr(addr)?;
        let listener = TcpListener::bind(target.as_str()).map_err(Error::write)?;
        listener.set_nonblocking(true).map_err(Error::write)?;
        logging::debug!(self.log, "bound"; "socket" => %self.name, "addr" => addr);
        self.listener = Some(listener);
        Ok(())
    }

    /// Drops all bound endpoints and open connections.
    pub fn unbind(&mut self) {
        if let Some(name) = self.inproc_name.take() {
            inproc::unbind(&name);
        }
        self.inproc_rx = None;
        self.listener = None;
        self.conns.clear();
        self.pending = None;
        self.reply_to = None;
    }

    /// The locally bound TCP port, when bound.
    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// True when a full incoming message is available within `timeout`.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
        match self.role {
            Role::Rep => self.poll_rep(timeout),
            _ => match &mut self.stream {
                Some(stream) => stream.poll(timeout),
                None => Ok(false),
            },
        }
    }

    /// Reads one message, enforcing the header contract: an optional header
    /// frame that must equal this socket's name, exactly one payload frame,
    /// nothing after it.
    pub fn read_raw(&mut self) -> Result<(Vec<u8>, String)> {
        let frames = self.read_frames()?;
        let (header, payload, content_type) = decode_frames(&frames, self.has_header)?;

        if let Some(header) = header {
            if header != self.name {
                return Err(Error::HeaderMismatch {
                    expected: self.name.clone(),
                    received: header,
                });
            }
        }

        self.dump_payload("recv", &payload);
        Ok((payload, content_type))
    }

    /// Reads one message and returns its header frame alongside the
    /// payload. Used by subscribers, which filter rather than fail on a
    /// topic that does not match exactly.
    pub fn read_with_topic(&mut self) -> Result<(String, Vec<u8>, String)> {
        let frames = self.read_frames()?;
        let (header, payload, content_type) = decode_frames(&frames, self.has_header)?;
        Ok((header.unwrap_or_default(), payload, content_type))
    }

    /// Reads and parses a typed message, verifying the content-type tag.
    pub fn read_msg<M: Message>(&mut self) -> Result<M> {
        let (payload, content_type) = self.read_raw()?;
        if content_type != M::TYPE {
            return Err(Error::MessageTypeMismatch {
                expected: M::TYPE.to_string(),
                received: content_type,
            });
        }
        M::from_bytes(&payload)
    }

    /// Wraps the payload in an envelope and writes it out: to the connected
    /// peer for publish sockets, to the requester for reply sockets.
    pub fn write_raw(&mut self, payload: &[u8], content_type: &str) -> Result<()> {
        let frames = self.encode_frames(payload, content_type)?;
        self.dump_payload("send", payload);

        match self.role {
            Role::Pub => match &mut self.stream {
                Some(stream) => stream.send(&frames, self.options.write_timeout),
                None => Err(Error::SocketWrite(io::ErrorKind::NotConnected)),
            },
            Role::Rep => match self.reply_to.take() {
                Some(ReplyTo::Conn(index)) => match &mut self.conns[index] {
                    Some(conn) => conn.send(&frames, self.options.write_timeout),
                    None => Err(Error::SocketWrite(io::ErrorKind::NotConnected)),
                },
                Some(ReplyTo::Inproc(reply_tx)) => {
                    // A requester that gave up waiting is not an error.
                    let _ = reply_tx.send(frames);
                    Ok(())
                }
                None => Err(Error::SocketWrite(io::ErrorKind::NotConnected)),
            },
            Role::Req => match &mut self.stream {
                Some(stream) => stream.send(&frames, self.options.write_timeout),
                None => Err(Error::SocketWrite(io::ErrorKind::NotConnected)),
            },
            Role::Sub => Err(Error::SocketWrite(io::ErrorKind::Unsupported)),
        }
    }

    pub fn write_msg<M: Message>(&mut self, msg: &M) -> Result<()> {
        self.write_raw(&msg.to_bytes()?, M::TYPE)
    }

    /// One synchronous request/reply exchange on a request socket. The
    /// connection is raised lazily under the read-timeout deadline, so an
    /// absent remote surfaces as a read error, not a connect error.
    pub fn request(&mut self, payload: &[u8], content_type: &str) -> Result<(Vec<u8>, String)> {
        if self.role != Role::Req {
            return Err(Error::SocketWrite(io::ErrorKind::Unsupported));
        }

        let frames = self.encode_frames(payload, content_type)?;
        self.dump_payload("send", payload);

        let remote_addr = self.remote_addr.clone();
        let reply_frames = if let Some(name) = stream::inproc_name(&remote_addr) {
            let client = match &self.inproc_tx {
                Some(client) => client.clone(),
                None => {
                    let client = inproc::connect(name)?;
                    self.inproc_tx = Some(client.clone());
                    client
                }
            };
            client.call(frames, self.options.read_timeout)?
        } else {
            self.ensure_connected()?;
            let read_timeout = self.options.read_timeout;
            let write_timeout = self.options.write_timeout;

            let sent = self
                .stream
                .as_mut()
                .expect("Request socket must be connected")
                .send(&frames, write_timeout);
            if let Err(err) = sent {
                self.stream = None;
                return Err(err);
            }

            let received = self
                .stream
                .as_mut()
                .expect("Request socket must be connected")
                .recv(read_timeout);
            match received {
                Ok(frames) => frames,
                Err(err) => {
                    // The exchange is broken; force a reconnect next time.
                    if !matches!(err, Error::SocketRead(io::ErrorKind::TimedOut)) {
                        self.stream = None;
                    }
                    return Err(err);
                }
            }
        };

        let (_, payload, content_type) = decode_frames(&reply_frames, false)?;
        self.dump_payload("recv", &payload);
        Ok((payload, content_type))
    }

    /// True when the socket name matches a `node.socket` debug pattern.
    pub fn matches_pattern(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if let Some(dot) = pattern.find('.') {
            let node_pattern = &pattern[..dot];
            let sock_pattern = &pattern[dot + 1..];
            return (node_pattern == "*" || node_pattern == self.node_name)
                && (sock_pattern == "*" || sock_pattern == self.name);
        }
        false
    }

    fn encode_frames(&self, payload: &[u8], content_type: &str) -> Result<Vec<Vec<u8>>> {
        let mut part = Part::new(payload.to_vec(), content_type);
        if !self.compression_algorithm.is_empty() {
            part = part.compressed(&self.compression_algorithm, self.compression_level);
        }
        let encoded = Envelope::single(part).encode()?;

        let mut frames = Vec::with_capacity(2);
        if self.has_header {
            frames.push(self.name.as_bytes().to_vec());
        }
        frames.push(encoded);
        Ok(frames)
    }

    fn read_frames(&mut self) -> Result<Vec<Vec<u8>>> {
        match self.role {
            Role::Rep => {
                if self.pending.is_none() && !self.poll_rep(self.options.read_timeout)? {
                    return Err(Error::SocketRead(io::ErrorKind::TimedOut));
                }
                let (frames, origin) = self.pending.take().expect("Poll reported a message");
                self.reply_to = Some(origin);
                Ok(frames)
            }
            _ => match &mut self.stream {
                Some(stream) => stream.recv(self.options.read_timeout),
                None => Err(Error::SocketRead(io::ErrorKind::NotConnected)),
            },
        }
    }

    fn connect_with_retry(&self) -> Result<MsgStream> {
        let deadline = Instant::now() + CONNECT_ATTEMPT_LIMIT;
        loop {
            match MsgStream::connect(&self.remote_addr, Some(CONNECT_ATTEMPT_LIMIT)) {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(err);
                    }
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        }
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        if self.remote_addr.is_empty() {
            return Err(Error::InvalidAddress("remote address not set".to_string()));
        }

        let deadline = self.options.read_timeout.map(|limit| Instant::now() + limit);

        loop {
            let attempt_limit = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::SocketRead(io::ErrorKind::TimedOut));
                    }
                    (deadline - now).min(CONNECT_ATTEMPT_LIMIT)
                }
                None => CONNECT_ATTEMPT_LIMIT,
            };

            match MsgStream::connect(&self.remote_addr, Some(attempt_limit)) {
                Ok(stream) => {
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(_) => thread::sleep(CONNECT_RETRY_DELAY),
            }
        }
    }

    fn accept_pending(&mut self) {
        let listener = match &self.listener {
            Some(listener) => listener,
            None => return,
        };

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    logging::debug!(self.log, "accepted connection";
                                    "socket" => %self.name,
                                    "peer" => %peer);
                    let conn = MsgStream::from_stream(stream);
                    match self.conns.iter_mut().position(|slot| slot.is_none()) {
                        Some(index) => self.conns[index] = Some(conn),
                        None => self.conns.push(Some(conn)),
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept failed";
                                   "socket" => %self.name,
                                   "error" => %err);
                    break;
                }
            }
        }
    }

    fn poll_rep(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }

        let deadline = timeout.map(|limit| Instant::now() + limit);

        loop {
            self.accept_pending();

            if let Some(inproc_rx) = &self.inproc_rx {
                if let Ok(request) = inproc_rx.try_recv() {
                    self.pending = Some((request.frames, ReplyTo::Inproc(request.reply_tx)));
                    return Ok(true);
                }
            }

            for index in 0..self.conns.len() {
                let ready = match &mut self.conns[index] {
                    Some(conn) => match conn.poll(Some(Duration::from_millis(0))) {
                        Ok(ready) => ready,
                        Err(err) => {
                            logging::debug!(self.log, "dropping connection";
                                            "socket" => %self.name,
                                            "error" => %err);
                            self.conns[index] = None;
                            continue;
                        }
                    },
                    None => continue,
                };

                if ready {
                    let conn = self.conns[index].as_mut().expect("Slot checked above");
                    match conn.recv(Some(Duration::from_millis(100))) {
                        Ok(frames) => {
                            self.pending = Some((frames, ReplyTo::Conn(index)));
                            return Ok(true);
                        }
                        Err(err) => {
                            logging::debug!(self.log, "dropping connection";
                                            "socket" => %self.name,
                                            "error" => %err);
                            self.conns[index] = None;
                        }
                    }
                }
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(false);
                }
            }
            thread::sleep(REP_POLL_SLICE);
        }
    }

    fn dump_payload(&self, op: &str, payload: &[u8]) {
        let patterns = quark::env::get("B0_DEBUG_SOCKET");
        if patterns.is_empty() {
            return;
        }
        if !patterns
            .split(|c| c == ':' || c == ';')
            .any(|pattern| self.matches_pattern(pattern))
        {
            return;
        }

        logging::debug!(self.log, "payload dump";
                        "sock" => format!("{}.{}", self.node_name, self.name),
                        "op" => op,
                        "len" => payload.len(),
                        "payload" => escape_payload(payload));
    }
}

/// Validates the frame layout of one received message and unpacks the
/// envelope: optional header frame, exactly one payload frame, no extras.
fn decode_frames(
    frames: &[Vec<u8>],
    has_header: bool,
) -> Result<(Option<String>, Vec<u8>, String)> {
    let (header, payload_frame) = if has_header {
        if frames.len() < 2 {
            return Err(Error::MessageMissingHeader);
        }
        if frames.len() > 2 {
            return Err(Error::MessageTooManyParts);
        }
        (
            Some(String::from_utf8_lossy(&frames[0]).into_owned()),
            &frames[1],
        )
    } else {
        if frames.is_empty() {
            return Err(Error::EnvelopeDecode("empty message".to_string()));
        }
        if frames.len() > 1 {
            return Err(Error::MessageTooManyParts);
        }
        (None, &frames[0])
    };

    let envelope = Envelope::decode(payload_frame)?;
    let part = envelope
        .parts
        .into_iter()
        .next()
        .ok_or_else(|| Error::EnvelopeDecode("envelope has no parts".to_string()))?;

    Ok((header, part.payload, part.content_type))
}

fn escape_payload(payload: &[u8]) -> String {
    let mut out = String::with_capacity(payload.len());
    for &byte in payload {
        match byte {
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            32..=126 => out.push(byte as char),
            _ => out.push_str(&format!("\\x{:02x}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quark::logging;

    fn encode_one(name: &str, has_header: bool, payload: &[u8], content_type: &str) -> Vec<Vec<u8>> {
        let mut sock = Socket::new(Role::Pub, name, logging::null());
        sock.set_has_header(has_header);
        sock.encode_frames(payload, content_type).unwrap()
    }

    #[test]
    fn test_decode_frames_with_header() {
        let frames = encode_one("topic-a", true, b"payload", "axon.Test");
        let (header, payload, content_type) = decode_frames(&frames, true).unwrap();
        assert_eq!(header.as_deref(), Some("topic-a"));
        assert_eq!(payload, b"payload");
        assert_eq!(content_type, "axon.Test");
    }

    #[test]
    fn test_decode_frames_missing_header() {
        let frames = encode_one("svc", false, b"payload", "");
        assert_eq!(
            decode_frames(&frames, true).unwrap_err(),
            Error::MessageMissingHeader
        );
    }

    #[test]
    fn test_decode_frames_too_many_parts() {
        let mut frames = encode_one("topic-a", true, b"payload", "");
        frames.push(b"extra".to_vec());
        assert_eq!(
            decode_frames(&frames, true).unwrap_err(),
            Error::MessageTooManyParts
        );

        let mut frames = encode_one("svc", false, b"payload", "");
        frames.push(b"extra".to_vec());
        assert_eq!(
            decode_frames(&frames, false).unwrap_err(),
            Error::MessageTooManyParts
        );
    }

    #[test]
    fn test_read_raw_header_mismatch() {
        let mut rep = Socket::new(Role::Rep, "svc", logging::null());
        rep.bind("tcp://127.0.0.1:0").unwrap();
        let port = rep.local_port().unwrap();

        // A publisher-style sender with a different name.
        let mut sender = Socket::new(Role::Pub, "other", logging::null());
        sender.set_has_header(true);
        sender.set_remote_address(&stream::tcp_addr("127.0.0.1", port));
        sender.connect().unwrap();
        sender.write_raw(b"payload", "").unwrap();

        rep.set_has_header(true);
        rep.set_read_timeout(Some(Duration::from_secs(2)));
        let err = rep.read_raw().unwrap_err();
        assert_eq!(
            err,
            Error::HeaderMismatch {
                expected: "svc".to_string(),
                received: "other".to_string(),
            }
        );
    }

    #[test]
    fn test_req_rep_roundtrip() {
        let mut rep = Socket::new(Role::Rep, "echo", logging::null());
        rep.bind("tcp://127.0.0.1:0").unwrap();
        let port = rep.local_port().unwrap();

        let server = thread::spawn(move || {
            rep.set_read_timeout(Some(Duration::from_secs(5)));
            let (request, content_type) = rep.read_raw().unwrap();
            assert_eq!(content_type, "axon.Ping");
            rep.write_raw(&request, "axon.Pong").unwrap();
        });

        let mut req = Socket::new(Role::Req, "echo", logging::null());
        req.set_remote_address(&stream::tcp_addr("127.0.0.1", port));
        req.set_read_timeout(Some(Duration::from_secs(5)));

        let (reply, content_type) = req.request(b"ping", "axon.Ping").unwrap();
        assert_eq!(reply, b"ping");
        assert_eq!(content_type, "axon.Pong");

        server.join().unwrap();
    }

    #[test]
    fn test_req_timeout_when_remote_absent() {
        let mut req = Socket::new(Role::Req, "ghost", logging::null());
        // Reserved port with nothing listening.
        let port = stream::free_tcp_port().unwrap();
        req.set_remote_address(&stream::tcp_addr("127.0.0.1", port));
        req.set_read_timeout(Some(Duration::from_millis(300)));

        let started = Instant::now();
        let err = req.request(b"ping", "").unwrap_err();
        assert!(matches!(err, Error::SocketRead(_)), "got {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_compressed_roundtrip() {
        let mut rep = Socket::new(Role::Rep, "pack", logging::null());
        rep.bind("tcp://127.0.0.1:0").unwrap();
        let port = rep.local_port().unwrap();

        let server = thread::spawn(move || {
            rep.set_read_timeout(Some(Duration::from_secs(5)));
            let (request, _) = rep.read_raw().unwrap();
            rep.write_raw(&request, "").unwrap();
        });

        let mut req = Socket::new(Role::Req, "pack", logging::null());
        req.set_remote_address(&stream::tcp_addr("127.0.0.1", port));
        req.set_read_timeout(Some(Duration::from_secs(5)));
        req.set_compression("zlib", -1);

        let body = vec![7u8; 8192];
        let (reply, _) = req.request(&body, "").unwrap();
        assert_eq!(reply, body);

        server.join().unwrap();
    }

    #[test]
    fn test_matches_pattern() {
        let mut sock = Socket::new(Role::Pub, "tele", logging::null());
        sock.set_node_name("cam0");

        assert!(sock.matches_pattern("*"));
        assert!(sock.matches_pattern("cam0.tele"));
        assert!(sock.matches_pattern("*.tele"));
        assert!(sock.matches_pattern("cam0.*"));
        assert!(sock.matches_pattern("*.*"));
        assert!(!sock.matches_pattern("cam1.tele"));
        assert!(!sock.matches_pattern("cam0.other"));
        assert!(!sock.matches_pattern("cam0"));
    }

    #[test]
    fn test_escape_payload() {
        assert_eq!(escape_payload(b"ok"), "ok");
        assert_eq!(escape_payload(b"a\nb\x01"), "a\\nb\\x01");
    }
}
