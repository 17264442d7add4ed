//! Blocking message stream over TCP. Reads go through a reassembly buffer
//! so a timed-out receive consumes nothing: partial bytes stay buffered and
//! the next receive continues where the wire left off.

use crate::error::{Error, Result};
use crate::net::buffer::Buffer;
use crate::net::frame;
use std::io;
use std::io::Write;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

pub struct MsgStream {
    stream: TcpStream,
    rbuf: Buffer,
}

impl MsgStream {
    /// Connects to a `tcp://host:port` endpoint.
    pub fn connect(addr: &str, timeout: Option<Duration>) -> Result<MsgStream> {
        let target = parse_tcp_addr(addr)?;

        let stream = match timeout {
            Some(limit) => {
                let sock_addr = target
                    .to_socket_addrs()
                    .map_err(Error::write)?
                    .next()
                    .ok_or_else(|| Error::InvalidAddress(addr.to_string()))?;
                TcpStream::connect_timeout(&sock_addr, limit).map_err(Error::write)?
            }
            None => TcpStream::connect(target.as_str()).map_err(Error::write)?,
        };

        Ok(MsgStream::from_stream(stream))
    }

    /// Wraps an accepted connection.
    pub fn from_stream(stream: TcpStream) -> MsgStream {
        let _ = stream.set_nodelay(true);
        let _ = stream.set_nonblocking(false);
        MsgStream {
            stream,
            rbuf: Buffer::new(),
        }
    }

    /// True when a full message is available without further waiting than
    /// `timeout`. Never consumes the message.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if self.has_complete()? {
            return Ok(true);
        }

        let deadline = timeout.map(|limit| Instant::now() + limit);

        loop {
            match deadline {
                None => {
                    self.fill_once(None)?;
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.fill_once(Some(Duration::from_millis(0)))?;
                        return self.has_complete();
                    }
                    self.fill_once(Some(deadline - now))?;
                }
            }

            if self.has_complete()? {
                return Ok(true);
            }
        }
    }

    /// Receives the next message, waiting up to `timeout`. A timeout leaves
    /// the stream state untouched apart from buffered partial bytes.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<Vec<u8>>> {
        let deadline = timeout.map(|limit| Instant::now() + limit);

        loop {
            if let Some((frames, consumed)) =
                frame::parse_message(self.rbuf.as_slice()).map_err(Error::read)?
            {
                self.rbuf.advance(consumed);
                return Ok(frames);
            }

            match deadline {
                None => {
                    self.fill_once(None)?;
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline || !self.fill_once(Some(deadline - now))? {
                        return Err(Error::SocketRead(io::ErrorKind::TimedOut));
                    }
                }
            }
        }
    }

    /// Sends one message, waiting up to `timeout` for the kernel to accept
    /// the bytes.
    pub fn send(&mut self, frames: &[Vec<u8>], timeout: Option<Duration>) -> Result<()> {
        let data = frame::encode_message(frames);

        self.stream
            .set_write_timeout(timeout.filter(|limit| limit.as_millis() > 0))
            .map_err(Error::write)?;
        self.stream.write_all(&data).map_err(Error::write)
    }

    fn has_complete(&self) -> Result<bool> {
        Ok(frame::parse_message(self.rbuf.as_slice())
            .map_err(Error::read)?
            .is_some())
    }

    /// One read into the reassembly buffer. Returns false when the wait ran
    /// out without data; end-of-stream is a read error.
    fn fill_once(&mut self, wait: Option<Duration>) -> Result<bool> {
        let result = match wait {
            Some(limit) if limit.as_millis() == 0 => {
                self.stream.set_nonblocking(true).map_err(Error::read)?;
                let result = self.rbuf.ingress(&mut self.stream);
                self.stream.set_nonblocking(false).map_err(Error::read)?;
                result
            }
            Some(limit) => {
                self.stream.set_read_timeout(Some(limit)).map_err(Error::read)?;
                self.rbuf.ingress(&mut self.stream)
            }
            None => {
                self.stream.set_read_timeout(None).map_err(Error::read)?;
                self.rbuf.ingress(&mut self.stream)
            }
        };

        match result {
            Ok(0) => Err(Error::SocketRead(io::ErrorKind::UnexpectedEof)),
            Ok(_) => Ok(true),
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(false)
            }
            Err(err) => Err(Error::read(err)),
        }
    }
}

/// Asks the OS for a currently free TCP port by binding port zero.
pub fn free_tcp_port() -> io::Result<u16> {
    let listener = TcpListener::bind("0.0.0.0:0")?;
    Ok(listener.local_addr()?.port())
}

/// Strips the `tcp://` scheme and normalizes the wildcard host, yielding a
/// `host:port` string the std networking calls accept.
pub fn parse_tcp_addr(addr: &str) -> Result<String> {
    let rest = addr
        .strip_prefix("tcp://")
        .ok_or_else(|| Error::InvalidAddress(addr.to_string()))?;
    if rest.is_empty() {
        return Err(Error::InvalidAddress(addr.to_string()));
    }
    if let Some(port) = rest.strip_prefix("*:") {
        Ok(format!("0.0.0.0:{}", port))
    } else {
        Ok(rest.to_string())
    }
}

/// Formats a connectable `tcp://host:port` endpoint.
pub fn tcp_addr(host: &str, port: u16) -> String {
    format!("tcp://{}:{}", host, port)
}

/// Returns the endpoint name when `addr` uses the in-process scheme.
pub fn inproc_name(addr: &str) -> Option<&str> {
    addr.strip_prefix("inproc://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn loopback_pair() -> (MsgStream, MsgStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        (MsgStream::from_stream(client), MsgStream::from_stream(server))
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let (mut client, mut server) = loopback_pair();

        let message = vec![b"topic".to_vec(), b"payload".to_vec()];
        client.send(&message, None).unwrap();

        let received = server.recv(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(received, message);
    }

    #[test]
    fn test_recv_timeout() {
        let (_client, mut server) = loopback_pair();

        let err = server.recv(Some(Duration::from_millis(50))).unwrap_err();
        assert_eq!(err, Error::SocketRead(io::ErrorKind::TimedOut));
    }

    #[test]
    fn test_partial_message_survives_timeout() {
        let (client, mut server) = loopback_pair();

        let encoded = frame::encode_message(&[b"split message".to_vec()]);
        let (head, tail) = encoded.split_at(4);

        let mut raw = client.stream.try_clone().unwrap();
        raw.write_all(head).unwrap();

        let err = server.recv(Some(Duration::from_millis(50))).unwrap_err();
        assert_eq!(err, Error::SocketRead(io::ErrorKind::TimedOut));

        raw.write_all(tail).unwrap();
        let received = server.recv(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(received, vec![b"split message".to_vec()]);
    }

    #[test]
    fn test_poll_does_not_consume() {
        let (mut client, mut server) = loopback_pair();

        client.send(&[b"once".to_vec()], None).unwrap();

        assert!(server.poll(Some(Duration::from_secs(2))).unwrap());
        assert!(server.poll(Some(Duration::from_millis(0))).unwrap());

        let received = server.recv(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(received, vec![b"once".to_vec()]);

        assert!(!server.poll(Some(Duration::from_millis(0))).unwrap());
    }

    #[test]
    fn test_closed_peer_is_a_read_error() {
        let (client, mut server) = loopback_pair();
        drop(client);

        thread::sleep(Duration::from_millis(20));
        let err = server.recv(Some(Duration::from_secs(1))).unwrap_err();
        assert_eq!(err, Error::SocketRead(io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_parse_tcp_addr() {
        assert_eq!(parse_tcp_addr("tcp://box1:22000").unwrap(), "box1:22000");
        assert_eq!(parse_tcp_addr("tcp://*:22000").unwrap(), "0.0.0.0:22000");
        assert!(parse_tcp_addr("box1:22000").is_err());
        assert!(parse_tcp_addr("inproc://resolv").is_err());
    }

    #[test]
    fn test_free_tcp_port() {
        let port = free_tcp_port().unwrap();
        assert!(port > 0);
    }
}
