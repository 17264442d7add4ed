//! In-process request/reply endpoints, addressed as `inproc://name`. The
//! resolver binds its `resolv` service here as well as on TCP so its own
//! fibres (heartbeat, sweeper) can reach it without a network round trip.

use crate::error::{Error, Result};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::io;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

/// One request travelling through an in-process endpoint, with the channel
/// the reply must be sent back on.
pub struct InprocRequest {
    pub frames: Vec<Vec<u8>>,
    pub reply_tx: mpsc::Sender<Vec<Vec<u8>>>,
}

pub type InprocServer = mpsc::Receiver<InprocRequest>;

#[derive(Clone)]
pub struct InprocClient {
    tx: mpsc::Sender<InprocRequest>,
}

impl InprocClient {
    /// Sends a request and waits for the reply.
    pub fn call(&self, frames: Vec<Vec<u8>>, timeout: Option<Duration>) -> Result<Vec<Vec<u8>>> {
        let (reply_tx, reply_rx) = mpsc::channel();

        self.tx
            .send(InprocRequest { frames, reply_tx })
            .map_err(|_| Error::SocketWrite(io::ErrorKind::BrokenPipe))?;

        match timeout {
            Some(limit) => reply_rx.recv_timeout(limit).map_err(|err| match err {
                mpsc::RecvTimeoutError::Timeout => Error::SocketRead(io::ErrorKind::TimedOut),
                mpsc::RecvTimeoutError::Disconnected => {
                    Error::SocketRead(io::ErrorKind::BrokenPipe)
                }
            }),
            None => reply_rx
                .recv()
                .map_err(|_| Error::SocketRead(io::ErrorKind::BrokenPipe)),
        }
    }
}

lazy_static! {
    static ref ENDPOINTS: Mutex<HashMap<String, mpsc::Sender<InprocRequest>>> =
        Mutex::new(HashMap::new());
}

/// Registers an endpoint and returns its request mailbox. Fails when the
/// name is already bound in this process.
pub fn bind(name: &str) -> Result<InprocServer> {
    let mut endpoints = ENDPOINTS.lock().expect("Inproc registry lock poisoned");

    if endpoints.contains_key(name) {
        return Err(Error::InvalidAddress(format!(
            "inproc://{} is already bound",
            name
        )));
    }

    let (tx, rx) = mpsc::channel();
    endpoints.insert(name.to_string(), tx);
    Ok(rx)
}

/// Connects to a previously bound endpoint.
pub fn connect(name: &str) -> Result<InprocClient> {
    let endpoints = ENDPOINTS.lock().expect("Inproc registry lock poisoned");

    endpoints
        .get(name)
        .cloned()
        .map(|tx| InprocClient { tx })
        .ok_or_else(|| Error::InvalidAddress(format!("inproc://{} is not bound", name)))
}

/// Removes the endpoint registration. Clients holding a sender observe a
/// broken pipe on their next call.
pub fn unbind(name: &str) {
    let mut endpoints = ENDPOINTS.lock().expect("Inproc registry lock poisoned");
    endpoints.remove(name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_request_reply() {
        let server = bind("test-echo").unwrap();
        let client = connect("test-echo").unwrap();

        let worker = thread::spawn(move || {
            let request = server.recv().unwrap();
            assert_eq!(request.frames, vec![b"ping".to_vec()]);
            request.reply_tx.send(vec![b"pong".to_vec()]).unwrap();
        });

        let reply = client
            .call(vec![b"ping".to_vec()], Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(reply, vec![b"pong".to_vec()]);

        worker.join().unwrap();
        unbind("test-echo");
    }

    #[test]
    fn test_double_bind_refused() {
        let _server = bind("test-dup").unwrap();
        assert!(bind("test-dup").is_err());
        unbind("test-dup");
    }

    #[test]
    fn test_connect_unknown() {
        assert!(connect("test-nowhere").is_err());
    }

    #[test]
    fn test_call_after_unbind_is_broken_pipe() {
        let server = bind("test-gone").unwrap();
        let client = connect("test-gone").unwrap();
        unbind("test-gone");
        drop(server);

        let err = client
            .call(vec![b"ping".to_vec()], Some(Duration::from_millis(100)))
            .unwrap_err();
        assert_eq!(err, Error::SocketWrite(io::ErrorKind::BrokenPipe));
    }
}
