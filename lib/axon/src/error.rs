use std::fmt;
use std::io;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An operation was called in a node state that does not allow it.
    InvalidStateTransition { op: &'static str, state: &'static str },
    /// The resolver has no binding for the given name.
    NameResolution(String),
    /// Transport-level read failure or timeout.
    SocketRead(io::ErrorKind),
    /// Transport-level write failure or timeout.
    SocketWrite(io::ErrorKind),
    /// The socket expects a header frame and none was present.
    MessageMissingHeader,
    /// Frames beyond header + payload arrived in one message.
    MessageTooManyParts,
    /// The header frame's topic differs from the socket name.
    HeaderMismatch { expected: String, received: String },
    /// Envelope framing corruption on decode.
    EnvelopeDecode(String),
    /// Envelope could not be produced.
    EnvelopeEncode(String),
    /// The content-type tag differs from what the reader expects.
    MessageTypeMismatch { expected: String, received: String },
    /// A well-framed payload failed to parse into the requested message.
    MessageParse(String),
    /// The envelope names an algorithm missing from the codec registry.
    UnsupportedCompression(String),
    /// The remote endpoint refused the request (protocol `ok = false`).
    RequestDenied(String),
    /// An endpoint address could not be parsed or bound.
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Folds an io error from a receive path into the read taxonomy.
    #[inline]
    pub fn read(err: io::Error) -> Error {
        Error::SocketRead(err.kind())
    }

    /// Folds an io error from a send path into the write taxonomy.
    #[inline]
    pub fn write(err: io::Error) -> Error {
        Error::SocketWrite(err.kind())
    }

    /// True for errors a caller can reasonably retry: name resolution
    /// misses and read timeouts. Everything else is fatal for the current
    /// operation.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::NameResolution(_) => true,
            Error::SocketRead(kind) => {
                *kind == io::ErrorKind::WouldBlock || *kind == io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidStateTransition { op, state } => {
                write!(f, "cannot call {}() in state {}", op, state)
            }
            Error::NameResolution(name) => write!(f, "failed to resolve name '{}'", name),
            Error::SocketRead(kind) => write!(f, "socket read error: {:?}", kind),
            Error::SocketWrite(kind) => write!(f, "socket write error: {:?}", kind),
            Error::MessageMissingHeader => write!(f, "message is missing the header frame"),
            Error::MessageTooManyParts => write!(f, "message has too many parts"),
            Error::HeaderMismatch { expected, received } => {
                write!(f, "header mismatch: expected '{}', got '{}'", expected, received)
            }
            Error::EnvelopeDecode(msg) => write!(f, "envelope decode error: {}", msg),
            Error::EnvelopeEncode(msg) => write!(f, "envelope encode error: {}", msg),
            Error::MessageTypeMismatch { expected, received } => {
                write!(f, "message type mismatch: expected '{}', got '{}'", expected, received)
            }
            Error::MessageParse(msg) => write!(f, "message parse error: {}", msg),
            Error::UnsupportedCompression(name) => {
                write!(f, "unsupported compression algorithm '{}'", name)
            }
            Error::RequestDenied(msg) => write!(f, "request denied: {}", msg),
            Error::InvalidAddress(addr) => write!(f, "invalid address '{}'", addr),
        }
    }
}

impl std::error::Error for Error {}
