//! Message-oriented transport: length-prefixed multipart framing over TCP,
//! plus an in-process request/reply shortcut.

pub mod buffer;
pub mod frame;
pub mod inproc;
pub mod stream;
