use bytes::{Buf, BytesMut};
use std::io;

const READ_CHUNK_SIZE: usize = 65536;

/// A byte FIFO used to reassemble framed messages from a stream. Data is
/// appended at the tail as it arrives off the wire and consumed from the
/// head once a complete message has been parsed, so a short read never
/// loses or tears a message.
pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Appends raw bytes at the tail.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Consumes `count` bytes from the head.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        self.data.advance(count);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Performs one read from the supplied reader into the tail. Returns the
    /// number of bytes transferred; zero means the peer closed the stream.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let count = reader.read(&mut chunk)?;
        self.data.extend_from_slice(&chunk[..count]);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_advance() {
        let mut buffer = Buffer::new();
        buffer.extend(b"hello world");
        assert_eq!(buffer.len(), 11);

        buffer.advance(6);
        assert_eq!(buffer.as_slice(), b"world");

        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_ingress() {
        let mut buffer = Buffer::new();
        let mut source: &[u8] = b"streamed bytes";
        let count = buffer.ingress(&mut source).unwrap();
        assert_eq!(count, 14);
        assert_eq!(buffer.as_slice(), b"streamed bytes");
    }
}
