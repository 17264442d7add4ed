//! Frame-level wire codec. A message is a run of frames, each carrying a
//! flags byte and a big-endian length prefix; the run ends at the first
//! frame with the more-bit clear.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;

pub const FLAG_MORE: u8 = 0x01;

const HEADER_SIZE: usize = 5;

/// Upper bound on a single frame. Anything larger is treated as stream
/// corruption rather than a legitimate payload.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Serializes a whole message into one byte vector.
pub fn encode_message(frames: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = frames.iter().map(|f| HEADER_SIZE + f.len()).sum();
    let mut out = Vec::with_capacity(total);

    for (i, frame) in frames.iter().enumerate() {
        let more = i + 1 < frames.len();
        out.write_u8(if more { FLAG_MORE } else { 0 })
            .expect("Vec write cannot fail");
        out.write_u32::<BigEndian>(frame.len() as u32)
            .expect("Vec write cannot fail");
        out.extend_from_slice(frame);
    }

    out
}

/// Attempts to parse one complete message from the front of `data`.
///
/// Returns `Ok(None)` when more bytes are needed, and the parsed frames plus
/// the number of consumed bytes once a full message is present. A frame
/// length beyond `MAX_FRAME_SIZE` is reported as `InvalidData`; the caller
/// should treat the connection as corrupt.
pub fn parse_message(data: &[u8]) -> io::Result<Option<(Vec<Vec<u8>>, usize)>> {
    let mut frames = Vec::new();
    let mut cursor = 0usize;

    loop {
        if data.len() - cursor < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &data[cursor..cursor + HEADER_SIZE];
        let flags = header.read_u8()?;
        let length = header.read_u32::<BigEndian>()? as usize;

        if length > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds the frame size bound", length),
            ));
        }

        let body_start = cursor + HEADER_SIZE;
        let body_end = body_start + length;
        if data.len() < body_end {
            return Ok(None);
        }

        frames.push(data[body_start..body_end].to_vec());
        cursor = body_end;

        if flags & FLAG_MORE == 0 {
            return Ok(Some((frames, cursor)));
        }
    }
}
