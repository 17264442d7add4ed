//! The on-wire envelope: an ASCII header section of `Key: Value` lines
//! terminated by a blank line, followed by the concatenated (possibly
//! compressed) payloads. `Part-count` and per-part `Content-length-i` are
//! mandatory; content type and compression metadata are optional. Header
//! order is not significant.

use crate::error::{Error, Result};
use hashbrown::HashMap;
use quark::compress;
use quark::compress::CompressError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Uncompressed payload bytes.
    pub payload: Vec<u8>,
    /// Content-type tag, empty when untyped.
    pub content_type: String,
    /// Compression algorithm name, empty for none.
    pub compression_algorithm: String,
    /// Compression level, `-1` for the algorithm default.
    pub compression_level: i32,
}

impl Part {
    pub fn new(payload: Vec<u8>, content_type: &str) -> Part {
        Part {
            payload,
            content_type: content_type.to_string(),
            compression_algorithm: String::new(),
            compression_level: compress::DEFAULT_LEVEL,
        }
    }

    pub fn compressed(mut self, algorithm: &str, level: i32) -> Part {
        self.compression_algorithm = algorithm.to_string();
        self.compression_level = level;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub parts: Vec<Part>,
}

impl Envelope {
    /// Envelope around a single payload part.
    pub fn single(part: Part) -> Envelope {
        Envelope { parts: vec![part] }
    }

    /// Serializes headers and compressed payloads into one byte string.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut headers = format!("Part-count: {}\n", self.parts.len());
        let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(self.parts.len());

        for (i, part) in self.parts.iter().enumerate() {
            let packed = compress::compress(
                &part.compression_algorithm,
                &part.payload,
                part.compression_level,
            )
            .map_err(fold_compress_error_encode)?;

            headers.push_str(&format!("Content-length-{}: {}\n", i, packed.len()));
            if !part.content_type.is_empty() {
                headers.push_str(&format!("Content-type-{}: {}\n", i, part.content_type));
            }
            if !part.compression_algorithm.is_empty() {
                headers.push_str(&format!(
                    "Compression-algorithm-{}: {}\n",
                    i, part.compression_algorithm
                ));
                headers.push_str(&format!(
                    "Uncompressed-content-length-{}: {}\n",
                    i,
                    part.payload.len()
                ));
            }
            if part.compression_level != compress::DEFAULT_LEVEL {
                headers.push_str(&format!(
                    "Compression-level-{}: {}\n",
                    i, part.compression_level
                ));
            }

            payloads.push(packed);
        }

        let mut out = headers.into_bytes();
        out.push(b'\n');
        for payload in payloads {
            out.extend_from_slice(&payload);
        }
        Ok(out)
    }

    /// Parses an encoded envelope. Fails with `EnvelopeDecode` on any
    /// missing or malformed mandatory field; header ordering is free.
    pub fn decode(data: &[u8]) -> Result<Envelope> {
        let content_begin = find_blank_line(data)
            .ok_or_else(|| Error::EnvelopeDecode("missing header terminator".to_string()))?;

        let header_text = std::str::from_utf8(&data[..content_begin])
            .map_err(|_| Error::EnvelopeDecode("header section is not text".to_string()))?;
        let content = &data[content_begin + 2..];

        let mut headers: HashMap<&str, &str> = HashMap::new();
        for line in header_text.split('\n') {
            let delim = line
                .find(": ")
                .ok_or_else(|| Error::EnvelopeDecode(format!("malformed header line '{}'", line)))?;
            headers.insert(&line[..delim], &line[delim + 2..]);
        }

        let part_count: usize = headers
            .remove("Part-count")
            .ok_or_else(|| Error::EnvelopeDecode("missing Part-count".to_string()))?
            .parse()
            .map_err(|_| Error::EnvelopeDecode("malformed Part-count".to_string()))?;

        let mut parts = Vec::with_capacity(part_count);
        let mut part_start = 0usize;

        for i in 0..part_count {
            let content_length: usize = headers
                .remove(format!("Content-length-{}", i).as_str())
                .ok_or_else(|| Error::EnvelopeDecode(format!("missing Content-length-{}", i)))?
                .parse()
                .map_err(|_| Error::EnvelopeDecode(format!("malformed Content-length-{}", i)))?;

            let content_type = headers
                .remove(format!("Content-type-{}", i).as_str())
                .unwrap_or("")
                .to_string();
            let compression_algorithm = headers
                .remove(format!("Compression-algorithm-{}", i).as_str())
                .unwrap_or("")
                .to_string();
            let compression_level: i32 = match headers
                .remove(format!("Compression-level-{}", i).as_str())
            {
                Some(raw) => raw.parse().map_err(|_| {
                    Error::EnvelopeDecode(format!("malformed Compression-level-{}", i))
                })?,
                None => compress::DEFAULT_LEVEL,
            };
            let uncompressed_length: Option<usize> = match headers
                .remove(format!("Uncompressed-content-length-{}", i).as_str())
            {
                Some(raw) => Some(raw.parse().map_err(|_| {
                    Error::EnvelopeDecode(format!("malformed Uncompressed-content-length-{}", i))
                })?),
                None => None,
            };

            let part_end = part_start
                .checked_add(content_length)
                .filter(|end| *end <= content.len())
                .ok_or_else(|| {
                    Error::EnvelopeDecode(format!("part {} exceeds payload section", i))
                })?;

            let payload = compress::decompress(
                &compression_algorithm,
                &content[part_start..part_end],
                uncompressed_length,
            )
            .map_err(fold_compress_error_decode)?;
            part_start = part_end;

            parts.push(Part {
                payload,
                content_type,
                compression_algorithm,
                compression_level,
            });
        }

        Ok(Envelope { parts })
    }
}

/// Locates the `\n\n` separator between headers and payloads.
fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\n\n")
}

fn fold_compress_error_encode(err: CompressError) -> Error {
    match err {
        CompressError::UnsupportedAlgorithm(name) => Error::UnsupportedCompression(name),
        other => Error::EnvelopeEncode(other.to_string()),
    }
}

fn fold_compress_error_decode(err: CompressError) -> Error {
    match err {
        CompressError::UnsupportedAlgorithm(name) => Error::UnsupportedCompression(name),
        other => Error::EnvelopeDecode(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(algorithm: &str, level: i32) -> Envelope {
        Envelope::single(
            Part::new(b"hello envelope".to_vec(), "axon.Test").compressed(algorithm, level),
        )
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        let env = Envelope::single(Part::new(b"hello".to_vec(), "axon.Test"));
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_roundtrip_compressed() {
        for algorithm in &["zlib", "lz4"] {
            for level in &[-1, 0, 3] {
                let env = sample(algorithm, *level);
                let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
                assert_eq!(decoded, env, "{} level {}", algorithm, level);
            }
        }
    }

    #[test]
    fn test_roundtrip_multipart() {
        let env = Envelope {
            parts: vec![
                Part::new(b"first".to_vec(), "axon.A"),
                Part::new(b"second part".to_vec(), "").compressed("zlib", -1),
                Part::new(Vec::new(), "axon.Empty"),
            ],
        };
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_decoder_accepts_any_header_order() {
        let env = sample("zlib", -1);
        let encoded = env.encode().unwrap();
        let boundary = find_blank_line(&encoded).unwrap();

        let mut lines: Vec<&str> = std::str::from_utf8(&encoded[..boundary])
            .unwrap()
            .split('\n')
            .collect();
        lines.reverse();

        let mut shuffled = lines.join("\n").into_bytes();
        shuffled.extend_from_slice(&encoded[boundary..]);

        assert_eq!(Envelope::decode(&shuffled).unwrap(), env);
    }

    #[test]
    fn test_missing_part_count() {
        assert!(matches!(
            Envelope::decode(b"Content-length-0: 5\n\nhello"),
            Err(Error::EnvelopeDecode(_))
        ));
    }

    #[test]
    fn test_missing_content_length() {
        assert!(matches!(
            Envelope::decode(b"Part-count: 1\n\nhello"),
            Err(Error::EnvelopeDecode(_))
        ));
    }

    #[test]
    fn test_malformed_header_line() {
        assert!(matches!(
            Envelope::decode(b"Part-count 1\n\n"),
            Err(Error::EnvelopeDecode(_))
        ));
    }

    #[test]
    fn test_missing_terminator() {
        assert!(matches!(
            Envelope::decode(b"Part-count: 1\nContent-length-0: 5\nhello"),
            Err(Error::EnvelopeDecode(_))
        ));
    }

    #[test]
    fn test_truncated_payload() {
        assert!(matches!(
            Envelope::decode(b"Part-count: 1\nContent-length-0: 10\n\nhello"),
            Err(Error::EnvelopeDecode(_))
        ));
    }

    #[test]
    fn test_unknown_compression_algorithm() {
        let encoded =
            b"Part-count: 1\nContent-length-0: 5\nCompression-algorithm-0: snappy\n\nhello";
        assert_eq!(
            Envelope::decode(encoded),
            Err(Error::UnsupportedCompression("snappy".to_string()))
        );
    }

    #[test]
    fn test_binary_payload_with_newlines() {
        let env = Envelope::single(Part::new(b"\n\nraw\nbinary\n\n".to_vec(), ""));
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }
}
