//! Pluggable payload compression. Codecs are looked up by algorithm name in
//! a process-wide registry; the empty name is the identity codec.

use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::io::{Read, Write};

/// Level passed by callers that want the algorithm's default.
pub const DEFAULT_LEVEL: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressError {
    UnsupportedAlgorithm(String),
    Compress(String),
    Decompress(String),
}

impl std::fmt::Display for CompressError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CompressError::UnsupportedAlgorithm(name) => {
                write!(f, "unsupported compression algorithm '{}'", name)
            }
            CompressError::Compress(msg) => write!(f, "compression failed: {}", msg),
            CompressError::Decompress(msg) => write!(f, "decompression failed: {}", msg),
        }
    }
}

impl std::error::Error for CompressError {}

pub type CompressFn = fn(&[u8], i32) -> Result<Vec<u8>, CompressError>;
pub type DecompressFn = fn(&[u8], Option<usize>) -> Result<Vec<u8>, CompressError>;

/// A compress/decompress function pair registered under an algorithm name.
pub struct Codec {
    pub compress: CompressFn,
    pub decompress: DecompressFn,
}

lazy_static! {
    static ref REGISTRY: HashMap<&'static str, Codec> = {
        let mut m = HashMap::new();
        m.insert(
            "",
            Codec {
                compress: identity_compress,
                decompress: identity_decompress,
            },
        );
        m.insert(
            "zlib",
            Codec {
                compress: zlib_compress,
                decompress: zlib_decompress,
            },
        );
        m.insert(
            "lz4",
            Codec {
                compress: lz4_compress,
                decompress: lz4_decompress,
            },
        );
        m
    };
}

/// Compresses `data` with the named algorithm. Level `-1` selects the
/// algorithm default.
pub fn compress(algorithm: &str, data: &[u8], level: i32) -> Result<Vec<u8>, CompressError> {
    let codec = REGISTRY
        .get(algorithm)
        .ok_or_else(|| CompressError::UnsupportedAlgorithm(algorithm.to_string()))?;
    (codec.compress)(data, level)
}

/// Decompresses `data`. `expected_size` is the uncompressed length carried
/// by the envelope; algorithms that need an output bound require it.
pub fn decompress(
    algorithm: &str,
    data: &[u8],
    expected_size: Option<usize>,
) -> Result<Vec<u8>, CompressError> {
    let codec = REGISTRY
        .get(algorithm)
        .ok_or_else(|| CompressError::UnsupportedAlgorithm(algorithm.to_string()))?;
    (codec.decompress)(data, expected_size)
}

/// True when the name resolves to a registered codec.
pub fn is_supported(algorithm: &str) -> bool {
    REGISTRY.contains_key(algorithm)
}

fn identity_compress(data: &[u8], _level: i32) -> Result<Vec<u8>, CompressError> {
    Ok(data.to_vec())
}

fn identity_decompress(data: &[u8], _expected: Option<usize>) -> Result<Vec<u8>, CompressError> {
    Ok(data.to_vec())
}

fn zlib_compress(data: &[u8], level: i32) -> Result<Vec<u8>, CompressError> {
    let level = match level {
        DEFAULT_LEVEL => flate2::Compression::best(),
        n => flate2::Compression::new(n.max(0).min(9) as u32),
    };
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), level);
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|err| CompressError::Compress(err.to_string()))
}

fn zlib_decompress(data: &[u8], _expected: Option<usize>) -> Result<Vec<u8>, CompressError> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| CompressError::Decompress(err.to_string()))?;
    Ok(out)
}

fn lz4_compress(data: &[u8], _level: i32) -> Result<Vec<u8>, CompressError> {
    // The block format has a single speed/ratio point; the level knob is
    // accepted for interface parity and ignored.
    Ok(lz4_flex::block::compress(data))
}

fn lz4_decompress(data: &[u8], expected: Option<usize>) -> Result<Vec<u8>, CompressError> {
    let expected = expected.ok_or_else(|| {
        CompressError::Decompress("lz4 requires the uncompressed length".to_string())
    })?;
    lz4_flex::block::decompress(data, expected)
        .map_err(|err| CompressError::Decompress(err.to_string()))
}
