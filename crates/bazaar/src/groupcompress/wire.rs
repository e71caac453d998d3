//! Network/on-disk envelope for one group compress block.
//!
//! `groupcompress-block\n`, three decimal-ASCII lengths (each on its own
//! line: the compressed header length, the header's uncompressed length,
//! and the raw block length), then the zlib-compressed header followed
//! immediately by the raw block bytes. The header itself is a sequence of
//! four-line per-record stanzas (key, parents, start, end), written and
//! parsed by [`crate::groupcompress::manager`].

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub const MAGIC: &[u8] = b"groupcompress-block";

#[derive(Debug)]
pub enum Error {
    InvalidData(String),
    Io(std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidData(s) => write!(f, "invalid group compress envelope: {}", s),
            Error::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// Wrap a header and a raw block into one envelope, ready to be sent over
/// the wire or stored as a single chunk.
pub fn encode(header_bytes: &[u8], block_bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(header_bytes)?;
    let z_header = encoder.finish()?;

    let mut out = Vec::with_capacity(MAGIC.len() + 1 + z_header.len() + block_bytes.len() + 32);
    out.extend_from_slice(MAGIC);
    out.push(b'\n');
    out.extend_from_slice(format!("{}\n", z_header.len()).as_bytes());
    out.extend_from_slice(format!("{}\n", header_bytes.len()).as_bytes());
    out.extend_from_slice(format!("{}\n", block_bytes.len()).as_bytes());
    out.extend_from_slice(&z_header);
    out.extend_from_slice(block_bytes);
    Ok(out)
}

/// Split an envelope back into its (uncompressed header, raw block) parts.
pub fn decode(bytes: &[u8]) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let mut rest = bytes;
    let mut fields: Vec<&[u8]> = Vec::with_capacity(4);
    for _ in 0..4 {
        let idx = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::InvalidData("truncated envelope".to_string()))?;
        fields.push(&rest[..idx]);
        rest = &rest[idx + 1..];
    }
    if fields[0] != MAGIC {
        return Err(Error::InvalidData(format!(
            "unknown storage kind: {:?}",
            String::from_utf8_lossy(fields[0])
        )));
    }
    let parse_len = |field: &[u8], what: &str| -> Result<usize, Error> {
        std::str::from_utf8(field)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::InvalidData(format!("bad {} length", what)))
    };
    let z_header_len = parse_len(fields[1], "z_header")?;
    let header_len = parse_len(fields[2], "header")?;
    let block_len = parse_len(fields[3], "block")?;

    if rest.len() < z_header_len {
        return Err(Error::InvalidData("truncated z_header".to_string()));
    }
    let (z_header, block_bytes) = rest.split_at(z_header_len);
    if block_bytes.len() != block_len {
        return Err(Error::InvalidData(format!(
            "block length mismatch: header says {}, got {}",
            block_len,
            block_bytes.len()
        )));
    }

    let mut decoder = ZlibDecoder::new(z_header);
    let mut header = Vec::new();
    decoder.read_to_end(&mut header)?;
    if header.len() != header_len {
        return Err(Error::InvalidData(format!(
            "header length mismatch: envelope says {}, got {}",
            header_len,
            header.len()
        )));
    }
    Ok((header, block_bytes.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let header = b"key\x00id\nNone:\n0\n10\n".to_vec();
        let block = b"some raw block bytes".to_vec();
        let encoded = encode(&header, &block).unwrap();
        assert!(encoded.starts_with(MAGIC));
        let (decoded_header, decoded_block) = decode(&encoded).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_block, block);
    }

    #[test]
    fn rejects_unknown_magic() {
        let bad = b"not-a-group-compress-block\n1\n2\n3\nxxx".to_vec();
        assert!(decode(&bad).is_err());
    }
}
