//! # Payload Codec
//!
//! Byte-level transform applied to serialized envelopes before they hit disk.
//! Writes honor the configured compression; reads sniff the gzip magic bytes,
//! so compressed and uncompressed files coexist in one directory and a cache
//! can migrate between the two settings without rewriting anything.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Gzip stream magic, checked on every read.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression applied to newly written payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Store payloads as-is.
    #[default]
    None,
    /// Gzip payloads on write.
    Gzip,
}

/// Encodes a payload for disk according to `compression`.
pub fn encode(bytes: &[u8], compression: Compression) -> std::io::Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(
                Vec::with_capacity(bytes.len() / 2 + 16),
                flate2::Compression::default(),
            );
            encoder.write_all(bytes)?;
            encoder.finish()
        }
    }
}

/// Decodes a payload read from disk, autodetecting gzip by magic bytes.
pub fn decode(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::with_capacity(bytes.len().saturating_mul(2));
        GzDecoder::new(bytes).read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_roundtrip() {
        let encoded = encode(b"payload", Compression::None).expect("encode");
        assert_eq!(encoded, b"payload");
        assert_eq!(decode(&encoded).expect("decode"), b"payload");
    }

    #[test]
    fn gzip_roundtrip() {
        let payload = b"a payload long enough to be worth compressing".repeat(8);
        let encoded = encode(&payload, Compression::Gzip).expect("encode");
        assert!(encoded.starts_with(&GZIP_MAGIC));
        assert_eq!(decode(&encoded).expect("decode"), payload);
    }

    #[test]
    fn decode_passes_plain_bytes_through() {
        // A plain payload written under one setting stays readable under the other.
        assert_eq!(decode(b"{\"k\":1}").expect("decode"), b"{\"k\":1}");
    }

    #[test]
    fn truncated_gzip_is_an_error() {
        let payload = encode(b"data", Compression::Gzip).expect("encode");
        assert!(decode(&payload[..4]).is_err());
    }
}
