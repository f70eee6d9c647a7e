use base64::{prelude::BASE64_STANDARD, Engine};
use deflate::deflate_bytes_conf;
use flate2::{Decompress, FlushDecompress, Status};

pub use deflate::Compression;

use crate::utils::decode_xml_base64;
use crate::SamlError;

// The redirect binding transports documents as raw DEFLATE (no zlib header)
// wrapped in standard base64.
pub fn encode(data: &[u8]) -> String {
    encode_with_level(data, Compression::Default)
}

pub fn encode_with_level(data: &[u8], level: Compression) -> String {
    BASE64_STANDARD.encode(deflate_bytes_conf(data, level))
}

pub fn decode(wire: &str) -> Result<Vec<u8>, SamlError> {
    let compressed = decode_xml_base64(wire).map_err(SamlError::InvalidBase64)?;
    inflate_raw(&compressed)
}

fn inflate_raw(compressed: &[u8]) -> Result<Vec<u8>, SamlError> {
    let mut inflater = Decompress::new(false);
    let mut out = Vec::with_capacity(compressed.len().saturating_mul(3).max(1024));
    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity());
        }
        let consumed = inflater.total_in() as usize;
        let produced = out.len();
        let status = inflater
            .decompress_vec(&compressed[consumed..], &mut out, FlushDecompress::None)
            .map_err(|_| SamlError::CorruptDeflateStream)?;
        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => {
                // No forward progress with all input presented means the
                // stream ended before its final block.
                if inflater.total_in() as usize == consumed && out.len() == produced {
                    return Err(SamlError::TruncatedDeflateStream);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_request_document() {
        let xml = br#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_12345"/>"#;
        let wire = encode(xml);
        assert_eq!(decode(&wire).unwrap(), xml);
    }

    #[test]
    fn round_trips_at_every_compression_level() {
        let data: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        for level in [Compression::Fast, Compression::Default, Compression::Best] {
            let wire = encode_with_level(&data, level);
            assert_eq!(decode(&wire).unwrap(), data);
        }
    }

    #[test]
    fn round_trips_empty_input() {
        assert!(decode(&encode(b"")).unwrap().is_empty());
    }

    #[test]
    fn tolerates_whitespace_in_base64() {
        let xml = b"<samlp:AuthnRequest ID=\"_1\"/>";
        let mut wire = encode(xml);
        wire.insert(8, '\n');
        wire.insert(4, ' ');
        assert_eq!(decode(&wire).unwrap(), xml);
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(matches!(
            decode("!!!not-base64!!!"),
            Err(SamlError::InvalidBase64(_))
        ));
    }

    #[test]
    fn rejects_garbage_deflate() {
        let wire = BASE64_STANDARD.encode([0xffu8; 32]);
        assert!(matches!(
            decode(&wire),
            Err(SamlError::CorruptDeflateStream)
        ));
    }

    #[test]
    fn rejects_truncated_stream() {
        let compressed = deflate_bytes_conf(
            b"a request document long enough to not fit a single byte of output",
            Compression::Default,
        );
        let wire = BASE64_STANDARD.encode(&compressed[..compressed.len() / 2]);
        assert!(matches!(
            decode(&wire),
            Err(SamlError::TruncatedDeflateStream)
        ));
    }
}
