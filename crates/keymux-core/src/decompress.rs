//! Response body decompression by `Content-Encoding`.

use std::io::Read;

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};

use crate::error::ProxyError;

pub fn decompress(content_encoding: Option<&str>, body: Bytes) -> Result<Bytes, ProxyError> {
    match content_encoding.map(str::trim) {
        None | Some("") | Some("identity") => Ok(body),
        Some("gzip") => {
            let mut decoder = GzDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|err| ProxyError::upstream_fatal(format!("gzip decode: {err}")))?;
            Ok(Bytes::from(out))
        }
        Some("deflate") => {
            let mut decoder = ZlibDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|err| ProxyError::upstream_fatal(format!("deflate decode: {err}")))?;
            Ok(Bytes::from(out))
        }
        Some("br") => {
            let mut decoder = brotli::Decompressor::new(&body[..], 4096);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|err| ProxyError::upstream_fatal(format!("brotli decode: {err}")))?;
            Ok(Bytes::from(out))
        }
        Some(other) => Err(ProxyError::upstream_fatal(format!(
            "unsupported content-encoding: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn gzip_round_trip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let compressed = Bytes::from(encoder.finish().unwrap());
        let out = decompress(Some("gzip"), compressed).unwrap();
        assert_eq!(&out[..], b"{\"ok\":true}");
    }

    #[test]
    fn identity_passes_through() {
        let body = Bytes::from_static(b"plain");
        assert_eq!(decompress(None, body.clone()).unwrap(), body);
        assert_eq!(decompress(Some("identity"), body.clone()).unwrap(), body);
    }

    #[test]
    fn unknown_encoding_is_fatal() {
        assert!(decompress(Some("zstd"), Bytes::new()).is_err());
    }
}
