use std::io::{self, Read};

use bytes::Bytes;
use http::header::CONTENT_ENCODING;
use http::HeaderMap;

#[derive(Debug)]
pub(crate) enum DecodeBodyError {
    ContentEncoding { encoding: String, message: String },
    Text { message: String },
    TooLarge { actual_bytes: usize },
}

fn read_to_end_limited<R: Read>(
    reader: &mut R,
    encoding: &str,
    max_bytes: usize,
) -> Result<Vec<u8>, DecodeBodyError> {
    let mut decoded = Vec::new();
    let mut chunk = [0_u8; 8 * 1024];

    loop {
        let read = reader
            .read(&mut chunk)
            .map_err(|error: io::Error| DecodeBodyError::ContentEncoding {
                encoding: encoding.to_owned(),
                message: error.to_string(),
            })?;
        if read == 0 {
            break;
        }
        let next_size = decoded.len().saturating_add(read);
        if next_size > max_bytes {
            return Err(DecodeBodyError::TooLarge {
                actual_bytes: next_size,
            });
        }
        decoded.extend_from_slice(&chunk[..read]);
    }

    Ok(decoded)
}

/// Decompress a response body per its `Content-Encoding` and decode it to
/// UTF-8 text.
///
/// `gzip` and `deflate` (raw deflate, no zlib header) are recognized; any
/// other encoding, including none, passes the bytes through unchanged before
/// the text decode.
pub(crate) fn decode_response_text(
    body: Bytes,
    headers: &HeaderMap,
    max_bytes: usize,
) -> Result<String, DecodeBodyError> {
    let max_bytes = max_bytes.max(1);
    let content_encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let decoded = if content_encoding.contains("gzip") {
        let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
        read_to_end_limited(&mut decoder, "gzip", max_bytes)?
    } else if content_encoding.contains("deflate") {
        let mut decoder = flate2::read::DeflateDecoder::new(body.as_ref());
        read_to_end_limited(&mut decoder, "deflate", max_bytes)?
    } else {
        if body.len() > max_bytes {
            return Err(DecodeBodyError::TooLarge {
                actual_bytes: body.len(),
            });
        }
        body.to_vec()
    };

    String::from_utf8(decoded).map_err(|error| DecodeBodyError::Text {
        message: error.to_string(),
    })
}
