use bytes::Bytes;
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;

use crate::error::Error;

/// Request bodies are always fully buffered so every retry attempt can
/// replay them.
pub(crate) type ReqBody = Full<Bytes>;

/// A request payload, kept distinct from its JSON-vs-raw origin because the
/// cache fingerprint treats the two differently.
#[derive(Clone, Debug)]
pub(crate) enum RequestPayload {
    Raw(Bytes),
    Json(Bytes),
}

pub(crate) fn build_http_request(
    method: Method,
    target: Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Request<ReqBody>, Error> {
    let mut request_builder = Request::builder().method(method).uri(target);
    for (name, value) in headers {
        request_builder = request_builder.header(name, value);
    }
    request_builder
        .body(Full::new(body))
        .map_err(|source| Error::RequestBuild { source })
}

pub(crate) enum ReadBodyError {
    Read(hyper::Error),
    TooLarge { actual_bytes: usize },
}

pub(crate) async fn read_all_body_limited(
    mut body: Incoming,
    max_bytes: usize,
) -> Result<Bytes, ReadBodyError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ReadBodyError::Read)?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(ReadBodyError::TooLarge {
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}
