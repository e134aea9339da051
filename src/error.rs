use http::{HeaderMap, Method};
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of a failure below the HTTP semantic layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Read,
    Decode,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Read => "read",
            Self::Decode => "decode",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUrl,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    SerializeQuery,
    Deserialize,
    RequestBuild,
    Transport,
    Timeout,
    ResponseBodyTooLarge,
    DecodeContentEncoding,
    DecodeText,
    HttpStatus,
    InvalidRedirectLocation,
    RedirectLimitExceeded,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::Deserialize => "deserialize",
            Self::RequestBuild => "request_build",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::DecodeText => "decode_text",
            Self::HttpStatus => "http_status",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request url: {url}")]
    InvalidUrl { url: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to decode response json: {source}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("http transport error ({kind}) for {method} {url}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {url}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        url: String,
    },
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes) for {method} {url}"
    )]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        url: String,
    },
    #[error("failed to decode response content-encoding {encoding} for {method} {url}: {message}")]
    DecodeContentEncoding {
        encoding: String,
        message: String,
        method: Method,
        url: String,
    },
    #[error("response body is not valid utf-8 for {method} {url}: {message}")]
    DecodeText {
        message: String,
        method: Method,
        url: String,
    },
    #[error("http status error {status} {reason} for {method} {url}")]
    HttpStatus {
        status: u16,
        reason: String,
        method: Method,
        url: String,
        body: String,
        headers: HeaderMap,
    },
    #[error("invalid redirect location {location} for {method} {url}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        url: String,
    },
    #[error("redirect limit exceeded ({max_redirects}) for {method} {url}")]
    RedirectLimitExceeded {
        max_redirects: usize,
        method: Method,
        url: String,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUrl { .. } => ErrorCode::InvalidUrl,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::DecodeText { .. } => ErrorCode::DecodeText,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::RedirectLimitExceeded { .. } => ErrorCode::RedirectLimitExceeded,
        }
    }
}

/// Failure of one attempt, classified for the retry controller.
///
/// `Transport` and `Protocol` are both retry-worthy; they differ on
/// exhaustion: transport failures collapse into an absent result, while the
/// protocol failure raised by the final attempt propagates to the caller.
/// `Fatal` aborts the retry loop immediately.
#[derive(Debug)]
pub enum AttemptError {
    Transport(Error),
    Protocol(Error),
    Fatal(Error),
}

/// A transport-level fault raised below the dispatcher, before the request
/// context (method, url) is known to the failing component.
#[derive(Debug)]
pub(crate) struct TransportFault {
    pub(crate) kind: TransportErrorKind,
    pub(crate) source: BoxError,
}

impl TransportFault {
    pub(crate) fn into_error(self, method: &Method, url: &str) -> Error {
        Error::Transport {
            kind: self.kind,
            method: method.clone(),
            url: url.to_owned(),
            source: self.source,
        }
    }
}

pub(crate) fn classify_io_error(error: &std::io::Error) -> TransportErrorKind {
    use std::io::ErrorKind;

    match error.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionAborted | ErrorKind::TimedOut => {
            TransportErrorKind::Connect
        }
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => {
            TransportErrorKind::Read
        }
        _ => {
            let text = error.to_string().to_ascii_lowercase();
            if text.contains("dns")
                || text.contains("name or service not known")
                || text.contains("failed to lookup address")
            {
                TransportErrorKind::Dns
            } else {
                TransportErrorKind::Other
            }
        }
    }
}

pub(crate) fn classify_hyper_error(error: &hyper::Error) -> TransportErrorKind {
    if error.is_incomplete_message() || error.is_body_write_aborted() {
        return TransportErrorKind::Read;
    }
    if error.is_parse() || error.is_parse_status() {
        return TransportErrorKind::Read;
    }

    let text = error.to_string().to_ascii_lowercase();
    if text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
        || text.contains("channel closed")
        || text.contains("connection closed")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}
