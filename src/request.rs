use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;

use crate::auth::Auth;
use crate::body::RequestPayload;
use crate::client::{Client, RequestOptions};
use crate::error::Error;
use crate::response::Response;
use crate::util::{append_query_pairs, parse_header_name, parse_header_value};

/// One request under construction.
///
/// Built from a [`Client`] verb method, finished with [`send`]. Every setter
/// takes and returns `self`, so a request reads as a single chain.
///
/// [`send`]: RequestBuilder::send
pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: Method,
    url: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    payload: Option<RequestPayload>,
    timeout: Option<Duration>,
    retries: Option<u32>,
    use_cache: bool,
    auth: Option<Auth>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, url: String) -> Self {
        Self {
            client,
            method,
            url,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            payload: None,
            timeout: None,
            retries: None,
            use_cache: true,
            auth: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Like [`header`], for callers holding plain strings.
    ///
    /// [`header`]: RequestBuilder::header
    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in pairs {
            self.query_pairs.push((name.into(), value.into()));
        }
        self
    }

    /// Serialize a struct or map into query parameters.
    pub fn query<T: Serialize>(mut self, params: &T) -> crate::Result<Self> {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| Error::SerializeQuery { source })?;
        for (name, value) in url::form_urlencoded::parse(encoded.as_bytes()) {
            self.query_pairs.push((name.into_owned(), value.into_owned()));
        }
        Ok(self)
    }

    /// Send raw bytes as the request body. The caller sets `Content-Type`
    /// when one applies.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.payload = Some(RequestPayload::Raw(body.into()));
        self
    }

    /// Serialize `value` as the JSON request body. `Content-Type` is set to
    /// `application/json` at dispatch, overriding any caller-set value.
    pub fn json<T: Serialize>(mut self, value: &T) -> crate::Result<Self> {
        let encoded = serde_json::to_vec(value).map_err(|source| Error::SerializeJson { source })?;
        self.payload = Some(RequestPayload::Json(Bytes::from(encoded)));
        Ok(self)
    }

    /// Per-attempt timeout, overriding the client default. One attempt is
    /// the request plus any redirect hops it follows, all under the same
    /// deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry count after the first attempt, overriding the client policy.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Opt this request out of (or back into) the response cache.
    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Dispatch the request.
    ///
    /// `Ok(Some(_))` carries the final response, `Ok(None)` means every
    /// attempt failed at the transport level, and `Err(_)` reports
    /// configuration errors or an HTTP error status that survived the last
    /// attempt.
    pub async fn send(self) -> crate::Result<Option<Response>> {
        let url = append_query_pairs(&self.url, &self.query_pairs);
        self.client
            .dispatch(
                self.method,
                url,
                self.headers,
                self.payload,
                RequestOptions {
                    timeout: self.timeout,
                    retries: self.retries,
                    use_cache: self.use_cache,
                    auth: self.auth,
                },
            )
            .await
    }
}
