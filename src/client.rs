use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    USER_AGENT,
};
use http::{HeaderMap, Method, StatusCode};
use rand::Rng;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info_span, warn, Instrument};
use url::Url;

use crate::auth::Auth;
use crate::body::{build_http_request, read_all_body_limited, ReadBodyError, RequestPayload};
use crate::cache::{request_fingerprint, ResponseCache};
use crate::connect::{Connector, Proxy, TcpConnector};
use crate::decode::{decode_response_text, DecodeBodyError};
use crate::error::{classify_hyper_error, AttemptError, Error, TransportFault};
use crate::pool::ConnectionPool;
use crate::redirect::{RedirectPolicy, RedirectStep};
use crate::request::RequestBuilder;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::util::{
    default_port, merge_headers, origin_form_target, parse_header_name, parse_header_value,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_REDIRECTS: usize = 5;
const DEFAULT_CACHE_MAX_SIZE: usize = 1000;
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

fn platform_user_agent() -> String {
    format!(
        "apireq/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Per-request knobs, resolved against the client's defaults at dispatch.
pub(crate) struct RequestOptions {
    pub(crate) timeout: Option<Duration>,
    pub(crate) retries: Option<u32>,
    pub(crate) use_cache: bool,
    pub(crate) auth: Option<Auth>,
}

pub struct ClientBuilder {
    default_timeout: Duration,
    max_redirects: usize,
    retry_policy: RetryPolicy,
    cache_max_size: usize,
    use_response_cache: bool,
    max_response_body_bytes: usize,
    default_headers: HeaderMap,
    user_agents: Vec<String>,
    proxy: Option<Proxy>,
    connector: Option<Arc<dyn Connector>>,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            retry_policy: RetryPolicy::standard(),
            cache_max_size: DEFAULT_CACHE_MAX_SIZE,
            use_response_cache: true,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            default_headers: HeaderMap::new(),
            user_agents: Vec::new(),
            proxy: None,
            connector: None,
        }
    }

    pub fn default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn response_cache_max_size(mut self, max_size: usize) -> Self {
        self.cache_max_size = max_size.max(1);
        self
    }

    pub fn use_response_cache(mut self, use_response_cache: bool) -> Self {
        self.use_response_cache = use_response_cache;
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    /// Replace the user-agent pool with a single agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agents = vec![user_agent.into()];
        self
    }

    /// Add one agent to the pool a request picks from at random.
    pub fn add_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agents.push(user_agent.into());
        self
    }

    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Swap the transport dialer; mainly a seam for tests.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> Client {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(self.proxy)));
        let mut user_agents = self.user_agents;
        if user_agents.is_empty() {
            user_agents.push(platform_user_agent());
        }

        Client {
            default_timeout: self.default_timeout,
            retry_policy: self.retry_policy,
            redirect_policy: RedirectPolicy::new(self.max_redirects),
            use_response_cache: self.use_response_cache,
            max_response_body_bytes: self.max_response_body_bytes,
            default_headers: self.default_headers,
            user_agents,
            pool: ConnectionPool::new(connector),
            cache: ResponseCache::new(self.cache_max_size),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The request dispatcher.
///
/// One instance owns the connection pool, the response cache, the user-agent
/// pool, and the default headers; there is no process-wide state. Wrap it in
/// an `Arc` to issue requests from many tasks concurrently.
///
/// A dispatched request resolves to one of three outcomes: `Ok(Some(_))` with
/// a [`Response`], `Ok(None)` when transport-level failures exhausted every
/// retry, or `Err(_)` for configuration errors and for HTTP error statuses
/// that survived the final attempt. The timeout bounds one attempt end to
/// end, including every redirect hop it follows; backoff sleeps run between
/// attempts, so a fully retried request can still take longer than
/// `timeout * (retries + 1)` of wall-clock time.
pub struct Client {
    default_timeout: Duration,
    retry_policy: RetryPolicy,
    redirect_policy: RedirectPolicy,
    use_response_cache: bool,
    max_response_body_bytes: usize,
    default_headers: HeaderMap,
    user_agents: Vec<String>,
    pool: ConnectionPool,
    cache: ResponseCache,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, url.into())
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn options(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::OPTIONS, url)
    }

    /// Empty the response cache.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Close every pooled connection. Idempotent; later requests dial fresh
    /// connections.
    pub fn close_connections(&self) {
        self.pool.close_all();
    }

    pub(crate) async fn dispatch(
        &self,
        method: Method,
        url_text: String,
        headers: HeaderMap,
        payload: Option<RequestPayload>,
        options: RequestOptions,
    ) -> crate::Result<Option<Response>> {
        let per_attempt_timeout = options
            .timeout
            .unwrap_or(self.default_timeout)
            .max(Duration::from_millis(1));
        let retries = options.retries.unwrap_or(self.retry_policy.retries_value());
        let cache_enabled = self.use_response_cache && options.use_cache;

        let fingerprint = request_fingerprint(&method, &url_text, &headers, payload.as_ref());
        if cache_enabled {
            if let Some(hit) = self.cache.get(&fingerprint) {
                debug!(method = %method, url = %url_text, "response cache hit");
                return Ok(Some(hit));
            }
        }

        // Bad input fails fast, before any attempt is spent on it.
        let parsed = parse_request_url(&url_text)?;

        for attempt in 0..=retries {
            let span = info_span!(
                "apireq.request",
                method = %method,
                url = %url_text,
                attempt = attempt + 1,
                max_attempts = retries + 1
            );
            // Instrumented rather than entered so the future stays Send.
            let outcome = async {
                debug!("sending request");
                let result = self
                    .perform_attempt(
                        &method,
                        parsed.clone(),
                        &headers,
                        payload.as_ref(),
                        per_attempt_timeout,
                        options.auth.as_ref(),
                    )
                    .await;
                if let Ok(response) = &result {
                    debug!(status = response.status_code(), "request completed");
                }
                result
            }
            .instrument(span)
            .await;

            match outcome {
                Ok(response) => {
                    if cache_enabled {
                        self.cache.insert(fingerprint, response.clone());
                    }
                    return Ok(Some(response));
                }
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(AttemptError::Protocol(error)) => {
                    if attempt == retries {
                        return Err(error);
                    }
                    let delay = self.retry_policy.backoff_for_attempt(attempt);
                    warn!(
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying request after http error status"
                    );
                    sleep(delay).await;
                }
                Err(AttemptError::Transport(error)) => {
                    if attempt == retries {
                        warn!(error = %error, "transport retries exhausted");
                        return Ok(None);
                    }
                    let delay = self.retry_policy.backoff_for_attempt(attempt);
                    warn!(
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying request after transport error"
                    );
                    sleep(delay).await;
                }
            }
        }

        Ok(None)
    }

    /// One attempt: the request plus sequential redirect following, all
    /// bounded by a single deadline.
    async fn perform_attempt(
        &self,
        method: &Method,
        mut url: Url,
        caller_headers: &HeaderMap,
        payload: Option<&RequestPayload>,
        per_attempt_timeout: Duration,
        auth: Option<&Auth>,
    ) -> Result<Response, AttemptError> {
        let deadline = Instant::now() + per_attempt_timeout;
        let mut hops_taken = 0_usize;

        loop {
            let url_text = url.to_string();
            let host = url
                .host_str()
                .ok_or_else(|| {
                    AttemptError::Fatal(Error::InvalidUrl {
                        url: url_text.clone(),
                    })
                })?
                .to_owned();
            let port = url.port().unwrap_or_else(|| default_port(url.scheme()));

            let request = self
                .build_attempt_request(method, &url, &host, port, caller_headers, payload, auth)
                .map_err(AttemptError::Fatal)?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AttemptError::Transport(Error::Timeout {
                    timeout_ms: per_attempt_timeout.as_millis(),
                    method: method.clone(),
                    url: url_text.clone(),
                }));
            }

            let mut connection = self
                .pool
                .acquire(&host, port, remaining)
                .await
                .map_err(|fault| {
                    AttemptError::Transport(fault.into_error(method, &url_text))
                })?;

            let exchange = timeout_at(deadline, async {
                let response = connection
                    .sender()
                    .send_request(request)
                    .await
                    .map_err(|error| TransportFault {
                        kind: classify_hyper_error(&error),
                        source: Box::new(error),
                    })?;
                let status = response.status();
                let headers = response.headers().clone();
                let body = read_all_body_limited(
                    response.into_body(),
                    self.max_response_body_bytes,
                )
                .await;
                Ok::<_, TransportFault>((status, headers, body))
            })
            .await;

            // A timed-out or failed exchange leaves the connection in an
            // unknown state; it is dropped instead of checked back in.
            let (status, mut response_headers, body_result) = match exchange {
                Err(_elapsed) => {
                    return Err(AttemptError::Transport(Error::Timeout {
                        timeout_ms: per_attempt_timeout.as_millis(),
                        method: method.clone(),
                        url: url_text.clone(),
                    }));
                }
                Ok(Err(fault)) => {
                    return Err(AttemptError::Transport(fault.into_error(method, &url_text)));
                }
                Ok(Ok(parts)) => parts,
            };
            let body = match body_result {
                Ok(body) => body,
                Err(ReadBodyError::Read(error)) => {
                    return Err(AttemptError::Transport(Error::Transport {
                        kind: classify_hyper_error(&error),
                        method: method.clone(),
                        url: url_text.clone(),
                        source: Box::new(error),
                    }));
                }
                Err(ReadBodyError::TooLarge { actual_bytes }) => {
                    return Err(AttemptError::Fatal(Error::ResponseBodyTooLarge {
                        limit_bytes: self.max_response_body_bytes,
                        actual_bytes,
                        method: method.clone(),
                        url: url_text.clone(),
                    }));
                }
            };

            self.pool.check_in(connection);

            match self
                .redirect_policy
                .next(method, &url, status, &response_headers, hops_taken)
                .map_err(AttemptError::Fatal)?
            {
                RedirectStep::Follow(next) => {
                    hops_taken += 1;
                    debug!(
                        status = status.as_u16(),
                        location = %next,
                        hop = hops_taken,
                        "following redirect"
                    );
                    url = next;
                    continue;
                }
                RedirectStep::Complete => {}
            }

            let text = decode_response_text(body, &response_headers, self.max_response_body_bytes)
                .map_err(|error| match error {
                    DecodeBodyError::ContentEncoding { encoding, message } => {
                        AttemptError::Transport(Error::DecodeContentEncoding {
                            encoding,
                            message,
                            method: method.clone(),
                            url: url_text.clone(),
                        })
                    }
                    DecodeBodyError::Text { message } => {
                        AttemptError::Transport(Error::DecodeText {
                            message,
                            method: method.clone(),
                            url: url_text.clone(),
                        })
                    }
                    DecodeBodyError::TooLarge { actual_bytes } => {
                        AttemptError::Fatal(Error::ResponseBodyTooLarge {
                            limit_bytes: self.max_response_body_bytes,
                            actual_bytes,
                            method: method.clone(),
                            url: url_text.clone(),
                        })
                    }
                })?;

            // The exposed body is already decoded, so the wire framing
            // headers would misdescribe it.
            if response_headers.contains_key(CONTENT_ENCODING) {
                response_headers.remove(CONTENT_ENCODING);
                response_headers.remove(CONTENT_LENGTH);
            }

            if status.as_u16() >= 400 {
                return Err(AttemptError::Protocol(protocol_error(
                    status,
                    method,
                    &url_text,
                    text,
                    response_headers,
                )));
            }

            let content_type = response_headers
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            return Ok(Response::new(status, text, response_headers, content_type));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_attempt_request(
        &self,
        method: &Method,
        url: &Url,
        host: &str,
        port: u16,
        caller_headers: &HeaderMap,
        payload: Option<&RequestPayload>,
        auth: Option<&Auth>,
    ) -> Result<http::Request<crate::body::ReqBody>, Error> {
        let mut headers = merge_headers(&self.default_headers, caller_headers);
        headers.insert(HOST, parse_header_value("host", &format!("{host}:{port}"))?);
        headers.insert(USER_AGENT, self.pick_user_agent()?);
        if let Some(auth) = auth {
            headers.insert(AUTHORIZATION, auth.header_value()?);
        }

        let body = match payload {
            None => Bytes::new(),
            Some(RequestPayload::Raw(bytes)) => bytes.clone(),
            Some(RequestPayload::Json(bytes)) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                bytes.clone()
            }
        };
        if !body.is_empty() {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
        }

        let target = origin_form_target(url)?;
        build_http_request(method.clone(), target, &headers, body)
    }

    fn pick_user_agent(&self) -> Result<HeaderValue, Error> {
        let index = if self.user_agents.len() > 1 {
            rand::rng().random_range(0..self.user_agents.len())
        } else {
            0
        };
        parse_header_value("user-agent", &self.user_agents[index])
    }
}

fn parse_request_url(url_text: &str) -> Result<Url, Error> {
    let parsed = Url::parse(url_text).map_err(|_| Error::InvalidUrl {
        url: url_text.to_owned(),
    })?;
    let scheme_supported = parsed.scheme().eq_ignore_ascii_case("http")
        || parsed.scheme().eq_ignore_ascii_case("https");
    if !scheme_supported || parsed.host_str().is_none() {
        return Err(Error::InvalidUrl {
            url: url_text.to_owned(),
        });
    }
    Ok(parsed)
}

fn protocol_error(
    status: StatusCode,
    method: &Method,
    url: &str,
    body: String,
    headers: HeaderMap,
) -> Error {
    Error::HttpStatus {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("").to_owned(),
        method: method.clone(),
        url: url.to_owned(),
        body,
        headers,
    }
}
