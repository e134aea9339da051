use http::header::LOCATION;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::Error;

/// What to do with a response once its status and headers are known.
#[derive(Debug)]
pub(crate) enum RedirectStep {
    /// Fetch the resolved URL next.
    Follow(Url),
    /// The response is final; stop following.
    Complete,
}

/// Decides whether a response redirects and where to, enforcing the hop cap.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RedirectPolicy {
    max_redirects: usize,
}

impl RedirectPolicy {
    pub(crate) fn new(max_redirects: usize) -> Self {
        Self { max_redirects }
    }

    /// Evaluate a response at hop `hops_taken` (hops already followed).
    ///
    /// A 3xx status without a `Location` header is treated as final rather
    /// than an error. Exceeding the cap raises `RedirectLimitExceeded`; this
    /// runtime never silently hands back an intermediate 3xx response.
    pub(crate) fn next(
        &self,
        method: &Method,
        current: &Url,
        status: StatusCode,
        headers: &HeaderMap,
        hops_taken: usize,
    ) -> Result<RedirectStep, Error> {
        if !status.is_redirection() {
            return Ok(RedirectStep::Complete);
        }
        let Some(location) = headers.get(LOCATION).and_then(|value| value.to_str().ok()) else {
            return Ok(RedirectStep::Complete);
        };

        if hops_taken + 1 > self.max_redirects {
            return Err(Error::RedirectLimitExceeded {
                max_redirects: self.max_redirects,
                method: method.clone(),
                url: current.to_string(),
            });
        }

        let next = resolve_location(current, location).ok_or_else(|| {
            Error::InvalidRedirectLocation {
                location: location.to_owned(),
                method: method.clone(),
                url: current.to_string(),
            }
        })?;
        Ok(RedirectStep::Follow(next))
    }
}

/// Resolve a `Location` header value against the URL that produced it.
///
/// Absolute `http(s)` locations are taken as-is; anything else resolves with
/// standard relative-reference semantics, never naive concatenation.
pub(crate) fn resolve_location(current: &Url, location: &str) -> Option<Url> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Url::parse(location).ok();
    }
    current.join(location).ok()
}
