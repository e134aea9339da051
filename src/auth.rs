use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http::header::HeaderValue;

use crate::error::Error;
use crate::util::parse_header_value;

/// Credentials attached to a request.
///
/// Each supported scheme is a variant carrying exactly the fields it needs,
/// so an unsupported scheme cannot be expressed at all.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Auth {
    Basic { username: String, password: String },
}

impl Auth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The `Authorization` header value for these credentials.
    pub fn header_value(&self) -> Result<HeaderValue, Error> {
        match self {
            Self::Basic { username, password } => {
                let encoded = BASE64.encode(format!("{username}:{password}"));
                let mut value = parse_header_value("authorization", &format!("Basic {encoded}"))?;
                value.set_sensitive(true);
                Ok(value)
            }
        }
    }
}
