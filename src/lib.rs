//! An HTTP/1.1 client runtime with connection pooling, retries, redirect
//! following, and response caching.
//!
//! A [`Client`] owns a keyed connection pool, a bounded FIFO response cache,
//! and the retry and redirect policies every request runs under. Requests
//! are built fluently and dispatched with [`RequestBuilder::send`]:
//!
//! ```no_run
//! use apireq::{Auth, Client};
//!
//! #[tokio::main]
//! async fn main() -> apireq::Result<()> {
//!     let client = Client::builder()
//!         .default_timeout(std::time::Duration::from_secs(5))
//!         .build();
//!
//!     let outcome = client
//!         .get("http://api.example.com/items")
//!         .query_pair("page", "1")
//!         .auth(Auth::basic("user", "secret"))
//!         .send()
//!         .await?;
//!
//!     match outcome {
//!         Some(response) => println!("{} {}", response.status_code(), response.text()),
//!         None => eprintln!("transport retries exhausted"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Dispatch has a three-way outcome. `Ok(Some(response))` is a final
//! response with a status below 400. `Ok(None)` means every attempt failed
//! below the HTTP layer and the retry budget ran out. `Err(error)` covers
//! configuration problems, which fail fast without consuming an attempt, and
//! HTTP error statuses that survived the last attempt, reported as
//! [`Error::HttpStatus`] with the status, body, and headers attached.
//!
//! Successful responses are cached by a SHA-1 fingerprint of the request
//! (method, URL, headers, and body), so an identical request is answered
//! from memory without touching the network. Opt out per request with
//! [`RequestBuilder::use_cache`] or globally via
//! [`ClientBuilder::use_response_cache`].

mod auth;
mod body;
mod cache;
mod client;
mod connect;
mod decode;
mod error;
mod pool;
mod redirect;
mod request;
mod response;
mod retry;
mod util;

pub use auth::Auth;
pub use client::{Client, ClientBuilder};
pub use connect::{BoxedStream, ConnectFuture, ConnectionStream, Connector, Proxy, TcpConnector};
pub use error::{Error, ErrorCode, TransportErrorKind};
pub use request::RequestBuilder;
pub use response::{Response, XmlElement};
pub use retry::RetryPolicy;

pub type Result<T> = std::result::Result<T, Error>;
