use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const MAX_TUNNEL_RESPONSE_BYTES: usize = 8 * 1024;

/// Byte stream a pooled connection runs over.
pub trait ConnectionStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ConnectionStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn ConnectionStream>;

pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send>>;

/// Dials the transport a pooled connection runs over.
///
/// The pool only sees this trait, so tests swap in connectors backed by
/// in-memory streams and call counters.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str, port: u16, connect_timeout: Duration) -> ConnectFuture;
}

/// Upstream proxy endpoint, reached via HTTP `CONNECT`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Default connector: plain TCP, optionally tunneled through a proxy.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    proxy: Option<Proxy>,
}

impl TcpConnector {
    pub fn new(proxy: Option<Proxy>) -> Self {
        Self { proxy }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, host: &str, port: u16, connect_timeout: Duration) -> ConnectFuture {
        let host = host.to_owned();
        let proxy = self.proxy.clone();

        Box::pin(async move {
            let stream = match proxy {
                Some(proxy) => {
                    debug!(
                        proxy_host = %proxy.host,
                        proxy_port = proxy.port,
                        target_host = %host,
                        target_port = port,
                        "tunneling through proxy"
                    );
                    let mut stream =
                        dial(&proxy.host, proxy.port, connect_timeout).await?;
                    establish_tunnel(&mut stream, &host, port, connect_timeout).await?;
                    stream
                }
                None => dial(&host, port, connect_timeout).await?,
            };
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

async fn dial(host: &str, port: u16, connect_timeout: Duration) -> io::Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {host}:{port} timed out"),
        )),
    }
}

/// Perform the `CONNECT` handshake on an open proxy connection.
async fn establish_tunnel(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    handshake_timeout: Duration,
) -> io::Result<()> {
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");

    let handshake = async {
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut response = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "proxy closed the connection during CONNECT",
                ));
            }
            response.extend_from_slice(&chunk[..read]);
            if response.windows(4).any(|window| window == b"\r\n\r\n") {
                break;
            }
            if response.len() > MAX_TUNNEL_RESPONSE_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "oversized CONNECT response from proxy",
                ));
            }
        }

        let head = String::from_utf8_lossy(&response);
        let status_line = head.lines().next().unwrap_or_default();
        let accepted = status_line
            .split_whitespace()
            .nth(1)
            .is_some_and(|status| status.starts_with('2'));
        if accepted {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("proxy refused CONNECT: {status_line}"),
            ))
        }
    };

    match timeout(handshake_timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("CONNECT handshake with proxy for {host}:{port} timed out"),
        )),
    }
}
