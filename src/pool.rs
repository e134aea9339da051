use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tracing::{debug, trace};

use crate::body::ReqBody;
use crate::connect::Connector;
use crate::error::{classify_hyper_error, classify_io_error, TransportFault};
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}:{}", self.host, self.port)
    }
}

/// A checked-out HTTP/1.1 connection.
///
/// Holds the request sender plus the handle of the task driving the
/// connection I/O. Dropping the sender lets the driver wind down on its own;
/// `close` aborts it outright.
pub(crate) struct PooledConnection {
    key: PoolKey,
    sender: http1::SendRequest<ReqBody>,
    driver: tokio::task::JoinHandle<()>,
}

impl PooledConnection {
    pub(crate) fn sender(&mut self) -> &mut http1::SendRequest<ReqBody> {
        &mut self.sender
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn close(self) {
        self.driver.abort();
    }
}

/// Keyed cache of live connections, at most one per `(host, port)`.
///
/// Connections are borrowed: `acquire` removes the entry (or dials a new
/// one), `check_in` returns it after a clean exchange. A connection that hit
/// a transport error is simply never checked back in. The map lock is held
/// only for map operations, never across an await.
pub(crate) struct ConnectionPool {
    connector: Arc<dyn Connector>,
    entries: Mutex<HashMap<PoolKey, PooledConnection>>,
}

impl ConnectionPool {
    pub(crate) fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn acquire(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<PooledConnection, TransportFault> {
        let key = PoolKey {
            host: host.to_owned(),
            port,
        };

        // Take the entry out under the lock, then drop the guard before the
        // readiness check awaits.
        let existing = lock_unpoisoned(&self.entries).remove(&key);
        if let Some(mut pooled) = existing {
            if !pooled.is_closed() && pooled.sender.ready().await.is_ok() {
                trace!(key = %key, "reusing pooled connection");
                return Ok(pooled);
            }
            debug!(key = %key, "evicting dead pooled connection");
            pooled.close();
        }

        let stream = self
            .connector
            .connect(host, port, connect_timeout)
            .await
            .map_err(|error| TransportFault {
                kind: classify_io_error(&error),
                source: Box::new(error),
            })?;
        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|error| TransportFault {
                kind: classify_hyper_error(&error),
                source: Box::new(error),
            })?;
        let driver_key = key.clone();
        let driver = tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!(key = %driver_key, error = %error, "pooled connection closed with error");
            }
        });
        debug!(key = %key, "opened new connection");

        Ok(PooledConnection {
            key,
            sender,
            driver,
        })
    }

    /// Return a connection after a clean exchange. If another connection for
    /// the same key was pooled in the meantime, the surplus one is closed to
    /// keep the one-entry-per-key invariant.
    pub(crate) fn check_in(&self, pooled: PooledConnection) {
        if pooled.is_closed() {
            return;
        }
        let mut entries = lock_unpoisoned(&self.entries);
        if entries.contains_key(&pooled.key) {
            drop(entries);
            pooled.close();
            return;
        }
        entries.insert(pooled.key.clone(), pooled);
    }

    /// Close every pooled connection and empty the map. Idempotent.
    pub(crate) fn close_all(&self) {
        let drained: Vec<PooledConnection> = {
            let mut entries = lock_unpoisoned(&self.entries);
            entries.drain().map(|(_, pooled)| pooled).collect()
        };
        for pooled in drained {
            pooled.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled_count(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close_all();
    }
}
