//! Client pool with lazy creation, bounded capacity, and TTL expiry.
//!
//! The pool hands out [`PooledClient`]s: a client plus an expiry stamp and
//! a handle to the pool's return channel. Closing an unexpired pooled
//! client returns it for reuse; closing an expired one really closes the
//! inner client. Capacity bounds the number of idle clients, not the
//! number in flight.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use fastgate::{simple_client_factory, ClientPool};
//! use fastgate::transport::simple_conn_factory;
//!
//! let factory = simple_client_factory(simple_conn_factory("tcp", "127.0.0.1:9000"), 0);
//! let pool = ClientPool::new(factory, 8, Duration::from_secs(30));
//! let client = pool.create_client().await?;
//! // ... use it ...
//! client.close().await; // back to the pool
//! ```

use std::ops::Deref;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};

use crate::client::{Client, ClientFactory};
use crate::error::Result;

/// Pool of reusable FastCGI clients for one endpoint.
pub struct ClientPool {
    factory: ClientFactory,
    return_tx: mpsc::Sender<PooledClient>,
    return_rx: Mutex<mpsc::Receiver<PooledClient>>,
    ttl: Duration,
}

impl ClientPool {
    /// Create a pool holding at most `capacity` idle clients, each living
    /// at most `ttl` past its creation.
    pub fn new(factory: ClientFactory, capacity: usize, ttl: Duration) -> Self {
        let (return_tx, return_rx) = mpsc::channel(capacity.max(1));
        Self {
            factory,
            return_tx,
            return_rx: Mutex::new(return_rx),
            ttl,
        }
    }

    /// Get a client: a live idle one from the pool, or a fresh one from
    /// the factory. Expired or broken idle clients are discarded on the
    /// way.
    pub async fn create_client(&self) -> Result<PooledClient> {
        {
            let mut rx = self.return_rx.lock().await;
            while let Ok(pooled) = rx.try_recv() {
                if pooled.expired() || pooled.client.is_closed() {
                    tracing::debug!("discarding expired idle client");
                    pooled.client.close().await;
                    continue;
                }
                return Ok(pooled);
            }
        }

        let client = (self.factory)().await?;
        Ok(PooledClient {
            client,
            expires_at: Instant::now() + self.ttl,
            return_tx: self.return_tx.clone(),
        })
    }
}

/// A [`Client`] checked out of a [`ClientPool`].
///
/// Derefs to [`Client`]; use [`PooledClient::close`] instead of the inner
/// client's `close` so the client can be reused.
pub struct PooledClient {
    client: Client,
    expires_at: Instant,
    return_tx: mpsc::Sender<PooledClient>,
}

impl PooledClient {
    /// Whether the client has outlived its TTL.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Access the inner client (also available through `Deref`).
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Return the client to the pool, or really close it when it expired,
    /// broke, or the pool already holds `capacity` idle clients.
    pub async fn close(self) {
        if self.expired() || self.client.is_closed() {
            self.client.close().await;
            return;
        }
        let tx = self.return_tx.clone();
        match tx.try_send(self) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(pooled))
            | Err(mpsc::error::TrySendError::Closed(pooled)) => {
                pooled.client.close().await;
            }
        }
    }
}

impl Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Factory over in-memory streams that counts how often it runs.
    fn counting_factory() -> (ClientFactory, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let factory: ClientFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let (local, remote) = tokio::io::duplex(4096);
                // Keep the far end alive so the client stays healthy.
                tokio::spawn(async move {
                    let mut remote = remote;
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = tokio::io::AsyncReadExt::read(&mut remote, &mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
                Ok(Client::new(local, 4))
            })
        });
        (factory, count)
    }

    #[tokio::test]
    async fn test_returned_client_is_reused() {
        let (factory, count) = counting_factory();
        let pool = ClientPool::new(factory, 4, Duration::from_secs(60));

        let client = pool.create_client().await.unwrap();
        client.close().await;
        let _again = pool.create_client().await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_client_is_not_reused() {
        let (factory, count) = counting_factory();
        let pool = ClientPool::new(factory, 4, Duration::from_millis(10));

        let client = pool.create_client().await.unwrap();
        client.close().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _fresh = pool.create_client().await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_capacity_bounds_idle_clients() {
        let (factory, _count) = counting_factory();
        let pool = ClientPool::new(factory, 1, Duration::from_secs(60));

        let a = pool.create_client().await.unwrap();
        let b = pool.create_client().await.unwrap();

        // Only one slot: the second return really closes its client.
        a.close().await;
        b.close().await;

        let reused = pool.create_client().await.unwrap();
        assert!(!reused.is_closed());
    }

    #[tokio::test]
    async fn test_broken_client_is_not_returned() {
        let (factory, count) = counting_factory();
        let pool = ClientPool::new(factory, 4, Duration::from_secs(60));

        let client = pool.create_client().await.unwrap();
        client.client().close().await; // break it behind the pool's back
        client.close().await;

        let _fresh = pool.create_client().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_factory_error_propagates() {
        let factory: ClientFactory = Arc::new(|| {
            Box::pin(async {
                Err(crate::FastgateError::Connect {
                    address: "tcp!127.0.0.1:1".into(),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                })
            })
        });
        let pool = ClientPool::new(factory, 4, Duration::from_secs(60));
        assert!(pool.create_client().await.is_err());
    }
}
