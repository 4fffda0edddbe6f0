//! Transport layer between the connection manager and the HSM endpoint
//!
//! A [`Link`] is one pool plus the broker that multiplexes commands over it.
//! The connection manager never touches sockets directly: it asks a
//! [`LinkFactory`] for a fresh link, probes it with [`Broker::start`] and
//! watches [`Broker::run`] for the moment it dies.

pub mod broker;
pub mod codec;
pub mod pool;

pub use broker::{BrokerConfig, BrokerError, CommandBroker};
pub use codec::FrameError;
pub use pool::{ConnectionPool, Dialer, PoolConfig, PoolError, TcpDialer};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Request/response engine sitting on top of a connection pool
///
/// This trait is the seam the connection manager is written against, so tests
/// can substitute scripted brokers for the TCP-backed [`CommandBroker`].
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Readiness probe: spawn workers and prove one socket can be obtained
    async fn start(&self) -> Result<(), BrokerError>;

    /// Block until the broker stops
    ///
    /// Always returns an error: [`BrokerError::Quit`] after a deliberate
    /// [`Broker::close`], the fatal cause otherwise.
    async fn run(&self) -> Result<(), BrokerError>;

    /// Submit one command and wait for its response
    async fn send(&self, command: &[u8]) -> Result<Vec<u8>, BrokerError>;

    /// Submit one command, giving up after `timeout`
    async fn send_timeout(&self, command: &[u8], timeout: Duration) -> Result<Vec<u8>, BrokerError>;

    /// Stop the broker; idempotent
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Settings used to build every link
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LinkSettings {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// A pool and its broker, created and torn down together
#[derive(Clone)]
pub struct Link {
    id: u64,
    broker: Arc<dyn Broker>,
    pool: Arc<ConnectionPool>,
}

impl Link {
    pub fn new(broker: Arc<dyn Broker>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            broker,
            pool,
        }
    }

    /// Process-unique identity, used to tell a live link from a replaced one
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Close the pool first, then the broker
    pub fn close(&self) {
        self.pool.close();
        self.broker.close();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("addr", &self.pool.addr())
            .field("capacity", &self.pool.capacity())
            .field("closed", &self.broker.is_closed())
            .finish()
    }
}

/// Builds links to an endpoint
pub trait LinkFactory: Send + Sync {
    fn create(
        &self,
        addr: &str,
        capacity: u32,
        settings: &LinkSettings,
    ) -> Result<Link, BrokerError>;
}

/// Production factory: TCP dialer, one pool, one [`CommandBroker`]
#[derive(Debug, Default, Clone)]
pub struct TcpLinkFactory;

impl LinkFactory for TcpLinkFactory {
    fn create(
        &self,
        addr: &str,
        capacity: u32,
        settings: &LinkSettings,
    ) -> Result<Link, BrokerError> {
        if addr.is_empty() {
            return Err(BrokerError::Setup("empty endpoint address".to_string()));
        }

        let dialer = Arc::new(TcpDialer::from_config(&settings.pool));
        let pool = Arc::new(ConnectionPool::new(
            capacity,
            dialer,
            addr,
            settings.pool.clone(),
        ));
        let broker = CommandBroker::new(
            vec![pool.clone()],
            settings.broker.worker_count,
            settings.broker.clone(),
        );

        Ok(Link::new(Arc::new(broker), pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_ids_are_unique() {
        let factory = TcpLinkFactory;
        let settings = LinkSettings::default();

        let a = factory.create("127.0.0.1:1500", 2, &settings).unwrap();
        let b = factory.create("127.0.0.1:1500", 2, &settings).unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.pool().capacity(), 2);
        assert_eq!(a.pool().addr(), "127.0.0.1:1500");
    }

    #[test]
    fn test_factory_rejects_empty_address() {
        let result = TcpLinkFactory.create("", 1, &LinkSettings::default());
        assert!(matches!(result, Err(BrokerError::Setup(_))));
    }

    #[tokio::test]
    async fn test_close_shuts_pool_and_broker() {
        let link = TcpLinkFactory
            .create("127.0.0.1:1500", 1, &LinkSettings::default())
            .unwrap();

        link.close();

        assert!(link.pool().is_closed());
        assert!(link.broker().is_closed());
    }

    #[tokio::test]
    async fn test_start_against_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let link = TcpLinkFactory
            .create(&addr, 1, &LinkSettings::default())
            .unwrap();

        link.broker().start().await.unwrap();
        assert_eq!(link.pool().idle_count(), 1);
        link.close();
    }
}
