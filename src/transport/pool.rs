//! Fixed-capacity pool of sockets to a single HSM endpoint
//!
//! The pool hands out at most `capacity` sockets at a time. Idle sockets are
//! reused while they are fresh; stale or dead ones are dropped and replaced by
//! dialing through the configured [`Dialer`].

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Anything the pool can hold: a bidirectional byte stream
pub trait PoolItem: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> PoolItem for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Pool errors
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,
    #[error("timed out after {0:?} waiting for a free connection")]
    Timeout(Duration),
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("dialing {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },
    #[error("failed to configure keep-alive: {0}")]
    KeepAlive(#[source] Arc<std::io::Error>),
}

impl PoolError {
    /// True for failures to establish a new socket, as opposed to pool usage errors
    pub fn is_dial_failure(&self) -> bool {
        matches!(
            self,
            PoolError::Dial { .. } | PoolError::DialTimeout { .. } | PoolError::KeepAlive(_)
        )
    }
}

/// Pool timing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Upper bound for establishing one TCP connection
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Idle sockets older than this are closed instead of reused
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Idle sockets are probed for liveness when last checked longer ago than this
    #[serde(default = "default_validation_interval_secs")]
    pub validation_interval_secs: u64,
    /// TCP keep-alive period applied to every dialed socket
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_validation_interval_secs() -> u64 {
    30
}

fn default_keep_alive_interval_secs() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            validation_interval_secs: default_validation_interval_secs(),
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
        }
    }
}

impl PoolConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn validation_interval(&self) -> Duration {
        Duration::from_secs(self.validation_interval_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }
}

/// Factory for new pool items
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Box<dyn PoolItem>, PoolError>;
}

/// Dials plain TCP with a timeout and enables keep-alive
#[derive(Debug, Clone)]
pub struct TcpDialer {
    dial_timeout: Duration,
    keep_alive: Duration,
}

impl TcpDialer {
    pub fn new(dial_timeout: Duration, keep_alive: Duration) -> Self {
        Self {
            dial_timeout,
            keep_alive,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.dial_timeout(), config.keep_alive_interval())
    }

    fn configure(&self, stream: &TcpStream) -> Result<(), PoolError> {
        stream
            .set_nodelay(true)
            .map_err(|e| PoolError::KeepAlive(Arc::new(e)))?;

        if !self.keep_alive.is_zero() {
            let keepalive = TcpKeepalive::new().with_time(self.keep_alive);
            SockRef::from(stream)
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| PoolError::KeepAlive(Arc::new(e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<Box<dyn PoolItem>, PoolError> {
        let stream = match tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(PoolError::Dial {
                    addr: addr.to_string(),
                    source: Arc::new(e),
                })
            }
            Err(_) => {
                return Err(PoolError::DialTimeout {
                    addr: addr.to_string(),
                    timeout: self.dial_timeout,
                })
            }
        };

        self.configure(&stream)?;
        debug!(addr, "Dialed new HSM socket");
        Ok(Box::new(stream))
    }
}

struct IdleEntry {
    item: Box<dyn PoolItem>,
    created_at: Instant,
    returned_at: Instant,
    validated_at: Instant,
}

/// A socket checked out of the pool
///
/// Hand it back with [`ConnectionPool::put`] after a clean round trip. Dropping
/// it instead discards the socket and frees its slot.
pub struct PooledConn {
    item: Box<dyn PoolItem>,
    created_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    pub fn stream(&mut self) -> &mut dyn PoolItem {
        self.item.as_mut()
    }

    /// Time since the underlying socket was dialed
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("age", &self.age())
            .finish()
    }
}

/// Fixed-capacity socket pool bound to one address
pub struct ConnectionPool {
    addr: String,
    capacity: u32,
    config: PoolConfig,
    dialer: Arc<dyn Dialer>,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<IdleEntry>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create a pool; a capacity of 0 is treated as 1
    pub fn new(
        capacity: u32,
        dialer: Arc<dyn Dialer>,
        addr: impl Into<String>,
        config: PoolConfig,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            addr: addr.into(),
            capacity,
            config,
            dialer,
            slots: Arc::new(Semaphore::new(capacity as usize)),
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of idle sockets ready for reuse
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Check out a socket, waiting as long as it takes for a free slot
    pub async fn get(&self) -> Result<PooledConn, PoolError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        self.checkout(permit).await
    }

    /// Check out a socket, giving up if no slot frees within `wait`
    pub async fn get_with_timeout(&self, wait: Duration) -> Result<PooledConn, PoolError> {
        let permit = match tokio::time::timeout(wait, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(PoolError::Timeout(wait)),
        };
        self.checkout(permit).await
    }

    /// Return a healthy socket for reuse
    pub fn put(&self, conn: PooledConn) {
        if self.is_closed() {
            return;
        }

        let now = Instant::now();
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(IdleEntry {
                item: conn.item,
                created_at: conn.created_at,
                returned_at: now,
                validated_at: now,
            });
        }
        // Slot permit is released when `conn._permit` drops here
    }

    /// Drop every idle socket and refuse further checkouts
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slots.close();
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
        debug!(addr = %self.addr, "Connection pool closed");
    }

    async fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<PooledConn, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        while let Some(mut entry) = self.pop_idle() {
            if entry.returned_at.elapsed() > self.config.idle_timeout() {
                debug!(addr = %self.addr, "Dropping idle socket past idle timeout");
                continue;
            }
            if entry.validated_at.elapsed() >= self.config.validation_interval() {
                if !probe_alive(entry.item.as_mut()) {
                    warn!(addr = %self.addr, "Dropping idle socket closed by peer");
                    continue;
                }
                entry.validated_at = Instant::now();
            }
            return Ok(PooledConn {
                item: entry.item,
                created_at: entry.created_at,
                _permit: permit,
            });
        }

        let item = self.dialer.dial(&self.addr).await?;
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        Ok(PooledConn {
            item,
            created_at: Instant::now(),
            _permit: permit,
        })
    }

    fn pop_idle(&self) -> Option<IdleEntry> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.addr)
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Non-blocking liveness probe for an idle socket
///
/// An idle HSM socket has nothing to read; a pending read means the peer is
/// still there. EOF, an error or unsolicited bytes all mean the socket is unusable.
fn probe_alive(item: &mut dyn PoolItem) -> bool {
    let mut buf = [0u8; 1];
    item.read(&mut buf).now_or_never().is_none()
}
