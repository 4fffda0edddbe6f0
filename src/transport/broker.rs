//! Command broker multiplexing requests over pooled sockets
//!
//! Callers enqueue opaque command payloads; a fixed set of workers pulls them
//! off a bounded queue, claims a socket from one of the pools, performs one
//! framed write/read round trip and hands the response back. A failure to dial
//! the endpoint is fatal and ends [`Broker::run`] with that error.

use super::codec::{read_frame, write_frame, FrameError};
use super::pool::{ConnectionPool, PoolError};
use super::Broker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Broker errors
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Returned by `run` after a deliberate `close`
    #[error("broker shut down")]
    Quit,
    #[error("broker is closed")]
    Closed,
    #[error("broker has no connection pools")]
    NoPools,
    #[error("failed to create broker: {0}")]
    Setup(String),
    #[error("transport failure: {0}")]
    Transport(#[from] PoolError),
    #[error("frame exchange failed: {0}")]
    Frame(#[from] FrameError),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("request was dropped before a response arrived")]
    Dropped,
}

impl BrokerError {
    /// Failures that mean the endpoint itself is unreachable
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Transport(e) if e.is_dial_failure())
    }

    /// The sentinel for a deliberate shutdown
    pub fn is_quit(&self) -> bool {
        matches!(self, BrokerError::Quit)
    }
}

/// Broker tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Number of worker tasks draining the request queue
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Pending requests the queue holds before `send` waits for room
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_worker_count() -> usize {
    3
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_queue_size() -> usize {
    64
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            write_timeout_ms: default_write_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            queue_size: default_queue_size(),
        }
    }
}

impl BrokerConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone)]
enum BrokerStatus {
    Running,
    Quit,
    Failed(BrokerError),
}

impl BrokerStatus {
    fn is_running(&self) -> bool {
        matches!(self, BrokerStatus::Running)
    }

    fn as_error(&self) -> Option<BrokerError> {
        match self {
            BrokerStatus::Running => None,
            BrokerStatus::Quit => Some(BrokerError::Quit),
            BrokerStatus::Failed(e) => Some(e.clone()),
        }
    }
}

struct Request {
    payload: Vec<u8>,
    reply: oneshot::Sender<Result<Vec<u8>, BrokerError>>,
}

struct BrokerInner {
    pools: Vec<Arc<ConnectionPool>>,
    config: BrokerConfig,
    queue_tx: mpsc::Sender<Request>,
    queue_rx: Mutex<mpsc::Receiver<Request>>,
    next_pool: AtomicUsize,
    status: watch::Sender<BrokerStatus>,
}

impl BrokerInner {
    fn is_running(&self) -> bool {
        self.status.borrow().is_running()
    }

    fn fail(&self, err: BrokerError) {
        let changed = self.status.send_if_modified(|status| {
            if status.is_running() {
                *status = BrokerStatus::Failed(err.clone());
                true
            } else {
                false
            }
        });
        if changed {
            error!(error = %err, "Broker hit a fatal transport error");
        }
    }

    fn quit(&self) -> bool {
        self.status.send_if_modified(|status| {
            if status.is_running() {
                *status = BrokerStatus::Quit;
                true
            } else {
                false
            }
        })
    }

    fn pick_pool(&self) -> Result<&Arc<ConnectionPool>, BrokerError> {
        if self.pools.is_empty() {
            return Err(BrokerError::NoPools);
        }
        let index = self.next_pool.fetch_add(1, Ordering::Relaxed) % self.pools.len();
        Ok(&self.pools[index])
    }

    async fn round_trip(&self, payload: &[u8]) -> Result<Vec<u8>, BrokerError> {
        let pool = self.pick_pool()?;
        let mut conn = pool.get().await?;

        let write_timeout = self.config.write_timeout();
        match tokio::time::timeout(write_timeout, write_frame(conn.stream(), payload)).await {
            Ok(result) => result?,
            Err(_) => return Err(BrokerError::WriteTimeout(write_timeout)),
        }

        let read_timeout = self.config.read_timeout();
        let response = match tokio::time::timeout(read_timeout, read_frame(conn.stream())).await {
            Ok(result) => result?,
            Err(_) => return Err(BrokerError::ReadTimeout(read_timeout)),
        };

        pool.put(conn);
        Ok(response)
    }

    async fn next_request(&self) -> Option<Request> {
        self.queue_rx.lock().await.recv().await
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Broker worker started");
        let mut status_rx = self.status.subscribe();

        loop {
            let request = tokio::select! {
                _ = status_rx.wait_for(|s| !s.is_running()) => break,
                request = self.next_request() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let result = self.round_trip(&request.payload).await;
            let fatal = match &result {
                Err(e) if e.is_fatal() => Some(e.clone()),
                Err(e) => {
                    warn!(worker_id, error = %e, "Command round trip failed");
                    None
                }
                Ok(_) => None,
            };

            // Reply before failing the broker so the caller sees the real cause
            let _ = request.reply.send(result);
            if let Some(err) = fatal {
                self.fail(err);
                break;
            }
        }

        debug!(worker_id, "Broker worker stopped");
    }
}

/// Queue-and-workers broker over one or more connection pools
pub struct CommandBroker {
    inner: Arc<BrokerInner>,
    worker_count: usize,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl CommandBroker {
    /// Build a broker; workers are spawned lazily by `start`/`run`
    pub fn new(pools: Vec<Arc<ConnectionPool>>, worker_count: usize, config: BrokerConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));
        let (status, _) = watch::channel(BrokerStatus::Running);

        Self {
            inner: Arc::new(BrokerInner {
                pools,
                config,
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
                next_pool: AtomicUsize::new(0),
                status,
            }),
            worker_count: worker_count.max(1),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn pools(&self) -> &[Arc<ConnectionPool>] {
        &self.inner.pools
    }

    fn spawn_workers(&self) {
        let Ok(mut workers) = self.workers.lock() else {
            return;
        };
        if !workers.is_empty() || !self.inner.is_running() {
            return;
        }
        for worker_id in 0..self.worker_count {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(inner.worker_loop(worker_id)));
        }
    }

    fn abort_workers(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl Broker for CommandBroker {
    async fn start(&self) -> Result<(), BrokerError> {
        let stopped = self.inner.status.borrow().as_error();
        if let Some(err) = stopped {
            return Err(if err.is_quit() { BrokerError::Closed } else { err });
        }
        self.spawn_workers();

        let pool = self.inner.pools.first().ok_or(BrokerError::NoPools)?;
        match pool.get().await {
            Ok(conn) => {
                pool.put(conn);
                Ok(())
            }
            Err(e) => {
                let err = BrokerError::from(e);
                if err.is_fatal() {
                    self.inner.fail(err.clone());
                }
                Err(err)
            }
        }
    }

    async fn run(&self) -> Result<(), BrokerError> {
        self.spawn_workers();

        let mut status_rx = self.inner.status.subscribe();
        let outcome = status_rx
            .wait_for(|s| !s.is_running())
            .await
            .ok()
            .and_then(|status| status.as_error())
            .unwrap_or(BrokerError::Quit);
        self.abort_workers();
        Err(outcome)
    }

    async fn send(&self, command: &[u8]) -> Result<Vec<u8>, BrokerError> {
        if !self.inner.is_running() {
            return Err(BrokerError::Closed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request {
            payload: command.to_vec(),
            reply: reply_tx,
        };
        self.inner
            .queue_tx
            .send(request)
            .await
            .map_err(|_| BrokerError::Closed)?;

        let mut status_rx = self.inner.status.subscribe();
        tokio::select! {
            biased;
            reply = reply_rx => reply.unwrap_or(Err(BrokerError::Dropped)),
            status = status_rx.wait_for(|s| !s.is_running()) => {
                let stopped = status.ok().and_then(|s| s.as_error());
                match stopped {
                    Some(BrokerError::Quit) | None => Err(BrokerError::Closed),
                    Some(err) => Err(err),
                }
            }
        }
    }

    async fn send_timeout(
        &self,
        command: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, BrokerError> {
        tokio::time::timeout(timeout, self.send(command))
            .await
            .map_err(|_| BrokerError::Timeout(timeout))?
    }

    fn close(&self) {
        if self.inner.quit() {
            debug!("Broker closed");
        }
        self.abort_workers();
    }

    fn is_closed(&self) -> bool {
        !self.inner.is_running()
    }
}

impl Drop for CommandBroker {
    fn drop(&mut self) {
        self.inner.quit();
        self.abort_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pool::{Dialer, PoolConfig, PoolItem};

    /// Dialer whose far ends are served by an in-process echo loop
    #[derive(Default)]
    struct EchoDialer {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for EchoDialer {
        async fn dial(&self, _addr: &str) -> Result<Box<dyn PoolItem>, PoolError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (near, mut far) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                while let Ok(frame) = read_frame(&mut far).await {
                    if write_frame(&mut far, &frame).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(near))
        }
    }

    struct RefusingDialer;

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, addr: &str) -> Result<Box<dyn PoolItem>, PoolError> {
            Err(PoolError::Dial {
                addr: addr.to_string(),
                source: Arc::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)),
            })
        }
    }

    /// Dialer whose peer accepts frames but never answers
    struct SilentDialer;

    #[async_trait]
    impl Dialer for SilentDialer {
        async fn dial(&self, _addr: &str) -> Result<Box<dyn PoolItem>, PoolError> {
            let (near, far) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(far);
            });
            Ok(Box::new(near))
        }
    }

    fn broker_with(dialer: Arc<dyn Dialer>, capacity: u32, config: BrokerConfig) -> CommandBroker {
        let pool = Arc::new(ConnectionPool::new(
            capacity,
            dialer,
            "hsm:1500",
            PoolConfig::default(),
        ));
        CommandBroker::new(vec![pool], 3, config)
    }

    #[test]
    fn test_broker_config_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.write_timeout(), Duration::from_secs(5));
        assert_eq!(config.read_timeout(), Duration::from_secs(5));
        assert_eq!(config.queue_size, 64);
    }

    #[test]
    fn test_only_dial_failures_are_fatal() {
        let dial = BrokerError::Transport(PoolError::DialTimeout {
            addr: "hsm:1500".to_string(),
            timeout: Duration::from_secs(1),
        });
        assert!(dial.is_fatal());
        assert!(!BrokerError::Transport(PoolError::Closed).is_fatal());
        assert!(!BrokerError::ReadTimeout(Duration::from_secs(1)).is_fatal());
        assert!(BrokerError::Quit.is_quit());
    }

    #[tokio::test]
    async fn test_start_then_send_echoes() {
        let dialer = Arc::new(EchoDialer::default());
        let broker = broker_with(dialer.clone(), 1, BrokerConfig::default());

        broker.start().await.unwrap();
        let response = broker.send(b"0000NC").await.unwrap();

        assert_eq!(response, b"0000NC".to_vec());
        // The readiness probe's socket is reused by the first command
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_fails_when_endpoint_refuses() {
        let broker = broker_with(Arc::new(RefusingDialer), 1, BrokerConfig::default());

        let err = broker.start().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(broker.is_closed());
    }

    #[tokio::test]
    async fn test_run_returns_quit_after_close() {
        let broker = Arc::new(broker_with(
            Arc::new(EchoDialer::default()),
            1,
            BrokerConfig::default(),
        ));
        let runner = broker.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.close();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(BrokerError::Quit)));
    }

    #[tokio::test]
    async fn test_run_surfaces_fatal_dial_failure() {
        let broker = Arc::new(broker_with(
            Arc::new(RefusingDialer),
            1,
            BrokerConfig::default(),
        ));
        let runner = broker.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let send_result = broker.send(b"NC").await;
        assert!(matches!(send_result, Err(BrokerError::Transport(_))));

        let run_result = handle.await.unwrap();
        assert!(matches!(run_result, Err(e) if e.is_fatal()));
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let broker = broker_with(Arc::new(EchoDialer::default()), 1, BrokerConfig::default());
        broker.close();

        assert!(matches!(broker.send(b"NC").await, Err(BrokerError::Closed)));
        assert!(matches!(broker.start().await, Err(BrokerError::Closed)));
    }

    #[tokio::test]
    async fn test_read_timeout_is_not_fatal() {
        let config = BrokerConfig {
            read_timeout_ms: 30,
            ..Default::default()
        };
        let broker = broker_with(Arc::new(SilentDialer), 1, config);
        broker.start().await.unwrap();

        let result = broker.send(b"NC").await;
        assert!(matches!(result, Err(BrokerError::ReadTimeout(_))));
        assert!(!broker.is_closed());
    }

    #[tokio::test]
    async fn test_send_timeout_bounds_the_wait() {
        let broker = broker_with(Arc::new(SilentDialer), 1, BrokerConfig::default());
        broker.start().await.unwrap();

        let result = broker.send_timeout(b"NC", Duration::from_millis(30)).await;
        assert!(matches!(result, Err(BrokerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_concurrent_sends_get_their_own_responses() {
        let broker = Arc::new(broker_with(
            Arc::new(EchoDialer::default()),
            3,
            BrokerConfig::default(),
        ));
        broker.start().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..30 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                let payload = format!("REQ-{i:03}").into_bytes();
                let response = broker.send(&payload).await.unwrap();
                (payload, response)
            }));
        }

        for handle in handles {
            let (payload, response) = handle.await.unwrap();
            assert_eq!(payload, response);
        }
    }
}
