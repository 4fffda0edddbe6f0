//! Scriptable brokers, link factories and an in-process echo HSM
//!
//! These let the connection manager be driven through failure scenarios
//! without a real device: brokers that refuse to start, run loops that die on
//! demand, and a TCP server that can be killed and brought back on the same
//! port.

use crate::transport::codec::{read_frame, write_frame};
use crate::transport::pool::PoolItem;
use crate::transport::{
    Broker, BrokerError, ConnectionPool, Dialer, Link, LinkFactory, LinkSettings, PoolError,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn refused(addr: &str) -> PoolError {
    PoolError::Dial {
        addr: addr.to_string(),
        source: Arc::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)),
    }
}

/// Dialer for pools that exist only to satisfy [`Link`]
struct NullDialer;

#[async_trait]
impl Dialer for NullDialer {
    async fn dial(&self, addr: &str) -> Result<Box<dyn PoolItem>, PoolError> {
        Err(refused(addr))
    }
}

/// Broker that echoes commands and fails when told to
#[derive(Debug)]
pub struct MockBroker {
    addr: String,
    start_error: Option<BrokerError>,
    trip_on_run: bool,
    latency: Option<Duration>,
    stopped: watch::Sender<Option<BrokerError>>,
    started: AtomicBool,
    sends: AtomicUsize,
}

impl MockBroker {
    pub fn new(addr: &str) -> Self {
        let (stopped, _) = watch::channel(None);
        Self {
            addr: addr.to_string(),
            start_error: None,
            trip_on_run: false,
            latency: None,
            stopped,
            started: AtomicBool::new(false),
            sends: AtomicUsize::new(0),
        }
    }

    /// `start` will fail with a dial error
    pub fn failing_start(mut self) -> Self {
        self.start_error = Some(BrokerError::Transport(refused(&self.addr)));
        self
    }

    /// `run` will fail as soon as it is called
    pub fn tripping_on_run(mut self) -> Self {
        self.trip_on_run = true;
        self
    }

    /// Each `send` sleeps this long before echoing
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Simulate the run loop dying on a transport failure
    pub fn trip(&self) {
        let err = BrokerError::Transport(refused(&self.addr));
        self.stopped.send_if_modified(|stopped| {
            if stopped.is_none() {
                *stopped = Some(err.clone());
                true
            } else {
                false
            }
        });
    }

    pub fn was_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn start(&self) -> Result<(), BrokerError> {
        if let Some(err) = &self.start_error {
            return Err(err.clone());
        }
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run(&self) -> Result<(), BrokerError> {
        if self.trip_on_run {
            self.trip();
        }
        let mut stopped = self.stopped.subscribe();
        let outcome = stopped
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|stopped| (*stopped).clone())
            .unwrap_or(BrokerError::Quit);
        Err(outcome)
    }

    async fn send(&self, command: &[u8]) -> Result<Vec<u8>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        self.sends.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(command.to_vec())
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
        self.stopped.send_if_modified(|stopped| {
            if stopped.is_none() {
                *stopped = Some(BrokerError::Quit);
                true
            } else {
                false
            }
        });
    }

    fn is_closed(&self) -> bool {
        self.stopped.borrow().is_some()
    }
}

/// Link factory handing out [`MockBroker`]s according to a script
///
/// Scripts are expressed over the sequence of `create` calls, counting from 0
/// and including calls that fail.
#[derive(Default)]
pub struct ScriptedLinkFactory {
    failing_starts: Range<usize>,
    failing_creates: Range<usize>,
    trip_on_run: bool,
    latency: Option<Duration>,
    creates: AtomicUsize,
    brokers: Mutex<Vec<Arc<MockBroker>>>,
}

impl ScriptedLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Brokers from the first `n` calls fail their readiness probe
    pub fn failing_starts(self, n: usize) -> Self {
        self.failing_starts_after(0, n)
    }

    /// The first `ok` calls succeed, the `n` after them fail their probe
    pub fn failing_starts_after(mut self, ok: usize, n: usize) -> Self {
        self.failing_starts = ok..ok.saturating_add(n);
        self
    }

    /// Only the first `ok` calls produce a broker that starts
    pub fn always_failing_after(self, ok: usize) -> Self {
        self.failing_starts_after(ok, usize::MAX)
    }

    /// The first `n` calls to `create` fail outright
    pub fn failing_creates(mut self, n: usize) -> Self {
        self.failing_creates = 0..n;
        self
    }

    /// Every broker's run loop dies immediately
    pub fn trip_on_run(mut self) -> Self {
        self.trip_on_run = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of `create` calls so far, failed ones included
    pub fn created(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn brokers(&self) -> Vec<Arc<MockBroker>> {
        self.brokers.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn last_broker(&self) -> Option<Arc<MockBroker>> {
        self.brokers().last().cloned()
    }
}

impl LinkFactory for ScriptedLinkFactory {
    fn create(
        &self,
        addr: &str,
        capacity: u32,
        settings: &LinkSettings,
    ) -> Result<Link, BrokerError> {
        let index = self.creates.fetch_add(1, Ordering::SeqCst);
        if self.failing_creates.contains(&index) {
            return Err(BrokerError::Setup(format!("scripted create failure #{}", index + 1)));
        }

        let mut broker = MockBroker::new(addr);
        if self.failing_starts.contains(&index) {
            broker = broker.failing_start();
        }
        if self.trip_on_run {
            broker = broker.tripping_on_run();
        }
        if let Some(latency) = self.latency {
            broker = broker.with_latency(latency);
        }
        let broker = Arc::new(broker);

        if let Ok(mut brokers) = self.brokers.lock() {
            brokers.push(broker.clone());
        }

        let pool = Arc::new(ConnectionPool::new(
            capacity,
            Arc::new(NullDialer),
            addr,
            settings.pool.clone(),
        ));
        Ok(Link::new(broker, pool))
    }
}

/// TCP server speaking the frame protocol, echoing every request
pub struct EchoHsmServer {
    addr: SocketAddr,
    accept_task: Option<JoinHandle<()>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accepted: Arc<AtomicUsize>,
}

impl EchoHsmServer {
    pub async fn start() -> std::io::Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            connections.clone(),
            accepted.clone(),
        ));

        Ok(Self {
            addr,
            accept_task: Some(accept_task),
            connections,
            accepted,
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
        accepted: Arc<AtomicUsize>,
    ) {
        while let Ok((mut socket, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            let handle = tokio::spawn(async move {
                while let Ok(frame) = read_frame(&mut socket).await {
                    if write_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
            });
            if let Ok(mut connections) = connections.lock() {
                connections.push(handle);
            }
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> String {
        self.addr.port().to_string()
    }

    /// Connections accepted since this server instance started
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Stop listening and drop every open connection
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        let handles: Vec<_> = self
            .connections
            .lock()
            .map(|mut c| c.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Listen again on the same port
    pub async fn restart(&mut self) -> std::io::Result<()> {
        self.shutdown().await;
        let fresh = Self::bind(self.addr).await?;
        *self = fresh;
        Ok(())
    }
}

impl Drop for EchoHsmServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Ok(mut connections) = self.connections.lock() {
            for handle in connections.drain(..) {
                handle.abort();
            }
        }
    }
}
