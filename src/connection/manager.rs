//! The connection manager: lifecycle of one link and automatic recovery
//!
//! [`HsmConnection`] owns at most one [`Link`] at a time. `connect` builds a
//! link, proves it with the broker's readiness probe and launches a monitor
//! task that waits on [`Broker::run`](crate::transport::Broker::run). When that
//! run loop dies while the connection is up, the monitor moves the state to
//! `Disconnected`, then `Reconnecting`, and spawns the reconnection loop.
//!
//! Locking:
//! - `lifecycle` (async mutex) serialises `connect` and `disconnect`
//! - `shared` (sync RwLock, never held across an await) guards every compound
//!   update of state, last error, link and task handles
//! - the state itself lives in an atomic cell so `state()` never blocks
//!
//! Background tasks hold only a `Weak` reference, identify their link by id
//! and their connect cycle by epoch, and ignore stale results.

use super::reconnect::{ReconnectConfig, ReconnectPolicy, ReconnectionDecision};
use super::state::{ConnectionError, ConnectionState, StateCell, StateEvent};
use crate::observability::ConnectionMetrics;
use crate::observability::MetricsSnapshot;
use crate::transport::{BrokerError, Link, LinkFactory, LinkSettings, TcpLinkFactory};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// How long `disconnect`/`connect` wait for a cancelled reconnection task
const TASK_JOIN_GRACE: Duration = Duration::from_secs(2);

/// Subscriber invoked on every state change
pub type StateCallback = Arc<dyn Fn(ConnectionState, Option<ConnectionError>) + Send + Sync>;

/// Runtime settings for an [`HsmConnection`]
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub link: LinkSettings,
    pub reconnect: ReconnectConfig,
    /// Wait after launching the run loop, to catch immediate failures
    pub grace_period: Duration,
    /// Buffered events per `subscribe` receiver before it starts lagging
    pub event_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            link: LinkSettings::default(),
            reconnect: ReconnectConfig::default(),
            grace_period: Duration::from_millis(100),
            event_capacity: 64,
        }
    }
}

/// Format an address, bracketing bare IPv6 hosts
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

struct Shared {
    host: String,
    port: String,
    pool_capacity: u32,
    link: Option<Link>,
    last_error: Option<ConnectionError>,
    /// Bumped by every connect/disconnect; reconnection loops carry the
    /// epoch they were started in
    epoch: u64,
    shutdown: watch::Sender<bool>,
    callbacks: Vec<StateCallback>,
    monitor: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Shared {
    fn endpoint(&self) -> Option<String> {
        if self.host.is_empty() {
            None
        } else {
            Some(join_host_port(&self.host, &self.port))
        }
    }

    fn is_current(&self, link: &Link) -> bool {
        self.link.as_ref().map(Link::id) == Some(link.id())
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }
}

struct Inner {
    settings: ConnectionSettings,
    factory: Arc<dyn LinkFactory>,
    state: StateCell,
    reconnecting: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    shared: RwLock<Shared>,
    events: broadcast::Sender<StateEvent>,
    metrics: ConnectionMetrics,
}

/// Clears the `reconnecting` flag when the reconnection task ends, however it ends
struct ReconnectGuard {
    inner: Weak<Inner>,
    released: bool,
}

impl ReconnectGuard {
    fn release(&mut self, inner: &Inner) {
        if !self.released {
            inner.reconnecting.store(false, Ordering::SeqCst);
            self.released = true;
        }
    }
}

impl Drop for ReconnectGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.reconnecting.store(false, Ordering::SeqCst);
        }
    }
}

/// Everything the reconnection loop needs without touching the shared lock
struct ReconnectPlan {
    epoch: u64,
    addr: String,
    capacity: u32,
    shutdown: watch::Receiver<bool>,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Shared> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Shared> {
        self.shared.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a new state and notify subscribers; caller holds the write lock
    fn transition(&self, shared: &Shared, to: ConnectionState) {
        let from = self.state.swap(to);
        if from == to {
            return;
        }

        self.metrics.state_changed();
        let endpoint = shared.endpoint().unwrap_or_default();
        ReconnectPolicy::log_state_transition(from, to, &endpoint);

        let event = StateEvent {
            state: to,
            last_error: shared.last_error.clone(),
        };
        let _ = self.events.send(event.clone());

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        for callback in &shared.callbacks {
            let callback = callback.clone();
            let last_error = event.last_error.clone();
            runtime.spawn_blocking(move || callback(to, last_error));
        }
    }

    fn spawn_monitor(self: &Arc<Self>, link: Link) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let span = crate::link_span!(link_id = link.id(), addr = %link.pool().addr());

        tokio::spawn(
            async move {
                let outcome = link.broker().run().await;
                match weak.upgrade() {
                    Some(inner) => inner.on_run_exit(link, outcome),
                    None => link.close(),
                }
            }
            .instrument(span),
        )
    }

    /// React to a broker run loop ending
    fn on_run_exit(self: &Arc<Self>, link: Link, outcome: Result<(), BrokerError>) {
        let err = outcome.err().unwrap_or(BrokerError::Quit);
        let mut shared = self.write();

        if !shared.is_current(&link) {
            debug!(link_id = link.id(), "Ignoring exit of a superseded link");
            drop(shared);
            link.close();
            return;
        }

        shared.link = None;
        shared.monitor = None;

        let deliberate = err.is_quit() || shared.shutdown_requested();
        if !err.is_quit() {
            warn!(link_id = link.id(), error = %err, "Broker run loop failed");
            self.metrics.link_failed();
            shared.last_error = Some(ConnectionError::BrokerStopped(err));
        }

        if self.state.load().is_connected() && !deliberate {
            self.transition(&shared, ConnectionState::Disconnected);
            if self
                .reconnecting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.transition(&shared, ConnectionState::Reconnecting);
                let plan = ReconnectPlan {
                    epoch: shared.epoch,
                    addr: join_host_port(&shared.host, &shared.port),
                    capacity: shared.pool_capacity,
                    shutdown: shared.shutdown.subscribe(),
                };
                let span = crate::link_span!(addr = %plan.addr, epoch = plan.epoch);
                let task = Self::reconnect_loop(Arc::downgrade(self), plan);
                shared.reconnect = Some(tokio::spawn(task.instrument(span)));
            }
        } else {
            self.transition(&shared, ConnectionState::Disconnected);
        }

        drop(shared);
        link.close();
    }

    async fn reconnect_loop(weak: Weak<Inner>, mut plan: ReconnectPlan) {
        let mut guard = ReconnectGuard {
            inner: weak.clone(),
            released: false,
        };
        let (factory, link_settings, config) = match weak.upgrade() {
            Some(inner) => (
                inner.factory.clone(),
                inner.settings.link.clone(),
                inner.settings.reconnect.clone(),
            ),
            None => return,
        };

        let mut attempts_made = 0;
        loop {
            let shutdown_requested = *plan.shutdown.borrow();
            let (attempt, delay) = match ReconnectPolicy::should_attempt_reconnection(
                attempts_made,
                &config,
                shutdown_requested,
            ) {
                ReconnectionDecision::Proceed { attempt, delay } => (attempt, delay),
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Reconnection cancelled");
                    return;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    if let Some(inner) = weak.upgrade() {
                        inner.finish_exhausted(plan.epoch, attempts_made, &mut guard);
                    }
                    return;
                }
            };
            attempts_made = attempt;

            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to HSM"
            );
            if !sleep_unless_shutdown(delay, &mut plan.shutdown).await {
                info!(attempt, "Reconnection cancelled during backoff");
                return;
            }

            match weak.upgrade() {
                Some(inner) => {
                    inner.metrics.reconnect_attempt();
                    inner.discard_stale_link(plan.epoch);
                }
                None => return,
            }

            let link = match factory.create(&plan.addr, plan.capacity, &link_settings) {
                Ok(link) => link,
                Err(e) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.record_attempt_failure(plan.epoch, attempt, e);
                    }
                    continue;
                }
            };

            let started = tokio::select! {
                result = link.broker().start() => result,
                _ = wait_for_shutdown(&mut plan.shutdown) => {
                    link.close();
                    info!(attempt, "Reconnection cancelled during readiness probe");
                    return;
                }
            };

            match started {
                Ok(()) => {
                    match weak.upgrade() {
                        Some(inner) => inner.install_reconnected(link, plan.epoch, &mut guard),
                        None => link.close(),
                    }
                    return;
                }
                Err(e) => {
                    link.close();
                    if let Some(inner) = weak.upgrade() {
                        inner.record_attempt_failure(plan.epoch, attempt, e);
                    }
                }
            }
        }
    }

    fn discard_stale_link(&self, epoch: u64) {
        let stale = {
            let mut shared = self.write();
            if shared.epoch != epoch {
                return;
            }
            shared.link.take()
        };
        if let Some(link) = stale {
            link.close();
        }
    }

    fn record_attempt_failure(&self, epoch: u64, attempt: u32, source: BrokerError) {
        warn!(attempt, error = %source, "Reconnection attempt failed");
        let mut shared = self.write();
        if shared.epoch == epoch {
            shared.last_error = Some(ConnectionError::ReconnectAttempt { attempt, source });
        }
    }

    fn install_reconnected(self: &Arc<Self>, link: Link, epoch: u64, guard: &mut ReconnectGuard) {
        let mut shared = self.write();
        if shared.epoch != epoch || shared.shutdown_requested() {
            drop(shared);
            debug!(
                link_id = link.id(),
                "Discarding link from a cancelled reconnection"
            );
            link.close();
            return;
        }

        shared.link = Some(link.clone());
        shared.last_error = None;
        // Released under the lock so a failure of the new link can start a
        // fresh episode straight away
        guard.release(self);
        self.metrics.reconnect_succeeded();
        self.metrics.connection_established();
        self.transition(&shared, ConnectionState::Connected);
        shared.monitor = Some(self.spawn_monitor(link));
    }

    fn finish_exhausted(&self, epoch: u64, attempts: u32, guard: &mut ReconnectGuard) {
        let mut shared = self.write();
        if shared.epoch == epoch && !shared.shutdown_requested() {
            if shared.last_error.is_none() {
                shared.last_error = Some(ConnectionError::ReconnectExhausted { attempts });
            }
            warn!(attempts, "Giving up on reconnection");
            self.metrics.reconnect_exhausted();
            self.transition(&shared, ConnectionState::Disconnected);
        }
        guard.release(self);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut().unwrap_or_else(PoisonError::into_inner);
        let _ = shared.shutdown.send(true);
        if let Some(link) = shared.link.take() {
            link.close();
        }
        for handle in [shared.monitor.take(), shared.reconnect.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

async fn sleep_unless_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = wait_for_shutdown(shutdown) => false,
    }
}

/// Resolves once shutdown is signalled or the sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn join_or_abort(mut handle: JoinHandle<()>) {
    if tokio::time::timeout(TASK_JOIN_GRACE, &mut handle).await.is_err() {
        warn!("Background task did not stop in time, aborting");
        handle.abort();
        let _ = handle.await;
    }
}

/// Handle to a managed, self-healing HSM connection
///
/// Cloning is cheap; all clones share the same link and state. The link is
/// closed when the last clone is dropped.
#[derive(Clone)]
pub struct HsmConnection {
    inner: Arc<Inner>,
}

impl HsmConnection {
    /// Manager using the TCP link factory
    pub fn new(settings: ConnectionSettings) -> Self {
        Self::with_factory(settings, Arc::new(TcpLinkFactory))
    }

    pub fn with_factory(settings: ConnectionSettings, factory: Arc<dyn LinkFactory>) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                settings,
                factory,
                state: StateCell::default(),
                reconnecting: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                shared: RwLock::new(Shared {
                    host: String::new(),
                    port: String::new(),
                    pool_capacity: 0,
                    link: None,
                    last_error: None,
                    epoch: 0,
                    shutdown,
                    callbacks: Vec::new(),
                    monitor: None,
                    reconnect: None,
                }),
                events,
                metrics: ConnectionMetrics::new(),
            }),
        }
    }

    /// Establish the link to `host:port` with `num_conns` pooled sockets
    ///
    /// `num_conns == 0` is treated as 1. Returns once the readiness probe has
    /// succeeded and the grace period has passed without the run loop failing.
    /// Any previous link or reconnection in progress is torn down first.
    pub async fn connect(
        &self,
        host: &str,
        port: &str,
        num_conns: u32,
    ) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        if inner.state.load().is_connected() {
            return Err(ConnectionError::AlreadyConnected);
        }

        let _lifecycle = inner.lifecycle.lock().await;
        if inner.state.load().is_connected() {
            return Err(ConnectionError::AlreadyConnected);
        }
        inner.metrics.connect_attempt();

        let capacity = num_conns.max(1);
        let (previous, monitor, reconnect, addr) = {
            let mut shared = inner.write();
            let _ = shared.shutdown.send(true);
            let (shutdown, _) = watch::channel(false);
            shared.shutdown = shutdown;
            shared.epoch += 1;
            shared.host = host.to_string();
            shared.port = port.to_string();
            shared.pool_capacity = capacity;
            inner.transition(&shared, ConnectionState::Disconnected);
            (
                shared.link.take(),
                shared.monitor.take(),
                shared.reconnect.take(),
                join_host_port(host, port),
            )
        };
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        if let Some(link) = previous {
            link.close();
        }
        if let Some(task) = reconnect {
            join_or_abort(task).await;
        }

        let span = crate::link_span!(addr = %addr, capacity);
        let link = async {
            let link = inner
                .factory
                .create(&addr, capacity, &inner.settings.link)
                .map_err(ConnectionError::Link)?;
            if let Err(e) = link.broker().start().await {
                link.close();
                return Err(ConnectionError::Link(e));
            }
            Ok::<Link, ConnectionError>(link)
        }
        .instrument(span)
        .await;

        let link = match link {
            Ok(link) => link,
            Err(e) => {
                warn!(addr = %addr, error = %e, "Connect failed");
                inner.metrics.link_failed();
                inner.write().last_error = Some(e.clone());
                return Err(e);
            }
        };

        {
            let mut shared = inner.write();
            shared.link = Some(link.clone());
            shared.monitor = Some(inner.spawn_monitor(link.clone()));
        }

        tokio::time::sleep(inner.settings.grace_period).await;

        let mut shared = inner.write();
        if !shared.is_current(&link) {
            let err = shared
                .last_error
                .clone()
                .unwrap_or(ConnectionError::Link(BrokerError::Closed));
            return Err(err);
        }
        shared.last_error = None;
        inner.metrics.connection_established();
        inner.transition(&shared, ConnectionState::Connected);
        Ok(())
    }

    /// Tear down the link and stop any reconnection in progress
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let (link, monitor, reconnect) = {
            let mut shared = inner.write();
            if inner.state.load() == ConnectionState::Disconnected {
                return Err(ConnectionError::AlreadyDisconnected);
            }
            inner.transition(&shared, ConnectionState::Disconnected);
            let _ = shared.shutdown.send(true);
            shared.epoch += 1;
            (
                shared.link.take(),
                shared.monitor.take(),
                shared.reconnect.take(),
            )
        };

        if let Some(monitor) = monitor {
            monitor.abort();
        }
        if let Some(link) = link {
            link.close();
        }
        if let Some(task) = reconnect {
            join_or_abort(task).await;
        }
        Ok(())
    }

    /// Lock-free; may be momentarily stale during a transition
    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    /// Capacity from the most recent `connect`, 0 before the first one
    pub fn pool_capacity(&self) -> u32 {
        self.inner.read().pool_capacity
    }

    pub fn last_error(&self) -> Option<ConnectionError> {
        self.inner.read().last_error.clone()
    }

    /// `host:port` from the most recent `connect`
    pub fn endpoint(&self) -> Option<String> {
        self.inner.read().endpoint()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Register a callback run on a blocking thread after every state change
    ///
    /// A slow callback never delays the state machine. The runtime still waits
    /// for running callbacks when it shuts down, so a callback that never
    /// returns keeps the process alive. Keep callbacks short, or hand the work
    /// to a channel.
    pub fn register_state_callback<F>(&self, callback: F)
    where
        F: Fn(ConnectionState, Option<ConnectionError>) + Send + Sync + 'static,
    {
        self.inner.write().callbacks.push(Arc::new(callback));
    }

    /// Ordered stream of state changes
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.events.subscribe()
    }

    /// Send one command over the current link
    ///
    /// Fails immediately with [`ConnectionError::NotConnected`] when no link is
    /// installed.
    pub async fn execute_command(
        &self,
        command: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ConnectionError> {
        let broker = self
            .inner
            .read()
            .link
            .as_ref()
            .map(|link| link.broker().clone());
        let Some(broker) = broker else {
            self.inner.metrics.command_failed();
            return Err(ConnectionError::NotConnected);
        };

        let started = Instant::now();
        let result = broker
            .send_timeout(command, timeout)
            .instrument(crate::command_span!(len = command.len()))
            .await;

        match result {
            Ok(response) => {
                self.inner.metrics.command_completed(started.elapsed());
                Ok(response)
            }
            Err(BrokerError::Timeout(after)) => {
                self.inner.metrics.command_failed();
                Err(ConnectionError::Timeout(after))
            }
            Err(e) => {
                self.inner.metrics.command_failed();
                Err(ConnectionError::Send(e))
            }
        }
    }
}

impl std::fmt::Debug for HsmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.read();
        f.debug_struct("HsmConnection")
            .field("state", &self.inner.state.load())
            .field("endpoint", &shared.endpoint())
            .field("pool_capacity", &shared.pool_capacity)
            .field("link", &shared.link)
            .finish()
    }
}
