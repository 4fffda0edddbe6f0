//! Batch command senders
//!
//! Drive many commands through an [`HsmConnection`], either one at a time or
//! from a fixed number of concurrent workers, and report per-command latency
//! and overall throughput. A batch stops early when the connection leaves the
//! `Connected` state, when a command fails in a way that means the link is
//! gone, or when [`CommandSender::stop`] is called.

use crate::connection::{ConnectionError, HsmConnection};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Result of a single command within a batch
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub index: usize,
    pub latency: Duration,
    pub result: Result<Vec<u8>, ConnectionError>,
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub requested: usize,
    pub completed: usize,
    pub failed: usize,
    /// Ordered by command index
    pub outcomes: Vec<CommandOutcome>,
    pub elapsed: Duration,
    pub stopped_early: bool,
}

impl BatchReport {
    fn from_outcomes(
        requested: usize,
        mut outcomes: Vec<CommandOutcome>,
        elapsed: Duration,
        stopped: bool,
    ) -> Self {
        outcomes.sort_by_key(|o| o.index);
        let completed = outcomes.iter().filter(|o| o.is_ok()).count();
        let failed = outcomes.len() - completed;

        Self {
            requested,
            completed,
            failed,
            stopped_early: stopped || outcomes.len() < requested,
            outcomes,
            elapsed,
        }
    }

    /// Successful commands per second
    pub fn tps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.completed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Batch ids shared by a sender and its clones
#[derive(Debug, Default)]
struct BatchControl {
    next_id: AtomicU64,
    /// Every batch with a lower id has been asked to stop
    stopped_below: AtomicU64,
}

/// Stop state of one batch
#[derive(Debug)]
struct BatchStop {
    id: u64,
    control: Arc<BatchControl>,
    halted: AtomicBool,
}

impl BatchStop {
    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
            || self.control.stopped_below.load(Ordering::SeqCst) > self.id
    }
}

/// Sends batches of one command over a shared connection
#[derive(Debug, Clone)]
pub struct CommandSender {
    connection: HsmConnection,
    timeout: Duration,
    control: Arc<BatchControl>,
}

impl CommandSender {
    pub fn new(connection: HsmConnection, timeout: Duration) -> Self {
        Self {
            connection,
            timeout,
            control: Arc::new(BatchControl::default()),
        }
    }

    /// Ask every batch created so far, from this sender or its clones, to
    /// finish after its in-flight commands
    ///
    /// Batches created afterwards are not affected.
    pub fn stop(&self) {
        let created = self.control.next_id.load(Ordering::SeqCst);
        self.control.stopped_below.fetch_max(created, Ordering::SeqCst);
    }

    /// Registered when the batch future is created, not when it is first polled
    fn begin_batch(&self) -> Arc<BatchStop> {
        Arc::new(BatchStop {
            id: self.control.next_id.fetch_add(1, Ordering::SeqCst),
            control: self.control.clone(),
            halted: AtomicBool::new(false),
        })
    }

    /// Send `command` `count` times, waiting for each response before the next
    pub fn send_sequential(
        &self,
        command: &[u8],
        count: usize,
    ) -> impl Future<Output = BatchReport> + Send + 'static {
        let stop = self.begin_batch();
        let connection = self.connection.clone();
        let timeout = self.timeout;
        let command = command.to_vec();

        async move {
            let started = Instant::now();
            let mut outcomes = Vec::with_capacity(count);

            for index in 0..count {
                if stop.is_stopped() || !connection.state().is_connected() {
                    stop.halt();
                    break;
                }

                let outcome = execute_one(&connection, &command, index, timeout).await;
                let lost = lost_connection(&outcome);
                outcomes.push(outcome);
                if lost {
                    warn!(index, "Connection lost, stopping sequential batch");
                    stop.halt();
                    break;
                }
            }

            let stopped = stop.halted.load(Ordering::SeqCst);
            let report = BatchReport::from_outcomes(count, outcomes, started.elapsed(), stopped);
            info!(
                completed = report.completed,
                failed = report.failed,
                tps = report.tps(),
                "Sequential batch finished"
            );
            report
        }
    }

    /// Send `command` `count` times from `workers` concurrent tasks
    ///
    /// Size `workers` to the pool capacity to keep every socket busy.
    pub fn send_concurrent(
        &self,
        command: &[u8],
        count: usize,
        workers: usize,
    ) -> impl Future<Output = BatchReport> + Send + 'static {
        let stop = self.begin_batch();
        let connection = self.connection.clone();
        let timeout = self.timeout;
        let command: Arc<[u8]> = Arc::from(command);

        async move {
            let started = Instant::now();
            let next = Arc::new(AtomicUsize::new(0));
            let mut tasks = JoinSet::new();

            for worker_id in 0..workers.max(1) {
                let connection = connection.clone();
                let stop = stop.clone();
                let next = next.clone();
                let command = command.clone();

                tasks.spawn(async move {
                    let mut outcomes = Vec::new();
                    loop {
                        if stop.is_stopped() {
                            stop.halt();
                            break;
                        }
                        if !connection.state().is_connected() {
                            stop.halt();
                            break;
                        }
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        if index >= count {
                            break;
                        }

                        let outcome = execute_one(&connection, &command, index, timeout).await;
                        if lost_connection(&outcome) {
                            warn!(worker_id, index, "Connection lost, stopping batch");
                            stop.halt();
                        }
                        outcomes.push(outcome);
                    }
                    debug!(worker_id, sent = outcomes.len(), "Sender worker finished");
                    outcomes
                });
            }

            let mut outcomes = Vec::with_capacity(count);
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(mut worker_outcomes) => outcomes.append(&mut worker_outcomes),
                    Err(e) => warn!(error = %e, "Sender worker panicked"),
                }
            }

            let stopped = stop.halted.load(Ordering::SeqCst);
            let report = BatchReport::from_outcomes(count, outcomes, started.elapsed(), stopped);
            info!(
                workers,
                completed = report.completed,
                failed = report.failed,
                tps = report.tps(),
                "Concurrent batch finished"
            );
            report
        }
    }
}

async fn execute_one(
    connection: &HsmConnection,
    command: &[u8],
    index: usize,
    timeout: Duration,
) -> CommandOutcome {
    let started = Instant::now();
    let result = connection.execute_command(command, timeout).await;
    CommandOutcome {
        index,
        latency: started.elapsed(),
        result,
    }
}

fn lost_connection(outcome: &CommandOutcome) -> bool {
    matches!(&outcome.result, Err(e) if e.is_connection_lost())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSettings;
    use crate::testing::mocks::ScriptedLinkFactory;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            grace_period: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn connected(factory: Arc<ScriptedLinkFactory>) -> HsmConnection {
        let conn = HsmConnection::with_factory(settings(), factory);
        conn.connect("hsm.local", "1500", 4).await.unwrap();
        conn
    }

    #[test]
    fn test_report_counts_and_tps() {
        let outcomes = vec![
            CommandOutcome {
                index: 1,
                latency: Duration::from_millis(5),
                result: Err(ConnectionError::Timeout(Duration::from_secs(1))),
            },
            CommandOutcome {
                index: 0,
                latency: Duration::from_millis(5),
                result: Ok(b"OK".to_vec()),
            },
        ];
        let report = BatchReport::from_outcomes(2, outcomes, Duration::from_millis(500), false);

        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.outcomes[0].index, 0);
        assert!(!report.stopped_early);
        assert_eq!(report.tps(), 2.0);
    }

    #[test]
    fn test_tps_with_zero_elapsed() {
        let report = BatchReport::from_outcomes(0, Vec::new(), Duration::ZERO, false);
        assert_eq!(report.tps(), 0.0);
    }

    #[tokio::test]
    async fn test_sequential_batch_completes() {
        let conn = connected(Arc::new(ScriptedLinkFactory::new())).await;
        let sender = CommandSender::new(conn, Duration::from_secs(1));

        let report = sender.send_sequential(b"0000NC", 10).await;

        assert_eq!(report.completed, 10);
        assert!(!report.stopped_early);
        assert!(report
            .outcomes
            .iter()
            .all(|o| matches!(&o.result, Ok(r) if r.as_slice() == b"0000NC")));
    }

    #[tokio::test]
    async fn test_sequential_batch_refuses_when_disconnected() {
        let conn = HsmConnection::with_factory(settings(), Arc::new(ScriptedLinkFactory::new()));
        let sender = CommandSender::new(conn, Duration::from_secs(1));

        let report = sender.send_sequential(b"NC", 5).await;

        assert!(report.outcomes.is_empty());
        assert!(report.stopped_early);
    }

    #[tokio::test]
    async fn test_concurrent_batch_completes() {
        let latency = Duration::from_millis(2);
        let factory = Arc::new(ScriptedLinkFactory::new().with_latency(latency));
        let conn = connected(factory.clone()).await;
        let sender = CommandSender::new(conn, Duration::from_secs(1));

        let report = sender.send_concurrent(b"0000NC", 40, 4).await;

        assert_eq!(report.completed, 40);
        assert_eq!(report.failed, 0);
        let indices: Vec<_> = report.outcomes.iter().map(|o| o.index).collect();
        assert_eq!(indices, (0..40).collect::<Vec<_>>());
        assert_eq!(factory.last_broker().unwrap().send_count(), 40);
    }

    #[tokio::test]
    async fn test_concurrent_batch_stops_on_link_loss() {
        let latency = Duration::from_millis(5);
        let factory = Arc::new(ScriptedLinkFactory::new().with_latency(latency));
        let conn = connected(factory.clone()).await;
        let sender = CommandSender::new(conn.clone(), Duration::from_secs(1));

        let broker = factory.last_broker().unwrap();
        let tripper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            broker.trip();
        });

        let report = sender.send_concurrent(b"NC", 10_000, 4).await;
        tripper.await.unwrap();

        assert!(report.stopped_early);
        assert!(report.outcomes.len() < 10_000);
    }

    #[tokio::test]
    async fn test_stop_ends_batch() {
        let latency = Duration::from_millis(5);
        let factory = Arc::new(ScriptedLinkFactory::new().with_latency(latency));
        let conn = connected(factory).await;
        let sender = CommandSender::new(conn, Duration::from_secs(1));

        let stopper = sender.clone();
        let batch = tokio::spawn(async move { stopper.send_sequential(b"NC", 10_000).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        sender.stop();

        let report = batch.await.unwrap();
        assert!(report.stopped_early);
        assert!(report.completed > 0);
    }

    #[tokio::test]
    async fn test_stop_before_first_poll_is_kept() {
        let conn = connected(Arc::new(ScriptedLinkFactory::new())).await;
        let sender = CommandSender::new(conn, Duration::from_secs(1));

        let batch = tokio::spawn(sender.send_sequential(b"NC", 100));
        sender.stop();

        let report = batch.await.unwrap();
        assert!(report.stopped_early);
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_stop_does_not_reach_later_batches() {
        let factory = Arc::new(ScriptedLinkFactory::new());
        let conn = connected(factory.clone()).await;
        let sender = CommandSender::new(conn, Duration::from_secs(1));

        let first = sender.send_concurrent(b"NC", 50, 2);
        sender.stop();
        let second = sender.clone().send_sequential(b"NC", 5);

        let first = first.await;
        assert!(first.stopped_early);
        assert!(first.outcomes.is_empty());

        let second = second.await;
        assert_eq!(second.completed, 5);
        assert!(!second.stopped_early);
        assert_eq!(factory.last_broker().unwrap().send_count(), 5);
    }
}
