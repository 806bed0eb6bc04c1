//! Circuit breaker for backend sync delivery
//!
//! Counts consecutive delivery failures and opens past a threshold. While
//! open, callers park payloads in a [`PersistentQueue`]. A periodic timer
//! closes the circuit again and republishes everything that was parked.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::DaemonSettings;
use crate::lifecycle::{self, ShutdownSignal, TaskHandle, TaskSlot};
use crate::retry_queue::{DrainReport, LineOutcome, PersistentQueue};

/// Redelivers one saved payload; `Err` keeps it queued
pub type RepublishFn = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub max_consecutive_failures: u32,
    pub reset_interval: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            reset_interval: Duration::from_secs(3600),
        }
    }
}

impl From<&DaemonSettings> for CircuitConfig {
    fn from(settings: &DaemonSettings) -> Self {
        Self {
            max_consecutive_failures: settings.circuit.max_consecutive_failures,
            reset_interval: settings.reset_interval(),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    is_open: bool,
}

/// Failure counter plus the queue that holds payloads while open
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: Mutex<CircuitState>,
    queue: PersistentQueue,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, queue_path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            state: Mutex::new(CircuitState::default()),
            queue: PersistentQueue::new(queue_path),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Reset the failure count and close the circuit
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.is_open {
            info!("Circuit breaker closed after successful delivery");
        }
        state.consecutive_failures = 0;
        state.is_open = false;
    }

    /// Count a failure; returns whether the circuit is open afterwards
    pub fn record_failure(&self) -> bool {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if !state.is_open && state.consecutive_failures >= self.config.max_consecutive_failures {
            state.is_open = true;
            warn!(
                "Circuit breaker opened after {} consecutive failures; parking payloads for {:?}",
                state.consecutive_failures, self.config.reset_interval
            );
        }
        state.is_open
    }

    /// Park a payload for the next drain
    pub fn save_for_retry(&self, payload: &[u8]) -> Result<()> {
        self.queue.append(payload)?;
        debug!("Saved payload for retry in {}", self.queue.path().display());
        Ok(())
    }

    pub fn queue(&self) -> &PersistentQueue {
        &self.queue
    }

    /// Republish every parked payload; failures stay in the queue verbatim
    pub async fn retry_pending_data(&self, republish: &RepublishFn) -> Result<DrainReport> {
        self.queue
            .drain(|line| {
                let republish = republish.clone();
                async move {
                    match republish(line.into_bytes()).await {
                        Ok(()) => LineOutcome::Delivered,
                        Err(e) => {
                            warn!("Failed to republish saved payload: {:#}", e);
                            LineOutcome::Retry
                        }
                    }
                }
            })
            .await
    }

    /// Close the circuit unconditionally, then drain the queue
    pub async fn check_and_retry(&self, republish: &RepublishFn) {
        {
            let mut state = self.state.lock();
            if state.is_open {
                info!("Circuit breaker reset interval elapsed, closing circuit");
            }
            state.is_open = false;
            state.consecutive_failures = 0;
        }

        match self.retry_pending_data(republish).await {
            Ok(report) if report.total() > 0 => info!(
                "Retried {} saved sync payloads ({} republished, {} kept)",
                report.total(),
                report.delivered,
                report.retained
            ),
            Ok(_) => {}
            Err(e) => error!("Failed to drain sync retry queue: {:#}", e),
        }
    }
}

/// Timer service that periodically runs [`CircuitBreaker::check_and_retry`]
pub struct CircuitBreakerService {
    breaker: Arc<CircuitBreaker>,
    republish: RepublishFn,
    task: TaskSlot,
}

impl CircuitBreakerService {
    pub fn new(breaker: Arc<CircuitBreaker>, republish: RepublishFn) -> Self {
        Self {
            breaker,
            republish,
            task: TaskSlot::new(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Start the reset timer. The first reset happens one interval from now.
    pub fn start(&self, shutdown: ShutdownSignal) {
        let breaker = self.breaker.clone();
        let republish = self.republish.clone();
        let started = self.task.start_with(|| {
            TaskHandle::spawn(move |stop| run(breaker, republish, stop, shutdown))
        });
        if started {
            info!(
                "Circuit breaker service started (reset every {:?})",
                self.breaker.config.reset_interval
            );
        }
    }

    /// Stop the timer and wait for it; safe without a prior start
    pub async fn stop(&self) {
        self.task.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

async fn run(
    breaker: Arc<CircuitBreaker>,
    republish: RepublishFn,
    mut stop: tokio::sync::watch::Receiver<bool>,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = lifecycle::ticker(breaker.config.reset_interval, false);
    loop {
        tokio::select! {
            _ = ticker.tick() => breaker.check_and_retry(&republish).await,
            _ = lifecycle::signalled(&mut stop) => break,
            _ = lifecycle::signalled(&mut shutdown) => break,
        }
    }
    debug!("Circuit breaker service stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(dir: &tempfile::TempDir, max: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitConfig {
                max_consecutive_failures: max,
                reset_interval: Duration::from_millis(50),
            },
            dir.path().join("sync-pending.ndjson"),
        )
    }

    fn republish_failing_on(bad: &'static str, calls: Arc<AtomicUsize>) -> RepublishFn {
        Arc::new(move |payload: Vec<u8>| -> BoxFuture<'static, Result<()>> {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if payload == bad.as_bytes() {
                    anyhow::bail!("backend still down")
                }
                Ok(())
            })
        })
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let cb = breaker(&dir, 3);
        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert!(!cb.is_open());
        assert!(cb.record_failure());
        assert!(cb.is_open());
        assert!(cb.record_failure());
        assert_eq!(cb.consecutive_failures(), 4);
    }

    #[test]
    fn test_success_resets_count() {
        let dir = tempfile::tempdir().unwrap();
        let cb = breaker(&dir, 3);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());

        cb.record_failure();
        assert!(cb.is_open());
        cb.record_success();
        assert!(!cb.is_open());
    }

    #[test]
    fn test_concurrent_failures_keep_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let cb = Arc::new(breaker(&dir, 100));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        cb.record_failure();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(cb.consecutive_failures(), 100);
        assert!(cb.is_open());
    }

    #[tokio::test]
    async fn test_check_and_retry_closes_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let cb = breaker(&dir, 1);
        cb.record_failure();
        assert!(cb.is_open());
        for line in ["A", "B", "C"] {
            cb.save_for_retry(line.as_bytes()).unwrap();
        }

        let calls = Arc::new(AtomicUsize::new(0));
        cb.check_and_retry(&republish_failing_on("B", calls.clone()))
            .await;

        assert!(!cb.is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.queue().pending().unwrap(), vec!["B"]);
    }

    #[tokio::test]
    async fn test_full_drain_removes_queue_file() {
        let dir = tempfile::tempdir().unwrap();
        let cb = breaker(&dir, 1);
        cb.save_for_retry(b"A").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let report = cb
            .retry_pending_data(&republish_failing_on("never", calls))
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert!(!cb.queue().path().exists());
        assert!(!cb.queue().temp_path().exists());
    }

    #[tokio::test]
    async fn test_service_periodically_drains() {
        let dir = tempfile::tempdir().unwrap();
        let cb = Arc::new(breaker(&dir, 1));
        cb.record_failure();
        cb.save_for_retry(b"A").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let service = CircuitBreakerService::new(
            cb.clone(),
            republish_failing_on("never", calls.clone()),
        );
        let (_tx, rx) = lifecycle::shutdown_channel();
        service.start(rx);
        assert!(service.is_running());

        tokio::time::sleep(Duration::from_millis(300)).await;
        service.stop().await;

        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert!(!cb.is_open());
        assert!(!cb.queue().path().exists());
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let service = CircuitBreakerService::new(
            Arc::new(breaker(&dir, 1)),
            republish_failing_on("never", calls),
        );
        // Without start
        service.stop().await;

        let (_tx, rx) = lifecycle::shutdown_channel();
        service.start(rx);
        service.stop().await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_loop() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let service = CircuitBreakerService::new(
            Arc::new(breaker(&dir, 1)),
            republish_failing_on("never", calls),
        );
        let (tx, rx) = lifecycle::shutdown_channel();
        service.start(rx);
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!service.is_running());
        service.stop().await;
    }
}
