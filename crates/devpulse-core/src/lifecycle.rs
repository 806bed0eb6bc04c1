//! Start/stop plumbing shared by the background services.
//!
//! Every loop waits on a ticker, its own stop channel and the daemon-wide
//! shutdown signal. A stop channel is signalled at most once because the
//! [`TaskHandle`] owning it is consumed by [`TaskHandle::stop`].

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Daemon-wide shutdown signal; `true` means shut down
pub type ShutdownSignal = watch::Receiver<bool>;

/// Create the daemon-wide shutdown channel
pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownSignal) {
    watch::channel(false)
}

/// Resolve once the signal is raised or its sender is gone
pub async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Longest period a [`ticker`] runs at; larger periods are clamped
pub const MAX_TICK_PERIOD: Duration = Duration::from_secs(365 * 86_400);

/// Ticker firing every `period`; the first tick is immediate when `immediate`
pub fn ticker(period: Duration, immediate: bool) -> Interval {
    let period = period.min(MAX_TICK_PERIOD);
    let start = if immediate {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// A spawned loop together with its dedicated stop channel
pub struct TaskHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn `f`, handing it the receiving end of a fresh stop channel
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(f(stop_rx));
        Self { stop_tx, handle }
    }

    /// Signal the loop and wait until it has exited
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::error!("Background task panicked: {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Slot holding at most one running loop; makes start/stop idempotent
#[derive(Default)]
pub struct TaskSlot {
    task: Mutex<Option<TaskHandle>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `start()`'s handle unless a loop is already running.
    /// Returns false when a loop was already present.
    pub fn start_with<F>(&self, start: F) -> bool
    where
        F: FnOnce() -> TaskHandle,
    {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }
        *task = Some(start());
        true
    }

    /// Stop the running loop, if any, and wait for it
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}
