//! Heartbeat resync service
//!
//! Heartbeat batches that could not be delivered are appended to their own
//! persistent queue. This service drains that queue once at startup and then
//! on every resync interval.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{self, ShutdownSignal, TaskHandle, TaskSlot};
use crate::model::HeartbeatPayload;
use crate::remote::SharedBackend;
use crate::retry_queue::{DrainReport, LineOutcome, PersistentQueue};

pub struct HeartbeatResyncService {
    queue: Arc<PersistentQueue>,
    backend: SharedBackend,
    interval: Duration,
    task: TaskSlot,
}

impl HeartbeatResyncService {
    pub fn new(queue: Arc<PersistentQueue>, backend: SharedBackend, interval: Duration) -> Self {
        Self {
            queue,
            backend,
            interval,
            task: TaskSlot::new(),
        }
    }

    pub fn queue(&self) -> &Arc<PersistentQueue> {
        &self.queue
    }

    /// Start the resync loop; the first run is immediate
    pub fn start(&self, shutdown: ShutdownSignal) {
        let queue = self.queue.clone();
        let backend = self.backend.clone();
        let interval = self.interval;
        let started = self.task.start_with(|| {
            TaskHandle::spawn(move |stop| run(queue, backend, interval, stop, shutdown))
        });
        if started {
            info!("Heartbeat resync service started (every {:?})", interval);
        }
    }

    /// Stop the loop and wait for it; safe without a prior start
    pub async fn stop(&self) {
        self.task.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Drain the queue once
    pub async fn resync_pending(&self) -> Result<DrainReport> {
        resync_pending(&self.queue, &self.backend).await
    }
}

async fn resync_pending(queue: &PersistentQueue, backend: &SharedBackend) -> Result<DrainReport> {
    queue
        .drain(|line| {
            let backend = backend.clone();
            async move {
                let payload: HeartbeatPayload = match serde_json::from_str(&line) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Discarding malformed heartbeat batch: {}", e);
                        return LineOutcome::Discard;
                    }
                };
                let sent =
                    tokio::task::spawn_blocking(move || backend.send_heartbeats(&payload)).await;
                match sent {
                    Ok(Ok(())) => LineOutcome::Delivered,
                    Ok(Err(e)) => {
                        warn!("Heartbeat resync failed, keeping batch: {}", e);
                        LineOutcome::Retry
                    }
                    Err(e) => {
                        warn!("Heartbeat resync task failed, keeping batch: {}", e);
                        LineOutcome::Retry
                    }
                }
            }
        })
        .await
}

async fn run(
    queue: Arc<PersistentQueue>,
    backend: SharedBackend,
    interval: Duration,
    mut stop: tokio::sync::watch::Receiver<bool>,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = lifecycle::ticker(interval, true);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match resync_pending(&queue, &backend).await {
                    Ok(report) if report.total() > 0 => info!(
                        "Heartbeat resync: {} delivered, {} kept, {} discarded",
                        report.delivered, report.retained, report.discarded
                    ),
                    Ok(_) => {}
                    Err(e) => error!("Failed to drain heartbeat queue: {:#}", e),
                }
            }
            _ = lifecycle::signalled(&mut stop) => break,
            _ = lifecycle::signalled(&mut shutdown) => break,
        }
    }
    debug!("Heartbeat resync service stopped");
}
