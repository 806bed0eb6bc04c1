//! Periodic housekeeping: old daemon logs and idle git cache entries

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::ccinfo::CcInfoTimer;
use crate::lifecycle::{self, ShutdownSignal, TaskHandle, TaskSlot};

const SECS_PER_DAY: u64 = 86_400;

/// What one cleanup pass removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub logs_removed: usize,
    pub git_entries_pruned: usize,
}

#[derive(Clone)]
struct CleanupJob {
    log_dir: PathBuf,
    log_retention: Duration,
    cc_info: CcInfoTimer,
}

impl CleanupJob {
    fn run_once(&self) -> CleanupReport {
        let logs_removed = match prune_logs(&self.log_dir, self.log_retention, SystemTime::now()) {
            Ok(n) => n,
            Err(e) => {
                warn!("Log cleanup failed: {:#}", e);
                0
            }
        };
        CleanupReport {
            logs_removed,
            git_entries_pruned: self.cc_info.prune_git_cache(),
        }
    }
}

/// Timer service running [`CleanupService::run_once`] at start and every interval
pub struct CleanupService {
    job: CleanupJob,
    interval: Duration,
    task: TaskSlot,
}

impl CleanupService {
    pub fn new(
        log_dir: impl Into<PathBuf>,
        log_retention_days: u64,
        interval: Duration,
        cc_info: CcInfoTimer,
    ) -> Self {
        Self {
            job: CleanupJob {
                log_dir: log_dir.into(),
                log_retention: Duration::from_secs(
                    log_retention_days.saturating_mul(SECS_PER_DAY),
                ),
                cc_info,
            },
            interval,
            task: TaskSlot::new(),
        }
    }

    pub fn run_once(&self) -> CleanupReport {
        self.job.run_once()
    }

    pub fn start(&self, shutdown: ShutdownSignal) {
        let job = self.job.clone();
        let interval = self.interval;
        let started = self
            .task
            .start_with(|| TaskHandle::spawn(move |stop| run(job, interval, stop, shutdown)));
        if started {
            info!("Cleanup service started (every {:?})", interval);
        }
    }

    pub async fn stop(&self) {
        self.task.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

async fn run(
    job: CleanupJob,
    interval: Duration,
    mut stop: tokio::sync::watch::Receiver<bool>,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = lifecycle::ticker(interval, true);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = job.run_once();
                if report != CleanupReport::default() {
                    info!(
                        "Cleanup removed {} log files and {} git cache entries",
                        report.logs_removed, report.git_entries_pruned
                    );
                }
            }
            _ = lifecycle::signalled(&mut stop) => break,
            _ = lifecycle::signalled(&mut shutdown) => break,
        }
    }
    debug!("Cleanup service stopped");
}

fn is_daemon_log(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("daemon-") && n.ends_with(".log"))
}

/// Delete `daemon-*.log` files in `dir` last modified before `now - retention`
pub fn prune_logs(dir: &Path, retention: Duration, now: SystemTime) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read log directory: {:?}", dir))
        }
    };
    let cutoff = now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_daemon_log(&path) {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if modified < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed old log {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove old log {}: {}", path.display(), e),
            }
        }
    }
    Ok(removed)
}
