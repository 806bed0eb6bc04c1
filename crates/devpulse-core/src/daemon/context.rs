use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::config::DaemonSettings;
use crate::ipc::protocol::{self, StatusResponse};

/// Process-wide facts built once at startup and shared by every component
#[derive(Debug)]
pub struct DaemonContext {
    pub settings: Arc<DaemonSettings>,
    pub version: String,
    pub started_at: DateTime<Local>,
    started: Instant,
}

impl DaemonContext {
    pub fn new(settings: DaemonSettings, version: impl Into<String>) -> Self {
        Self {
            settings: Arc::new(settings),
            version: version.into(),
            started_at: Local::now(),
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn code_tracking_enabled(&self) -> bool {
        self.settings.code_tracking.enabled
    }

    /// Snapshot for the `status` request
    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            version: self.version.clone(),
            started_at: self.started_at.to_rfc3339(),
            uptime: protocol::format_uptime(self.uptime()),
            go_version: protocol::runtime_version(),
            platform: protocol::platform(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_snapshot() {
        let ctx = DaemonContext::new(DaemonSettings::default(), "1.2.3");
        let status = ctx.status();
        assert_eq!(status.version, "1.2.3");
        assert_eq!(status.uptime, "0s");
        assert!(!status.go_version.is_empty());
        assert_eq!(
            status.platform,
            format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
        );
        assert!(DateTime::parse_from_rfc3339(&status.started_at).is_ok());
    }
}
