use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// File name of the sync retry queue under the base directory
const SYNC_PENDING_FILE: &str = "sync-pending.ndjson";
/// File name of the heartbeat retry queue under the base directory
const HEARTBEAT_PENDING_FILE: &str = "heartbeat-pending.ndjson";

/// Overrides supplied on the command line
///
/// Every field is optional; `None` leaves the file/default value alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Socket path override
    pub socket_path: Option<PathBuf>,
    /// Base storage directory override
    pub base_dir: Option<PathBuf>,
    /// Backend endpoint override
    pub api_endpoint: Option<String>,
    /// Force code tracking on
    pub code_tracking: bool,
}

/// Daemon settings (from config file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// API token used for backend requests
    #[serde(default)]
    pub token: String,

    /// Backend base URL
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Base storage directory (queues, logs)
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Unix socket path the daemon listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Code tracking (heartbeat) settings
    #[serde(default)]
    pub code_tracking: CodeTrackingSettings,

    /// Circuit breaker settings
    #[serde(default)]
    pub circuit: CircuitSettings,

    /// Heartbeat resync settings
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    /// CC info cache settings
    #[serde(default)]
    pub cc_info: CcInfoSettings,

    /// In-process bus settings
    #[serde(default)]
    pub bus: BusSettings,

    /// Cleanup timer settings
    #[serde(default)]
    pub cleanup: CleanupSettings,
}

fn default_api_endpoint() -> String {
    "https://api.devpulse.dev".to_string()
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".devpulse"))
        .unwrap_or_else(|| PathBuf::from("/tmp/devpulse"))
}

fn default_socket_path() -> PathBuf {
    runtime_dir().join("devpulse.sock")
}

/// Directory for the runtime socket, preferring XDG_RUNTIME_DIR
pub fn runtime_dir() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(xdg) if !xdg.is_empty() => PathBuf::from(xdg),
        _ => PathBuf::from("/tmp"),
    }
}

/// Code tracking settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeTrackingSettings {
    /// Accept heartbeats from editor integrations
    #[serde(default)]
    pub enabled: bool,
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Seconds between reset-and-drain attempts
    #[serde(default = "default_reset_interval")]
    pub reset_interval_secs: u64,
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_reset_interval() -> u64 {
    3600
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            reset_interval_secs: default_reset_interval(),
        }
    }
}

/// Heartbeat resync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Seconds between resync passes over the pending heartbeat file
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
}

fn default_resync_interval() -> u64 {
    1800
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            resync_interval_secs: default_resync_interval(),
        }
    }
}

/// CC info cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcInfoSettings {
    /// Fetch interval while clients are active (milliseconds)
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_ms: u64,

    /// Suspend polling after this many seconds without a query
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Rate limit cache TTL in seconds
    #[serde(default = "default_rate_limit_ttl")]
    pub rate_limit_ttl_secs: u64,

    /// Git info cache TTL in seconds
    #[serde(default = "default_git_ttl")]
    pub git_ttl_secs: u64,
}

fn default_fetch_interval() -> u64 {
    3000
}

fn default_inactivity_timeout() -> u64 {
    180
}

fn default_rate_limit_ttl() -> u64 {
    600
}

fn default_git_ttl() -> u64 {
    10
}

impl Default for CcInfoSettings {
    fn default() -> Self {
        Self {
            fetch_interval_ms: default_fetch_interval(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            rate_limit_ttl_secs: default_rate_limit_ttl(),
            git_ttl_secs: default_git_ttl(),
        }
    }
}

/// In-process bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Buffered messages before publishers wait
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,

    /// Redeliveries of a nacked message before it is dropped
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

fn default_bus_capacity() -> usize {
    256
}

fn default_max_redeliveries() -> u32 {
    3
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
            max_redeliveries: default_max_redeliveries(),
        }
    }
}

/// Cleanup timer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSettings {
    /// Seconds between cleanup passes
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,

    /// Daemon log files older than this are deleted
    #[serde(default = "default_log_retention")]
    pub log_retention_days: u64,
}

fn default_cleanup_interval() -> u64 {
    86_400
}

fn default_log_retention() -> u64 {
    7
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            log_retention_days: default_log_retention(),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_endpoint: default_api_endpoint(),
            base_dir: default_base_dir(),
            socket_path: default_socket_path(),
            code_tracking: CodeTrackingSettings::default(),
            circuit: CircuitSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            cc_info: CcInfoSettings::default(),
            bus: BusSettings::default(),
            cleanup: CleanupSettings::default(),
        }
    }
}

impl DaemonSettings {
    /// Load settings from config file or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        // Try custom path first
        if let Some(p) = path {
            if p.exists() {
                return Self::load_from(p);
            }
        }

        let default_paths = [
            dirs::config_dir().map(|p| p.join("devpulse/config.toml")),
            dirs::home_dir().map(|p| p.join(".config/devpulse/config.toml")),
            dirs::home_dir().map(|p| p.join(".devpulse.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::load_from(path);
            }
        }

        Ok(Self::default())
    }

    fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Merge CLI overrides into settings (CLI takes precedence)
    pub fn merge_cli(&mut self, cli: &CliOverrides) {
        if let Some(socket_path) = &cli.socket_path {
            self.socket_path = socket_path.clone();
        }
        if let Some(base_dir) = &cli.base_dir {
            self.base_dir = base_dir.clone();
        }
        if let Some(endpoint) = &cli.api_endpoint {
            self.api_endpoint = endpoint.clone();
        }
        if cli.code_tracking {
            self.code_tracking.enabled = true;
        }
    }

    /// Clamp zero values that would spin timers or disable the circuit
    pub fn validate(&mut self) {
        const MIN_FETCH_INTERVAL_MS: u64 = 100;

        if self.circuit.max_consecutive_failures == 0 {
            self.circuit.max_consecutive_failures = 1;
        }
        if self.circuit.reset_interval_secs == 0 {
            self.circuit.reset_interval_secs = 1;
        }
        if self.heartbeat.resync_interval_secs == 0 {
            self.heartbeat.resync_interval_secs = 1;
        }
        if self.cc_info.fetch_interval_ms < MIN_FETCH_INTERVAL_MS {
            self.cc_info.fetch_interval_ms = MIN_FETCH_INTERVAL_MS;
        }
        if self.cleanup.interval_secs == 0 {
            self.cleanup.interval_secs = 1;
        }
        if self.bus.capacity == 0 {
            self.bus.capacity = 1;
        }
        self.api_endpoint = self.api_endpoint.trim_end_matches('/').to_string();
    }

    /// Path of the sync retry queue
    pub fn sync_pending_path(&self) -> PathBuf {
        self.base_dir.join(SYNC_PENDING_FILE)
    }

    /// Path of the heartbeat retry queue
    pub fn heartbeat_pending_path(&self) -> PathBuf {
        self.base_dir.join(HEARTBEAT_PENDING_FILE)
    }

    /// Directory holding daemon log files
    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.circuit.reset_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.resync_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = DaemonSettings::default();
        assert_eq!(settings.circuit.max_consecutive_failures, 10);
        assert_eq!(settings.circuit.reset_interval_secs, 3600);
        assert_eq!(settings.heartbeat.resync_interval_secs, 1800);
        assert_eq!(settings.cc_info.fetch_interval_ms, 3000);
        assert_eq!(settings.cc_info.inactivity_timeout_secs, 180);
        assert!(!settings.code_tracking.enabled);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            token = "abc"
            base_dir = "/var/lib/devpulse"

            [code_tracking]
            enabled = true

            [circuit]
            max_consecutive_failures = 3
        "#;

        let settings: DaemonSettings = toml::from_str(toml).expect("Should parse TOML");
        assert_eq!(settings.token, "abc");
        assert!(settings.code_tracking.enabled);
        assert_eq!(settings.circuit.max_consecutive_failures, 3);
        // Untouched sections keep defaults
        assert_eq!(settings.circuit.reset_interval_secs, 3600);
        assert_eq!(
            settings.sync_pending_path(),
            PathBuf::from("/var/lib/devpulse/sync-pending.ndjson")
        );
    }

    #[test]
    fn test_merge_cli_takes_precedence() {
        let mut settings = DaemonSettings::default();
        settings.merge_cli(&CliOverrides {
            socket_path: Some(PathBuf::from("/tmp/x.sock")),
            base_dir: None,
            api_endpoint: Some("http://localhost:8080/".to_string()),
            code_tracking: true,
        });
        settings.validate();
        assert_eq!(settings.socket_path, PathBuf::from("/tmp/x.sock"));
        assert_eq!(settings.api_endpoint, "http://localhost:8080");
        assert!(settings.code_tracking.enabled);
    }

    #[test]
    fn test_validate_clamps_zero_values() {
        let mut settings = DaemonSettings::default();
        settings.circuit.max_consecutive_failures = 0;
        settings.cc_info.fetch_interval_ms = 0;
        settings.bus.capacity = 0;
        settings.validate();
        assert_eq!(settings.circuit.max_consecutive_failures, 1);
        assert_eq!(settings.cc_info.fetch_interval_ms, 100);
        assert_eq!(settings.bus.capacity, 1);
    }

    #[test]
    fn test_runtime_dir_prefers_xdg() {
        temp_env::with_var("XDG_RUNTIME_DIR", Some("/run/user/1000"), || {
            assert_eq!(runtime_dir(), PathBuf::from("/run/user/1000"));
        });
        temp_env::with_var_unset("XDG_RUNTIME_DIR", || {
            assert_eq!(runtime_dir(), PathBuf::from("/tmp"));
        });
    }
}
