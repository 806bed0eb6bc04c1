//! Activity-gated polling of cost, git and rate-limit data.
//!
//! Readers always get whatever is cached. Polling runs only while clients
//! keep calling [`CcInfoTimer::notify_activity`]; once the inactivity
//! timeout passes the loop stops itself and forgets which ranges and
//! directories were being watched.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::rate_limit::RateLimitSource;
use super::types::{AnthropicRateLimitData, CcInfoCache, TimeRange};
use crate::config::DaemonSettings;
use crate::git::{self, GitCache, GitInfo};
use crate::lifecycle::{self, ShutdownSignal, TaskHandle};
use crate::remote::SharedBackend;

/// Failed rate-limit lookups are not retried sooner than this many fetch intervals
const RATE_LIMIT_BACKOFF_FACTOR: u32 = 20;

/// Polling configuration
#[derive(Debug, Clone)]
pub struct CcInfoConfig {
    pub fetch_interval: Duration,
    pub inactivity_timeout: Duration,
    pub rate_limit_ttl: Duration,
    pub git_ttl: Duration,
}

impl Default for CcInfoConfig {
    fn default() -> Self {
        Self {
            fetch_interval: Duration::from_secs(3),
            inactivity_timeout: Duration::from_secs(180),
            rate_limit_ttl: Duration::from_secs(600),
            git_ttl: Duration::from_secs(10),
        }
    }
}

impl From<&DaemonSettings> for CcInfoConfig {
    fn from(settings: &DaemonSettings) -> Self {
        let cc = &settings.cc_info;
        Self {
            fetch_interval: Duration::from_millis(cc.fetch_interval_ms),
            inactivity_timeout: Duration::from_secs(cc.inactivity_timeout_secs),
            rate_limit_ttl: Duration::from_secs(cc.rate_limit_ttl_secs),
            git_ttl: Duration::from_secs(cc.git_ttl_secs),
        }
    }
}

#[derive(Default)]
struct RateLimitState {
    data: Option<AnthropicRateLimitData>,
    fetched_at: Option<Instant>,
    last_attempt_at: Option<Instant>,
}

struct PollLoop {
    id: u64,
    task: TaskHandle,
}

struct Inner {
    config: CcInfoConfig,
    backend: SharedBackend,
    rate_limit_source: Option<Arc<dyn RateLimitSource>>,
    costs: RwLock<HashMap<TimeRange, CcInfoCache>>,
    active_ranges: Mutex<HashSet<TimeRange>>,
    git_cache: RwLock<GitCache>,
    active_dirs: Mutex<HashSet<String>>,
    rate_limit: RwLock<RateLimitState>,
    user_login: RwLock<Option<String>>,
    login_attempted: AtomicBool,
    last_activity: Mutex<Instant>,
    running: Mutex<Option<PollLoop>>,
    next_loop_id: AtomicU64,
    shutdown: ShutdownSignal,
}

/// Demand-driven cache for the `cc_info` request
#[derive(Clone)]
pub struct CcInfoTimer {
    inner: Arc<Inner>,
}

impl CcInfoTimer {
    pub fn new(
        config: CcInfoConfig,
        backend: SharedBackend,
        rate_limit_source: Option<Arc<dyn RateLimitSource>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let git_cache = GitCache::new(config.git_ttl);
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                rate_limit_source,
                costs: RwLock::new(HashMap::new()),
                active_ranges: Mutex::new(HashSet::new()),
                git_cache: RwLock::new(git_cache),
                active_dirs: Mutex::new(HashSet::new()),
                rate_limit: RwLock::new(RateLimitState::default()),
                user_login: RwLock::new(None),
                login_attempted: AtomicBool::new(false),
                last_activity: Mutex::new(Instant::now()),
                running: Mutex::new(None),
                next_loop_id: AtomicU64::new(1),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &CcInfoConfig {
        &self.inner.config
    }

    /// Include `range` in the next refresh
    pub fn mark_range_active(&self, range: TimeRange) {
        self.inner.active_ranges.lock().insert(range);
    }

    /// Cached cost for `range`; marks the range active and never fetches
    pub fn get_cached_cost(&self, range: TimeRange) -> CcInfoCache {
        self.mark_range_active(range);
        self.inner
            .costs
            .read()
            .get(&range)
            .copied()
            .unwrap_or_default()
    }

    /// Cached git info for `dir`; registers the directory for refresh
    pub fn get_cached_git_info(&self, dir: &str) -> GitInfo {
        if dir.is_empty() {
            return GitInfo::default();
        }
        self.inner.active_dirs.lock().insert(dir.to_string());
        self.inner
            .git_cache
            .read()
            .get_cached(dir)
            .unwrap_or_default()
    }

    /// Serve a client request: record activity, then read the caches.
    ///
    /// Activity is recorded first so a concurrent inactivity check either
    /// suspends before the range is registered or sees the fresh activity.
    pub fn lookup(&self, range: TimeRange, dir: &str) -> (CcInfoCache, GitInfo) {
        self.notify_activity();
        (self.get_cached_cost(range), self.get_cached_git_info(dir))
    }

    pub fn get_cached_rate_limit(&self) -> Option<AnthropicRateLimitData> {
        self.inner.rate_limit.read().data.clone()
    }

    pub fn get_user_login(&self) -> Option<String> {
        self.inner.user_login.read().clone()
    }

    pub fn active_ranges(&self) -> Vec<TimeRange> {
        let mut ranges: Vec<_> = self.inner.active_ranges.lock().iter().copied().collect();
        ranges.sort_by_key(|r| r.as_str());
        ranges
    }

    /// Record client demand and start polling if idle
    pub fn notify_activity(&self) {
        *self.inner.last_activity.lock() = Instant::now();

        let mut running = self.inner.running.lock();
        if running.as_ref().is_some_and(|p| !p.task.is_finished()) {
            return;
        }
        if *self.inner.shutdown.borrow() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("CC info activity outside a runtime, polling not started");
            return;
        }

        let id = self.inner.next_loop_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.clone();
        let task = TaskHandle::spawn(move |stop| poll(inner, id, stop, shutdown));
        *running = Some(PollLoop { id, task });
        info!(
            "CC info polling started (every {:?})",
            self.inner.config.fetch_interval
        );
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .as_ref()
            .is_some_and(|p| !p.task.is_finished())
    }

    /// Stop polling and wait for the loop; safe when idle
    pub async fn stop(&self) {
        let running = self.inner.running.lock().take();
        if let Some(p) = running {
            p.task.stop().await;
            debug!("CC info polling stopped");
        }
    }

    /// Drop git entries nobody asked about recently
    pub fn prune_git_cache(&self) -> usize {
        self.inner.git_cache.write().cleanup()
    }

    #[cfg(test)]
    fn loop_id(&self) -> Option<u64> {
        self.inner.running.lock().as_ref().map(|p| p.id)
    }
}

impl Inner {
    /// Give up the running slot when idle too long. Returns true if the
    /// loop identified by `id` should exit.
    fn suspend_if_inactive(&self, id: u64) -> bool {
        let mut running = self.running.lock();
        if running.as_ref().map(|p| p.id) != Some(id) {
            return true;
        }
        let idle = self.last_activity.lock().elapsed();
        if idle <= self.config.inactivity_timeout {
            return false;
        }

        // Dropping our own handle detaches the task; the loop exits next.
        running.take();
        self.active_ranges.lock().clear();
        self.active_dirs.lock().clear();
        self.login_attempted.store(false, Ordering::Relaxed);
        info!("CC info polling suspended after {:?} without activity", idle);
        true
    }

    async fn refresh(&self) {
        self.refresh_costs().await;
        self.refresh_user_login().await;
        self.refresh_rate_limit().await;
        self.refresh_git().await;
    }

    async fn refresh_costs(&self) {
        let ranges: Vec<TimeRange> = self.active_ranges.lock().iter().copied().collect();
        for range in ranges {
            let window = range.window();
            let backend = self.backend.clone();
            let result =
                tokio::task::spawn_blocking(move || backend.fetch_cost(&window)).await;
            match result {
                Ok(Ok(summary)) => {
                    self.costs.write().insert(
                        range,
                        CcInfoCache {
                            total_cost_usd: summary.total_cost_usd,
                            total_session_seconds: summary.total_session_seconds,
                            fetched_at: Some(Utc::now()),
                        },
                    );
                }
                Ok(Err(e)) => warn!("Failed to fetch cost for {}: {}", range, e),
                Err(e) => warn!("Cost fetch task for {} failed: {}", range, e),
            }
        }
    }

    async fn refresh_user_login(&self) {
        if self.login_attempted.swap(true, Ordering::Relaxed) {
            return;
        }
        let backend = self.backend.clone();
        match tokio::task::spawn_blocking(move || backend.fetch_user_login()).await {
            Ok(Ok(Some(login))) => *self.user_login.write() = Some(login),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => debug!("Failed to fetch user login: {}", e),
            Err(e) => warn!("User login task failed: {}", e),
        }
    }

    fn rate_limit_due(&self) -> bool {
        let state = self.rate_limit.read();
        if state
            .fetched_at
            .is_some_and(|t| t.elapsed() < self.config.rate_limit_ttl)
        {
            return false;
        }
        let backoff = self
            .config
            .fetch_interval
            .saturating_mul(RATE_LIMIT_BACKOFF_FACTOR);
        state.last_attempt_at.is_none_or(|t| t.elapsed() >= backoff)
    }

    async fn refresh_rate_limit(&self) {
        let Some(source) = self.rate_limit_source.clone() else {
            return;
        };
        if !self.rate_limit_due() {
            return;
        }
        self.rate_limit.write().last_attempt_at = Some(Instant::now());

        match tokio::task::spawn_blocking(move || source.fetch()).await {
            Ok(Ok(data)) => {
                let mut state = self.rate_limit.write();
                state.data = Some(data);
                state.fetched_at = Some(Instant::now());
            }
            Ok(Err(e)) => debug!("Failed to fetch rate limits: {}", e),
            Err(e) => warn!("Rate limit task failed: {}", e),
        }
    }

    async fn refresh_git(&self) {
        let dirs: Vec<String> = self.active_dirs.lock().iter().cloned().collect();
        for dir in dirs {
            if !self.git_cache.read().is_expired(&dir) {
                continue;
            }
            let info = git::fetch_git_info(&dir).await;
            self.git_cache.write().insert(&dir, info);
        }
    }
}

async fn poll(
    inner: Arc<Inner>,
    id: u64,
    mut stop: tokio::sync::watch::Receiver<bool>,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = lifecycle::ticker(inner.config.fetch_interval, true);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if inner.suspend_if_inactive(id) {
                    break;
                }
                inner.refresh().await;
            }
            _ = lifecycle::signalled(&mut stop) => break,
            _ = lifecycle::signalled(&mut shutdown) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::MockBackend;
    use crate::remote::RemoteError;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockRateLimits {
        calls: AtomicUsize,
    }

    impl RateLimitSource for MockRateLimits {
        fn fetch(&self) -> Result<AnthropicRateLimitData, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AnthropicRateLimitData {
                five_hour_utilization: 12.0,
                seven_day_utilization: 34.0,
                ..Default::default()
            })
        }
    }

    fn fast_config() -> CcInfoConfig {
        CcInfoConfig {
            fetch_interval: Duration::from_millis(20),
            inactivity_timeout: Duration::from_secs(60),
            rate_limit_ttl: Duration::from_secs(600),
            git_ttl: Duration::from_secs(10),
        }
    }

    fn timer_with(
        config: CcInfoConfig,
        backend: Arc<MockBackend>,
        rate_limits: Option<Arc<MockRateLimits>>,
    ) -> (CcInfoTimer, tokio::sync::watch::Sender<bool>) {
        let (tx, rx) = lifecycle::shutdown_channel();
        let source = rate_limits.map(|r| r as Arc<dyn RateLimitSource>);
        (CcInfoTimer::new(config, backend, source, rx), tx)
    }

    #[tokio::test]
    async fn test_no_fetch_before_activity() {
        let backend = Arc::new(MockBackend::default());
        let (timer, _tx) = timer_with(fast_config(), backend.clone(), None);

        let cached = timer.get_cached_cost(TimeRange::Today);
        assert_eq!(cached, CcInfoCache::default());
        assert_eq!(timer.active_ranges(), vec![TimeRange::Today]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.cost_calls.load(Ordering::SeqCst), 0);
        assert!(!timer.is_running());
    }

    #[tokio::test]
    async fn test_activity_triggers_fetch() {
        let backend = Arc::new(MockBackend::default());
        let (timer, _tx) = timer_with(fast_config(), backend.clone(), None);

        timer.get_cached_cost(TimeRange::Week);
        timer.notify_activity();
        assert!(timer.is_running());
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(backend.cost_calls.load(Ordering::SeqCst) >= 1);
        let cached = timer.get_cached_cost(TimeRange::Week);
        assert_eq!(cached.total_cost_usd, 1.5);
        assert_eq!(cached.total_session_seconds, 600);
        assert!(cached.fetched_at.is_some());
        // Other ranges stay untouched
        assert_eq!(timer.get_cached_cost(TimeRange::Month).fetched_at, None);
        timer.stop().await;
    }

    #[tokio::test]
    async fn test_repeated_activity_keeps_same_loop() {
        let backend = Arc::new(MockBackend::default());
        let (timer, _tx) = timer_with(fast_config(), backend, None);

        timer.notify_activity();
        let first = timer.loop_id();
        timer.notify_activity();
        timer.notify_activity();
        assert_eq!(timer.loop_id(), first);
        timer.stop().await;
        assert!(!timer.is_running());
    }

    #[tokio::test]
    async fn test_inactivity_auto_stop_clears_ranges() {
        let backend = Arc::new(MockBackend::default());
        let config = CcInfoConfig {
            inactivity_timeout: Duration::from_millis(80),
            ..fast_config()
        };
        let (timer, _tx) = timer_with(config, backend, None);

        timer.get_cached_cost(TimeRange::Today);
        timer.get_cached_git_info("/nonexistent/dir");
        timer.notify_activity();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!timer.is_running());
        assert!(timer.active_ranges().is_empty());
        assert!(timer.inner.active_dirs.lock().is_empty());

        // Resumes on the next activity
        timer.notify_activity();
        assert!(timer.is_running());
        timer.stop().await;
    }

    #[tokio::test]
    async fn test_lookup_survives_concurrent_inactivity_check() {
        let backend = Arc::new(MockBackend::default());
        let config = CcInfoConfig {
            fetch_interval: Duration::from_secs(10),
            inactivity_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let (timer, _tx) = timer_with(config, backend, None);

        timer.notify_activity();
        let first = timer.loop_id().unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        // Check lands right after the request
        timer.lookup(TimeRange::Week, "");
        assert!(!timer.inner.suspend_if_inactive(first));
        assert_eq!(timer.active_ranges(), vec![TimeRange::Week]);
        assert_eq!(timer.loop_id(), Some(first));

        // Check lands right before the request
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(timer.inner.suspend_if_inactive(first));
        timer.lookup(TimeRange::Today, "");
        assert_eq!(timer.active_ranges(), vec![TimeRange::Today]);
        assert!(timer.is_running());
        assert_ne!(timer.loop_id(), Some(first));
        timer.stop().await;
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_stale_value() {
        let backend = Arc::new(MockBackend::default());
        let (timer, _tx) = timer_with(fast_config(), backend.clone(), None);

        timer.get_cached_cost(TimeRange::Today);
        timer.notify_activity();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let before = timer.get_cached_cost(TimeRange::Today);
        assert_eq!(before.total_cost_usd, 1.5);

        backend.fail_cost.store(true, Ordering::SeqCst);
        let calls = backend.cost_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(backend.cost_calls.load(Ordering::SeqCst) > calls);
        assert_eq!(timer.get_cached_cost(TimeRange::Today), before);
        timer.stop().await;
    }

    #[tokio::test]
    async fn test_user_login_fetched_once_per_session() {
        let backend = Arc::new(MockBackend::default());
        let (timer, _tx) = timer_with(fast_config(), backend.clone(), None);

        assert_eq!(timer.get_user_login(), None);
        timer.notify_activity();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(timer.get_user_login(), Some("octocat".to_string()));
        assert_eq!(backend.login_calls.load(Ordering::SeqCst), 1);
        timer.stop().await;
    }

    #[tokio::test]
    async fn test_rate_limit_cached_within_ttl() {
        let backend = Arc::new(MockBackend::default());
        let rate_limits = Arc::new(MockRateLimits::default());
        let (timer, _tx) = timer_with(fast_config(), backend, Some(rate_limits.clone()));

        assert_eq!(timer.get_cached_rate_limit(), None);
        timer.notify_activity();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let data = timer.get_cached_rate_limit().unwrap();
        assert_eq!(data.five_hour_utilization, 12.0);
        assert_eq!(rate_limits.calls.load(Ordering::SeqCst), 1);
        timer.stop().await;
    }

    #[test]
    fn test_rate_limit_backoff_with_huge_interval() {
        let config = CcInfoConfig {
            fetch_interval: Duration::MAX,
            ..fast_config()
        };
        let (timer, _tx) = timer_with(config, Arc::new(MockBackend::default()), None);
        assert!(timer.inner.rate_limit_due());

        timer.inner.rate_limit.write().last_attempt_at = Some(Instant::now());
        assert!(!timer.inner.rate_limit_due());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let backend = Arc::new(MockBackend::default());
        let (timer, _tx) = timer_with(fast_config(), backend, None);
        timer.stop().await;
        timer.notify_activity();
        timer.stop().await;
        timer.stop().await;
        assert!(!timer.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_prevents_restart() {
        let backend = Arc::new(MockBackend::default());
        let (timer, tx) = timer_with(fast_config(), backend, None);
        tx.send(true).unwrap();
        timer.notify_activity();
        assert!(!timer.is_running());
    }

    #[test]
    fn test_empty_dir_is_not_registered() {
        let backend = Arc::new(MockBackend::default());
        let (timer, _tx) = timer_with(fast_config(), backend, None);
        assert_eq!(timer.get_cached_git_info(""), GitInfo::default());
        assert!(timer.inner.active_dirs.lock().is_empty());
    }
}
