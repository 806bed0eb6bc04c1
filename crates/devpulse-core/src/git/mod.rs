use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Timeout for git commands to prevent hanging on unresponsive repos
const GIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Git information for a working directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitInfo {
    /// Current branch name (empty outside a repository)
    pub branch: String,
    /// Whether the working tree has uncommitted changes
    pub dirty: bool,
    /// Whether the directory is inside a git repository
    pub is_repo: bool,
}

/// Per-directory cache of git information with TTL.
///
/// Entries past their TTL are still served by [`GitCache::get_cached`];
/// callers decide when to refresh via [`GitCache::is_expired`].
pub struct GitCache {
    cache: HashMap<String, (GitInfo, Instant)>,
    ttl: Duration,
}

impl Default for GitCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl GitCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: HashMap::new(),
            ttl,
        }
    }

    /// Cached info for a directory, however old
    pub fn get_cached(&self, dir: &str) -> Option<GitInfo> {
        self.cache.get(dir).map(|(info, _)| info.clone())
    }

    /// Whether `dir` has no entry or an entry older than the TTL
    pub fn is_expired(&self, dir: &str) -> bool {
        match self.cache.get(dir) {
            Some((_, ts)) => ts.elapsed() >= self.ttl,
            None => true,
        }
    }

    pub fn insert(&mut self, dir: &str, info: GitInfo) {
        self.cache.insert(dir.to_string(), (info, Instant::now()));
    }

    /// Remove entries not refreshed for three TTLs; returns how many were removed
    pub fn cleanup(&mut self) -> usize {
        let before = self.cache.len();
        let ttl = self.ttl;
        self.cache.retain(|_, (_, ts)| ts.elapsed() < ttl * 3);
        before - self.cache.len()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Fetch branch and dirty state for a directory with timeout.
///
/// Any failure (not a repo, git missing, timeout) yields `is_repo: false`.
pub async fn fetch_git_info(dir: &str) -> GitInfo {
    let branch = match fetch_branch(dir).await {
        Some(b) => b,
        None => return GitInfo::default(),
    };
    let dirty = fetch_dirty(dir).await;
    GitInfo {
        branch,
        dirty,
        is_repo: true,
    }
}

/// Fetch the current branch name for a directory
async fn fetch_branch(dir: &str) -> Option<String> {
    let output = tokio::time::timeout(
        GIT_TIMEOUT,
        Command::new("git")
            .args(["-C", dir, "rev-parse", "--abbrev-ref", "HEAD"])
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

/// Check if the working tree has uncommitted changes.
///
/// Untracked files are skipped; on large repositories they dominate the scan.
async fn fetch_dirty(dir: &str) -> bool {
    let output = tokio::time::timeout(
        GIT_TIMEOUT,
        Command::new("git")
            .args(["-C", dir, "status", "--porcelain", "--untracked-files=no"])
            .output(),
    )
    .await;
    match output {
        Ok(Ok(o)) => !o.stdout.is_empty(),
        _ => false,
    }
}
