//! Anthropic subscription rate-limit lookup via the OAuth usage endpoint.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::types::AnthropicRateLimitData;
use crate::remote::RemoteError;

const USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const KEYCHAIN_SERVICE: &str = "Claude Code-credentials";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of rate-limit utilisation data
pub trait RateLimitSource: Send + Sync {
    fn fetch(&self) -> Result<AnthropicRateLimitData, RemoteError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsFile {
    claude_ai_oauth: Option<OAuthCredentials>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthCredentials {
    access_token: String,
}

#[derive(Deserialize)]
struct UsageWindow {
    #[serde(default)]
    utilization: Option<f64>,
    #[serde(default)]
    resets_at: Option<String>,
}

#[derive(Deserialize)]
struct UsageResponse {
    #[serde(default)]
    five_hour: Option<UsageWindow>,
    #[serde(default)]
    seven_day: Option<UsageWindow>,
}

impl From<UsageResponse> for AnthropicRateLimitData {
    fn from(r: UsageResponse) -> Self {
        let (five_hour_utilization, five_hour_resets_at) = split_window(r.five_hour);
        let (seven_day_utilization, seven_day_resets_at) = split_window(r.seven_day);
        Self {
            five_hour_utilization,
            five_hour_resets_at,
            seven_day_utilization,
            seven_day_resets_at,
        }
    }
}

fn split_window(w: Option<UsageWindow>) -> (f64, Option<String>) {
    match w {
        Some(w) => (w.utilization.unwrap_or_default(), w.resets_at),
        None => (0.0, None),
    }
}

/// Reads the Claude Code OAuth token and queries the usage endpoint
pub struct AnthropicUsageClient {
    agent: ureq::Agent,
    credentials_path: PathBuf,
}

impl Default for AnthropicUsageClient {
    fn default() -> Self {
        let path = dirs::home_dir()
            .unwrap_or_default()
            .join(".claude/.credentials.json");
        Self::with_credentials_path(path)
    }
}

impl AnthropicUsageClient {
    pub fn with_credentials_path(credentials_path: PathBuf) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build()
            .into();
        Self {
            agent,
            credentials_path,
        }
    }

    /// OAuth access token from the credentials file, then the macOS keychain
    fn access_token(&self) -> Option<String> {
        if let Ok(content) = std::fs::read_to_string(&self.credentials_path) {
            if let Some(token) = parse_access_token(&content) {
                return Some(token);
            }
        }
        keychain_credentials().and_then(|c| parse_access_token(&c))
    }
}

fn parse_access_token(content: &str) -> Option<String> {
    let creds: CredentialsFile = serde_json::from_str(content).ok()?;
    creds
        .claude_ai_oauth
        .map(|o| o.access_token)
        .filter(|t| !t.is_empty())
}

#[cfg(target_os = "macos")]
fn keychain_credentials() -> Option<String> {
    let output = std::process::Command::new("security")
        .args(["find-generic-password", "-s", KEYCHAIN_SERVICE, "-w"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(not(target_os = "macos"))]
fn keychain_credentials() -> Option<String> {
    let _ = KEYCHAIN_SERVICE;
    None
}

impl RateLimitSource for AnthropicUsageClient {
    fn fetch(&self) -> Result<AnthropicRateLimitData, RemoteError> {
        let token = self.access_token().ok_or(RemoteError::NotConfigured)?;
        debug!("GET {}", USAGE_URL);
        let mut response = self
            .agent
            .get(USAGE_URL)
            .header("Authorization", &format!("Bearer {}", token))
            .header("anthropic-beta", OAUTH_BETA)
            .call()?;
        let usage: UsageResponse = response
            .body_mut()
            .read_json()
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(usage.into())
    }
}
