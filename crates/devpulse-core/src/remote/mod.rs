//! Remote backend access
//!
//! The daemon talks to the backend only through [`Backend`]. Calls are
//! blocking; async callers go through `tokio::task::spawn_blocking`.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::ccinfo::TimeWindow;
use crate::model::HeartbeatPayload;

#[cfg(test)]
pub(crate) mod testing;

/// Timeout applied to every backend request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const COST_QUERY: &str = "query CcInfoCost($since: String!, $until: String!) { \
    ccCost(since: $since, until: $until) { totalCostUsd totalSessionSeconds } }";

const USER_QUERY: &str = "query CurrentUser { currentUser { login } }";

/// Error type for backend calls
#[derive(Debug, Error)]
pub enum RemoteError {
    /// No token or endpoint configured
    #[error("backend is not configured")]
    NotConfigured,

    /// Backend answered with a non-success status
    #[error("backend returned HTTP {status}")]
    Http { status: u16 },

    /// Connection, TLS or timeout failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Response body could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl From<ureq::Error> for RemoteError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::StatusCode(status) => RemoteError::Http { status },
            other => RemoteError::Transport(other.to_string()),
        }
    }
}

/// Aggregated AI-tool cost for a time window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_session_seconds: i64,
}

/// Remote operations the daemon needs
pub trait Backend: Send + Sync {
    /// Deliver one opaque sync payload
    fn send_sync(&self, payload: &serde_json::Value) -> Result<(), RemoteError>;

    /// Deliver a batch of heartbeats
    fn send_heartbeats(&self, payload: &HeartbeatPayload) -> Result<(), RemoteError>;

    /// Fetch aggregated cost for a time window
    fn fetch_cost(&self, window: &TimeWindow) -> Result<CostSummary, RemoteError>;

    /// Fetch the login of the account owning the token
    fn fetch_user_login(&self) -> Result<Option<String>, RemoteError>;
}

/// Shared handle to a backend
pub type SharedBackend = Arc<dyn Backend>;

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CostData {
    cc_cost: CostSummary,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserData {
    current_user: Option<UserLogin>,
}

#[derive(Deserialize)]
struct UserLogin {
    login: String,
}

/// HTTP/GraphQL backend client
pub struct HttpBackend {
    agent: ureq::Agent,
    endpoint: String,
    token: String,
}

impl HttpBackend {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build()
            .into();
        Self {
            agent,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn check_configured(&self) -> Result<(), RemoteError> {
        if self.token.is_empty() || self.endpoint.is_empty() {
            return Err(RemoteError::NotConfigured);
        }
        Ok(())
    }

    fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<(), RemoteError> {
        self.check_configured()?;
        let url = format!("{}{}", self.endpoint, path);
        debug!("POST {}", url);
        self.agent
            .post(&url)
            .header("Authorization", &format!("Bearer {}", self.token))
            .header("User-Agent", concat!("devpulse/", env!("CARGO_PKG_VERSION")))
            .send_json(body)?;
        Ok(())
    }

    fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, RemoteError> {
        self.check_configured()?;
        let url = format!("{}/api/v2/graphql", self.endpoint);
        let mut response = self
            .agent
            .post(&url)
            .header("Authorization", &format!("Bearer {}", self.token))
            .header("User-Agent", concat!("devpulse/", env!("CARGO_PKG_VERSION")))
            .send_json(&GraphQlRequest { query, variables })?;
        let parsed: GraphQlResponse<T> = response
            .body_mut()
            .read_json()
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        graphql_data(parsed)
    }
}

fn graphql_data<T>(response: GraphQlResponse<T>) -> Result<T, RemoteError> {
    if let Some(err) = response.errors.first() {
        return Err(RemoteError::Decode(err.message.clone()));
    }
    response
        .data
        .ok_or_else(|| RemoteError::Decode("response has no data".to_string()))
}

impl Backend for HttpBackend {
    fn send_sync(&self, payload: &serde_json::Value) -> Result<(), RemoteError> {
        self.post_json("/api/v1/sync", payload)
    }

    fn send_heartbeats(&self, payload: &HeartbeatPayload) -> Result<(), RemoteError> {
        self.post_json("/api/v1/heartbeats", payload)
    }

    fn fetch_cost(&self, window: &TimeWindow) -> Result<CostSummary, RemoteError> {
        let data: CostData = self.graphql(
            COST_QUERY,
            serde_json::json!({
                "since": window.since_rfc3339(),
                "until": window.until_rfc3339(),
            }),
        )?;
        Ok(data.cc_cost)
    }

    fn fetch_user_login(&self) -> Result<Option<String>, RemoteError> {
        let data: UserData = self.graphql(USER_QUERY, serde_json::json!({}))?;
        Ok(data.current_user.map(|u| u.login))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_backend_fails_fast() {
        let backend = HttpBackend::new("https://api.example.com", "");
        assert!(matches!(
            backend.send_sync(&serde_json::json!({})),
            Err(RemoteError::NotConfigured)
        ));
        assert!(matches!(
            backend.fetch_user_login(),
            Err(RemoteError::NotConfigured)
        ));
    }

    #[test]
    fn test_graphql_errors_take_precedence() {
        let response: GraphQlResponse<CostData> = serde_json::from_str(
            r#"{"data":null,"errors":[{"message":"unauthorized"}]}"#,
        )
        .unwrap();
        match graphql_data(response) {
            Err(RemoteError::Decode(msg)) => assert_eq!(msg, "unauthorized"),
            _ => panic!("Expected Decode error"),
        }
    }

    #[test]
    fn test_graphql_cost_decoding() {
        let response: GraphQlResponse<CostData> = serde_json::from_str(
            r#"{"data":{"ccCost":{"totalCostUsd":1.25,"totalSessionSeconds":3600}}}"#,
        )
        .unwrap();
        let data = graphql_data(response).unwrap();
        assert_eq!(
            data.cc_cost,
            CostSummary {
                total_cost_usd: 1.25,
                total_session_seconds: 3600
            }
        );
    }

    #[test]
    fn test_status_code_maps_to_http_error() {
        let err: RemoteError = ureq::Error::StatusCode(503).into();
        assert!(matches!(err, RemoteError::Http { status: 503 }));
    }
}
