//! Client side of the daemon socket, used by the CLI
//!
//! Every call opens a fresh connection, writes one request and reads at
//! most one reply. The whole exchange is bounded by [`CLIENT_TIMEOUT`].

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::ccinfo::TimeRange;
use crate::ipc::protocol::*;
use crate::model::HeartbeatPayload;

/// Deadline for one request/response exchange
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

async fn connect_and_send(socket_path: &Path, request: &Value) -> Result<UnixStream> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("Failed to connect to daemon at {}", socket_path.display()))?;
    stream.write_all(&encode(request)?).await?;
    stream.flush().await?;
    Ok(stream)
}

async fn request<T: DeserializeOwned>(socket_path: &Path, request: Value) -> Result<T> {
    let exchange = async {
        let mut stream = connect_and_send(socket_path, &request).await?;
        let value = read_json_value(&mut stream).await.map_err(|e| match e {
            ProtocolError::Incomplete => {
                anyhow::anyhow!("Daemon closed the connection without a reply")
            }
            other => other.into(),
        })?;
        serde_json::from_value(value).context("Unexpected reply from daemon")
    };
    tokio::time::timeout(CLIENT_TIMEOUT, exchange)
        .await
        .with_context(|| format!("Daemon did not answer within {:?}", CLIENT_TIMEOUT))?
}

/// Ask the daemon for its version and uptime
pub async fn request_status(socket_path: &Path) -> Result<StatusResponse> {
    request(socket_path, envelope(MessageType::Status, None)).await
}

/// Ask the daemon for cached cost, git and rate-limit data
pub async fn request_cc_info(
    socket_path: &Path,
    range: TimeRange,
    working_directory: Option<&str>,
) -> Result<CcInfoResponse> {
    let payload = CcInfoRequest {
        time_range: Some(range.as_str().to_string()),
        working_directory: working_directory.map(str::to_string),
    };
    request(
        socket_path,
        envelope(MessageType::CcInfo, Some(serde_json::to_value(payload)?)),
    )
    .await
}

/// Hand a sync payload to the daemon. Returns once it has been written.
pub async fn send_sync(socket_path: &Path, payload: Value) -> Result<()> {
    let request = envelope(MessageType::Sync, Some(payload));
    let exchange = async {
        let mut stream = connect_and_send(socket_path, &request).await?;
        stream.shutdown().await?;
        Ok::<_, anyhow::Error>(())
    };
    tokio::time::timeout(CLIENT_TIMEOUT, exchange)
        .await
        .with_context(|| format!("Daemon did not accept sync within {:?}", CLIENT_TIMEOUT))?
}

/// Send a heartbeat batch; the ack says whether code tracking is enabled
pub async fn send_heartbeat(
    socket_path: &Path,
    payload: &HeartbeatPayload,
) -> Result<HeartbeatAck> {
    request(
        socket_path,
        envelope(MessageType::Heartbeat, Some(serde_json::to_value(payload)?)),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HeartbeatData;
    use pretty_assertions::assert_eq;
    use tokio::net::UnixListener;

    /// One-shot server answering every request with `reply`
    fn serve_once(
        listener: UnixListener,
        reply: Option<Value>,
    ) -> tokio::task::JoinHandle<Value> {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_json_value(&mut stream).await.unwrap();
            if let Some(reply) = reply {
                stream.write_all(&encode(&reply).unwrap()).await.unwrap();
            }
            request
        })
    }

    #[tokio::test]
    async fn test_request_cc_info_sends_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve_once(
            listener,
            Some(serde_json::json!({
                "totalCostUsd": 2.25,
                "totalSessionSeconds": 90,
                "timeRange": "month",
                "cachedAt": "2026-10-19T10:00:00+00:00",
                "gitBranch": "main",
                "gitDirty": true,
                "fiveHourUtilization": 40.0,
                "sevenDayUtilization": 5.0
            })),
        );

        let response = request_cc_info(&path, TimeRange::Month, Some("/repo"))
            .await
            .unwrap();
        assert_eq!(response.total_cost_usd, 2.25);
        assert_eq!(response.git_branch, "main");
        assert_eq!(response.five_hour_utilization, Some(40.0));
        assert_eq!(response.user_login, None);

        let request = server.await.unwrap();
        assert_eq!(request["type"], "cc_info");
        assert_eq!(request["payload"]["timeRange"], "month");
        assert_eq!(request["payload"]["workingDirectory"], "/repo");
    }

    #[tokio::test]
    async fn test_send_heartbeat_payload_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve_once(listener, Some(serde_json::json!({"status": "ok"})));

        let payload = HeartbeatPayload {
            heartbeats: vec![HeartbeatData::new("/src/main.rs")],
        };
        let ack = send_heartbeat(&path, &payload).await.unwrap();
        assert_eq!(ack, HeartbeatAck::ok());

        let request = server.await.unwrap();
        assert_eq!(request["type"], "heartbeat");
        assert_eq!(request["payload"]["heartbeats"][0]["entity"], "/src/main.rs");
    }

    #[tokio::test]
    async fn test_missing_reply_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve_once(listener, None);

        let err = request_status(&path).await.unwrap_err();
        assert!(err.to_string().contains("without a reply"), "{}", err);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_sync_does_not_wait_for_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve_once(listener, None);

        send_sync(&path, serde_json::json!({"commands": []}))
            .await
            .unwrap();
        let request = server.await.unwrap();
        assert_eq!(request["type"], "sync");
    }

    #[tokio::test]
    async fn test_unreachable_socket() {
        let dir = tempfile::tempdir().unwrap();
        let err = request_status(&dir.path().join("missing.sock"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to connect"));
    }
}
