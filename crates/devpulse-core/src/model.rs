//! Payload types carried through the daemon.

use serde::{Deserialize, Serialize};

/// A single editor heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    /// Client-generated idempotency id, used by the backend to drop duplicates
    pub heartbeat_id: String,
    /// File (or other entity) the activity happened on
    pub entity: String,
    /// Unix seconds of the activity
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_version: Option<String>,
    /// Whether the heartbeat was triggered by a save
    #[serde(default)]
    pub is_write: bool,
}

impl HeartbeatData {
    /// Create a heartbeat for `entity` at the current time with a fresh id
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            heartbeat_id: uuid::Uuid::new_v4().to_string(),
            entity: entity.into(),
            time: chrono::Utc::now().timestamp(),
            project: None,
            branch: None,
            language: None,
            editor: None,
            editor_version: None,
            is_write: false,
        }
    }
}

/// A batch of heartbeats, the unit of delivery and of resync persistence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub heartbeats: Vec<HeartbeatData>,
}

impl HeartbeatPayload {
    pub fn is_empty(&self) -> bool {
        self.heartbeats.is_empty()
    }
}
