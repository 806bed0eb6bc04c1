//! In-memory [`Backend`] for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{Backend, CostSummary, RemoteError};
use crate::ccinfo::TimeWindow;
use crate::model::HeartbeatPayload;

#[derive(Default)]
pub(crate) struct MockBackend {
    pub cost_calls: AtomicUsize,
    pub login_calls: AtomicUsize,
    pub sync_calls: AtomicUsize,
    pub heartbeat_calls: AtomicUsize,
    pub fail_cost: AtomicBool,
    pub fail_send: AtomicBool,
    pub synced: Mutex<Vec<serde_json::Value>>,
    pub heartbeats: Mutex<Vec<HeartbeatPayload>>,
}

impl MockBackend {
    pub fn failing() -> Self {
        let backend = Self::default();
        backend.fail_send.store(true, Ordering::SeqCst);
        backend
    }
}

impl Backend for MockBackend {
    fn send_sync(&self, payload: &serde_json::Value) -> Result<(), RemoteError> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(RemoteError::Http { status: 502 });
        }
        self.synced.lock().push(payload.clone());
        Ok(())
    }

    fn send_heartbeats(&self, payload: &HeartbeatPayload) -> Result<(), RemoteError> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".to_string()));
        }
        self.heartbeats.lock().push(payload.clone());
        Ok(())
    }

    fn fetch_cost(&self, _window: &TimeWindow) -> Result<CostSummary, RemoteError> {
        self.cost_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_cost.load(Ordering::SeqCst) {
            return Err(RemoteError::Http { status: 503 });
        }
        Ok(CostSummary {
            total_cost_usd: 1.5,
            total_session_seconds: 600,
        })
    }

    fn fetch_user_login(&self) -> Result<Option<String>, RemoteError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some("octocat".to_string()))
    }
}
