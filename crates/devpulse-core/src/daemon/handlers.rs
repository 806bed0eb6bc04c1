//! Bus consumer: routes socket envelopes to the sync and heartbeat paths

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::bus::{Delivery, Message};
use crate::circuit::CircuitBreaker;
use crate::ipc::protocol::SocketMessage;
use crate::model::HeartbeatPayload;
use crate::remote::SharedBackend;
use crate::retry_queue::PersistentQueue;

/// State shared by the pub/sub handlers
pub struct PubSubHandlers {
    backend: SharedBackend,
    breaker: Arc<CircuitBreaker>,
    heartbeat_queue: Arc<PersistentQueue>,
}

impl PubSubHandlers {
    pub fn new(
        backend: SharedBackend,
        breaker: Arc<CircuitBreaker>,
        heartbeat_queue: Arc<PersistentQueue>,
    ) -> Self {
        Self {
            backend,
            breaker,
            heartbeat_queue,
        }
    }

    /// Decode the envelope again and route by type
    pub async fn handle(&self, msg: Message) -> Delivery {
        let decoded = match SocketMessage::from_slice(&msg.payload) {
            Ok(m) => m,
            Err(e) => {
                error!(id = %msg.id, "Dropping undecodable bus message: {}", e);
                return Delivery::Ack;
            }
        };

        match decoded {
            SocketMessage::Sync(payload) => self.handle_pubsub_sync(&msg.payload, payload).await,
            SocketMessage::Heartbeat(payload) => self.handle_pubsub_heartbeat(payload).await,
            other => {
                warn!(
                    "Unexpected {} message on the bus",
                    other.message_type().as_str()
                );
                Delivery::Ack
            }
        }
    }

    /// Deliver a sync payload, or park the envelope while the circuit is open
    /// or after a failed attempt.
    pub async fn handle_pubsub_sync(&self, envelope: &[u8], payload: Value) -> Delivery {
        if self.breaker.is_open() {
            debug!("Circuit open, parking sync payload");
            return self.park_sync(envelope);
        }

        let backend = self.backend.clone();
        let sent = tokio::task::spawn_blocking(move || backend.send_sync(&payload)).await;
        match sent {
            Ok(Ok(())) => {
                self.breaker.record_success();
                Delivery::Ack
            }
            Ok(Err(e)) => {
                warn!("Sync delivery failed: {}", e);
                self.breaker.record_failure();
                self.park_sync(envelope)
            }
            Err(e) => {
                warn!("Sync delivery task failed: {}", e);
                self.breaker.record_failure();
                self.park_sync(envelope)
            }
        }
    }

    fn park_sync(&self, envelope: &[u8]) -> Delivery {
        match self.breaker.save_for_retry(envelope) {
            Ok(()) => Delivery::Ack,
            Err(e) => {
                error!("Failed to save sync payload for retry: {:#}", e);
                Delivery::Nack
            }
        }
    }

    /// Deliver a heartbeat batch; failures go to the resync queue
    pub async fn handle_pubsub_heartbeat(&self, payload: Value) -> Delivery {
        let batch: HeartbeatPayload = match serde_json::from_value(payload) {
            Ok(b) => b,
            Err(e) => {
                error!("Dropping malformed heartbeat payload: {}", e);
                return Delivery::Ack;
            }
        };
        if batch.is_empty() {
            return Delivery::Ack;
        }

        let line = match serde_json::to_vec(&batch) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode heartbeat batch: {}", e);
                return Delivery::Ack;
            }
        };

        let backend = self.backend.clone();
        let sent = tokio::task::spawn_blocking(move || backend.send_heartbeats(&batch)).await;
        let failure = match sent {
            Ok(Ok(())) => return Delivery::Ack,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };

        warn!("Heartbeat delivery failed, queueing for resync: {}", failure);
        match self.heartbeat_queue.append(&line) {
            Ok(()) => Delivery::Ack,
            Err(e) => {
                error!("Failed to queue heartbeat batch: {:#}", e);
                Delivery::Nack
            }
        }
    }
}
