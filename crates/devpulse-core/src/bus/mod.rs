//! In-process publish/subscribe bus
//!
//! Decouples accepting a request on the socket from processing it. Backed by
//! a bounded mpsc channel with a single owned consumer; handlers answer each
//! delivery with [`Delivery::Ack`] or [`Delivery::Nack`], and nacked messages
//! are redelivered with a linear backoff up to a configured limit.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// Topic used for every socket-originated payload (sync and heartbeat)
pub const SOCKET_TOPIC: &str = "socket";

/// Base delay between redeliveries; multiplied by the attempt number
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(100);

/// A message travelling through the bus
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    /// 0 for the first delivery, incremented on each redelivery
    pub attempt: u32,
}

/// Handler verdict for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Ack,
    Nack,
}

/// Error type for bus operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,
}

/// Publishing side of the bus
pub struct Bus {
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    consumer: Mutex<Option<BusConsumer>>,
    published: AtomicU64,
}

impl Bus {
    /// Create a bus buffering up to `capacity` messages
    pub fn new(capacity: usize, max_redeliveries: u32) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(BusConsumer {
                rx,
                max_redeliveries,
            })),
            published: AtomicU64::new(0),
        }
    }

    /// Publish a payload. Waits only while the buffer is full.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let tx = self.tx.lock().clone().ok_or(BusError::Closed)?;
        let msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            attempt: 0,
        };
        debug!(id = %msg.id, topic = %msg.topic, "Publishing message");
        tx.send(msg).await.map_err(|_| BusError::Closed)?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Take the single consumer. Returns `None` after the first call.
    pub fn take_consumer(&self) -> Option<BusConsumer> {
        self.consumer.lock().take()
    }

    /// Stop accepting publishes. Buffered messages are still delivered.
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            debug!("Bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Number of messages accepted since creation
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Consuming side of the bus
pub struct BusConsumer {
    rx: mpsc::Receiver<Message>,
    max_redeliveries: u32,
}

impl BusConsumer {
    /// Receive the next message without handling redelivery
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Deliver messages to `handler` until the bus is closed and drained.
    ///
    /// A shutdown signal stops new publishes from being accepted; messages
    /// already buffered are still handled before returning.
    pub async fn run<H, Fut>(mut self, mut handler: H, mut shutdown: watch::Receiver<bool>)
    where
        H: FnMut(Message) -> Fut,
        Fut: Future<Output = Delivery>,
    {
        let mut closing = *shutdown.borrow();
        if closing {
            self.rx.close();
        }

        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => self.deliver(msg, &mut handler).await,
                        None => break,
                    }
                }
                changed = shutdown.changed(), if !closing => {
                    if changed.is_err() || *shutdown.borrow() {
                        closing = true;
                        self.rx.close();
                    }
                }
            }
        }

        debug!("Bus consumer stopped");
    }

    async fn deliver<H, Fut>(&self, mut msg: Message, handler: &mut H)
    where
        H: FnMut(Message) -> Fut,
        Fut: Future<Output = Delivery>,
    {
        loop {
            match handler(msg.clone()).await {
                Delivery::Ack => return,
                Delivery::Nack if msg.attempt < self.max_redeliveries => {
                    msg.attempt += 1;
                    warn!(
                        id = %msg.id,
                        attempt = msg.attempt,
                        "Message nacked, redelivering"
                    );
                    tokio::time::sleep(REDELIVERY_BACKOFF * msg.attempt).await;
                }
                Delivery::Nack => {
                    error!(
                        id = %msg.id,
                        topic = %msg.topic,
                        attempts = msg.attempt + 1,
                        "Message dropped after exhausting redeliveries"
                    );
                    return;
                }
            }
        }
    }
}
