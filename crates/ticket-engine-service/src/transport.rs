//! In-process delivery queue
//!
//! Stands in for the message broker: at-least-once delivery, redelivery with
//! backoff for retryable failures, and a dead-letter list once the redelivery
//! policy is exhausted.
//!
//! ```text
//!  publish ─▶ [ mpsc ] ─▶ worker ─▶ ack
//!                ▲           │
//!                └─ backoff ◀┴─ nack ─▶ dead letters (attempts exhausted)
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ticket_engine::RetryPolicy;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Error type for the transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Delivery queue closed")]
    Closed,

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid replay record on line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
}

/// One message as handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// 0 for the first delivery
    pub attempt: u32,
}

impl Delivery {
    pub fn new(routing_key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            attempt: 0,
        }
    }
}

/// Result of a negative acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { after: Duration },
    DeadLettered,
}

/// Shared queue handle
pub type SharedDeliveryQueue = Arc<DeliveryQueue>;

pub struct DeliveryQueue {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    /// Queued, waiting for redelivery, or being handled
    pending: AtomicUsize,
    idle: Notify,
    redelivery: RetryPolicy,
    dead_letters: Mutex<Vec<Delivery>>,
}

impl DeliveryQueue {
    pub fn new(redelivery: RetryPolicy) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            redelivery,
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(self) -> SharedDeliveryQueue {
        Arc::new(self)
    }

    /// Enqueue a first delivery
    pub fn publish(
        &self,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.enqueue(Delivery::new(routing_key, payload))
    }

    pub fn enqueue(&self, delivery: Delivery) -> Result<(), TransportError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(delivery).is_err() {
            self.finish();
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Next delivery; waits until one is available
    pub async fn recv(&self) -> Option<Delivery> {
        self.receiver.lock().await.recv().await
    }

    /// The delivery was handled (applied or dropped)
    pub fn ack(&self, delivery: &Delivery) {
        debug!(routing_key = %delivery.routing_key, attempt = delivery.attempt, "Delivery acknowledged");
        self.finish();
    }

    /// The delivery failed with a retryable error
    pub fn nack(self: &Arc<Self>, mut delivery: Delivery) -> NackOutcome {
        if !self.redelivery.should_retry(delivery.attempt) {
            warn!(
                routing_key = %delivery.routing_key,
                attempts = delivery.attempt + 1,
                "Delivery dead-lettered"
            );
            self.dead_letters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(delivery);
            self.finish();
            return NackOutcome::DeadLettered;
        }

        delivery.attempt += 1;
        let after = self.redelivery.backoff_duration(delivery.attempt);
        debug!(
            routing_key = %delivery.routing_key,
            attempt = delivery.attempt,
            backoff_ms = after.as_millis() as u64,
            "Delivery requeued"
        );
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if queue.sender.send(delivery).is_err() {
                queue.finish();
            }
        });
        NackOutcome::Requeued { after }
    }

    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Deliveries not yet acknowledged or dead-lettered
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every published delivery has been settled
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn dead_letters(&self) -> Vec<Delivery> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// One line of a replay file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRecord {
    pub routing_key: String,
    pub payload: serde_json::Value,
}

/// Parse JSONL replay records. Blank lines and `#` comments are skipped.
pub fn parse_replay(content: &str) -> Result<Vec<Delivery>, TransportError> {
    let mut deliveries = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let record: ReplayRecord = serde_json::from_str(line).map_err(|source| {
            TransportError::Parse {
                line: idx + 1,
                source,
            }
        })?;
        let payload = serde_json::to_vec(&record.payload).map_err(|source| {
            TransportError::Parse {
                line: idx + 1,
                source,
            }
        })?;
        deliveries.push(Delivery::new(record.routing_key, payload));
    }
    Ok(deliveries)
}

pub fn load_replay(path: &Path) -> Result<Vec<Delivery>, TransportError> {
    let content = std::fs::read_to_string(path).map_err(|source| TransportError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_replay(&content)
}
