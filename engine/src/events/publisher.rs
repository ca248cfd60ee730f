//! Publishing seam with retry and outbox
//!
//! Local state is always committed before anything is published, so a failed
//! publish never rolls back engine state. [`RetryingPublisher`] retries with
//! backoff and parks what it could not deliver in an outbox that the sweeper
//! re-drives on every tick.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::types::OutboundEvent;
use crate::error::PublishError;
use crate::retry::{retry_async, RetryPolicy};

/// Destination for outbound engine events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: OutboundEvent) -> Result<(), PublishError>;
}

/// Shared publisher handle
pub type SharedPublisher = Arc<dyn EventPublisher>;

/// Publisher decorator adding retries and an outbox
pub struct RetryingPublisher {
    inner: SharedPublisher,
    policy: RetryPolicy,
    outbox: Mutex<VecDeque<OutboundEvent>>,
}

impl RetryingPublisher {
    pub fn new(inner: SharedPublisher, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Number of events waiting for redelivery
    pub fn outbox_len(&self) -> usize {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn park(&self, event: OutboundEvent) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
    }

    /// Try every parked event once, oldest first.
    ///
    /// Events that still fail go back to the outbox in their original order.
    /// Returns how many were delivered.
    pub async fn redrive_outbox(&self) -> usize {
        let pending: Vec<OutboundEvent> = {
            let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
            outbox.drain(..).collect()
        };
        if pending.is_empty() {
            return 0;
        }

        let total = pending.len();
        let mut failed = Vec::new();
        for event in pending {
            if let Err(e) = self.inner.publish(event.clone()).await {
                debug!(event_type = event.routing_key(), error = %e, "Outbox redelivery failed");
                failed.push(event);
            }
        }

        let delivered = total - failed.len();
        if !failed.is_empty() {
            let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
            // Anything parked during the redrive goes after the older events
            for event in failed.into_iter().rev() {
                outbox.push_front(event);
            }
        }
        if delivered > 0 {
            info!(delivered, remaining = self.outbox_len(), "Outbox re-driven");
        }
        delivered
    }
}

#[async_trait]
impl EventPublisher for RetryingPublisher {
    async fn publish(&self, event: OutboundEvent) -> Result<(), PublishError> {
        let inner = &self.inner;
        let result = retry_async(&self.policy, event.routing_key(), |_| {
            let event = event.clone();
            async move { inner.publish(event).await }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err((e, attempts)) => {
                let routing_key = event.routing_key().to_string();
                warn!(
                    event_type = %routing_key,
                    ticket_id = event.ticket_id(),
                    attempts,
                    error = %e,
                    "Publish failed, parking event in outbox"
                );
                self.park(event);
                Err(PublishError::Parked {
                    routing_key,
                    attempts,
                })
            }
        }
    }
}
