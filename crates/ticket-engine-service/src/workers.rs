//! Delivery worker pool
//!
//! N workers share one queue. Ordering for a ticket is not guaranteed across
//! workers; the engine serializes per ticket with its own lock.

use std::sync::Arc;

use ticket_engine::{Engine, HandleOutcome};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::telemetry::ServiceStats;
use crate::transport::{NackOutcome, SharedDeliveryQueue};

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        engine: Arc<Engine>,
        queue: SharedDeliveryQueue,
        stats: Arc<ServiceStats>,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        let handles = (0..workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    engine.clone(),
                    queue.clone(),
                    stats.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        info!(workers, "Worker pool started");
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit (after cancellation)
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task failed");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    engine: Arc<Engine>,
    queue: SharedDeliveryQueue,
    stats: Arc<ServiceStats>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        match engine
            .handle_delivery(&delivery.routing_key, &delivery.payload)
            .await
        {
            Ok(HandleOutcome::Applied { .. }) => {
                stats.record_applied();
                queue.ack(&delivery);
            }
            Ok(HandleOutcome::Dropped { .. }) => {
                stats.record_dropped();
                queue.ack(&delivery);
            }
            Err(e) => {
                debug!(worker_id, routing_key = %delivery.routing_key, error = %e, "Delivery failed");
                match queue.nack(delivery) {
                    NackOutcome::Requeued { .. } => stats.record_redelivered(),
                    NackOutcome::DeadLettered => stats.record_dead_lettered(),
                }
            }
        }
    }
    debug!(worker_id, "Worker stopped");
}
