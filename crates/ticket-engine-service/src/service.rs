//! Service assembly
//!
//! ```text
//!  DeliveryQueue ─▶ WorkerPool ─▶ Engine ─▶ RetryingPublisher ─▶ EventBus ─▶ subscribers
//!                                   ▲
//!  Sweeper (lease: sla-sweep) ──────┤
//!  AssignmentRetrier (lease: assignment-retry)
//! ```

use std::sync::Arc;
use std::time::Duration;

use ticket_engine::directory::SharedAgentDirectory;
use ticket_engine::events::{SharedEventBus, SharedPublisher};
use ticket_engine::sla::SlaPolicyError;
use ticket_engine::{Engine, EventBus, RetryingPublisher, StateStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::leader::{InMemoryLeaderElector, LeaderElector, ASSIGNMENT_RETRY_LOCK, SWEEP_LOCK};
use crate::sweeper::{AssignmentRetrier, LeaseHolder, Sweeper};
use crate::telemetry::ServiceStats;
use crate::transport::{DeliveryQueue, SharedDeliveryQueue};
use crate::workers::WorkerPool;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Policy(#[from] SlaPolicyError),
}

/// A wired engine with its transport, publisher and recurring jobs
pub struct Service {
    config: EngineConfig,
    engine: Arc<Engine>,
    bus: SharedEventBus,
    publisher: Arc<RetryingPublisher>,
    queue: SharedDeliveryQueue,
    elector: Arc<dyn LeaderElector>,
    stats: Arc<ServiceStats>,
}

impl Service {
    pub fn build(config: EngineConfig, directory: SharedAgentDirectory) -> Result<Self, ServiceError> {
        let bus = EventBus::new().shared();
        Self::with_downstream(config, directory, bus.clone(), bus)
    }

    /// Build with a custom downstream publisher; `bus` is still exposed for
    /// subscribers and receives nothing unless `downstream` forwards to it
    pub fn with_downstream(
        config: EngineConfig,
        directory: SharedAgentDirectory,
        bus: SharedEventBus,
        downstream: SharedPublisher,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let publisher =
            RetryingPublisher::new(downstream, config.publish_retry.clone()).shared();
        let engine_publisher: SharedPublisher = publisher.clone();
        let engine = Arc::new(Engine::new(
            StateStore::new().shared(),
            config.sla_policy()?,
            directory,
            engine_publisher,
            config.engine_options(),
        ));
        let queue = DeliveryQueue::new(config.redelivery_policy()).shared();
        let elector: Arc<dyn LeaderElector> = Arc::new(InMemoryLeaderElector::new(
            Duration::from_secs(config.lease_ttl_secs),
        ));

        Ok(Self {
            config,
            engine,
            bus,
            publisher,
            queue,
            elector,
            stats: Arc::new(ServiceStats::new()),
        })
    }

    /// Share leadership with other services (e.g. a second instance in tests)
    pub fn with_elector(mut self, elector: Arc<dyn LeaderElector>) -> Self {
        self.elector = elector;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    pub fn publisher(&self) -> &Arc<RetryingPublisher> {
        &self.publisher
    }

    pub fn queue(&self) -> &SharedDeliveryQueue {
        &self.queue
    }

    pub fn stats(&self) -> &Arc<ServiceStats> {
        &self.stats
    }

    pub fn elector(&self) -> &Arc<dyn LeaderElector> {
        &self.elector
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.engine.clone(),
            self.publisher.clone(),
            self.stats.clone(),
            LeaseHolder::new(self.elector.clone(), SWEEP_LOCK, &self.config.instance_id),
            Duration::from_secs(self.config.sweep_interval_secs),
        )
    }

    pub fn assignment_retrier(&self) -> AssignmentRetrier {
        AssignmentRetrier::new(
            self.engine.clone(),
            self.stats.clone(),
            LeaseHolder::new(
                self.elector.clone(),
                ASSIGNMENT_RETRY_LOCK,
                &self.config.instance_id,
            ),
            Duration::from_secs(self.config.assignment_retry_interval_secs),
        )
    }

    /// Spawn workers and recurring jobs; they stop when `cancel` fires
    pub fn start(&self, cancel: CancellationToken) -> RunningService {
        info!(
            instance_id = %self.config.instance_id,
            workers = self.config.workers,
            "Starting ticket engine service"
        );
        let workers = WorkerPool::spawn(
            self.engine.clone(),
            self.queue.clone(),
            self.stats.clone(),
            self.config.workers,
            cancel.clone(),
        );
        let sweeper = tokio::spawn(self.sweeper().run(cancel.clone()));
        let retrier = tokio::spawn(self.assignment_retrier().run(cancel));
        RunningService {
            workers,
            sweeper,
            retrier,
        }
    }
}

/// Handles of a started service
pub struct RunningService {
    workers: WorkerPool,
    sweeper: JoinHandle<()>,
    retrier: JoinHandle<()>,
}

impl RunningService {
    /// Wait for all tasks to finish after cancellation
    pub async fn join(self) {
        self.workers.join().await;
        for (name, handle) in [("sweeper", self.sweeper), ("assignment retry", self.retrier)] {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Recurring task failed");
            }
        }
    }
}
