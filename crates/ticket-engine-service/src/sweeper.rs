//! Recurring jobs: the SLA sweep and the unassigned-ticket retry
//!
//! Both run on a fixed interval and only while this instance holds the lease
//! for the job's lock key. The sweep tick also re-drives the publish outbox
//! and audits workload counters.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ticket_engine::{AssignmentOutcome, Engine, RetryingPublisher, SweepReport};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::leader::{LeaderElector, LeadershipResult, RenewalResult};
use crate::telemetry::ServiceStats;

/// Tracks this instance's lease on one lock key across ticks
pub struct LeaseHolder {
    elector: Arc<dyn LeaderElector>,
    lock_key: &'static str,
    instance_id: String,
    token: Option<String>,
}

impl LeaseHolder {
    pub fn new(
        elector: Arc<dyn LeaderElector>,
        lock_key: &'static str,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            elector,
            lock_key,
            instance_id: instance_id.into(),
            token: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.token.is_some()
    }

    /// Renew the held lease or try to acquire one. `true` if we lead.
    pub async fn ensure(&mut self) -> bool {
        if let Some(token) = self.token.clone() {
            match self.elector.renew(self.lock_key, &token).await {
                Ok(RenewalResult::Renewed { .. }) => return true,
                Ok(outcome) => {
                    info!(lock_key = self.lock_key, ?outcome, "Lease lost");
                    self.token = None;
                }
                Err(e) => {
                    warn!(lock_key = self.lock_key, error = %e, "Lease renewal failed");
                    self.token = None;
                    return false;
                }
            }
        }

        match self
            .elector
            .try_acquire(self.lock_key, &self.instance_id)
            .await
        {
            Ok(LeadershipResult::Acquired { lease_token, .. }) => {
                info!(lock_key = self.lock_key, instance_id = %self.instance_id, "Lease acquired");
                self.token = Some(lease_token);
                true
            }
            Ok(LeadershipResult::NotLeader { current_leader }) => {
                debug!(lock_key = self.lock_key, ?current_leader, "Not leader, skipping");
                false
            }
            Err(e) => {
                warn!(lock_key = self.lock_key, error = %e, "Lease acquisition failed");
                false
            }
        }
    }

    pub async fn release(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.elector.release(self.lock_key, &token).await {
                warn!(lock_key = self.lock_key, error = %e, "Lease release failed");
            }
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Periodic SLA sweep
pub struct Sweeper {
    engine: Arc<Engine>,
    publisher: Arc<RetryingPublisher>,
    stats: Arc<ServiceStats>,
    lease: LeaseHolder,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        engine: Arc<Engine>,
        publisher: Arc<RetryingPublisher>,
        stats: Arc<ServiceStats>,
        lease: LeaseHolder,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            publisher,
            stats,
            lease,
            interval,
        }
    }

    /// One sweep at `now`. `None` when another instance leads or the sweep
    /// failed (it is retried next tick).
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Option<SweepReport> {
        if !self.lease.ensure().await {
            return None;
        }

        let redriven = self.publisher.redrive_outbox().await;
        if redriven > 0 {
            debug!(redriven, "Outbox events delivered before sweep");
        }

        let report = match self.engine.sweep(now).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "SLA sweep failed");
                return None;
            }
        };
        self.stats.record_sweep(&report);
        if report.publish_failures > 0 {
            warn!(
                publish_failures = report.publish_failures,
                outbox = self.publisher.outbox_len(),
                "SLA events parked for redelivery"
            );
        }

        if let Err(e) = self.engine.audit() {
            warn!(error = %e, "Workload audit failed");
        }
        Some(report)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "SLA sweeper started");
        let mut ticker = ticker(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        self.lease.release().await;
        debug!("SLA sweeper stopped");
    }
}

/// Periodic retry of tickets left unassigned (no agent was available)
pub struct AssignmentRetrier {
    engine: Arc<Engine>,
    stats: Arc<ServiceStats>,
    lease: LeaseHolder,
    interval: Duration,
}

impl AssignmentRetrier {
    pub fn new(
        engine: Arc<Engine>,
        stats: Arc<ServiceStats>,
        lease: LeaseHolder,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            stats,
            lease,
            interval,
        }
    }

    /// One retry pass. Returns how many tickets got an agent.
    pub async fn tick(&mut self) -> usize {
        if !self.lease.ensure().await {
            return 0;
        }
        match self.engine.retry_unassigned().await {
            Ok(results) => {
                let assigned = results
                    .iter()
                    .filter(|(_, outcome)| matches!(outcome, AssignmentOutcome::Assigned { .. }))
                    .count();
                self.stats.record_retry_assignments(assigned);
                assigned
            }
            Err(e) => {
                warn!(error = %e, "Assignment retry failed");
                0
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Assignment retry started");
        let mut ticker = ticker(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        self.lease.release().await;
        debug!("Assignment retry stopped");
    }
}
