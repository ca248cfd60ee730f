//! SLA deadline engine
//!
//! Creates one tracking per ticket once its priority is known, and sweeps
//! open trackings for warnings and breaches. Each tracking is evaluated and
//! updated inside a single store write; the breach flags and the status
//! edge double as publish guards, so an event is published at most once per
//! transition no matter how often the sweep runs.
//!
//! ```text
//!  ON_TRACK ──(pending deadline within lead)──▶ AT_RISK ──(deadline passed)──▶ BREACHED
//!      │                                                                          │
//!      └───────────────────────(ticket resolved or closed)──────────▶ RESOLVED ◀──┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::policy::SlaPolicy;
use crate::error::EngineResult;
use crate::events::{OutboundEvent, SharedPublisher};
use crate::state::{Priority, SharedStateStore, SlaClock, SlaStatus, SlaTracking, TicketId};

/// Configuration for the deadline engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    /// How long before a pending deadline the tracking turns AT_RISK
    pub at_risk_lead_minutes: u32,
}

impl SlaConfig {
    pub fn at_risk_lead(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.at_risk_lead_minutes))
    }
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            at_risk_lead_minutes: 10,
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub warnings: usize,
    pub breaches: usize,
    /// Events committed but not delivered (parked for redelivery)
    pub publish_failures: usize,
}

/// A transition committed by the sweep, published after the write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Warning(SlaClock, DateTime<Utc>),
    Breach(SlaClock, DateTime<Utc>),
}

/// Apply every due transition to `tracking` and return what to publish
fn evaluate(
    tracking: &mut SlaTracking,
    now: DateTime<Utc>,
    lead: chrono::Duration,
) -> Vec<Signal> {
    let mut signals = Vec::new();
    if !tracking.is_open() {
        return signals;
    }

    if tracking.awaiting_response() && tracking.response_due_at < now {
        tracking.response_breached = true;
        tracking.sla_status = tracking.sla_status.advance(SlaStatus::Breached);
        signals.push(Signal::Breach(SlaClock::Response, tracking.response_due_at));
    }

    if !tracking.resolution_breached && tracking.resolution_due_at < now {
        tracking.resolution_breached = true;
        tracking.sla_status = tracking.sla_status.advance(SlaStatus::Breached);
        signals.push(Signal::Breach(SlaClock::Resolution, tracking.resolution_due_at));
    }

    if tracking.sla_status == SlaStatus::OnTrack {
        let response = tracking
            .awaiting_response()
            .then_some((SlaClock::Response, tracking.response_due_at));
        let resolution = (!tracking.resolution_breached)
            .then_some((SlaClock::Resolution, tracking.resolution_due_at));

        let earliest = [response, resolution]
            .into_iter()
            .flatten()
            .min_by_key(|(_, due)| *due);
        if let Some((clock, due)) = earliest {
            if due - lead <= now {
                tracking.sla_status = SlaStatus::AtRisk;
                signals.push(Signal::Warning(clock, due));
            }
        }
    }

    signals
}

/// Computes deadlines and runs the warning/breach sweep
pub struct SlaDeadlineEngine {
    store: SharedStateStore,
    policy: Arc<SlaPolicy>,
    publisher: SharedPublisher,
    config: SlaConfig,
}

impl SlaDeadlineEngine {
    pub fn new(store: SharedStateStore, policy: Arc<SlaPolicy>, publisher: SharedPublisher) -> Self {
        Self::with_config(store, policy, publisher, SlaConfig::default())
    }

    pub fn with_config(
        store: SharedStateStore,
        policy: Arc<SlaPolicy>,
        publisher: SharedPublisher,
        config: SlaConfig,
    ) -> Self {
        Self {
            store,
            policy,
            publisher,
            config,
        }
    }

    pub fn policy(&self) -> &SlaPolicy {
        &self.policy
    }

    pub fn tracking(&self, ticket_id: &str) -> EngineResult<Option<SlaTracking>> {
        Ok(self.store.get_tracking(ticket_id)?)
    }

    /// Start the SLA clock for a ticket.
    ///
    /// Idempotent: an existing tracking is returned unchanged. The bool is
    /// true when this call created it.
    pub fn create_tracking(
        &self,
        ticket_id: &str,
        priority: Priority,
        category: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<(SlaTracking, bool)> {
        let rule = self.policy.resolve(priority, category);
        let tracking = SlaTracking {
            ticket_id: ticket_id.to_string(),
            priority,
            category: category.map(str::to_string),
            started_at: now,
            response_due_at: now + rule.response_time(),
            resolution_due_at: now + rule.resolution_time(),
            first_response_at: None,
            resolved_at: None,
            response_breached: false,
            resolution_breached: false,
            sla_status: SlaStatus::OnTrack,
            version: 0,
        };

        let (stored, created) = self.store.insert_tracking_if_absent(tracking)?;
        if created {
            info!(
                ticket_id,
                %priority,
                response_due_at = %stored.response_due_at,
                resolution_due_at = %stored.resolution_due_at,
                "SLA tracking created"
            );
        }
        Ok((stored, created))
    }

    /// Freeze the tracking when the ticket reaches a terminal status.
    ///
    /// Returns true the first time; later calls leave `resolved_at` alone.
    pub fn record_resolution(&self, ticket_id: &str, at: DateTime<Utc>) -> EngineResult<bool> {
        let frozen = self.store.update_tracking(ticket_id, |t| {
            if t.resolved_at.is_some() {
                return false;
            }
            t.resolved_at = Some(at);
            t.sla_status = t.sla_status.advance(SlaStatus::Resolved);
            true
        })?;
        let frozen = frozen.unwrap_or(false);
        if frozen {
            info!(ticket_id, "SLA tracking resolved");
        }
        Ok(frozen)
    }

    /// Record the first agent response, which stops the response clock.
    ///
    /// Only the first call counts; a resolved tracking is left alone.
    pub fn record_first_response(&self, ticket_id: &str, at: DateTime<Utc>) -> EngineResult<bool> {
        let recorded = self.store.update_tracking(ticket_id, |t| {
            if t.first_response_at.is_some() || !t.is_open() {
                return false;
            }
            t.first_response_at = Some(at);
            true
        })?;
        let recorded = recorded.unwrap_or(false);
        if recorded {
            debug!(ticket_id, "First response recorded");
        }
        Ok(recorded)
    }

    /// Evaluate every open tracking at `now`.
    ///
    /// Takes no ticket lock; each tracking is re-read and updated inside one
    /// store write, and events are published only after the write committed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let lead = self.config.at_risk_lead();
        let mut report = SweepReport::default();

        for ticket_id in self.store.open_tracking_ids()? {
            report.scanned += 1;

            // Cheap read first so quiet trackings are never written
            let Some(mut snapshot) = self.store.get_tracking(&ticket_id)? else {
                continue;
            };
            if evaluate(&mut snapshot, now, lead).is_empty() {
                continue;
            }

            let signals = self
                .store
                .update_tracking(&ticket_id, |t| evaluate(t, now, lead))?
                .unwrap_or_default();

            for signal in signals {
                self.emit(&ticket_id, signal, now, &mut report).await;
            }
        }

        if report.warnings > 0 || report.breaches > 0 {
            info!(
                scanned = report.scanned,
                warnings = report.warnings,
                breaches = report.breaches,
                "SLA sweep complete"
            );
        } else {
            debug!(scanned = report.scanned, "SLA sweep complete");
        }
        Ok(report)
    }

    async fn emit(
        &self,
        ticket_id: &TicketId,
        signal: Signal,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let event = match signal {
            Signal::Warning(clock, due_at) => {
                report.warnings += 1;
                warn!(%ticket_id, %clock, %due_at, "SLA at risk");
                OutboundEvent::SlaWarning {
                    ticket_id: ticket_id.clone(),
                    clock,
                    due_at,
                    observed_at: now,
                }
            }
            Signal::Breach(clock, due_at) => {
                report.breaches += 1;
                warn!(%ticket_id, %clock, %due_at, "SLA breached");
                OutboundEvent::SlaBreach {
                    ticket_id: ticket_id.clone(),
                    clock,
                    due_at,
                    observed_at: now,
                }
            }
        };

        if let Err(e) = self.publisher.publish(event).await {
            report.publish_failures += 1;
            warn!(%ticket_id, error = %e, "SLA event not delivered");
        }
    }
}
