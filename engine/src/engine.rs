//! Engine facade
//!
//! Routes decoded inbound events through the components in order, under the
//! ticket's lock:
//!
//! ```text
//!  delivery ─▶ decode ─▶ lock(ticket_number) ─▶ ingestion guard ─▶ SLA tracking
//!                                                        │
//!                                                        └─▶ assignment / escalation ─▶ publish
//! ```
//!
//! Malformed events and unresolved references are logged and acknowledged.
//! Store and workload failures are returned so the transport redelivers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::assignment::{AssignmentConfig, AssignmentEngine, AssignmentOutcome};
use crate::directory::SharedAgentDirectory;
use crate::error::{EngineError, EngineResult};
use crate::escalation::{EscalationHandler, EscalationOutcome};
use crate::events::{InboundEvent, SharedPublisher};
use crate::ingest::{IngestOutcome, IngestionGuard};
use crate::sla::{SlaConfig, SlaDeadlineEngine, SlaPolicy, SweepReport};
use crate::state::{SharedStateStore, TicketId, TicketLocks, TicketStatus};
use crate::workload::{SharedWorkloadTracker, WorkloadDiscrepancy, WorkloadTracker};

/// Tunables for the engine's components
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Agents at or above this many active tickets are skipped by auto-assign
    pub max_active_per_agent: Option<u32>,
    pub assignment: AssignmentConfig,
    pub sla: SlaConfig,
}

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Applied {
        routing_key: &'static str,
        ticket_id: TicketId,
    },
    /// Acknowledged without effect; never redelivered
    Dropped { routing_key: String, reason: String },
}

/// The assignment and SLA engine
pub struct Engine {
    store: SharedStateStore,
    locks: TicketLocks,
    guard: Arc<IngestionGuard>,
    assignments: Arc<AssignmentEngine>,
    sla: Arc<SlaDeadlineEngine>,
    escalation: EscalationHandler,
}

impl Engine {
    pub fn new(
        store: SharedStateStore,
        policy: SlaPolicy,
        directory: SharedAgentDirectory,
        publisher: SharedPublisher,
        options: EngineOptions,
    ) -> Self {
        let guard = Arc::new(IngestionGuard::new(store.clone()));
        let workload = WorkloadTracker::with_soft_cap(options.max_active_per_agent).shared();
        let assignments = Arc::new(AssignmentEngine::new(
            store.clone(),
            guard.clone(),
            workload,
            directory,
            publisher.clone(),
            options.assignment,
        ));
        let sla = Arc::new(SlaDeadlineEngine::with_config(
            store.clone(),
            Arc::new(policy),
            publisher,
            options.sla,
        ));
        let escalation = EscalationHandler::new(store.clone(), guard.clone(), assignments.clone());

        Self {
            store,
            locks: TicketLocks::new(),
            guard,
            assignments,
            sla,
            escalation,
        }
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    pub fn workload(&self) -> &SharedWorkloadTracker {
        self.assignments.workload()
    }

    pub fn sla(&self) -> &Arc<SlaDeadlineEngine> {
        &self.sla
    }

    pub fn assignments(&self) -> &Arc<AssignmentEngine> {
        &self.assignments
    }

    /// Load the agent directory into the workload tracker.
    ///
    /// Call once before consuming events. Returns false when the directory
    /// could not be reached; the next assignment attempt retries.
    pub async fn refresh_roster(&self) -> EngineResult<bool> {
        self.assignments.refresh_roster().await
    }

    /// Decode a raw delivery and handle it
    pub async fn handle_delivery(
        &self,
        routing_key: &str,
        payload: &[u8],
    ) -> EngineResult<HandleOutcome> {
        match InboundEvent::decode(routing_key, payload) {
            Ok(event) => self.handle(event).await,
            Err(e) => Ok(dropped(routing_key, e)),
        }
    }

    /// Handle one decoded event under its ticket's lock
    pub async fn handle(&self, event: InboundEvent) -> EngineResult<HandleOutcome> {
        let routing_key = event.routing_key();
        if let Err(e) = event.validate() {
            return Ok(dropped(routing_key, e));
        }

        let now = Utc::now();
        let _lock = self.locks.lock(event.ticket_number()).await;

        match self.apply(&event, now).await {
            Ok(ticket_id) => {
                debug!(event_type = routing_key, %ticket_id, "Event applied");
                Ok(HandleOutcome::Applied {
                    routing_key,
                    ticket_id,
                })
            }
            Err(e) if !e.is_retryable() => Ok(dropped(routing_key, e)),
            Err(e) => {
                error!(
                    event_type = routing_key,
                    ticket_id = event.ticket_id(),
                    error = %e,
                    "Event failed, will be redelivered"
                );
                Err(e)
            }
        }
    }

    async fn apply(&self, event: &InboundEvent, now: DateTime<Utc>) -> EngineResult<TicketId> {
        let at = event.occurred_at().unwrap_or(now);
        match event {
            InboundEvent::Created(created) => {
                let outcome = self.guard.apply_created(created, at)?;
                debug!(ticket_id = %created.ticket_id, ?outcome, "ticket.created applied");
                // A redelivered creation still finishes the follow-up steps a
                // failed first attempt may have skipped
                self.start_sla_and_assign(&created.ticket_id, None, now)
                    .await?;
                Ok(created.ticket_id.clone())
            }
            InboundEvent::Assigned(assigned) => {
                let (ticket_id, _) = self.guard.apply_assigned(assigned, at)?;
                if let Some(agent_id) = assigned.assigned_to_user_id.as_deref() {
                    self.assignments
                        .record_external_assignment(&ticket_id, agent_id, at)
                        .await?;
                }
                Ok(ticket_id)
            }
            InboundEvent::StatusChanged(changed) => {
                let (ticket_id, outcome) = self.guard.apply_status_changed(changed, at)?;
                if outcome == IngestOutcome::Stale {
                    return Ok(ticket_id);
                }
                match changed.new_status {
                    Some(status) if status.is_terminal() => {
                        self.sla.record_resolution(&ticket_id, at)?;
                        self.assignments.complete(&ticket_id)?;
                    }
                    Some(TicketStatus::Reopened) => {
                        let outcome = self.assignments.auto_assign(&ticket_id, now).await?;
                        info!(%ticket_id, ?outcome, "Reopened ticket re-evaluated");
                    }
                    _ => {}
                }
                Ok(ticket_id)
            }
            InboundEvent::Escalated(escalated) => {
                let outcome = self.escalation.handle(escalated, at).await?;
                debug!(?outcome, "ticket.escalated applied");
                match outcome {
                    EscalationOutcome::Escalated { ticket_id, .. }
                    | EscalationOutcome::AlreadyEscalated { ticket_id }
                    | EscalationOutcome::TerminalTicket { ticket_id } => Ok(ticket_id),
                }
            }
            InboundEvent::PriorityChanged(changed) => {
                let (ticket_id, _) = self.guard.apply_priority(changed, at)?;
                self.start_sla_and_assign(&ticket_id, Some(at), now).await?;
                Ok(ticket_id)
            }
            InboundEvent::CommentAdded(comment) => {
                let ticket_id = self.guard.resolve(event)?;
                let created_by = self
                    .guard
                    .view(&ticket_id)?
                    .and_then(|view| view.created_by);
                let author = comment.author_id.as_deref();
                if author.is_some() && author != created_by.as_deref() {
                    self.sla.record_first_response(&ticket_id, at)?;
                }
                Ok(ticket_id)
            }
        }
    }

    /// Start the SLA clock and try to assign once the priority is known.
    ///
    /// `started_at` defaults to the ticket's creation time.
    async fn start_sla_and_assign(
        &self,
        ticket_id: &str,
        started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let Some(view) = self.guard.view(ticket_id)? else {
            return Ok(());
        };
        let Some(priority) = view.priority else {
            debug!(ticket_id, "Priority unknown, SLA and assignment deferred");
            return Ok(());
        };
        if view.status.is_terminal() {
            return Ok(());
        }

        self.sla.create_tracking(
            ticket_id,
            priority,
            view.category.as_deref(),
            started_at.unwrap_or(view.created_at),
        )?;
        let outcome = self.assignments.auto_assign(ticket_id, now).await?;
        debug!(ticket_id, ?outcome, "Assignment evaluated");
        Ok(())
    }

    /// Manual override from a manager
    pub async fn reassign(&self, ticket_id: &str, agent_id: &str) -> EngineResult<AssignmentOutcome> {
        let view = self
            .guard
            .view(ticket_id)?
            .ok_or_else(|| EngineError::unknown_ticket("reassign", ticket_id))?;
        let _lock = self.locks.lock(&view.ticket_number).await;
        self.assignments
            .reassign(ticket_id, agent_id, Utc::now())
            .await
    }

    /// Retry assignment for every eligible ticket without an agent
    pub async fn retry_unassigned(&self) -> EngineResult<Vec<(TicketId, AssignmentOutcome)>> {
        let candidates = self.assignments.unassigned_candidates()?;
        let mut results = Vec::with_capacity(candidates.len());
        for view in candidates {
            let _lock = self.locks.lock(&view.ticket_number).await;
            let outcome = self
                .assignments
                .auto_assign(&view.ticket_id, Utc::now())
                .await?;
            let exhausted = outcome == AssignmentOutcome::NoAgentAvailable;
            results.push((view.ticket_id, outcome));
            if exhausted {
                // Nobody left for the remaining tickets either
                break;
            }
        }
        let assigned = results
            .iter()
            .filter(|(_, o)| matches!(o, AssignmentOutcome::Assigned { .. }))
            .count();
        if assigned > 0 {
            info!(assigned, "Unassigned tickets picked up");
        }
        Ok(results)
    }

    /// Run one SLA sweep at `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        self.sla.sweep(now).await
    }

    /// Compare workload counters against ACTIVE assignments
    pub fn audit(&self) -> EngineResult<Vec<WorkloadDiscrepancy>> {
        let discrepancies = self.assignments.audit()?;
        for d in &discrepancies {
            warn!(
                agent_id = %d.agent_id,
                counted = d.counted,
                active_assignments = d.active_assignments,
                "WorkloadInconsistency"
            );
        }
        Ok(discrepancies)
    }
}

fn dropped(routing_key: &str, error: EngineError) -> HandleOutcome {
    warn!(event_type = routing_key, error = %error, "Event dropped");
    HandleOutcome::Dropped {
        routing_key: routing_key.to_string(),
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{AgentRecord, StaticAgentDirectory};
    use crate::events::EventBus;
    use crate::state::StateStore;
    use serde_json::json;

    fn engine() -> Engine {
        Engine::new(
            StateStore::new().shared(),
            SlaPolicy::defaults(),
            Arc::new(StaticAgentDirectory::new(vec![AgentRecord::agent(
                "agent-a", "alice",
            )])),
            EventBus::new().shared(),
            EngineOptions::default(),
        )
    }

    fn payload(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[tokio::test]
    async fn test_malformed_delivery_is_dropped() {
        let engine = engine();
        let outcome = engine
            .handle_delivery("ticket.created", b"{\"ticketNumber\":\"TCK-1\"}")
            .await
            .unwrap();
        assert!(matches!(outcome, HandleOutcome::Dropped { .. }));
        assert!(engine.store().list_tickets().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_created_with_priority_tracks_and_assigns() {
        let engine = engine();
        let outcome = engine
            .handle_delivery(
                "ticket.created",
                &payload(json!({
                    "ticketId": "t-1",
                    "ticketNumber": "TCK-1",
                    "priority": "CRITICAL",
                    "createdBy": "customer-1"
                })),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, HandleOutcome::Applied { .. }));
        assert!(engine.sla().tracking("t-1").unwrap().is_some());
        assert_eq!(
            engine.store().active_assignment("t-1").unwrap().unwrap().agent_id,
            "agent-a"
        );
    }

    #[tokio::test]
    async fn test_priority_later_starts_clock() {
        let engine = engine();
        engine
            .handle_delivery(
                "ticket.created",
                &payload(json!({ "ticketId": "t-1", "ticketNumber": "TCK-1" })),
            )
            .await
            .unwrap();
        assert!(engine.sla().tracking("t-1").unwrap().is_none());
        assert!(engine.store().active_assignment("t-1").unwrap().is_none());

        engine
            .handle_delivery(
                "ticket.priority.changed",
                &payload(json!({
                    "ticketId": "t-1",
                    "ticketNumber": "TCK-1",
                    "priority": "LOW",
                    "changedAt": "2024-05-01T12:00:00Z"
                })),
            )
            .await
            .unwrap();

        let tracking = engine.sla().tracking("t-1").unwrap().unwrap();
        assert_eq!(
            tracking.started_at,
            "2024-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert!(engine.store().active_assignment("t-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_comment_by_creator_is_not_a_response() {
        let engine = engine();
        engine
            .handle_delivery(
                "ticket.created",
                &payload(json!({
                    "ticketId": "t-1",
                    "ticketNumber": "TCK-1",
                    "priority": "HIGH",
                    "createdBy": "customer-1"
                })),
            )
            .await
            .unwrap();

        let comment = |author: &str| {
            payload(json!({
                "ticketId": "t-1",
                "ticketNumber": "TCK-1",
                "commentId": "c-1",
                "authorId": author
            }))
        };
        engine
            .handle_delivery("comment.added", &comment("customer-1"))
            .await
            .unwrap();
        assert!(engine
            .sla()
            .tracking("t-1")
            .unwrap()
            .unwrap()
            .first_response_at
            .is_none());

        engine
            .handle_delivery("comment.added", &comment("agent-a"))
            .await
            .unwrap();
        assert!(engine
            .sla()
            .tracking("t-1")
            .unwrap()
            .unwrap()
            .first_response_at
            .is_some());
    }
}
