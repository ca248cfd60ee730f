//! Assignment engine
//!
//! Picks an agent for tickets that have a priority and no ACTIVE assignment,
//! and applies manual overrides. Components here take no locks of their own;
//! callers hold the ticket's lock (see [`crate::state::TicketLocks`]).
//!
//! Ordering inside one assignment: workload counters, then the assignment
//! record, then the ticket view, then the outbound event. A failure before the
//! record is written undoes the counter change.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::directory::{fetch_roster, SharedAgentDirectory};
use crate::error::{EngineError, EngineResult};
use crate::events::{OutboundEvent, SharedPublisher};
use crate::ingest::IngestionGuard;
use crate::retry::{retry_async, RetryPolicy};
use crate::state::{
    AgentId, Assignment, AssignmentStatus, AssignmentType, SharedStateStore, TicketView,
};
use crate::workload::{SharedWorkloadTracker, WorkloadDiscrepancy};

/// Configuration for the assignment engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    /// Upper bound on one agent-directory lookup
    pub directory_timeout_ms: u64,
    /// Retry policy for workload transfers that cannot be confirmed
    pub transfer_retry: RetryPolicy,
}

impl AssignmentConfig {
    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            directory_timeout_ms: 2_000,
            transfer_retry: RetryPolicy::default(),
        }
    }
}

/// Result of an assignment attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentOutcome {
    Assigned {
        agent_id: AgentId,
        assignment_type: AssignmentType,
    },
    /// The ticket already has an ACTIVE assignment to this agent
    AlreadyAssigned { agent_id: AgentId },
    /// Nobody can take the ticket right now; it stays unassigned
    NoAgentAvailable,
    /// The ticket cannot enter the assignment path
    NotEligible { reason: &'static str },
}

impl AssignmentOutcome {
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            AssignmentOutcome::Assigned { agent_id, .. }
            | AssignmentOutcome::AlreadyAssigned { agent_id } => Some(agent_id),
            _ => None,
        }
    }
}

/// Selects agents and keeps assignments and workload counters in step
pub struct AssignmentEngine {
    store: SharedStateStore,
    guard: Arc<IngestionGuard>,
    workload: SharedWorkloadTracker,
    directory: SharedAgentDirectory,
    publisher: SharedPublisher,
    config: AssignmentConfig,
}

impl AssignmentEngine {
    pub fn new(
        store: SharedStateStore,
        guard: Arc<IngestionGuard>,
        workload: SharedWorkloadTracker,
        directory: SharedAgentDirectory,
        publisher: SharedPublisher,
        config: AssignmentConfig,
    ) -> Self {
        Self {
            store,
            guard,
            workload,
            directory,
            publisher,
            config,
        }
    }

    pub fn workload(&self) -> &SharedWorkloadTracker {
        &self.workload
    }

    /// Mirror the directory into the workload tracker.
    ///
    /// Newly rostered agents start from their ACTIVE assignments. Returns
    /// false when the directory failed or timed out; callers treat that as
    /// "no agent available".
    pub async fn refresh_roster(&self) -> EngineResult<bool> {
        match fetch_roster(self.directory.as_ref(), self.config.directory_timeout()).await {
            Ok(records) => {
                let active = self.store.list_active_assignments()?;
                self.workload.sync_roster(&records, &active)?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Assign the least-loaded available agent to an eligible ticket
    pub async fn auto_assign(
        &self,
        ticket_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<AssignmentOutcome> {
        let Some(view) = self.store.get_ticket(ticket_id)? else {
            return Ok(AssignmentOutcome::NotEligible {
                reason: "unknown ticket",
            });
        };
        if let Some(reason) = ineligible(&view) {
            debug!(ticket_id, reason, "Ticket not eligible for assignment");
            return Ok(AssignmentOutcome::NotEligible { reason });
        }
        if let Some(active) = self.store.active_assignment(ticket_id)? {
            return Ok(AssignmentOutcome::AlreadyAssigned {
                agent_id: active.agent_id,
            });
        }

        // Fail closed: an unreachable directory means nobody is available
        if !self.refresh_roster().await? {
            info!(ticket_id, "Agent directory unavailable, ticket left unassigned");
            return Ok(AssignmentOutcome::NoAgentAvailable);
        }
        let Some(agent_id) = self.workload.claim_least_loaded()? else {
            info!(ticket_id, "No agent available, ticket left unassigned");
            return Ok(AssignmentOutcome::NoAgentAvailable);
        };

        let assignment = Assignment::active(ticket_id, agent_id.clone(), AssignmentType::Auto, now);
        match self
            .store
            .replace_active_assignment(assignment, AssignmentStatus::Superseded)
        {
            Ok(Some(previous)) => {
                // Only reachable if the caller skipped the ticket lock
                warn!(ticket_id, agent_id = %previous.agent_id, "Superseded a concurrent assignment");
                self.workload.record_completion(&previous.agent_id)?;
            }
            Ok(None) => {}
            Err(e) => {
                if let Err(release) = self.workload.record_completion(&agent_id) {
                    warn!(ticket_id, %agent_id, error = %release, "Failed to release claimed agent");
                }
                return Err(e.into());
            }
        }

        self.guard.set_assigned_agent(ticket_id, &agent_id, now)?;
        info!(ticket_id, %agent_id, "Ticket auto-assigned");
        self.publish_assigned(&view, &agent_id, AssignmentType::Auto, now)
            .await;

        Ok(AssignmentOutcome::Assigned {
            agent_id,
            assignment_type: AssignmentType::Auto,
        })
    }

    /// Manual override: move the ticket to `agent_id` and publish it
    pub async fn reassign(
        &self,
        ticket_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<AssignmentOutcome> {
        let Some(view) = self.store.get_ticket(ticket_id)? else {
            return Err(EngineError::unknown_ticket("reassign", ticket_id));
        };
        if view.status.is_terminal() {
            return Ok(AssignmentOutcome::NotEligible {
                reason: "ticket is closed",
            });
        }
        if let Some(active) = self.store.active_assignment(ticket_id)? {
            if active.agent_id == agent_id {
                return Ok(AssignmentOutcome::AlreadyAssigned {
                    agent_id: active.agent_id,
                });
            }
        }

        self.move_assignment(ticket_id, agent_id, AssignmentType::Manual, now)
            .await?;
        self.guard.set_assigned_agent(ticket_id, agent_id, now)?;
        info!(ticket_id, agent_id, "Ticket reassigned");
        self.publish_assigned(&view, agent_id, AssignmentType::Manual, now)
            .await;

        Ok(AssignmentOutcome::Assigned {
            agent_id: agent_id.to_string(),
            assignment_type: AssignmentType::Manual,
        })
    }

    /// Mirror an upstream `ticket.assigned` without re-publishing it.
    ///
    /// The view is already updated by the guard; this keeps the assignment
    /// records and counters in step.
    pub async fn record_external_assignment(
        &self,
        ticket_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<AssignmentOutcome> {
        if let Some(active) = self.store.active_assignment(ticket_id)? {
            if active.agent_id == agent_id {
                return Ok(AssignmentOutcome::AlreadyAssigned {
                    agent_id: active.agent_id,
                });
            }
        }
        if let Some(view) = self.store.get_ticket(ticket_id)? {
            if view.status.is_terminal() {
                return Ok(AssignmentOutcome::NotEligible {
                    reason: "ticket is closed",
                });
            }
        }

        self.move_assignment(ticket_id, agent_id, AssignmentType::Manual, now)
            .await?;
        debug!(ticket_id, agent_id, "External assignment recorded");
        Ok(AssignmentOutcome::Assigned {
            agent_id: agent_id.to_string(),
            assignment_type: AssignmentType::Manual,
        })
    }

    /// Supersede the ACTIVE assignment with one to `to_agent`, moving one
    /// unit of workload.
    ///
    /// The counter transfer is retried with backoff and never half-applied;
    /// if the record write then fails the transfer is reversed. Returns the
    /// superseded assignment.
    pub async fn move_assignment(
        &self,
        ticket_id: &str,
        to_agent: &str,
        assignment_type: AssignmentType,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Assignment>> {
        if !self.workload.is_tracked(to_agent) && !self.refresh_roster().await? {
            debug!(ticket_id, to_agent, "Agent directory unavailable before transfer");
        }
        let previous = self.store.active_assignment(ticket_id)?;
        let from_agent = previous.as_ref().map(|a| a.agent_id.clone());

        let workload = &self.workload;
        let from = from_agent.as_deref();
        retry_async(&self.config.transfer_retry, "workload transfer", |_| async move {
            workload.transfer(from, Some(to_agent))
        })
        .await
        .map_err(|(e, attempts)| {
            warn!(ticket_id, error = %e, attempts, "Workload transfer unconfirmed");
            EngineError::TransferUnconfirmed {
                ticket_id: ticket_id.to_string(),
                attempts,
            }
        })?;

        let next = Assignment::active(ticket_id, to_agent, assignment_type, now);
        match self
            .store
            .replace_active_assignment(next, AssignmentStatus::Superseded)
        {
            Ok(superseded) => {
                debug!(
                    ticket_id,
                    from = ?from_agent,
                    to = to_agent,
                    %assignment_type,
                    "Assignment moved"
                );
                Ok(superseded)
            }
            Err(e) => {
                if let Err(undo) = self.workload.transfer(Some(to_agent), from) {
                    warn!(ticket_id, error = %undo, "Failed to reverse workload transfer");
                }
                Err(e.into())
            }
        }
    }

    /// Complete the ACTIVE assignment of a ticket that reached a terminal
    /// status and release its agent
    pub fn complete(&self, ticket_id: &str) -> EngineResult<Option<Assignment>> {
        let closed = self
            .store
            .close_active_assignment(ticket_id, AssignmentStatus::Completed)?;
        if let Some(assignment) = &closed {
            self.workload.record_completion(&assignment.agent_id)?;
            debug!(ticket_id, agent_id = %assignment.agent_id, "Assignment completed");
        }
        Ok(closed)
    }

    /// Tickets that should have an agent but do not
    pub fn unassigned_candidates(&self) -> EngineResult<Vec<TicketView>> {
        let mut candidates = Vec::new();
        for view in self.store.list_tickets()? {
            if ineligible(&view).is_none()
                && self.store.active_assignment(&view.ticket_id)?.is_none()
            {
                candidates.push(view);
            }
        }
        Ok(candidates)
    }

    /// Compare workload counters against ACTIVE assignments
    pub fn audit(&self) -> EngineResult<Vec<WorkloadDiscrepancy>> {
        let active = self.store.list_active_assignments()?;
        Ok(self.workload.audit(&active)?)
    }

    async fn publish_assigned(
        &self,
        view: &TicketView,
        agent_id: &str,
        assignment_type: AssignmentType,
        at: DateTime<Utc>,
    ) {
        let event = OutboundEvent::TicketAssigned {
            ticket_id: view.ticket_id.clone(),
            ticket_number: view.ticket_number.clone(),
            agent_id: agent_id.to_string(),
            assigned_at: at,
            assignment_type,
        };
        if let Err(e) = self.publisher.publish(event).await {
            warn!(ticket_id = %view.ticket_id, error = %e, "ticket.assigned not delivered");
        }
    }
}

fn ineligible(view: &TicketView) -> Option<&'static str> {
    if view.priority.is_none() {
        Some("priority unknown")
    } else if view.status.is_terminal() {
        Some("ticket is closed")
    } else {
        None
    }
}
