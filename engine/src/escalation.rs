//! Escalation handler
//!
//! Moves a ticket to a higher-authority handler. The SLA clock is left
//! exactly as it was; this module has no access to SLA state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::assignment::AssignmentEngine;
use crate::error::EngineResult;
use crate::events::TicketEscalated;
use crate::ingest::IngestionGuard;
use crate::state::{AgentId, AssignmentType, SharedStateStore, TicketId};

/// Result of handling one `ticket.escalated` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// The ticket now has an ACTIVE escalation assignment to `to`
    Escalated {
        ticket_id: TicketId,
        from: Option<AgentId>,
        to: AgentId,
    },
    /// Redelivery: the target already holds the ticket
    AlreadyEscalated { ticket_id: TicketId },
    /// Escalation of a resolved or closed ticket; only the view records it
    TerminalTicket { ticket_id: TicketId },
}

/// Applies `ticket.escalated` events
pub struct EscalationHandler {
    store: SharedStateStore,
    guard: Arc<IngestionGuard>,
    assignments: Arc<AssignmentEngine>,
}

impl EscalationHandler {
    pub fn new(
        store: SharedStateStore,
        guard: Arc<IngestionGuard>,
        assignments: Arc<AssignmentEngine>,
    ) -> Self {
        Self {
            store,
            guard,
            assignments,
        }
    }

    /// Record the new handler on the view, then supersede the ACTIVE
    /// assignment with an ESCALATION one.
    ///
    /// Workload moves from the previous agent to the target; a target outside
    /// the roster (a manager, say) only releases the previous agent.
    pub async fn handle(
        &self,
        event: &TicketEscalated,
        now: DateTime<Utc>,
    ) -> EngineResult<EscalationOutcome> {
        let (ticket_id, _) = self.guard.apply_escalated(event, now)?;
        let target = match event.escalated_to_user_id.as_deref() {
            Some(target) => target,
            // Validated on decode; a hand-built event without a target is a no-op
            None => return Ok(EscalationOutcome::AlreadyEscalated { ticket_id }),
        };

        if let Some(view) = self.store.get_ticket(&ticket_id)? {
            if view.status.is_terminal() {
                return Ok(EscalationOutcome::TerminalTicket { ticket_id });
            }
        }

        let active = self.store.active_assignment(&ticket_id)?;
        if let Some(active) = &active {
            if active.agent_id == target && active.assignment_type == AssignmentType::Escalation {
                return Ok(EscalationOutcome::AlreadyEscalated { ticket_id });
            }
        }

        let at = event.escalated_at.unwrap_or(now);
        let previous = self
            .assignments
            .move_assignment(&ticket_id, target, AssignmentType::Escalation, at)
            .await?;
        let from = previous.map(|a| a.agent_id);

        info!(
            %ticket_id,
            from = ?from,
            to = target,
            reason = event.reason.as_deref().unwrap_or(""),
            "Ticket escalated"
        );
        Ok(EscalationOutcome::Escalated {
            ticket_id,
            from,
            to: target.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::AssignmentConfig;
    use crate::directory::{AgentRecord, StaticAgentDirectory};
    use crate::events::{EventBus, TicketCreated};
    use crate::sla::{SlaDeadlineEngine, SlaPolicy};
    use crate::state::{AssignmentStatus, Priority, StateStore, TicketStatus};
    use crate::workload::WorkloadTracker;

    struct Fixture {
        store: SharedStateStore,
        guard: Arc<IngestionGuard>,
        assignments: Arc<AssignmentEngine>,
        handler: EscalationHandler,
    }

    fn fixture() -> Fixture {
        let store = StateStore::new().shared();
        let guard = Arc::new(IngestionGuard::new(store.clone()));
        let directory = Arc::new(StaticAgentDirectory::new(vec![
            AgentRecord::agent("agent-a", "alice"),
            AgentRecord::agent("agent-b", "bob"),
        ]));
        let assignments = Arc::new(AssignmentEngine::new(
            store.clone(),
            guard.clone(),
            WorkloadTracker::new().shared(),
            directory,
            EventBus::new().shared(),
            AssignmentConfig::default(),
        ));
        let handler = EscalationHandler::new(store.clone(), guard.clone(), assignments.clone());
        Fixture {
            store,
            guard,
            assignments,
            handler,
        }
    }

    fn escalated(target: &str) -> TicketEscalated {
        TicketEscalated {
            ticket_id: "t-1".to_string(),
            ticket_number: "TCK-1".to_string(),
            escalated_to_user_id: Some(target.to_string()),
            reason: Some("customer unhappy".to_string()),
            ..Default::default()
        }
    }

    async fn assigned_ticket(fx: &Fixture) {
        let created = TicketCreated {
            ticket_id: "t-1".to_string(),
            ticket_number: "TCK-1".to_string(),
            priority: Some(Priority::High),
            ..Default::default()
        };
        fx.guard.apply_created(&created, Utc::now()).unwrap();
        fx.assignments.auto_assign("t-1", Utc::now()).await.unwrap();
    }

    fn count(fx: &Fixture, agent: &str) -> u32 {
        fx.assignments
            .workload()
            .get(agent)
            .unwrap()
            .map_or(0, |w| w.active_ticket_count)
    }

    #[tokio::test]
    async fn test_escalation_moves_assignment_and_workload() {
        let fx = fixture();
        assigned_ticket(&fx).await;

        let outcome = fx.handler.handle(&escalated("agent-b"), Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            EscalationOutcome::Escalated {
                ticket_id: "t-1".to_string(),
                from: Some("agent-a".to_string()),
                to: "agent-b".to_string(),
            }
        );
        assert_eq!(count(&fx, "agent-a"), 0);
        assert_eq!(count(&fx, "agent-b"), 1);

        let history = fx.store.assignments_for_ticket("t-1").unwrap();
        assert_eq!(history[0].status, AssignmentStatus::Superseded);
        assert_eq!(history[1].assignment_type, AssignmentType::Escalation);

        let view = fx.store.get_ticket("t-1").unwrap().unwrap();
        assert_eq!(view.status, TicketStatus::Escalated);
        assert_eq!(view.assigned_agent.as_deref(), Some("agent-b"));
    }

    #[tokio::test]
    async fn test_redelivered_escalation_is_noop() {
        let fx = fixture();
        assigned_ticket(&fx).await;
        fx.handler.handle(&escalated("agent-b"), Utc::now()).await.unwrap();
        let again = fx.handler.handle(&escalated("agent-b"), Utc::now()).await.unwrap();

        assert!(matches!(again, EscalationOutcome::AlreadyEscalated { .. }));
        assert_eq!(count(&fx, "agent-b"), 1);
        assert_eq!(fx.store.assignments_for_ticket("t-1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_escalation_to_manager_only_releases_agent() {
        let fx = fixture();
        assigned_ticket(&fx).await;
        fx.handler.handle(&escalated("manager-1"), Utc::now()).await.unwrap();

        assert_eq!(count(&fx, "agent-a"), 0);
        assert!(!fx.assignments.workload().is_tracked("manager-1"));
        assert_eq!(
            fx.store.active_assignment("t-1").unwrap().unwrap().agent_id,
            "manager-1"
        );
    }

    #[tokio::test]
    async fn test_escalation_keeps_sla_clock() {
        let fx = fixture();
        let sla = SlaDeadlineEngine::new(
            fx.store.clone(),
            Arc::new(SlaPolicy::defaults()),
            EventBus::new().shared(),
        );
        assigned_ticket(&fx).await;
        let (before, _) = sla
            .create_tracking("t-1", Priority::High, None, Utc::now())
            .unwrap();

        fx.handler.handle(&escalated("agent-b"), Utc::now()).await.unwrap();

        assert_eq!(sla.tracking("t-1").unwrap().unwrap(), before);
    }
}
