//! Engine property tests: end-to-end checks of the engine's guarantees
//! through raw deliveries.
//!
//! Tests verify:
//! - Redelivered creation and assignment events leave identical state
//! - Workload counters equal ACTIVE assignments after mixed sequences
//! - Least-loaded selection skips offline agents
//! - Deadline arithmetic, single-fire breach and warning signals
//! - Out-of-order and malformed deliveries are dropped without side effects
//! - Stale status changes never reopen or re-close a ticket
//! - Assignments to agents not yet rostered are counted once they are
//! - Escalation keeps the SLA clock
//! - A hung agent directory fails closed

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::broadcast;

use ticket_engine::state::{AgentStatus, SlaClock, SlaStatus, TicketStatus};
use ticket_engine::workload::WorkloadTracker;
use ticket_engine::{
    AgentDirectory, AgentRecord, AssignmentConfig, AssignmentOutcome, DirectoryError, Engine,
    EngineOptions, EventBus, HandleOutcome, OutboundEvent, SlaPolicy, StateStore,
    StaticAgentDirectory,
};

const T0: &str = "2024-05-01T09:00:00Z";

fn at(offset_minutes: i64) -> DateTime<Utc> {
    T0.parse::<DateTime<Utc>>().unwrap() + chrono::Duration::minutes(offset_minutes)
}

fn roster(ids: &[&str]) -> Vec<AgentRecord> {
    ids.iter().map(|id| AgentRecord::agent(*id, *id)).collect()
}

struct Harness {
    engine: Engine,
    directory: Arc<StaticAgentDirectory>,
    rx: broadcast::Receiver<OutboundEvent>,
}

fn harness(agents: &[&str]) -> Harness {
    let bus = EventBus::with_capacity(4096).shared();
    let rx = bus.subscribe();
    let directory = Arc::new(StaticAgentDirectory::new(roster(agents)));
    let engine = Engine::new(
        StateStore::new().shared(),
        SlaPolicy::defaults(),
        directory.clone(),
        bus,
        EngineOptions::default(),
    );
    Harness {
        engine,
        directory,
        rx,
    }
}

fn drain(rx: &mut broadcast::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn deliver(engine: &Engine, routing_key: &str, body: serde_json::Value) -> HandleOutcome {
    engine
        .handle_delivery(routing_key, &serde_json::to_vec(&body).unwrap())
        .await
        .unwrap()
}

async fn create(engine: &Engine, n: u32, priority: Option<&str>) {
    let mut body = json!({
        "ticketId": format!("t-{n}"),
        "ticketNumber": format!("TCK-{n}"),
        "title": format!("Ticket {n}"),
        "createdBy": "customer-1",
        "createdAt": T0,
    });
    if let Some(priority) = priority {
        body["priority"] = json!(priority);
    }
    deliver(engine, "ticket.created", body).await;
}

async fn set_status(engine: &Engine, n: u32, status: &str) {
    deliver(
        engine,
        "ticket.status.changed",
        json!({
            "ticketId": format!("t-{n}"),
            "ticketNumber": format!("TCK-{n}"),
            "newStatus": status,
        }),
    )
    .await;
}

async fn set_status_at(engine: &Engine, n: u32, status: &str, changed_at: &str) {
    deliver(
        engine,
        "ticket.status.changed",
        json!({
            "ticketId": format!("t-{n}"),
            "ticketNumber": format!("TCK-{n}"),
            "newStatus": status,
            "changedAt": changed_at,
        }),
    )
    .await;
}

async fn assign(engine: &Engine, n: u32, agent: &str) {
    deliver(
        engine,
        "ticket.assigned",
        json!({
            "ticketId": format!("t-{n}"),
            "ticketNumber": format!("TCK-{n}"),
            "assignedToUserId": agent,
        }),
    )
    .await;
}

fn count(engine: &Engine, agent: &str) -> u32 {
    engine
        .workload()
        .get(agent)
        .unwrap()
        .map_or(0, |w| w.active_ticket_count)
}

async fn escalate(engine: &Engine, n: u32, target: &str) {
    deliver(
        engine,
        "ticket.escalated",
        json!({
            "ticketId": format!("t-{n}"),
            "ticketNumber": format!("TCK-{n}"),
            "escalatedToUserId": target,
        }),
    )
    .await;
}

fn assert_workload_exact(engine: &Engine) {
    let drift = engine.audit().unwrap();
    assert!(drift.is_empty(), "workload drifted: {drift:?}");
}

// ── Property: idempotent ingestion ─────────────────────────────────

#[tokio::test]
async fn prop_redelivered_created_is_identical() {
    let h = harness(&["agent-a", "agent-b"]);
    create(&h.engine, 1, Some("HIGH")).await;
    let view = h.engine.store().get_ticket("t-1").unwrap();
    let assignments = h.engine.store().assignments_for_ticket("t-1").unwrap();
    let tracking = h.engine.sla().tracking("t-1").unwrap();

    create(&h.engine, 1, Some("HIGH")).await;

    assert_eq!(h.engine.store().get_ticket("t-1").unwrap(), view);
    assert_eq!(
        h.engine.store().assignments_for_ticket("t-1").unwrap(),
        assignments
    );
    assert_eq!(h.engine.sla().tracking("t-1").unwrap(), tracking);
    assert_workload_exact(&h.engine);
}

#[tokio::test]
async fn prop_redelivered_assigned_is_identical() {
    let h = harness(&["agent-a", "agent-b"]);
    create(&h.engine, 1, Some("HIGH")).await;

    let assigned = json!({
        "ticketId": "t-1",
        "ticketNumber": "TCK-1",
        "assignedToUserId": "agent-b",
        "assignedAt": T0,
    });
    deliver(&h.engine, "ticket.assigned", assigned.clone()).await;
    let view = h.engine.store().get_ticket("t-1").unwrap();
    let history = h.engine.store().assignments_for_ticket("t-1").unwrap();

    deliver(&h.engine, "ticket.assigned", assigned).await;

    assert_eq!(h.engine.store().get_ticket("t-1").unwrap(), view);
    assert_eq!(
        h.engine.store().assignments_for_ticket("t-1").unwrap(),
        history
    );
    assert_workload_exact(&h.engine);
}

// ── Property: workload counters never drift ────────────────────────

#[tokio::test]
async fn prop_workload_matches_active_assignments() {
    let h = harness(&["agent-a", "agent-b", "agent-c"]);
    let agents = ["agent-a", "agent-b", "agent-c", "manager-1"];

    for n in 0..24u32 {
        create(&h.engine, n, Some(["LOW", "MEDIUM", "HIGH", "CRITICAL"][n as usize % 4])).await;
    }
    for n in 0..24u32 {
        match n % 6 {
            0 => {
                h.engine
                    .reassign(&format!("t-{n}"), agents[(n as usize / 6) % 3])
                    .await
                    .unwrap();
            }
            1 => escalate(&h.engine, n, agents[(n as usize) % 4]).await,
            2 => set_status(&h.engine, n, "RESOLVED").await,
            3 => {
                set_status(&h.engine, n, "CLOSED").await;
                set_status(&h.engine, n, "REOPENED").await;
            }
            4 => {
                escalate(&h.engine, n, "manager-1").await;
                set_status(&h.engine, n, "CLOSED").await;
            }
            _ => set_status(&h.engine, n, "IN_PROGRESS").await,
        }
        assert_workload_exact(&h.engine);
    }

    // Every non-terminal ticket has exactly one ACTIVE assignment
    for view in h.engine.store().list_tickets().unwrap() {
        let active = h
            .engine
            .store()
            .assignments_for_ticket(&view.ticket_id)
            .unwrap()
            .into_iter()
            .filter(|a| a.is_active())
            .count();
        let expected = usize::from(!view.status.is_terminal());
        assert_eq!(active, expected, "ticket {}", view.ticket_id);
    }
}

#[tokio::test]
async fn prop_concurrent_deliveries_keep_counters_exact() {
    let h = harness(&["agent-a", "agent-b", "agent-c", "agent-d"]);
    let engine = Arc::new(h.engine);

    let mut handles = Vec::new();
    for n in 0..40u32 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            create(&engine, n, Some("MEDIUM")).await;
            // Redelivery racing itself
            create(&engine, n, Some("MEDIUM")).await;
            if n % 3 == 0 {
                set_status(&engine, n, "RESOLVED").await;
            }
            if n % 5 == 0 {
                escalate(&engine, n, "agent-a").await;
            }
        }));
    }
    let sweeper = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for minute in 0..50 {
                engine.sweep(at(minute * 10)).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    for handle in handles {
        handle.await.unwrap();
    }
    sweeper.await.unwrap();

    assert_workload_exact(&engine);
    let total: u32 = engine
        .workload()
        .snapshot()
        .unwrap()
        .iter()
        .map(|w| w.active_ticket_count)
        .sum();
    let active = engine.store().list_active_assignments().unwrap().len() as u32;
    assert_eq!(total, active);
}

#[tokio::test]
async fn prop_upstream_assignment_before_roster_load_is_counted() {
    let h = harness(&["agent-a", "agent-b"]);
    create(&h.engine, 1, None).await;
    assign(&h.engine, 1, "agent-a").await;
    create(&h.engine, 2, Some("HIGH")).await;

    assert_workload_exact(&h.engine);
    assert_eq!(count(&h.engine, "agent-a"), 1);
    assert_eq!(count(&h.engine, "agent-b"), 1);
    assert_eq!(
        h.engine.store().active_assignment("t-2").unwrap().unwrap().agent_id,
        "agent-b"
    );
}

#[tokio::test]
async fn prop_agent_rostered_late_starts_from_its_assignments() {
    let h = harness(&["agent-a", "agent-b"]);
    h.directory.set_active("agent-b", false);
    create(&h.engine, 1, None).await;
    assign(&h.engine, 1, "agent-b").await;
    assert!(!h.engine.workload().is_tracked("agent-b"));

    h.directory.set_active("agent-b", true);
    create(&h.engine, 2, Some("HIGH")).await;

    assert_workload_exact(&h.engine);
    assert_eq!(count(&h.engine, "agent-b"), 1);
    assert_eq!(
        h.engine.store().active_assignment("t-2").unwrap().unwrap().agent_id,
        "agent-a"
    );
}

// ── Property: least-loaded selection ───────────────────────────────

#[test]
fn prop_least_loaded_skips_offline() {
    let tracker = WorkloadTracker::new();
    tracker.sync_roster(&roster(&["A", "B", "C"]), &[]).unwrap();
    for _ in 0..2 {
        tracker.record_assignment("A").unwrap();
    }
    tracker.record_assignment("C").unwrap();
    tracker.set_status("C", AgentStatus::Offline).unwrap();

    let chosen = tracker.select_least_loaded_agent().unwrap().unwrap();
    assert_eq!(chosen.agent_id, "B");
}

#[tokio::test]
async fn prop_auto_assign_balances_load() {
    let h = harness(&["agent-a", "agent-b", "agent-c"]);
    for n in 0..9 {
        create(&h.engine, n, Some("LOW")).await;
    }
    for workload in h.engine.workload().snapshot().unwrap() {
        assert_eq!(workload.active_ticket_count, 3, "{}", workload.agent_id);
    }
}

// ── Property: SLA arithmetic and single-fire signals ───────────────

#[tokio::test]
async fn prop_critical_deadlines_from_creation() {
    let h = harness(&["agent-a"]);
    create(&h.engine, 1, Some("CRITICAL")).await;

    let tracking = h.engine.sla().tracking("t-1").unwrap().unwrap();
    assert_eq!(tracking.response_due_at, at(15));
    assert_eq!(tracking.resolution_due_at, at(120));
    assert_eq!(tracking.sla_status, SlaStatus::OnTrack);
}

#[tokio::test]
async fn prop_breach_fires_once() {
    let mut h = harness(&["agent-a"]);
    create(&h.engine, 1, Some("CRITICAL")).await;
    drain(&mut h.rx);

    h.engine.sweep(at(200)).await.unwrap();
    h.engine.sweep(at(201)).await.unwrap();

    let breaches: Vec<_> = drain(&mut h.rx)
        .into_iter()
        .filter(|e| matches!(e, OutboundEvent::SlaBreach { clock: SlaClock::Resolution, .. }))
        .collect();
    assert_eq!(breaches.len(), 1);
    assert!(h.engine.sla().tracking("t-1").unwrap().unwrap().resolution_breached);
}

#[tokio::test]
async fn prop_warning_fires_once_and_never_regresses() {
    let mut h = harness(&["agent-a"]);
    create(&h.engine, 1, Some("MEDIUM")).await;
    drain(&mut h.rx);

    let mut statuses = Vec::new();
    for minute in (200..=260).step_by(5) {
        h.engine.sweep(at(minute)).await.unwrap();
        statuses.push(h.engine.sla().tracking("t-1").unwrap().unwrap().sla_status);
    }

    let warnings = drain(&mut h.rx)
        .into_iter()
        .filter(|e| matches!(e, OutboundEvent::SlaWarning { .. }))
        .count();
    assert_eq!(warnings, 1);
    assert!(statuses.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(statuses.last(), Some(&SlaStatus::Breached));
}

#[tokio::test]
async fn prop_resolution_freezes_tracking() {
    let mut h = harness(&["agent-a"]);
    create(&h.engine, 1, Some("CRITICAL")).await;
    set_status(&h.engine, 1, "RESOLVED").await;
    drain(&mut h.rx);

    h.engine.sweep(at(10_000)).await.unwrap();
    assert!(drain(&mut h.rx).is_empty());

    let tracking = h.engine.sla().tracking("t-1").unwrap().unwrap();
    let resolved_at = tracking.resolved_at;
    assert_eq!(tracking.sla_status, SlaStatus::Resolved);

    set_status(&h.engine, 1, "CLOSED").await;
    assert_eq!(
        h.engine.sla().tracking("t-1").unwrap().unwrap().resolved_at,
        resolved_at
    );
}

// ── Property: out-of-order and malformed deliveries ────────────────

#[tokio::test]
async fn prop_assignment_before_creation_is_dropped() {
    let h = harness(&["agent-a"]);
    let outcome = deliver(
        &h.engine,
        "ticket.assigned",
        json!({ "ticketId": "t-1", "ticketNumber": "TCK-1", "assignedToUserId": "agent-a" }),
    )
    .await;
    assert!(matches!(outcome, HandleOutcome::Dropped { .. }));
    assert!(h.engine.store().get_ticket("t-1").unwrap().is_none());

    create(&h.engine, 1, Some("LOW")).await;
    let view = h.engine.store().get_ticket("t-1").unwrap().unwrap();
    assert_eq!(view.status, TicketStatus::Assigned);
    assert_workload_exact(&h.engine);
}

#[tokio::test]
async fn prop_stale_status_does_not_reopen_resolved_ticket() {
    let mut h = harness(&["agent-a"]);
    create(&h.engine, 1, Some("HIGH")).await;
    set_status_at(&h.engine, 1, "RESOLVED", "2024-05-01T12:00:00Z").await;
    drain(&mut h.rx);

    set_status_at(&h.engine, 1, "IN_PROGRESS", "2024-05-01T11:00:00Z").await;
    // Newer timestamp, but a resolved ticket only comes back through REOPENED
    set_status_at(&h.engine, 1, "IN_PROGRESS", "2024-05-01T13:00:00Z").await;

    let view = h.engine.store().get_ticket("t-1").unwrap().unwrap();
    assert_eq!(view.status, TicketStatus::Resolved);
    assert!(h.engine.retry_unassigned().await.unwrap().is_empty());
    assert!(h.engine.store().active_assignment("t-1").unwrap().is_none());
    assert!(drain(&mut h.rx).is_empty());
    assert_eq!(count(&h.engine, "agent-a"), 0);
    assert_workload_exact(&h.engine);
}

#[tokio::test]
async fn prop_resolution_redelivered_after_reopen_is_ignored() {
    let h = harness(&["agent-a"]);
    create(&h.engine, 1, Some("HIGH")).await;
    set_status_at(&h.engine, 1, "RESOLVED", "2024-05-01T12:00:00Z").await;
    set_status_at(&h.engine, 1, "REOPENED", "2024-05-01T13:00:00Z").await;
    let reopened = h.engine.store().active_assignment("t-1").unwrap().unwrap();
    let tracking = h.engine.sla().tracking("t-1").unwrap();

    set_status_at(&h.engine, 1, "RESOLVED", "2024-05-01T12:00:00Z").await;

    let view = h.engine.store().get_ticket("t-1").unwrap().unwrap();
    assert!(!view.status.is_terminal());
    assert_eq!(
        h.engine.store().active_assignment("t-1").unwrap(),
        Some(reopened)
    );
    assert_eq!(h.engine.sla().tracking("t-1").unwrap(), tracking);
    assert_eq!(count(&h.engine, "agent-a"), 1);
    assert_workload_exact(&h.engine);
}

#[tokio::test]
async fn prop_malformed_deliveries_are_acknowledged() {
    let h = harness(&["agent-a"]);
    let cases: Vec<(&str, Vec<u8>)> = vec![
        ("ticket.created", b"{".to_vec()),
        ("ticket.created", br#"{"ticketId":"t-1"}"#.to_vec()),
        ("ticket.assigned", br#"{"ticketId":"t-1","ticketNumber":"TCK-1"}"#.to_vec()),
        ("ticket.reticulated", br#"{"ticketId":"t-1","ticketNumber":"TCK-1"}"#.to_vec()),
    ];
    for (routing_key, payload) in cases {
        let outcome = h.engine.handle_delivery(routing_key, &payload).await.unwrap();
        assert!(
            matches!(outcome, HandleOutcome::Dropped { .. }),
            "{routing_key} should be dropped"
        );
    }
    assert!(h.engine.store().list_tickets().unwrap().is_empty());
}

// ── Property: escalation keeps the SLA clock ───────────────────────

#[tokio::test]
async fn prop_escalation_preserves_sla_clock() {
    let h = harness(&["agent-a", "agent-b"]);
    create(&h.engine, 1, Some("HIGH")).await;
    let before = h.engine.sla().tracking("t-1").unwrap().unwrap();

    escalate(&h.engine, 1, "agent-b").await;

    let after = h.engine.sla().tracking("t-1").unwrap().unwrap();
    assert_eq!(after, before);
    let view = h.engine.store().get_ticket("t-1").unwrap().unwrap();
    assert_eq!(view.status, TicketStatus::Escalated);
    assert_workload_exact(&h.engine);
}

// ── Property: directory failures fail closed ───────────────────────

struct HungDirectory;

#[async_trait]
impl AgentDirectory for HungDirectory {
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, DirectoryError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(roster(&["agent-a"]))
    }
}

#[tokio::test(start_paused = true)]
async fn prop_directory_timeout_means_no_agent() {
    let options = EngineOptions {
        assignment: AssignmentConfig {
            directory_timeout_ms: 100,
            ..AssignmentConfig::default()
        },
        ..EngineOptions::default()
    };
    let engine = Engine::new(
        StateStore::new().shared(),
        SlaPolicy::defaults(),
        Arc::new(HungDirectory),
        EventBus::new().shared(),
        options,
    );
    create(&engine, 1, Some("HIGH")).await;

    assert!(engine.store().active_assignment("t-1").unwrap().is_none());
    let retried = engine.retry_unassigned().await.unwrap();
    assert_eq!(
        retried,
        vec![("t-1".to_string(), AssignmentOutcome::NoAgentAvailable)]
    );
}

#[tokio::test]
async fn prop_retry_picks_up_tickets_once_agents_return() {
    let h = harness(&["agent-a"]);
    h.directory.set_active("agent-a", false);
    create(&h.engine, 1, Some("HIGH")).await;
    create(&h.engine, 2, Some("LOW")).await;
    assert!(h.engine.store().list_active_assignments().unwrap().is_empty());

    h.directory.set_active("agent-a", true);
    let results = h.engine.retry_unassigned().await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(h.engine.store().list_active_assignments().unwrap().len(), 2);
    assert!(h.engine.retry_unassigned().await.unwrap().is_empty());
}
