//! In-process keyed state store for the engine's read-model
//!
//! Every family is a sorted map behind its own lock. Writes to one record are
//! atomic: read-modify-write goes through closure updates that run while the
//! family's write lock is held, so the sweep and the event workers never see
//! a half-applied record.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::schema::{self, keys};
use super::types::*;

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Lock poisoned for family {0}")]
    LockPoisoned(&'static str),

    #[error("Ticket number {ticket_number} already bound to ticket {existing}")]
    TicketNumberTaken {
        ticket_number: TicketNumber,
        existing: TicketId,
    },
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to StateStore
pub type SharedStateStore = Arc<StateStore>;

type Family<T> = RwLock<BTreeMap<String, T>>;

/// Keyed store holding tickets, assignments and SLA trackings
#[derive(Default)]
pub struct StateStore {
    tickets: Family<TicketView>,
    ticket_numbers: Family<TicketId>,
    assignments: Family<Assignment>,
    trackings: Family<SlaTracking>,
}

fn read<'a, T>(
    family: &'a Family<T>,
    name: &'static str,
) -> StoreResult<RwLockReadGuard<'a, BTreeMap<String, T>>> {
    family.read().map_err(|_| StoreError::LockPoisoned(name))
}

fn write<'a, T>(
    family: &'a Family<T>,
    name: &'static str,
) -> StoreResult<RwLockWriteGuard<'a, BTreeMap<String, T>>> {
    family.write().map_err(|_| StoreError::LockPoisoned(name))
}

/// Iterate all entries of a sorted map whose key starts with `prefix`
fn scan_prefix<'a, T>(
    map: &'a BTreeMap<String, T>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a T)> + 'a {
    map.range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(move |(k, _)| k.starts_with(prefix))
}

impl StateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    /// Record counts per family, keyed by family name
    pub fn family_sizes(&self) -> StoreResult<Vec<(&'static str, usize)>> {
        let mut sizes = Vec::with_capacity(schema::ALL_FAMILIES.len());
        for &name in schema::ALL_FAMILIES {
            let len = match name {
                schema::FAMILY_TICKETS => read(&self.tickets, name)?.len(),
                schema::FAMILY_TICKET_NUMBERS => read(&self.ticket_numbers, name)?.len(),
                schema::FAMILY_ASSIGNMENTS => read(&self.assignments, name)?.len(),
                _ => read(&self.trackings, name)?.len(),
            };
            sizes.push((name, len));
        }
        Ok(sizes)
    }

    // =========================================================================
    // Ticket operations
    // =========================================================================

    /// Get a ticket view by ID
    pub fn get_ticket(&self, ticket_id: &str) -> StoreResult<Option<TicketView>> {
        let tickets = read(&self.tickets, schema::FAMILY_TICKETS)?;
        Ok(tickets.get(&keys::ticket(ticket_id)).cloned())
    }

    /// Resolve a ticket number to the ticket ID it was first bound to
    pub fn ticket_id_for_number(&self, ticket_number: &str) -> StoreResult<Option<TicketId>> {
        let index = read(&self.ticket_numbers, schema::FAMILY_TICKET_NUMBERS)?;
        Ok(index.get(&keys::ticket_number(ticket_number)).cloned())
    }

    /// Insert a ticket view unless its ID or number is already known.
    ///
    /// Returns `true` when the view was inserted. An existing record is never
    /// overwritten.
    pub fn insert_ticket_if_absent(&self, view: TicketView) -> StoreResult<bool> {
        // Lock order: tickets before ticket_numbers
        let mut tickets = write(&self.tickets, schema::FAMILY_TICKETS)?;
        let mut index = write(&self.ticket_numbers, schema::FAMILY_TICKET_NUMBERS)?;

        let ticket_key = keys::ticket(&view.ticket_id);
        if tickets.contains_key(&ticket_key) {
            return Ok(false);
        }

        let number_key = keys::ticket_number(&view.ticket_number);
        if let Some(existing) = index.get(&number_key) {
            return Err(StoreError::TicketNumberTaken {
                ticket_number: view.ticket_number.clone(),
                existing: existing.clone(),
            });
        }

        index.insert(number_key, view.ticket_id.clone());
        tickets.insert(ticket_key, view);
        Ok(true)
    }

    /// Atomically mutate a ticket view.
    ///
    /// Returns `None` when the ticket is unknown.
    pub fn update_ticket<R>(
        &self,
        ticket_id: &str,
        f: impl FnOnce(&mut TicketView) -> R,
    ) -> StoreResult<Option<R>> {
        let mut tickets = write(&self.tickets, schema::FAMILY_TICKETS)?;
        Ok(tickets.get_mut(&keys::ticket(ticket_id)).map(f))
    }

    /// List all ticket views
    pub fn list_tickets(&self) -> StoreResult<Vec<TicketView>> {
        let tickets = read(&self.tickets, schema::FAMILY_TICKETS)?;
        Ok(tickets.values().cloned().collect())
    }

    // =========================================================================
    // Assignment operations
    // =========================================================================

    /// All assignments of a ticket, oldest first
    pub fn assignments_for_ticket(&self, ticket_id: &str) -> StoreResult<Vec<Assignment>> {
        let assignments = read(&self.assignments, schema::FAMILY_ASSIGNMENTS)?;
        let prefix = keys::assignment_prefix(ticket_id);
        let history = scan_prefix(&assignments, &prefix)
            .map(|(_, a)| a.clone())
            .collect();
        Ok(history)
    }

    /// The ACTIVE assignment of a ticket, if any
    pub fn active_assignment(&self, ticket_id: &str) -> StoreResult<Option<Assignment>> {
        let assignments = read(&self.assignments, schema::FAMILY_ASSIGNMENTS)?;
        let prefix = keys::assignment_prefix(ticket_id);
        let active = scan_prefix(&assignments, &prefix)
            .map(|(_, a)| a)
            .find(|a| a.is_active())
            .cloned();
        Ok(active)
    }

    /// Close the ticket's ACTIVE assignment (if any) with `closing_status`
    /// and append `next` as the new record, in one write.
    ///
    /// Keeps the at-most-one-ACTIVE invariant. Returns the closed assignment.
    pub fn replace_active_assignment(
        &self,
        next: Assignment,
        closing_status: AssignmentStatus,
    ) -> StoreResult<Option<Assignment>> {
        let mut assignments = write(&self.assignments, schema::FAMILY_ASSIGNMENTS)?;
        let prefix = keys::assignment_prefix(&next.ticket_id);

        let mut previous = None;
        let mut last_seq = None;
        let history: Vec<String> = scan_prefix(&assignments, &prefix)
            .map(|(k, _)| k.clone())
            .collect();
        for key in history {
            last_seq = keys::parse_assignment_seq(&key).or(last_seq);
            if let Some(record) = assignments.get_mut(&key) {
                if record.is_active() {
                    record.status = closing_status;
                    previous = Some(record.clone());
                }
            }
        }

        let seq = last_seq.map(|s| s + 1).unwrap_or(0);
        assignments.insert(keys::assignment(&next.ticket_id, seq), next);
        Ok(previous)
    }

    /// Close the ticket's ACTIVE assignment without replacing it
    pub fn close_active_assignment(
        &self,
        ticket_id: &str,
        closing_status: AssignmentStatus,
    ) -> StoreResult<Option<Assignment>> {
        let mut assignments = write(&self.assignments, schema::FAMILY_ASSIGNMENTS)?;
        let prefix = keys::assignment_prefix(ticket_id);
        let active_key = scan_prefix(&assignments, &prefix)
            .find(|(_, a)| a.is_active())
            .map(|(k, _)| k.clone());

        Ok(active_key.and_then(|key| {
            assignments.get_mut(&key).map(|record| {
                record.status = closing_status;
                record.clone()
            })
        }))
    }

    /// Every ACTIVE assignment across all tickets
    pub fn list_active_assignments(&self) -> StoreResult<Vec<Assignment>> {
        let assignments = read(&self.assignments, schema::FAMILY_ASSIGNMENTS)?;
        Ok(assignments
            .values()
            .filter(|a| a.is_active())
            .cloned()
            .collect())
    }

    // =========================================================================
    // SLA tracking operations
    // =========================================================================

    /// Get the SLA tracking of a ticket
    pub fn get_tracking(&self, ticket_id: &str) -> StoreResult<Option<SlaTracking>> {
        let trackings = read(&self.trackings, schema::FAMILY_TRACKINGS)?;
        Ok(trackings.get(&keys::tracking(ticket_id)).cloned())
    }

    /// Insert a tracking unless one exists; returns the stored record and
    /// whether it was inserted by this call
    pub fn insert_tracking_if_absent(
        &self,
        tracking: SlaTracking,
    ) -> StoreResult<(SlaTracking, bool)> {
        let mut trackings = write(&self.trackings, schema::FAMILY_TRACKINGS)?;
        let key = keys::tracking(&tracking.ticket_id);
        if let Some(existing) = trackings.get(&key) {
            return Ok((existing.clone(), false));
        }
        trackings.insert(key, tracking.clone());
        Ok((tracking, true))
    }

    /// Atomically mutate a tracking; bumps its version when the closure
    /// changed anything.
    ///
    /// Returns `None` when the ticket has no tracking.
    pub fn update_tracking<R>(
        &self,
        ticket_id: &str,
        f: impl FnOnce(&mut SlaTracking) -> R,
    ) -> StoreResult<Option<R>> {
        let mut trackings = write(&self.trackings, schema::FAMILY_TRACKINGS)?;
        Ok(trackings.get_mut(&keys::tracking(ticket_id)).map(|t| {
            let before = t.clone();
            let result = f(t);
            if *t != before {
                t.version = before.version + 1;
            }
            result
        }))
    }

    /// Ticket IDs of trackings that are not yet resolved
    pub fn open_tracking_ids(&self) -> StoreResult<Vec<TicketId>> {
        let trackings = read(&self.trackings, schema::FAMILY_TRACKINGS)?;
        Ok(trackings
            .values()
            .filter(|t| t.is_open())
            .map(|t| t.ticket_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn view(id: &str, number: &str) -> TicketView {
        let now = Utc::now();
        TicketView {
            ticket_id: id.to_string(),
            ticket_number: number.to_string(),
            title: "Printer on fire".to_string(),
            description: None,
            status: TicketStatus::Open,
            priority: None,
            category: None,
            created_by: Some("customer-1".to_string()),
            assigned_agent: None,
            created_at: now,
            updated_at: now,
            status_changed_at: None,
        }
    }

    #[test]
    fn test_insert_ticket_is_first_writer_wins() {
        let store = StateStore::new();
        assert!(store.insert_ticket_if_absent(view("t-1", "TCK-1")).unwrap());

        let mut second = view("t-1", "TCK-1");
        second.title = "Overwritten".to_string();
        assert!(!store.insert_ticket_if_absent(second).unwrap());

        let stored = store.get_ticket("t-1").unwrap().unwrap();
        assert_eq!(stored.title, "Printer on fire");
        assert_eq!(
            store.ticket_id_for_number("TCK-1").unwrap().as_deref(),
            Some("t-1")
        );
    }

    #[test]
    fn test_ticket_number_bound_once() {
        let store = StateStore::new();
        store.insert_ticket_if_absent(view("t-1", "TCK-1")).unwrap();
        let err = store
            .insert_ticket_if_absent(view("t-2", "TCK-1"))
            .unwrap_err();
        assert!(matches!(err, StoreError::TicketNumberTaken { .. }));
        assert!(store.get_ticket("t-2").unwrap().is_none());
    }

    #[test]
    fn test_replace_active_assignment_keeps_history() {
        let store = StateStore::new();
        let now = Utc::now();

        let first = Assignment::active("t-1", "agent-a", AssignmentType::Auto, now);
        assert!(store
            .replace_active_assignment(first, AssignmentStatus::Superseded)
            .unwrap()
            .is_none());

        let second = Assignment::active("t-1", "agent-b", AssignmentType::Manual, now);
        let previous = store
            .replace_active_assignment(second, AssignmentStatus::Superseded)
            .unwrap()
            .unwrap();
        assert_eq!(previous.agent_id, "agent-a");
        assert_eq!(previous.status, AssignmentStatus::Superseded);

        let history = store.assignments_for_ticket("t-1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|a| a.is_active()).count(), 1);
        assert_eq!(
            store.active_assignment("t-1").unwrap().unwrap().agent_id,
            "agent-b"
        );
    }

    #[test]
    fn test_prefix_scan_does_not_leak_between_tickets() {
        let store = StateStore::new();
        let now = Utc::now();
        store
            .replace_active_assignment(
                Assignment::active("t-1", "a", AssignmentType::Auto, now),
                AssignmentStatus::Superseded,
            )
            .unwrap();
        store
            .replace_active_assignment(
                Assignment::active("t-10", "b", AssignmentType::Auto, now),
                AssignmentStatus::Superseded,
            )
            .unwrap();

        assert_eq!(store.assignments_for_ticket("t-1").unwrap().len(), 1);
        assert_eq!(store.list_active_assignments().unwrap().len(), 2);

        store
            .replace_active_assignment(
                Assignment::active("t-1:x", "c", AssignmentType::Auto, now),
                AssignmentStatus::Superseded,
            )
            .unwrap();
        assert_eq!(store.active_assignment("t-1").unwrap().unwrap().agent_id, "a");
        assert_eq!(store.assignments_for_ticket("t-1").unwrap().len(), 1);
        assert_eq!(store.active_assignment("t-1:x").unwrap().unwrap().agent_id, "c");
    }

    #[test]
    fn test_close_active_assignment() {
        let store = StateStore::new();
        let now = Utc::now();
        store
            .replace_active_assignment(
                Assignment::active("t-1", "a", AssignmentType::Auto, now),
                AssignmentStatus::Superseded,
            )
            .unwrap();

        let closed = store
            .close_active_assignment("t-1", AssignmentStatus::Completed)
            .unwrap()
            .unwrap();
        assert_eq!(closed.status, AssignmentStatus::Completed);
        assert!(store.active_assignment("t-1").unwrap().is_none());
        assert!(store
            .close_active_assignment("t-1", AssignmentStatus::Completed)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_update_tracking_bumps_version() {
        let store = StateStore::new();
        let now = Utc::now();
        let tracking = SlaTracking {
            ticket_id: "t-1".to_string(),
            priority: Priority::High,
            category: None,
            started_at: now,
            response_due_at: now,
            resolution_due_at: now,
            first_response_at: None,
            resolved_at: None,
            response_breached: false,
            resolution_breached: false,
            sla_status: SlaStatus::OnTrack,
            version: 0,
        };
        let (_, inserted) = store.insert_tracking_if_absent(tracking.clone()).unwrap();
        assert!(inserted);
        let (_, inserted_again) = store.insert_tracking_if_absent(tracking).unwrap();
        assert!(!inserted_again);

        store
            .update_tracking("t-1", |t| t.resolved_at = Some(now))
            .unwrap();
        store
            .update_tracking("t-1", |t| t.resolved_at = Some(now))
            .unwrap();
        let stored = store.get_tracking("t-1").unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert!(store.open_tracking_ids().unwrap().is_empty());
        assert!(store.update_tracking("missing", |_| ()).unwrap().is_none());
    }
}
