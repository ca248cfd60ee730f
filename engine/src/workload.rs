//! Agent workload tracker
//!
//! Each agent's counter sits behind its own mutex, so concurrent assignments
//! for different agents never contend. Operations that touch two agents lock
//! them in agent-id order.
//!
//! ```text
//!   roster (RwLock)
//!   ├── agent-a ── Mutex<AgentWorkload { count: 2, AVAILABLE }>
//!   ├── agent-b ── Mutex<AgentWorkload { count: 0, AVAILABLE }>  ← least loaded
//!   └── agent-c ── Mutex<AgentWorkload { count: 1, OFFLINE }>
//! ```
//!
//! Counters are exact (`count == ACTIVE assignments`) as long as every
//! assignment change goes through this tracker. `audit` checks that.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::directory::AgentRecord;
use crate::error::WorkloadError;
use crate::state::{AgentId, AgentStatus, AgentWorkload, Assignment};

/// Result type for workload operations
pub type WorkloadResult<T> = Result<T, WorkloadError>;

/// Shared reference to WorkloadTracker
pub type SharedWorkloadTracker = Arc<WorkloadTracker>;

type Slot = Arc<Mutex<AgentWorkload>>;

/// Outcome of a roster synchronisation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterSync {
    pub added: usize,
    pub went_offline: usize,
    pub came_online: usize,
}

/// A counter that disagrees with the assignment records
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadDiscrepancy {
    pub agent_id: AgentId,
    pub counted: u32,
    pub active_assignments: u32,
}

/// Per-agent load counters mirrored from the agent directory
#[derive(Default)]
pub struct WorkloadTracker {
    agents: RwLock<BTreeMap<AgentId, Slot>>,
    /// Serializes select-then-increment so two claims cannot both see the
    /// same minimum
    claim: Mutex<()>,
    soft_cap: Option<u32>,
}

fn lock<'a>(slot: &'a Slot, agent_id: &str) -> WorkloadResult<MutexGuard<'a, AgentWorkload>> {
    slot.lock()
        .map_err(|_| WorkloadError::LockPoisoned(agent_id.to_string()))
}

impl WorkloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agents at or above `cap` active tickets are not selectable
    pub fn with_soft_cap(cap: Option<u32>) -> Self {
        Self {
            soft_cap: cap,
            ..Self::default()
        }
    }

    pub fn shared(self) -> SharedWorkloadTracker {
        Arc::new(self)
    }

    pub fn soft_cap(&self) -> Option<u32> {
        self.soft_cap
    }

    fn slot(&self, agent_id: &str) -> WorkloadResult<Option<Slot>> {
        let agents = self
            .agents
            .read()
            .map_err(|_| WorkloadError::RosterPoisoned)?;
        Ok(agents.get(agent_id).cloned())
    }

    fn slots(&self) -> WorkloadResult<Vec<(AgentId, Slot)>> {
        let agents = self
            .agents
            .read()
            .map_err(|_| WorkloadError::RosterPoisoned)?;
        Ok(agents
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect())
    }

    /// Whether the agent is part of the mirrored roster
    pub fn is_tracked(&self, agent_id: &str) -> bool {
        matches!(self.slot(agent_id), Ok(Some(_)))
    }

    /// Copy of one agent's workload
    pub fn get(&self, agent_id: &str) -> WorkloadResult<Option<AgentWorkload>> {
        match self.slot(agent_id)? {
            Some(slot) => Ok(Some(lock(&slot, agent_id)?.clone())),
            None => Ok(None),
        }
    }

    /// Copy of every agent's workload, ordered by agent id
    pub fn snapshot(&self) -> WorkloadResult<Vec<AgentWorkload>> {
        self.slots()?
            .iter()
            .map(|(id, slot)| lock(slot, id).map(|w| w.clone()))
            .collect()
    }

    fn selectable(&self, workload: &AgentWorkload) -> bool {
        workload.status == AgentStatus::Available
            && self
                .soft_cap
                .map_or(true, |cap| workload.active_ticket_count < cap)
    }

    /// The AVAILABLE agent with the fewest active tickets.
    ///
    /// Ties go to the lowest agent id. `None` means no agent is available.
    pub fn select_least_loaded_agent(&self) -> WorkloadResult<Option<AgentWorkload>> {
        let mut best: Option<AgentWorkload> = None;
        // Slots iterate in id order, so strict `<` keeps the lowest id on ties
        for (id, slot) in self.slots()? {
            let workload = lock(&slot, &id)?;
            if !self.selectable(&workload) {
                continue;
            }
            let better = best
                .as_ref()
                .map_or(true, |b| workload.active_ticket_count < b.active_ticket_count);
            if better {
                best = Some(workload.clone());
            }
        }
        Ok(best)
    }

    /// Select the least-loaded agent and count the new ticket against it,
    /// as one step.
    pub fn claim_least_loaded(&self) -> WorkloadResult<Option<AgentId>> {
        let _claim = self.claim.lock().map_err(|_| WorkloadError::RosterPoisoned)?;
        let Some(candidate) = self.select_least_loaded_agent()? else {
            return Ok(None);
        };
        let Some(slot) = self.slot(&candidate.agent_id)? else {
            return Ok(None);
        };

        let mut workload = lock(&slot, &candidate.agent_id)?;
        // Presence may have changed since selection
        if !self.selectable(&workload) {
            debug!(agent_id = %candidate.agent_id, "Candidate no longer selectable");
            return Ok(None);
        }
        workload.active_ticket_count += 1;
        debug!(
            agent_id = %workload.agent_id,
            active_ticket_count = workload.active_ticket_count,
            "Claimed least-loaded agent"
        );
        Ok(Some(workload.agent_id.clone()))
    }

    /// Count one more active ticket against the agent.
    ///
    /// Returns false if the agent is not rostered.
    pub fn record_assignment(&self, agent_id: &str) -> WorkloadResult<bool> {
        let Some(slot) = self.slot(agent_id)? else {
            return Ok(false);
        };
        let mut workload = lock(&slot, agent_id)?;
        workload.active_ticket_count += 1;
        Ok(true)
    }

    /// Count one fewer active ticket against the agent, clamping at zero.
    ///
    /// Returns false if the agent is not rostered.
    pub fn record_completion(&self, agent_id: &str) -> WorkloadResult<bool> {
        let Some(slot) = self.slot(agent_id)? else {
            return Ok(false);
        };
        let mut workload = lock(&slot, agent_id)?;
        decrement(&mut workload);
        Ok(true)
    }

    /// Move one unit of load from `from` to `to`.
    ///
    /// Both agents are locked (in id order) before either counter changes.
    /// An unrostered side is skipped, so escalating to a user outside the
    /// roster only decrements the previous agent.
    pub fn transfer(&self, from: Option<&str>, to: Option<&str>) -> WorkloadResult<()> {
        if from.is_some() && from == to {
            return Ok(());
        }
        let from_slot = match from {
            Some(id) => self.slot(id)?.map(|slot| (id, slot)),
            None => None,
        };
        let to_slot = match to {
            Some(id) => self.slot(id)?.map(|slot| (id, slot)),
            None => None,
        };

        match (from_slot, to_slot) {
            (Some((from_id, from_slot)), Some((to_id, to_slot))) => {
                let (mut from_guard, mut to_guard) = if from_id < to_id {
                    let f = lock(&from_slot, from_id)?;
                    let t = lock(&to_slot, to_id)?;
                    (f, t)
                } else {
                    let t = lock(&to_slot, to_id)?;
                    let f = lock(&from_slot, from_id)?;
                    (f, t)
                };
                decrement(&mut from_guard);
                to_guard.active_ticket_count += 1;
            }
            (Some((from_id, from_slot)), None) => {
                decrement(&mut *lock(&from_slot, from_id)?);
            }
            (None, Some((to_id, to_slot))) => {
                lock(&to_slot, to_id)?.active_ticket_count += 1;
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Set an agent's presence; returns false if the agent is not rostered
    pub fn set_status(&self, agent_id: &str, status: AgentStatus) -> WorkloadResult<bool> {
        let Some(slot) = self.slot(agent_id)? else {
            return Ok(false);
        };
        let mut workload = lock(&slot, agent_id)?;
        if workload.status != status {
            info!(agent_id, from = %workload.status, to = %status, "Agent status changed");
            workload.status = status;
        }
        Ok(true)
    }

    /// Mirror the directory roster.
    ///
    /// Known agents keep their counters. A newly added agent starts from its
    /// ACTIVE entries in `active`, which covers tickets handed to it before
    /// it was rostered. Agents missing from the directory or no longer
    /// assignable go OFFLINE but are never removed. A BUSY agent stays BUSY
    /// while the directory lists it as active.
    pub fn sync_roster(
        &self,
        records: &[AgentRecord],
        active: &[Assignment],
    ) -> WorkloadResult<RosterSync> {
        let mut report = RosterSync::default();
        let assignable: HashMap<&str, &AgentRecord> = records
            .iter()
            .filter(|r| r.is_assignable())
            .map(|r| (r.agent_id.as_str(), r))
            .collect();

        let mut agents = self
            .agents
            .write()
            .map_err(|_| WorkloadError::RosterPoisoned)?;

        for (id, slot) in agents.iter() {
            let mut workload = lock(slot, id)?;
            match assignable.get(id.as_str()) {
                Some(record) => {
                    workload.username = Some(record.username.clone());
                    if workload.status == AgentStatus::Offline {
                        workload.status = AgentStatus::Available;
                        report.came_online += 1;
                    }
                }
                None => {
                    if workload.status != AgentStatus::Offline {
                        workload.status = AgentStatus::Offline;
                        report.went_offline += 1;
                    }
                }
            }
        }

        for (id, record) in assignable {
            if agents.contains_key(id) {
                continue;
            }
            let mut workload = AgentWorkload::new(id, AgentStatus::Available);
            workload.username = Some(record.username.clone());
            workload.active_ticket_count = active
                .iter()
                .filter(|a| a.is_active() && a.agent_id == id)
                .count() as u32;
            if workload.active_ticket_count > 0 {
                debug!(
                    agent_id = id,
                    active_ticket_count = workload.active_ticket_count,
                    "Agent rostered with existing assignments"
                );
            }
            agents.insert(id.to_string(), Arc::new(Mutex::new(workload)));
            report.added += 1;
        }

        if report != RosterSync::default() {
            info!(
                added = report.added,
                went_offline = report.went_offline,
                came_online = report.came_online,
                "Roster synchronised"
            );
        }
        Ok(report)
    }

    /// Compare rostered counters against ACTIVE assignments
    pub fn audit(&self, assignments: &[Assignment]) -> WorkloadResult<Vec<WorkloadDiscrepancy>> {
        let mut expected: HashMap<&str, u32> = HashMap::new();
        for assignment in assignments.iter().filter(|a| a.is_active()) {
            *expected.entry(assignment.agent_id.as_str()).or_default() += 1;
        }

        let mut discrepancies = Vec::new();
        for workload in self.snapshot()? {
            let active = expected
                .get(workload.agent_id.as_str())
                .copied()
                .unwrap_or(0);
            if active != workload.active_ticket_count {
                discrepancies.push(WorkloadDiscrepancy {
                    agent_id: workload.agent_id.clone(),
                    counted: workload.active_ticket_count,
                    active_assignments: active,
                });
            }
        }
        Ok(discrepancies)
    }
}

fn decrement(workload: &mut AgentWorkload) {
    match workload.active_ticket_count.checked_sub(1) {
        Some(count) => workload.active_ticket_count = count,
        None => {
            warn!(
                agent_id = %workload.agent_id,
                "WorkloadInconsistency: decrement below zero clamped"
            );
        }
    }
}
