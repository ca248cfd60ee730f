//! Agent directory seam
//!
//! The directory (identity service) is the only source of roster membership.
//! Lookups are bounded by a timeout and fail closed: an unreachable directory
//! means no agent is available, never a guessed roster.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DirectoryError;
use crate::state::AgentId;

/// Role of a user in the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    Customer,
    Agent,
    Manager,
    Admin,
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub username: String,
    pub role: AgentRole,
    pub active: bool,
}

impl AgentRecord {
    pub fn agent(agent_id: impl Into<AgentId>, username: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            username: username.into(),
            role: AgentRole::Agent,
            active: true,
        }
    }

    /// Only active users with the agent role take tickets
    pub fn is_assignable(&self) -> bool {
        self.active && self.role == AgentRole::Agent
    }
}

/// Queried collaborator listing support staff
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, DirectoryError>;
}

/// Shared directory handle
pub type SharedAgentDirectory = Arc<dyn AgentDirectory>;

/// In-memory directory, loaded from a roster file or set by tests
#[derive(Debug, Default)]
pub struct StaticAgentDirectory {
    records: RwLock<Vec<AgentRecord>>,
}

impl StaticAgentDirectory {
    pub fn new(records: Vec<AgentRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Replace the roster
    pub fn set_records(&self, records: Vec<AgentRecord>) {
        match self.records.write() {
            Ok(mut guard) => *guard = records,
            Err(poisoned) => *poisoned.into_inner() = records,
        }
    }

    /// Flip the active flag of one agent; returns false if unknown
    pub fn set_active(&self, agent_id: &str, active: bool) -> bool {
        let mut guard = match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.iter_mut().find(|r| r.agent_id == agent_id) {
            Some(record) => {
                record.active = active;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, DirectoryError> {
        self.records
            .read()
            .map(|records| records.clone())
            .map_err(|_| DirectoryError::Unavailable("roster lock poisoned".to_string()))
    }
}

/// Fetch the roster, giving up after `timeout`
pub async fn fetch_roster(
    directory: &dyn AgentDirectory,
    timeout: Duration,
) -> Result<Vec<AgentRecord>, DirectoryError> {
    match tokio::time::timeout(timeout, directory.list_agents()).await {
        Ok(Ok(records)) => Ok(records),
        Ok(Err(e)) => {
            warn!(error = %e, "Agent directory lookup failed");
            Err(e)
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Agent directory lookup timed out");
            Err(DirectoryError::Timeout(timeout))
        }
    }
}
