//! Service configuration
//!
//! Layering, lowest to highest precedence:
//! 1. Built-in defaults
//! 2. `ENGINE_*` environment variables (read by `EngineConfig::default`)
//! 3. A TOML file passed with `--config`
//! 4. Command-line flags (applied by `main`)

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ticket_engine::sla::SlaPolicyError;
use ticket_engine::{
    AgentRecord, AssignmentConfig, EngineOptions, RetryPolicy, SlaConfig, SlaPolicy, SlaRule,
};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Policy(#[from] SlaPolicyError),
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Top-level engine service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity used for sweep leases
    pub instance_id: String,
    /// Number of concurrent delivery workers
    pub workers: usize,
    /// Seconds between SLA sweeps
    pub sweep_interval_secs: u64,
    /// Seconds between retries of unassigned tickets
    pub assignment_retry_interval_secs: u64,
    /// Minutes before a pending deadline that a ticket turns AT_RISK
    pub at_risk_lead_minutes: u32,
    /// Agents at or above this many active tickets are skipped
    pub max_active_per_agent: Option<u32>,
    /// Upper bound on one agent-directory lookup
    pub directory_timeout_ms: u64,
    /// Deliveries failing this many times are dead-lettered
    pub max_delivery_attempts: u32,
    /// Lifetime of a sweep lease
    pub lease_ttl_secs: u64,
    /// Retry policy for outbound publishing
    pub publish_retry: RetryPolicy,
    /// Retry policy for unconfirmed workload transfers
    pub transfer_retry: RetryPolicy,
    /// SLA rules merged over the built-in table
    pub sla_rules: Vec<SlaRule>,
    /// Agent roster file for the static directory
    pub roster_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: std::env::var("ENGINE_INSTANCE_ID")
                .unwrap_or_else(|_| format!("engine-{}", uuid::Uuid::new_v4())),
            workers: env_or("ENGINE_WORKERS", 4),
            sweep_interval_secs: env_or("ENGINE_SWEEP_INTERVAL_SECS", 60),
            assignment_retry_interval_secs: env_or("ENGINE_ASSIGNMENT_RETRY_SECS", 30),
            at_risk_lead_minutes: env_or("ENGINE_AT_RISK_LEAD_MINUTES", 10),
            max_active_per_agent: env_opt("ENGINE_MAX_ACTIVE_PER_AGENT"),
            directory_timeout_ms: env_or("ENGINE_DIRECTORY_TIMEOUT_MS", 2_000),
            max_delivery_attempts: env_or("ENGINE_MAX_DELIVERY_ATTEMPTS", 5),
            lease_ttl_secs: env_or("ENGINE_LEASE_TTL_SECS", 120),
            publish_retry: RetryPolicy::default(),
            transfer_retry: RetryPolicy::default(),
            sla_rules: Vec::new(),
            roster_path: env_opt("ENGINE_ROSTER_PATH"),
        }
    }
}

impl EngineConfig {
    /// Defaults and environment, overlaid with `path` when given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file; keys it omits keep their default/environment value
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_secs must be positive".into(),
            ));
        }
        if self.assignment_retry_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "assignment_retry_interval_secs must be positive".into(),
            ));
        }
        if self.max_delivery_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_delivery_attempts must be at least 1".into(),
            ));
        }
        if self.max_active_per_agent == Some(0) {
            return Err(ConfigError::Invalid(
                "max_active_per_agent of 0 would block every assignment".into(),
            ));
        }
        // Surface bad rules at startup rather than at first use
        self.sla_policy()?;
        Ok(())
    }

    /// SLA rule table: configured rules merged over the defaults
    pub fn sla_policy(&self) -> Result<SlaPolicy, SlaPolicyError> {
        SlaPolicy::from_rules(self.sla_rules.clone())
    }

    /// Component tunables for the engine
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_active_per_agent: self.max_active_per_agent,
            assignment: AssignmentConfig {
                directory_timeout_ms: self.directory_timeout_ms,
                transfer_retry: self.transfer_retry.clone(),
            },
            sla: SlaConfig {
                at_risk_lead_minutes: self.at_risk_lead_minutes,
            },
        }
    }

    /// Delivery retry policy derived from `max_delivery_attempts`
    pub fn redelivery_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_delivery_attempts.saturating_sub(1),
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
        }
    }
}

/// `[[agents]]` tables of a roster file
#[derive(Debug, Default, Deserialize)]
struct RosterFile {
    #[serde(default)]
    agents: Vec<AgentRecord>,
}

/// Load agent records for the static directory
pub fn load_roster(path: &Path) -> Result<Vec<AgentRecord>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let roster: RosterFile = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(roster.agents)
}
