//! Ticket Assignment & SLA Engine
//!
//! This library provides:
//! - A local, eventually-consistent view of tickets built from lifecycle events
//! - Least-loaded agent selection with exact per-agent workload counters
//! - SLA deadline tracking with exactly-once warning and breach signals
//!
//! # Components
//!
//! - [`ingest::IngestionGuard`]: idempotent merge of upstream events into the view
//! - [`workload::WorkloadTracker`]: per-agent counters behind per-agent locks
//! - [`assignment::AssignmentEngine`]: auto-assignment, reassignment, completion
//! - [`sla::SlaDeadlineEngine`]: deadline computation and the recurring sweep
//! - [`escalation::EscalationHandler`]: escalation without touching the SLA clock
//! - [`engine::Engine`]: routes deliveries through all of the above
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use ticket_engine::{Engine, EngineOptions, EventBus, SlaPolicy, StateStore, StaticAgentDirectory};
//!
//! let bus = EventBus::new().shared();
//! let engine = Engine::new(
//!     StateStore::new().shared(),
//!     SlaPolicy::defaults(),
//!     Arc::new(StaticAgentDirectory::new(roster)),
//!     bus.clone(),
//!     EngineOptions::default(),
//! );
//!
//! engine.handle_delivery("ticket.created", payload).await?;
//! engine.sweep(chrono::Utc::now()).await?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod assignment;
pub mod directory;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod events;
pub mod ingest;
pub mod retry;
pub mod sla;
pub mod state;
pub mod workload;

pub use assignment::{AssignmentConfig, AssignmentEngine, AssignmentOutcome};
pub use directory::{AgentDirectory, AgentRecord, AgentRole, StaticAgentDirectory};
pub use engine::{Engine, EngineOptions, HandleOutcome};
pub use error::{DirectoryError, EngineError, EngineResult, PublishError, WorkloadError};
pub use events::{EventBus, EventPublisher, InboundEvent, OutboundEvent, RetryingPublisher};
pub use retry::RetryPolicy;
pub use sla::{SlaConfig, SlaPolicy, SlaRule, SweepReport};
pub use state::{SharedStateStore, StateStore};
