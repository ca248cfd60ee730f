//! Runtime for the ticket assignment & SLA engine
//!
//! Wraps [`ticket_engine::Engine`] with the pieces a deployed instance needs:
//!
//! - [`config`]: layered configuration (defaults, `ENGINE_*` env, TOML file)
//! - [`transport`]: at-least-once delivery queue with redelivery and dead letters
//! - [`workers`]: concurrent delivery workers
//! - [`leader`]: lease-based leadership for the recurring jobs
//! - [`sweeper`]: the SLA sweep and the unassigned-ticket retry
//! - [`telemetry`]: tracing bootstrap and delivery counters
//! - [`service`]: wiring of all of the above

pub mod config;
pub mod leader;
pub mod service;
pub mod sweeper;
pub mod telemetry;
pub mod transport;
pub mod workers;

pub use config::{ConfigError, EngineConfig};
pub use leader::{InMemoryLeaderElector, LeaderElector};
pub use service::{RunningService, Service, ServiceError};
pub use telemetry::{ServiceStats, ServiceStatsSnapshot};
pub use transport::{Delivery, DeliveryQueue, TransportError};
