//! SLA policy and deadline tracking

pub mod deadline;
pub mod policy;

pub use deadline::{SlaConfig, SlaDeadlineEngine, SweepReport};
pub use policy::{SlaPolicy, SlaPolicyError, SlaRule};
