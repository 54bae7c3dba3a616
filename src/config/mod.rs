//! Orchestrator configuration: builder, types, and accessors.

mod builder;
mod getters;
mod types;

pub use builder::OrchestratorConfigBuilder;
pub use types::{InterventionTtls, OrchestratorConfig};
