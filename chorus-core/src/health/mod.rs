//! Health monitoring: check registry, result cache and the engine that
//! re-evaluates checks on domain events and on a schedule.

pub mod checks;
pub mod engine;
pub mod model;
pub mod registry;

pub use engine::HealthCheckEngine;
pub use model::{HealthCheckOutcome, HealthCheckResult, HealthSeverity};
pub use registry::{CheckOptions, HealthCheck, HealthCheckRegistry};
