//! Builtin simulation specialists for the coordination engine.
//!
//! - [`agents`]: Physics, Visualization, Optimization and Debug workers
//! - [`config`]: per-specialist scoring weights and runner settings
//! - [`runner`]: local interpreter behind the `CodeRunner` boundary

pub mod agents;
pub mod config;
pub mod runner;

pub use agents::{register_builtin, SpecialistKind};
pub use config::{AgentsConfig, RunnerSettings};
pub use runner::CommandRunner;
