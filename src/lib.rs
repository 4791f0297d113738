pub mod constants;
pub mod error;
pub mod logging;
pub mod config;
pub mod severity;
pub mod security;
pub mod sandbox;
pub mod events;
pub mod runner;
pub mod comparison;
pub mod regression;
pub mod rules;
pub mod snapshot;
pub mod pipeline;

pub use config::{EvoGuardConfig, RuleProfile, RuntimeKind};
pub use error::{EvoGuardError, Result};
pub use pipeline::{EvaluationOutcome, EvolutionCandidate, EvolutionPipeline};
pub use sandbox::{ContainerRuntime, ExecutionResult, ResourceLimits, SandboxManager, SandboxStatus};
pub use severity::Severity;
