//! Sandbox execution orchestrator.
//!
//! A submission flows through the [`materializer`] (stage files), the
//! [`provisioner`] (acquire an isolated environment), the [`runner`]
//! (compile and run under limits) and the [`collector`] (verdict and
//! cleanup). The [`orchestrator`] composes those stages per submission and
//! bounds how many run at once.

pub mod collector;
pub mod docker;
pub mod error;
pub mod materializer;
pub mod orchestrator;
pub mod output;
pub mod provisioner;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod substrate;

#[cfg(test)]
mod testing;

pub use error::EngineError;
pub use orchestrator::{ExecutionPolicy, Orchestrator, SubmissionTicket};
pub use registry::{LanguageProfile, LanguageRegistry, ResourceLimits};
