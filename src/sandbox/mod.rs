//! Sandboxed code execution.
//!
//! - [`SandboxProvider`]: container runtime contract (create, start, logs, wait, remove)
//! - [`DockerCli`]: provider backed by the `docker` CLI
//! - [`SandboxExecutor`]: runs one job per unit and always cleans up
//! - [`CodeArtifact`]: uniquely named temporary file holding the job's code

pub mod artifact;
pub mod docker;
pub mod executor;
pub mod provider;

pub use artifact::{remove_artifact, CodeArtifact};
pub use docker::DockerCli;
pub use executor::{ExecutionResult, SandboxExecutor};
pub use provider::{
    ExitInfo, LogStream, Mount, ResourceLimits, SandboxProvider, UnitHandle, UnitSpec,
};
