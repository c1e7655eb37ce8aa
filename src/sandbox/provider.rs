use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// CPU and memory ceiling for one sandbox unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub cpu_count: u32,
    pub ram_bytes: u64,
}

impl ResourceLimits {
    /// CPU quota in the provider's fractional-CPU unit.
    pub fn cpus(&self) -> f64 {
        f64::from(self.cpu_count)
    }
}

/// Host path exposed inside the unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything the provider needs to create one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSpec {
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    /// Fractional CPUs
    pub cpu_limit: f64,
    /// Memory ceiling in bytes
    pub memory_limit: u64,
    pub network_disabled: bool,
}

/// Provider-specific identifier of a created unit.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct UnitHandle(pub String);

impl std::fmt::Display for UnitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: i64,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Combined stdout/stderr of a unit. Ordering holds within each stream only.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Isolated execution backend, e.g. a container runtime.
///
/// Limits are enforced per unit by the provider; nothing here caps how many
/// units a host runs at once.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle>;

    async fn start(&self, handle: &UnitHandle) -> Result<()>;

    async fn stream_logs(&self, handle: &UnitHandle) -> Result<LogStream>;

    /// Block until the unit exits.
    async fn wait(&self, handle: &UnitHandle) -> Result<ExitInfo>;

    /// Remove the unit, stopping it first if it is still running.
    /// Removing a unit that no longer exists succeeds.
    async fn remove(&self, handle: &UnitHandle) -> Result<()>;
}
