use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::sandbox::ResourceLimits;

/// Default memory ceiling for a job when the client gives no hint (512 MiB).
pub const DEFAULT_RAM_BYTES: u64 = 512 * 1024 * 1024;

/// Default CPU quota for a job when the client gives no hint.
pub const DEFAULT_CPU_COUNT: u32 = 1;

/// Configuration for sandboxed job execution.
///
/// Every job runs in its own container; the code artifact is bind-mounted
/// read-only at `mount_path` and `command` is run against it.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container image every job runs in
    pub image: String,
    /// Command executed inside the container
    pub command: Vec<String>,
    /// Path the code artifact is mounted at inside the container
    pub mount_path: String,
    /// Host directory temporary code artifacts are written to
    pub work_dir: PathBuf,
    /// Limits applied when a request carries no resource hints
    pub default_limits: ResourceLimits,
    /// Disable network access in the container
    pub network_disabled: bool,
    /// Deadline after which a running unit is torn down. `None` disables it.
    pub execution_timeout: Option<Duration>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:alpine".to_string(),
            command: vec!["python3".to_string(), "/app/code.py".to_string()],
            mount_path: "/app/code.py".to_string(),
            work_dir: std::env::temp_dir(),
            default_limits: ResourceLimits {
                cpu_count: DEFAULT_CPU_COUNT,
                ram_bytes: DEFAULT_RAM_BYTES,
            },
            network_disabled: true,
            execution_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Which shared-store backend a host talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StoreConfig {
    /// In-process store; only useful for a single host or tests.
    #[default]
    Memory,
    /// Redis-backed store shared by every host pointed at the same server.
    Redis { url: String, prefix: String },
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub host_id: String,
    pub advertise_interval: Duration,
    pub sandbox: SandboxConfig,
    /// Address for the `/run-code` endpoint. Disabled when `None`.
    pub http_addr: Option<SocketAddr>,
    /// Limits applied to jobs submitted through the HTTP endpoint
    pub http_limits: ResourceLimits,
    pub store: StoreConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_id: resolve_host_id(None),
            advertise_interval: Duration::from_secs(5),
            sandbox: SandboxConfig::default(),
            http_addr: None,
            http_limits: ResourceLimits {
                cpu_count: 4,
                ram_bytes: 4 * 1024 * 1024 * 1024,
            },
            store: StoreConfig::default(),
        }
    }
}

impl HostConfig {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            ..Default::default()
        }
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = Some(addr);
        self
    }

    pub fn with_advertise_interval(mut self, interval: Duration) -> Self {
        self.advertise_interval = interval;
        self
    }
}

/// Resolve this host's identity.
///
/// An explicit non-empty identity wins, then the kernel hostname, then the
/// `HOSTNAME` environment variable, and finally a freshly generated UUID.
pub fn resolve_host_id(explicit: Option<&str>) -> String {
    if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_string();
    }

    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .or_else(|| {
            std::env::var("HOSTNAME")
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
