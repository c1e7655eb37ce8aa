//! Host resource sampling and advertisement.
//!
//! - [`ResourceSampler`]: reads CPU count, total memory and GPU inventory
//! - [`gpu`]: ordered chain of vendor GPU probes
//! - [`ResourceAdvertiser`]: periodically publishes a [`HostResourceRecord`]
//!
//! Records are overwritten every cycle and never deleted. Readers decide
//! whether a host is alive by comparing `observed_at` against their own TTL.

pub mod advertiser;
pub mod gpu;
pub mod sampler;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use advertiser::ResourceAdvertiser;
pub use gpu::{GpuInfo, GpuProbe, GpuVendor};
pub use sampler::{ResourceSample, ResourceSampler};

/// Capacity advertised by one host at `resources/{hostId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResourceRecord {
    pub host_id: String,
    pub cpu_count: u32,
    pub ram_bytes: u64,
    #[serde(default)]
    pub gpu_list: Vec<GpuInfo>,
    pub observed_at: DateTime<Utc>,
}

impl HostResourceRecord {
    pub fn from_sample(host_id: impl Into<String>, sample: ResourceSample) -> Self {
        Self {
            host_id: host_id.into(),
            cpu_count: sample.cpu_count,
            ram_bytes: sample.ram_bytes,
            gpu_list: sample.gpu_list,
            observed_at: Utc::now(),
        }
    }

    /// Whether the record is older than `ttl` as of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.observed_at > ttl,
            Err(_) => false,
        }
    }
}
