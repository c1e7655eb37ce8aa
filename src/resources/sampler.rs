use super::gpu::{default_probes, probe_chain, GpuInfo, GpuProbe};

/// Capacity readings of the local host, without identity or timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSample {
    pub cpu_count: u32,
    pub ram_bytes: u64,
    pub gpu_list: Vec<GpuInfo>,
}

/// Reads local CPU, memory and GPU inventory.
pub struct ResourceSampler {
    probes: Vec<Box<dyn GpuProbe>>,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self::with_probes(default_probes())
    }

    pub fn with_probes(probes: Vec<Box<dyn GpuProbe>>) -> Self {
        Self { probes }
    }

    /// Take a sample. GPU probing failures degrade to an empty list.
    pub async fn sample(&self) -> ResourceSample {
        ResourceSample {
            cpu_count: Self::cpu_count(),
            ram_bytes: Self::total_memory(),
            gpu_list: probe_chain(&self.probes).await,
        }
    }

    /// Number of logical cores available to this process.
    pub fn cpu_count() -> u32 {
        std::thread::available_parallelism()
            .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
            .unwrap_or(1)
    }

    /// Total physical memory in bytes, or 0 when it cannot be read.
    pub fn total_memory() -> u64 {
        match std::fs::read_to_string("/proc/meminfo") {
            Ok(contents) => parse_mem_total(&contents).unwrap_or_else(|| {
                tracing::warn!("MemTotal missing from /proc/meminfo");
                0
            }),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read /proc/meminfo");
                0
            }
        }
    }
}

/// Extract `MemTotal` from `/proc/meminfo` contents, in bytes.
pub fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let mut parts = line["MemTotal:".len()..].split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    let multiplier = match parts.next() {
        Some("kB") | Some("KB") | Some("kb") => 1024,
        Some("mB") | Some("MB") => 1024 * 1024,
        None | Some("B") => 1,
        Some(_) => return None,
    };
    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mem_total_in_kb() {
        let meminfo = "MemTotal:       16314204 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16314204 * 1024));
    }

    #[test]
    fn missing_mem_total_is_none() {
        assert_eq!(parse_mem_total("MemFree: 1 kB\n"), None);
        assert_eq!(parse_mem_total("MemTotal: lots kB\n"), None);
        assert_eq!(parse_mem_total("MemTotal: 12 parsecs\n"), None);
    }

    #[test]
    fn cpu_count_is_positive() {
        assert!(ResourceSampler::cpu_count() >= 1);
    }

    #[tokio::test]
    async fn sample_without_probes_has_no_gpus() {
        let sampler = ResourceSampler::with_probes(Vec::new());
        let sample = sampler.sample().await;
        assert_eq!(sample.cpu_count, ResourceSampler::cpu_count());
        assert!(sample.gpu_list.is_empty());
    }
}
