//! GPU inventory probes.
//!
//! Each vendor is a [`GpuProbe`] that either returns a normalized list or
//! reports itself unavailable. [`probe_chain`] tries them in priority order
//! and never fails: enumeration is best-effort enrichment of the host record.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GpuVendor {
    Nvidia,
    Amd,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    /// Memory as reported by the vendor tool, e.g. `24576 MiB`
    pub memory: String,
    #[serde(alias = "type")]
    pub vendor: GpuVendor,
}

#[async_trait]
pub trait GpuProbe: Send + Sync {
    fn vendor(&self) -> GpuVendor;

    /// `None` when the vendor tool is missing or fails.
    async fn probe(&self) -> Option<Vec<GpuInfo>>;
}

/// Probe that runs a vendor CLI tool and parses its stdout.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    vendor: GpuVendor,
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    pub fn nvidia() -> Self {
        Self {
            vendor: GpuVendor::Nvidia,
            program: "nvidia-smi".to_string(),
            args: vec![
                "--query-gpu=name,memory.total".to_string(),
                "--format=csv,noheader".to_string(),
            ],
        }
    }

    pub fn amd() -> Self {
        Self {
            vendor: GpuVendor::Amd,
            program: "rocm-smi".to_string(),
            args: vec![
                "--showproductname".to_string(),
                "--showmeminfo".to_string(),
                "vram".to_string(),
            ],
        }
    }

    /// Replace the executable, keeping the vendor's arguments and parser.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn parse(&self, stdout: &str) -> Vec<GpuInfo> {
        match self.vendor {
            GpuVendor::Nvidia => parse_nvidia(stdout),
            GpuVendor::Amd => parse_rocm(stdout),
        }
    }
}

#[async_trait]
impl GpuProbe for CommandProbe {
    fn vendor(&self) -> GpuVendor {
        self.vendor
    }

    async fn probe(&self) -> Option<Vec<GpuInfo>> {
        let result = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                Some(self.parse(&stdout))
            }
            Ok(output) => {
                tracing::debug!(
                    vendor = %self.vendor,
                    program = %self.program,
                    exit_code = ?output.status.code(),
                    "GPU probe exited with failure"
                );
                None
            }
            Err(e) => {
                tracing::debug!(
                    vendor = %self.vendor,
                    program = %self.program,
                    error = %e,
                    "GPU probe unavailable"
                );
                None
            }
        }
    }
}

/// Default probe order: NVIDIA first, then AMD.
pub fn default_probes() -> Vec<Box<dyn GpuProbe>> {
    vec![Box::new(CommandProbe::nvidia()), Box::new(CommandProbe::amd())]
}

/// Run `probes` in order and return the first available inventory.
pub async fn probe_chain(probes: &[Box<dyn GpuProbe>]) -> Vec<GpuInfo> {
    for probe in probes {
        if let Some(gpus) = probe.probe().await {
            return gpus;
        }
    }
    tracing::warn!("No GPU info available from any probe");
    Vec::new()
}

/// Parse `nvidia-smi --query-gpu=name,memory.total --format=csv,noheader`.
///
/// Any malformed line discards the whole result.
pub fn parse_nvidia(stdout: &str) -> Vec<GpuInfo> {
    let mut gpus = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.split(',').map(str::trim);
        match (fields.next(), fields.next()) {
            (Some(name), Some(memory)) if !name.is_empty() && !memory.is_empty() => {
                gpus.push(GpuInfo {
                    name: name.to_string(),
                    memory: memory.to_string(),
                    vendor: GpuVendor::Nvidia,
                });
            }
            _ => {
                tracing::warn!(line, "Malformed nvidia-smi output, ignoring GPU list");
                return Vec::new();
            }
        }
    }
    gpus
}

/// Parse `rocm-smi --showproductname --showmeminfo vram`.
///
/// Lines look like `GPU[0]  : Card series:  Navi 21` and are grouped by the
/// bracketed index. GPUs without a product name are dropped.
pub fn parse_rocm(stdout: &str) -> Vec<GpuInfo> {
    let mut by_index: BTreeMap<u32, (Option<String>, Option<String>)> = BTreeMap::new();

    for line in stdout.lines().map(str::trim) {
        let Some(rest) = line.strip_prefix("GPU[") else {
            continue;
        };
        let Some((index, rest)) = rest.split_once(']') else {
            continue;
        };
        let Ok(index) = index.parse::<u32>() else {
            continue;
        };
        let Some((_, field)) = rest.split_once(':') else {
            continue;
        };
        let Some((key, value)) = field.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        let entry = by_index.entry(index).or_default();
        if key.contains("card series") || key.contains("product name") {
            entry.0.get_or_insert_with(|| value.to_string());
        } else if key.starts_with("vram total memory") {
            entry.1 = Some(format!("{} B", value));
        }
    }

    by_index
        .into_values()
        .filter_map(|(name, memory)| {
            Some(GpuInfo {
                name: name?,
                memory: memory.unwrap_or_else(|| "unknown".to_string()),
                vendor: GpuVendor::Amd,
            })
        })
        .collect()
}
