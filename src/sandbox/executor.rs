use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;

use super::artifact::CodeArtifact;
use super::docker::DockerCli;
use super::provider::{
    ExitInfo, LogStream, Mount, ResourceLimits, SandboxProvider, UnitHandle, UnitSpec,
};
use crate::config::SandboxConfig;
use crate::error::{RelayError, Result};

/// Result of running one piece of code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: Option<i64>,
    /// Combined stdout/stderr captured from the unit
    pub output: String,
    /// Set when any step of the lifecycle failed, including a non-zero exit
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn failure(message: String) -> Self {
        Self {
            exit_code: None,
            output: String::new(),
            error: Some(message),
        }
    }
}

/// Runs code in a fresh sandbox unit per call.
///
/// Lifecycle of one [`execute`](Self::execute):
///
/// 1. Write the code to a uniquely named artifact
/// 2. Create a unit with the artifact mounted read-only and the given limits
/// 3. Start it and collect its combined output
/// 4. Wait for exit, bounded by the configured deadline
/// 5. Remove the unit, then the artifact
///
/// Once created, the unit is removed on every path. The artifact is removed
/// on every path; a missing artifact is not an error.
#[derive(Clone)]
pub struct SandboxExecutor {
    provider: Arc<dyn SandboxProvider>,
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: SandboxConfig) -> Self {
        Self { provider, config }
    }

    /// Executor backed by the local `docker` CLI.
    pub fn docker(config: SandboxConfig) -> Self {
        Self::new(Arc::new(DockerCli::new()), config)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn default_limits(&self) -> ResourceLimits {
        self.config.default_limits
    }

    pub fn unit_spec(&self, artifact: &Path, limits: ResourceLimits) -> UnitSpec {
        UnitSpec {
            image: self.config.image.clone(),
            command: self.config.command.clone(),
            mounts: vec![Mount {
                source: artifact.to_path_buf(),
                target: self.config.mount_path.clone(),
                read_only: true,
            }],
            cpu_limit: limits.cpus(),
            memory_limit: limits.ram_bytes,
            network_disabled: self.config.network_disabled,
        }
    }

    pub async fn execute(&self, code: &str, limits: ResourceLimits) -> ExecutionResult {
        tracing::info!(
            image = %self.config.image,
            cpu_count = limits.cpu_count,
            ram_bytes = limits.ram_bytes,
            "Executing code"
        );

        let extension = Path::new(&self.config.mount_path)
            .extension()
            .and_then(|ext| ext.to_str());
        let artifact = match CodeArtifact::create(&self.config.work_dir, extension, code).await {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::error!(error = %e, "Failed to write code artifact");
                return ExecutionResult::failure(format!("Failed to write code artifact: {}", e));
            }
        };

        let outcome = self.run_unit(&artifact, limits).await;

        if let Err(e) = artifact.remove().await {
            tracing::error!(
                path = %artifact.path().display(),
                error = %e,
                "Failed to delete code artifact"
            );
        }

        match outcome {
            Ok((exit, output)) if exit.success() => {
                tracing::info!(exit_code = exit.exit_code, "Execution completed");
                ExecutionResult {
                    exit_code: Some(exit.exit_code),
                    output,
                    error: None,
                }
            }
            Ok((exit, output)) => {
                tracing::info!(exit_code = exit.exit_code, "Execution exited with failure");
                let mut message = format!("Process exited with code {}", exit.exit_code);
                if !output.trim().is_empty() {
                    message.push('\n');
                    message.push_str(output.trim_end());
                }
                ExecutionResult {
                    exit_code: Some(exit.exit_code),
                    output,
                    error: Some(message),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Execution failed");
                ExecutionResult::failure(e.to_string())
            }
        }
    }

    async fn run_unit(
        &self,
        artifact: &CodeArtifact,
        limits: ResourceLimits,
    ) -> Result<(ExitInfo, String)> {
        let spec = self.unit_spec(artifact.path(), limits);
        let handle = self.provider.create(&spec).await?;
        tracing::debug!(unit = %handle, "Sandbox unit created");

        let outcome = self.drive(&handle).await;

        match (outcome, self.provider.remove(&handle).await) {
            (Ok(done), Ok(())) => {
                tracing::debug!(unit = %handle, "Sandbox unit removed");
                Ok(done)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(remove_err)) => {
                tracing::warn!(
                    unit = %handle,
                    error = %remove_err,
                    "Failed to remove sandbox unit"
                );
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    async fn drive(&self, handle: &UnitHandle) -> Result<(ExitInfo, String)> {
        self.provider.start(handle).await?;
        let logs = self.provider.stream_logs(handle).await?;

        let run = async {
            let (output, exit) = tokio::join!(collect_output(logs), self.provider.wait(handle));
            Ok::<_, RelayError>((exit?, output?))
        };

        match self.config.execution_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, run).await {
                Ok(done) => done,
                Err(_) => {
                    tracing::warn!(
                        unit = %handle,
                        ?deadline,
                        "Execution deadline exceeded, tearing down unit"
                    );
                    Err(RelayError::Timeout(deadline))
                }
            },
            None => run.await,
        }
    }
}

async fn collect_output(mut logs: LogStream) -> Result<String> {
    let mut buf = Vec::new();
    while let Some(chunk) = logs.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
