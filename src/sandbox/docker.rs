use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::process::Command;
use tokio_util::io::ReaderStream;

use super::provider::{ExitInfo, LogStream, SandboxProvider, UnitHandle, UnitSpec};
use crate::error::{RelayError, Result};

/// Sandbox provider driving the `docker` CLI.
///
/// Units run with:
/// - Network isolation (when requested)
/// - Dropped capabilities and no privilege escalation
/// - Memory and CPU limits
/// - Read-only bind mounts for the code artifact
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_program("docker")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments for `docker create`.
    pub fn create_args(spec: &UnitSpec) -> Vec<String> {
        let mut args = vec!["create".to_string()];

        if spec.network_disabled {
            args.push("--network=none".to_string());
        }

        args.push(format!("--memory={}", spec.memory_limit));
        args.push(format!("--cpus={}", spec.cpu_limit));

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());

        for mount in &spec.mounts {
            let mode = if mount.read_only { ":ro" } else { "" };
            args.push("-v".to_string());
            args.push(format!("{}:{}{}", mount.source.display(), mount.target, mode));
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RelayError::Sandbox(format!("Failed to run {}: {}", self.program, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(RelayError::Sandbox(if stderr.is_empty() {
                format!("{} {} exited with {:?}", self.program, args[0], output.status.code())
            } else {
                stderr
            }))
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerCli {
    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle> {
        let id = self.run(&Self::create_args(spec)).await?;
        if id.is_empty() {
            return Err(RelayError::Sandbox(
                "docker create returned no container id".to_string(),
            ));
        }
        Ok(UnitHandle(id))
    }

    async fn start(&self, handle: &UnitHandle) -> Result<()> {
        self.run(&["start".to_string(), handle.0.clone()]).await?;
        Ok(())
    }

    async fn stream_logs(&self, handle: &UnitHandle) -> Result<LogStream> {
        let mut child = Command::new(&self.program)
            .args(["logs", "--follow", handle.0.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RelayError::Sandbox(format!("Failed to attach to logs: {}", e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RelayError::Sandbox("Log pipes unavailable".to_string()));
        };

        // Reap the log follower once the container goes away
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        let stdout = ReaderStream::new(stdout);
        let stderr = ReaderStream::new(stderr);
        let merged =
            futures::stream::select(stdout, stderr).map(|chunk| chunk.map_err(RelayError::from));
        Ok(Box::pin(merged))
    }

    async fn wait(&self, handle: &UnitHandle) -> Result<ExitInfo> {
        let out = self.run(&["wait".to_string(), handle.0.clone()]).await?;
        let exit_code = out
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<i64>().ok())
            .ok_or_else(|| {
                RelayError::Sandbox(format!("Unexpected docker wait output: {:?}", out))
            })?;
        Ok(ExitInfo { exit_code })
    }

    async fn remove(&self, handle: &UnitHandle) -> Result<()> {
        match self
            .run(&["rm".to_string(), "-f".to_string(), handle.0.clone()])
            .await
        {
            Ok(_) => Ok(()),
            Err(RelayError::Sandbox(msg)) if msg.contains("No such container") => {
                tracing::debug!(unit = %handle, "Container already removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
