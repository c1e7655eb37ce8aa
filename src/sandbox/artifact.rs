use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Temporary file holding one job's source code.
///
/// Named with a fresh UUID so concurrent jobs never share a path. Owned
/// exclusively by the execution that created it.
#[derive(Debug)]
pub struct CodeArtifact {
    path: PathBuf,
}

impl CodeArtifact {
    /// Write `code` to a new uniquely named file in `dir`.
    pub async fn create(dir: &Path, extension: Option<&str>, code: &str) -> std::io::Result<Self> {
        let name = match extension {
            Some(ext) => format!("code_{}.{}", Uuid::new_v4(), ext),
            None => format!("code_{}", Uuid::new_v4()),
        };
        let path = dir.join(name);
        tokio::fs::write(&path, code).await?;
        tracing::debug!(path = %path.display(), "Code artifact written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(&self) -> std::io::Result<()> {
        remove_artifact(&self.path).await
    }
}

/// Delete an artifact. A file that is already gone counts as removed.
pub async fn remove_artifact(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Code artifact deleted");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Code artifact not found for deletion");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
