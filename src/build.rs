use crate::error::{HarnessError, Result};

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Builds a subject artifact with `make`.
///
/// Every build starts from `make clean`. In tolerant mode a failing `make`
/// still counts as a success when the artifact is on disk, since kernel
/// module builds often report harmless errors from the surrounding tree.
#[derive(Debug, Clone)]
pub struct MakeBuild {
    project_root: PathBuf,
    tolerant: bool,
    artifact: Option<String>,
}

impl MakeBuild {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            tolerant: false,
            artifact: None,
        }
    }

    pub fn tolerant(mut self, tolerant: bool) -> Self {
        self.tolerant = tolerant;
        self
    }

    /// File name of the artifact when it differs from the make target.
    pub fn artifact(mut self, file_name: impl Into<String>) -> Self {
        self.artifact = Some(file_name.into());
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Runs `make clean` then `make <target>`; returns the artifact path.
    pub async fn build(&self, target: &str) -> Result<PathBuf> {
        let artifact = self
            .project_root
            .join(self.artifact.as_deref().unwrap_or(target));

        if let Err(reason) = self.make("clean").await {
            debug!("make clean in {:?} failed: {}", self.project_root, reason);
        }

        info!("Building {} in {:?}", target, self.project_root);
        match self.make(target).await {
            Ok(()) => {}
            Err(reason) if self.tolerant && artifact.exists() => {
                warn!("make {} reported an error but {:?} exists: {}", target, artifact, reason);
            }
            Err(reason) => {
                return Err(HarnessError::BuildFailed {
                    target: target.to_string(),
                    reason,
                })
            }
        }

        if !artifact.exists() {
            return Err(HarnessError::ArtifactMissing(artifact));
        }
        Ok(artifact)
    }

    async fn make(&self, rule: &str) -> std::result::Result<(), String> {
        let output = Command::new("make")
            .arg("-C")
            .arg(&self.project_root)
            .arg(rule)
            .output()
            .await
            .map_err(|e| format!("unable to run make: {e}"))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim_end().to_string())
        }
    }
}

/// Finds the directory called `name`, starting from the current directory.
pub fn find_path_to_dir(name: &str) -> Result<PathBuf> {
    let start = std::env::current_dir()?;
    find_path_to_dir_from(&start, name)
}

/// Looks at `start` and its ancestors, a child of each called `name`, then
/// the children of `start` one level down.
pub fn find_path_to_dir_from(start: &Path, name: &str) -> Result<PathBuf> {
    for ancestor in start.ancestors() {
        if ancestor.file_name().is_some_and(|dir| dir == name) {
            return Ok(ancestor.to_path_buf());
        }
        let candidate = ancestor.join(name);
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }

    for entry in std::fs::read_dir(start)?.flatten() {
        let candidate = entry.path().join(name);
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }

    Err(HarnessError::DirectoryNotFound(name.to_string()))
}
