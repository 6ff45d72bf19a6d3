//! One-shot project build that precedes supervision.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

/// Builds the test project once before any harness is launched.
#[async_trait]
pub trait ProjectBuilder: Send + Sync {
    async fn build(&self, root_path: &Path) -> Result<()>;
}

/// Builder that does nothing, for hosts that build out of band.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBuilder;

#[async_trait]
impl ProjectBuilder for NoopBuilder {
    async fn build(&self, root_path: &Path) -> Result<()> {
        info!(root = %root_path.display(), "skipping project build");
        Ok(())
    }
}

/// Location of the Xcode workspace and scheme that hold the UI test harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XcodeProject {
    /// Path to the `xcodebuild` binary. Defaults to `"xcodebuild"` on `$PATH`.
    pub binary: String,
    /// Workspace file, relative to the project root.
    pub workspace: String,
    pub scheme: String,
}

impl XcodeProject {
    pub const DEFAULT_WORKSPACE: &str = "RealDeviceMap-UIControl.xcworkspace";
    pub const DEFAULT_SCHEME: &str = "RealDeviceMap-UIControl";

    pub fn workspace_path(&self, root_path: &Path) -> PathBuf {
        root_path.join(&self.workspace)
    }
}

impl Default for XcodeProject {
    fn default() -> Self {
        Self {
            binary: "xcodebuild".to_string(),
            workspace: Self::DEFAULT_WORKSPACE.to_string(),
            scheme: Self::DEFAULT_SCHEME.to_string(),
        }
    }
}

/// Runs `xcodebuild build-for-testing`.
///
/// A non-zero exit status is a failure. With `strict_stderr` any non-blank
/// stderr output is a failure too, since xcodebuild sometimes reports
/// signing problems on stderr and still exits 0.
#[derive(Debug, Clone)]
pub struct XcodebuildBuilder {
    project: XcodeProject,
    strict_stderr: bool,
}

impl XcodebuildBuilder {
    pub fn new(project: XcodeProject) -> Self {
        Self {
            project,
            strict_stderr: false,
        }
    }

    pub fn strict_stderr(mut self, strict: bool) -> Self {
        self.strict_stderr = strict;
        self
    }

    fn command(&self, root_path: &Path) -> Command {
        let mut cmd = Command::new(&self.project.binary);
        cmd.arg("build-for-testing")
            .arg("-workspace")
            .arg(self.project.workspace_path(root_path))
            .arg("-scheme")
            .arg(&self.project.scheme)
            .arg("-allowProvisioningUpdates")
            .arg("-allowProvisioningDeviceRegistration")
            .current_dir(root_path)
            .stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl ProjectBuilder for XcodebuildBuilder {
    async fn build(&self, root_path: &Path) -> Result<()> {
        info!(
            workspace = %self.project.workspace_path(root_path).display(),
            scheme = %self.project.scheme,
            "building project"
        );

        let output = self
            .command(root_path)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.project.binary))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            bail!(
                "{} build-for-testing failed ({}):\n{}",
                self.project.binary,
                output.status,
                stderr.trim()
            );
        }
        if self.strict_stderr && !stderr.trim().is_empty() {
            bail!(
                "{} build-for-testing reported errors:\n{}",
                self.project.binary,
                stderr.trim()
            );
        }

        info!("project build done");
        Ok(())
    }
}
