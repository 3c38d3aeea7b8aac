//! Fresh backing disk images through external imaging tools

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use sysreg_core::error::{SysregError, SysregResult};

use crate::command::{CommandExecutor, CommandOutput, CommandSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Qcow2,
    Vmdk,
    Vdi,
}

impl DiskFormat {
    fn tool(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 | DiskFormat::Vmdk => "qemu-img",
            DiskFormat::Vdi => "VBoxManage",
        }
    }
}

/// Whether VBoxManage complained that the medium is unknown or missing
fn is_unknown_medium(stderr: &str) -> bool {
    stderr.contains("VBOX_E_OBJECT_NOT_FOUND")
        || stderr.contains("VERR_FILE_NOT_FOUND")
        || stderr.contains("Could not find")
}

/// Replaces the image at `path` with an empty one of `size_mb` megabytes
pub struct DiskProvisioner {
    format: DiskFormat,
    path: PathBuf,
    size_mb: u64,
    executor: Arc<dyn CommandExecutor>,
}

impl DiskProvisioner {
    pub fn new(
        format: DiskFormat,
        path: impl Into<PathBuf>,
        size_mb: u64,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            format,
            path: path.into(),
            size_mb,
            executor,
        }
    }

    async fn run_tool(&self, args: &[&str]) -> SysregResult<CommandOutput> {
        let tool = self.format.tool();
        self.executor
            .execute(CommandSpec::new(tool, args))
            .await
            .map_err(|e| SysregError::ToolFailed {
                tool: tool.to_string(),
                details: e.to_string(),
            })
    }

    /// VirtualBox keeps every created medium in its global registry, and
    /// `createmedium` refuses a location that is still registered
    async fn close_registered_medium(&self, path: &str) -> SysregResult<()> {
        let output = self
            .run_tool(&["closemedium", "disk", path, "--delete"])
            .await?;
        if output.status.success() {
            info!("Closed and deleted registered medium {}", path);
            return Ok(());
        }

        let stderr = output.stderr_lossy();
        if is_unknown_medium(&stderr) {
            debug!("No registered medium at {}", path);
            return Ok(());
        }
        Err(SysregError::ToolFailed {
            tool: self.format.tool().to_string(),
            details: stderr,
        })
    }

    pub async fn provision(&self) -> SysregResult<()> {
        let tool = self.format.tool();
        let path = self.path.to_string_lossy().into_owned();

        if self.format == DiskFormat::Vdi {
            self.close_registered_medium(&path).await?;
        }

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => info!("Removed old disk image {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SysregError::ToolFailed {
                    tool: tool.to_string(),
                    details: format!("cannot remove {}: {}", self.path.display(), e),
                })
            }
        }

        let size = self.size_mb.to_string();
        let qemu_size = format!("{}M", self.size_mb);
        let args: Vec<&str> = match self.format {
            DiskFormat::Qcow2 => vec!["create", "-f", "qcow2", path.as_str(), qemu_size.as_str()],
            DiskFormat::Vmdk => vec!["create", "-f", "vmdk", path.as_str(), qemu_size.as_str()],
            DiskFormat::Vdi => vec![
                "createmedium",
                "disk",
                "--filename",
                path.as_str(),
                "--size",
                size.as_str(),
                "--format",
                "VDI",
            ],
        };

        let output = self.run_tool(&args).await?;
        if !output.status.success() {
            return Err(SysregError::ToolFailed {
                tool: tool.to_string(),
                details: output.stderr_lossy(),
            });
        }

        info!(
            "Created {:?} disk image {} ({} MB)",
            self.format,
            self.path.display(),
            self.size_mb
        );
        Ok(())
    }
}
