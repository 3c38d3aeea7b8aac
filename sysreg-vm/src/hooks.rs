use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use sysreg_core::error::{SysregError, SysregResult};
use sysreg_core::processor::HookRunner;

use crate::command::{CommandExecutor, CommandSpec, SystemCommandExecutor};

/// Runs stage hooks through `sh -c`
pub struct ShellHookRunner {
    executor: Arc<dyn CommandExecutor>,
}

impl ShellHookRunner {
    pub fn new() -> Self {
        Self::with_executor(Arc::new(SystemCommandExecutor))
    }

    pub fn with_executor(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }
}

impl Default for ShellHookRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HookRunner for ShellHookRunner {
    async fn run_hook(&self, command: &str) -> SysregResult<()> {
        info!("Applying hook: {}", command);

        let output = self
            .executor
            .execute(CommandSpec::new("sh", &["-c", command]))
            .await
            .map_err(|e| SysregError::HookFailed {
                command: command.to_string(),
                details: format!("failed to spawn shell: {}", e),
            })?;

        if !output.status.success() {
            let stderr = output.stderr_lossy();
            return Err(SysregError::HookFailed {
                command: command.to_string(),
                details: if stderr.is_empty() {
                    output.status.to_string()
                } else {
                    format!("{}: {}", output.status, stderr)
                },
            });
        }

        debug!("Hook finished: {}", output.stdout_lossy().trim());
        Ok(())
    }
}
