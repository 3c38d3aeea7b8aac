pub mod orchestrator;

use std::sync::Arc;

pub use orchestrator::{AttemptReport, RunReport, RunState, StageOrchestrator, StageReport};

// Re-export commonly used types
pub use sysreg_core::{
    config::{RunConfiguration, StageConfig},
    error::{SysregError, SysregResult},
    machine::MachineRegistry,
    types::{BackendKind, Verdict},
};

use sysreg_vm::{ConsoleReader, ShellHookRunner};

/// Wire the configured backend, console reader and shell hooks together
///
/// Fails only while assembling the pieces; once the orchestrator exists every
/// outcome is carried by its [`RunReport`].
pub fn build_orchestrator(
    config: RunConfiguration,
    registry: &MachineRegistry,
) -> SysregResult<StageOrchestrator> {
    let machine = registry.create_machine(&config)?;
    let reader = ConsoleReader::new(&config)?.with_transcript_dir(&config.output_dir);

    tracing::info!(
        "Using {} backend for machine '{}' with {} stage(s)",
        config.backend,
        config.machine_name,
        config.stages.len()
    );

    Ok(StageOrchestrator::new(
        Arc::new(config),
        machine,
        Box::new(reader),
        Box::new(ShellHookRunner::new()),
    ))
}
