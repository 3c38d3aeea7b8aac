use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use sysreg_core::{
    config::{RunConfiguration, StageConfig},
    error::{SysregError, SysregResult},
    machine::Machine,
    processor::{DebugDataProcessor, HookRunner, ObservationRequest},
    types::Verdict,
};

/// File name of the JSON run report inside the output directory
pub const REPORT_FILE: &str = "sysreg-report.json";

/// Where the run currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum RunState {
    Idle,
    Connected,
    StageRunning { stage: usize },
    RetryAttempt { stage: usize, attempt: u32 },
    StageDone { stage: usize },
    RunComplete,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptReport {
    pub attempt: u32,
    pub verdict: Verdict,
    /// Wall time spent observing the console
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// 1-based stage number
    pub stage: usize,
    pub boot_device: String,
    pub checkpoint: Option<String>,
    pub attempts: Vec<AttemptReport>,
    /// Every allowed attempt ended in `Continue`
    pub retries_exhausted: bool,
}

impl StageReport {
    fn new(stage: usize, config: &StageConfig) -> Self {
        Self {
            stage,
            boot_device: config.boot_device.clone(),
            checkpoint: config.checkpoint.clone(),
            attempts: Vec::new(),
            retries_exhausted: false,
        }
    }
}

/// Outcome of a whole run, written next to the build artifacts
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub verdict: Verdict,
    pub machine_name: String,
    pub stages: Vec<StageReport>,
    /// A domain with the configured name had to be destroyed at start
    pub stale_domain_reclaimed: bool,
    /// The advisory global deadline passed at some point during the run
    pub deadline_exceeded: bool,
    /// Message of the error that ended the run, if any
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    fn new(machine_name: &str) -> Self {
        let now = Utc::now();
        Self {
            verdict: Verdict::Abort,
            machine_name: machine_name.to_string(),
            stages: Vec::new(),
            stale_domain_reclaimed: false,
            deadline_exceeded: false,
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.verdict.exit_code()
    }

    /// Launches performed across all stages
    pub fn total_attempts(&self) -> usize {
        self.stages.iter().map(|s| s.attempts.len()).sum()
    }

    /// Write the report as pretty JSON into `dir`, creating it if needed
    pub fn write_to(&self, dir: &Path) -> SysregResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(REPORT_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }
}

/// Drives one machine through every configured stage
///
/// ## Run loop
///
/// ```text
/// Idle ─► Connected ─► StageRunning{k} ─► RetryAttempt{k, n} ─► StageDone{k}
///                            ▲                 │     ▲               │
///                            │                 └─────┘ continue      │
///                            └───────────── next stage ◄─────────────┘
///                                                               │
///                                           RunComplete | Aborted
/// ```
///
/// Only the observation step is retried. Connection, hook, launch and console
/// failures end the run, after which any held domain is shut down and the
/// connection released.
pub struct StageOrchestrator {
    config: Arc<RunConfiguration>,
    machine: Box<dyn Machine>,
    processor: Box<dyn DebugDataProcessor>,
    hooks: Box<dyn HookRunner>,
    state: RunState,
}

impl StageOrchestrator {
    pub fn new(
        config: Arc<RunConfiguration>,
        machine: Box<dyn Machine>,
        processor: Box<dyn DebugDataProcessor>,
        hooks: Box<dyn HookRunner>,
    ) -> Self {
        Self {
            config,
            machine,
            processor,
            hooks,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!("Run state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn check_deadline(&self, report: &mut RunReport) {
        if report.deadline_exceeded || !self.config.deadline_exceeded() {
            return;
        }
        if let Some(deadline) = self.config.global_deadline {
            warn!("Global deadline {} has passed, the run continues", deadline);
        }
        report.deadline_exceeded = true;
    }

    /// Run every stage and always come back with a report
    pub async fn run(&mut self) -> RunReport {
        let mut report = RunReport::new(&self.config.machine_name);

        match self.run_stages(&mut report).await {
            Ok(verdict) => report.verdict = verdict,
            Err(e) => {
                error!("Run aborted: {}", e);
                report.verdict = Verdict::Abort;
                report.error = Some(e.to_string());
            }
        }

        self.teardown().await;
        self.check_deadline(&mut report);

        self.transition(if report.verdict == Verdict::Abort {
            RunState::Aborted
        } else {
            RunState::RunComplete
        });
        report.finished_at = Utc::now();
        info!("Status: {}", report.verdict.status_line());
        report
    }

    async fn run_stages(&mut self, report: &mut RunReport) -> SysregResult<Verdict> {
        let config = Arc::clone(&self.config);

        self.machine.connect().await?;
        self.transition(RunState::Connected);

        if self.machine.ensure_clean_slate(&config.machine_name).await? {
            warn!(
                "Domain '{}' was still running and has been destroyed",
                config.machine_name
            );
            report.stale_domain_reclaimed = true;
        }

        self.machine.initialize_disk().await?;

        let mut verdict = Verdict::Continue;
        for (index, stage) in config.stages.iter().enumerate() {
            let number = index + 1;
            self.check_deadline(report);
            self.transition(RunState::StageRunning { stage: number });
            info!("Starting stage {}", number);

            if let Some(hook) = &stage.hook_command {
                self.hooks.run_hook(hook).await?;
            }

            report.stages.push(StageReport::new(number, stage));
            let stage_report = report
                .stages
                .last_mut()
                .ok_or_else(|| SysregError::Internal {
                    message: "stage report vanished".to_string(),
                })?;

            verdict = self.run_stage(number, stage, stage_report).await?;
            self.transition(RunState::StageDone { stage: number });

            if verdict == Verdict::Abort {
                info!("Stage {} aborted the run", number);
                break;
            }
        }

        Ok(verdict)
    }

    /// Retry loop of one stage
    async fn run_stage(
        &mut self,
        number: usize,
        stage: &StageConfig,
        stage_report: &mut StageReport,
    ) -> SysregResult<Verdict> {
        let max_retries = self.config.max_retries;
        let mut attempt: u32 = 0;

        loop {
            self.transition(RunState::RetryAttempt {
                stage: number,
                attempt,
            });

            let (verdict, elapsed_ms) = self.run_attempt(number, attempt, stage).await?;
            stage_report.attempts.push(AttemptReport {
                attempt,
                verdict,
                elapsed_ms,
            });

            if verdict != Verdict::Continue || stage.checkpoint.is_none() {
                return Ok(verdict);
            }

            if attempt >= max_retries {
                warn!(
                    "Maximum number ({}) of retries reached, aborting!",
                    max_retries
                );
                stage_report.retries_exhausted = true;
                return Ok(Verdict::Abort);
            }
            attempt += 1;
        }
    }

    /// Launch, observe, shut down
    async fn run_attempt(
        &mut self,
        number: usize,
        attempt: u32,
        stage: &StageConfig,
    ) -> SysregResult<(Verdict, u64)> {
        if attempt == 0 {
            info!("Running stage {}...", number);
        } else {
            info!("Running stage {} retry {}...", number, attempt);
        }

        self.machine
            .launch_machine(&self.config.domain_description, &stage.boot_device)
            .await?;
        info!(
            "Domain {} started",
            self.machine
                .machine_name()
                .unwrap_or(self.config.machine_name.as_str())
        );

        let started = Instant::now();
        let console = match self.machine.get_console().await {
            Ok(console) => console,
            Err(e) => {
                self.shutdown_after_failure().await;
                return Err(e);
            }
        };

        let request = ObservationRequest {
            stage: number,
            attempt,
            checkpoint: stage.checkpoint.as_deref(),
            timeout: self.config.console_timeout(),
        };
        let observed = self.processor.process(console, request).await;
        let elapsed = started.elapsed();

        let shutdown = self.machine.shutdown_machine().await;
        let verdict = match (observed, shutdown) {
            (Ok(verdict), Ok(())) => verdict,
            (Err(e), shutdown) => {
                if let Err(shutdown_err) = shutdown {
                    warn!("Shutdown after console failure also failed: {}", shutdown_err);
                }
                return Err(e);
            }
            (Ok(_), Err(e)) => return Err(e),
        };

        if attempt == 0 {
            info!("Stage {} took: {:.3} seconds", number, elapsed.as_secs_f64());
        } else {
            info!(
                "Stage {} retry {} took: {:.3} seconds",
                number,
                attempt,
                elapsed.as_secs_f64()
            );
        }
        debug!("Stage {} attempt {} verdict: {}", number, attempt, verdict);

        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        Ok((verdict, elapsed_ms))
    }

    async fn shutdown_after_failure(&mut self) {
        if let Err(e) = self.machine.shutdown_machine().await {
            warn!("Failed to shut down domain after error: {}", e);
        }
    }

    /// Release whatever is still held; never fails
    async fn teardown(&mut self) {
        if self.machine.machine_name().is_some() {
            self.shutdown_after_failure().await;
        }
        self.machine.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysreg_core::test_helpers::{
        test_config, MockMachine, RecordingHookRunner, ScriptedProcessor,
    };

    #[tokio::test]
    async fn test_states_end_in_run_complete() {
        let config = Arc::new(test_config(
            0,
            vec![StageConfig::new("hd").with_checkpoint("SECONDBOOT")],
        ));
        let (machine, _log) = MockMachine::new();
        let mut orchestrator = StageOrchestrator::new(
            config,
            Box::new(machine),
            Box::new(ScriptedProcessor::always(Verdict::CheckpointReached)),
            Box::new(RecordingHookRunner::new()),
        );
        assert_eq!(orchestrator.state(), RunState::Idle);

        let report = orchestrator.run().await;
        assert_eq!(report.verdict, Verdict::CheckpointReached);
        assert_eq!(orchestrator.state(), RunState::RunComplete);
    }

    #[tokio::test]
    async fn test_report_is_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = RunReport::new("ReactOS");
        report.verdict = Verdict::Continue;
        report.stages.push(StageReport {
            stage: 1,
            boot_device: "cdrom".to_string(),
            checkpoint: None,
            attempts: vec![AttemptReport {
                attempt: 0,
                verdict: Verdict::Continue,
                elapsed_ms: 1200,
            }],
            retries_exhausted: false,
        });

        let path = report.write_to(&dir.path().join("output-i386")).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();

        assert_eq!(json["verdict"], "continue");
        assert_eq!(json["stages"][0]["attempts"][0]["elapsed_ms"], 1200);
        assert_eq!(json["error"], serde_json::Value::Null);
    }

    #[test]
    fn test_run_state_serialization() {
        let state = RunState::RetryAttempt {
            stage: 2,
            attempt: 1,
        };
        assert_eq!(
            serde_json::to_string(&state).unwrap(),
            r#"{"state":"retry-attempt","stage":2,"attempt":1}"#
        );
    }
}
