//! Test doubles for the run loop
//!
//! `MockMachine` records every backend call in a shared [`MachineLog`] and
//! models the one-domain-per-name rule of a real hypervisor, so tests can
//! assert launch/shutdown pairing. `ScriptedProcessor` replays verdicts and
//! `RecordingHookRunner` remembers which hooks ran.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ConsoleConfig, EsxCredentials, RunConfiguration, StageConfig};
use crate::error::{SysregError, SysregResult};
use crate::machine::{Machine, MachineFactory};
use crate::processor::{DebugDataProcessor, HookRunner, ObservationRequest};
use crate::types::{BackendKind, ConsoleHandle, Verdict};

/// Build a configuration without touching the filesystem or environment
pub fn test_config(max_retries: u32, stages: Vec<StageConfig>) -> RunConfiguration {
    RunConfiguration {
        backend: BackendKind::Kvm,
        machine_name: "ReactOS".to_string(),
        domain_description: PathBuf::from("domain.xml"),
        timeout_ms: 1_000,
        global_deadline: None,
        max_retries,
        disk_size_mb: 512,
        serial_socket: PathBuf::from("/tmp/sysreg-test.sock"),
        esx: EsxCredentials::default(),
        max_cache_hits: 0,
        max_conts: 0,
        console: ConsoleConfig::default(),
        stages,
        output_dir: PathBuf::from("output-test"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineCall {
    Connect,
    IsMachineRunning { name: String, destroy: bool },
    InitializeDisk,
    Launch { boot_device: String },
    GetConsole,
    Shutdown,
    Disconnect,
}

/// Shared view of what a [`MockMachine`] did and how it should misbehave
#[derive(Debug, Default)]
pub struct MachineLog {
    pub calls: Vec<MachineCall>,
    /// Active domains by name
    pub running: HashSet<String>,
    pub fail_connect: bool,
    pub fail_disk: bool,
    /// Fail the n-th launch (1-based)
    pub fail_launch_on: Option<usize>,
    pub fail_console: bool,
    pub fail_shutdown: bool,
}

impl MachineLog {
    pub fn launches(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, MachineCall::Launch { .. }))
            .count()
    }

    pub fn shutdowns(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, MachineCall::Shutdown))
            .count()
    }

    pub fn boot_devices(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                MachineCall::Launch { boot_device } => Some(boot_device.clone()),
                _ => None,
            })
            .collect()
    }
}

pub type SharedMachineLog = Arc<Mutex<MachineLog>>;

/// Mock machine for testing
pub struct MockMachine {
    kind: BackendKind,
    name: String,
    domain: Option<String>,
    log: SharedMachineLog,
}

impl MockMachine {
    pub fn new() -> (Self, SharedMachineLog) {
        Self::with_name(BackendKind::Kvm, "ReactOS")
    }

    pub fn with_name(kind: BackendKind, name: &str) -> (Self, SharedMachineLog) {
        let log = SharedMachineLog::default();
        let machine = Self {
            kind,
            name: name.to_string(),
            domain: None,
            log: Arc::clone(&log),
        };
        (machine, log)
    }
}

#[async_trait]
impl Machine for MockMachine {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn connect(&mut self) -> SysregResult<()> {
        let mut log = self.log.lock();
        log.calls.push(MachineCall::Connect);
        if log.fail_connect {
            return Err(SysregError::Connection {
                uri: "mock:///session".to_string(),
                details: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn is_machine_running(
        &mut self,
        name: &str,
        destroy_if_running: bool,
    ) -> SysregResult<bool> {
        let mut log = self.log.lock();
        log.calls.push(MachineCall::IsMachineRunning {
            name: name.to_string(),
            destroy: destroy_if_running,
        });
        let running = log.running.iter().find(|d| d.eq_ignore_ascii_case(name)).cloned();
        if let (Some(domain), true) = (&running, destroy_if_running) {
            log.running.remove(domain);
        }
        Ok(running.is_some())
    }

    async fn initialize_disk(&mut self) -> SysregResult<()> {
        let mut log = self.log.lock();
        log.calls.push(MachineCall::InitializeDisk);
        if log.fail_disk {
            return Err(SysregError::ToolFailed {
                tool: "qemu-img".to_string(),
                details: "disk full".to_string(),
            });
        }
        Ok(())
    }

    async fn launch_machine(
        &mut self,
        _domain_description: &Path,
        boot_device: &str,
    ) -> SysregResult<()> {
        let mut log = self.log.lock();
        log.calls.push(MachineCall::Launch {
            boot_device: boot_device.to_string(),
        });

        if self.domain.is_some() {
            return Err(SysregError::InvalidOperation {
                operation: "launch".to_string(),
                reason: "a domain is already held".to_string(),
            });
        }
        if log.fail_launch_on == Some(log.launches()) {
            return Err(SysregError::vm_operation("launch", "domain failed to start"));
        }
        if log.running.contains(&self.name) {
            return Err(SysregError::vm_operation(
                "launch",
                format!("domain '{}' already exists", self.name),
            ));
        }

        log.running.insert(self.name.clone());
        self.domain = Some(self.name.clone());
        Ok(())
    }

    async fn get_console(&mut self) -> SysregResult<ConsoleHandle> {
        let mut log = self.log.lock();
        log.calls.push(MachineCall::GetConsole);
        if log.fail_console || self.domain.is_none() {
            return Err(SysregError::Console {
                message: "no console available".to_string(),
            });
        }
        Ok(ConsoleHandle::Tty(PathBuf::from("/dev/null")))
    }

    fn machine_name(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    async fn shutdown_machine(&mut self) -> SysregResult<()> {
        let mut log = self.log.lock();
        log.calls.push(MachineCall::Shutdown);
        if let Some(domain) = self.domain.take() {
            log.running.remove(&domain);
        }
        if log.fail_shutdown {
            return Err(SysregError::vm_operation("shutdown", "undefine failed"));
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.log.lock().calls.push(MachineCall::Disconnect);
    }
}

/// Factory for the mock machine
pub struct MockMachineFactory {
    kind: BackendKind,
}

impl MockMachineFactory {
    pub fn new(kind: BackendKind) -> Self {
        Self { kind }
    }
}

impl MachineFactory for MockMachineFactory {
    fn create_machine(&self, config: &RunConfiguration) -> SysregResult<Box<dyn Machine>> {
        let (machine, _log) = MockMachine::with_name(self.kind, &config.machine_name);
        Ok(Box::new(machine))
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn description(&self) -> &'static str {
        "Mock machine for testing (no actual VMs created)"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStep {
    Verdict(Verdict),
    /// Console could not be opened
    Fail,
}

/// Processor that replays a fixed script, then repeats a fallback verdict
pub struct ScriptedProcessor {
    script: VecDeque<ScriptStep>,
    fallback: Verdict,
    pub requests: Arc<Mutex<Vec<(usize, u32)>>>,
}

impl ScriptedProcessor {
    pub fn always(verdict: Verdict) -> Self {
        Self::new(Vec::new(), verdict)
    }

    pub fn new(script: Vec<ScriptStep>, fallback: Verdict) -> Self {
        Self {
            script: script.into(),
            fallback,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn verdicts(verdicts: &[Verdict], fallback: Verdict) -> Self {
        Self::new(
            verdicts.iter().copied().map(ScriptStep::Verdict).collect(),
            fallback,
        )
    }
}

#[async_trait]
impl DebugDataProcessor for ScriptedProcessor {
    async fn process(
        &mut self,
        _console: ConsoleHandle,
        request: ObservationRequest<'_>,
    ) -> SysregResult<Verdict> {
        self.requests.lock().push((request.stage, request.attempt));
        match self.script.pop_front() {
            Some(ScriptStep::Verdict(verdict)) => Ok(verdict),
            Some(ScriptStep::Fail) => Err(SysregError::Console {
                message: "scripted console failure".to_string(),
            }),
            None => Ok(self.fallback),
        }
    }
}

/// Hook runner that records commands and fails the configured ones
#[derive(Default)]
pub struct RecordingHookRunner {
    pub commands: Arc<Mutex<Vec<String>>>,
    failing: HashSet<String>,
}

impl RecordingHookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(command: &str) -> Self {
        let mut runner = Self::default();
        runner.failing.insert(command.to_string());
        runner
    }
}

#[async_trait]
impl HookRunner for RecordingHookRunner {
    async fn run_hook(&self, command: &str) -> SysregResult<()> {
        self.commands.lock().push(command.to_string());
        if self.failing.contains(command) {
            return Err(SysregError::HookFailed {
                command: command.to_string(),
                details: "exit status: 1".to_string(),
            });
        }
        Ok(())
    }
}
