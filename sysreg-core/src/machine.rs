use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::RunConfiguration;
use crate::error::{SysregError, SysregResult};
use crate::types::{BackendKind, ConsoleHandle};

/// Capability set every virtualization backend provides
///
/// One instance owns the management connection for the whole run and, between
/// a successful [`launch_machine`](Machine::launch_machine) and the matching
/// [`shutdown_machine`](Machine::shutdown_machine), exactly one domain.
///
/// ## Lifecycle
///
/// ```text
/// connect ─► ensure_clean_slate ─► initialize_disk
///                                     │
///        ┌────────────────────────────┘
///        ▼
///   launch_machine ─► get_console ─► (observe) ─► shutdown_machine ─┐
///        ▲                                                          │
///        └──────────────────────── next attempt / stage ◄───────────┘
/// ```
///
/// The next attempt re-launches under the same domain name, so a domain left
/// defined or running by a skipped shutdown makes the following launch fail.
/// Implementations enforce that by refusing to launch while a domain is held.
#[async_trait]
pub trait Machine: Send + Sync {
    /// Backend variant implemented by this machine
    fn kind(&self) -> BackendKind;

    /// Establish the management connection
    ///
    /// Failure is fatal for the run; there is no retry at this level.
    async fn connect(&mut self) -> SysregResult<()>;

    /// Whether a domain called `name` is currently active
    ///
    /// With `destroy_if_running` set, an active domain is force-stopped and
    /// undefined as a side effect. The return value is always the state
    /// observed *before* any destruction.
    async fn is_machine_running(&mut self, name: &str, destroy_if_running: bool)
        -> SysregResult<bool>;

    /// Create a fresh backing disk image, replacing any existing file
    ///
    /// No-op for variants that do not provision storage.
    async fn initialize_disk(&mut self) -> SysregResult<()>;

    /// Define and start a domain from `domain_description`, booting from
    /// `boot_device`
    ///
    /// A domain that was defined but failed to start is undefined before the
    /// error is returned.
    async fn launch_machine(&mut self, domain_description: &Path, boot_device: &str)
        -> SysregResult<()>;

    /// Readable console of the domain started by the last launch
    async fn get_console(&mut self) -> SysregResult<ConsoleHandle>;

    /// Effective domain name assigned by the backend, while a domain is held
    fn machine_name(&self) -> Option<&str>;

    /// Force-stop and undefine the held domain
    ///
    /// A domain that already exited or disappeared is not an error.
    async fn shutdown_machine(&mut self) -> SysregResult<()>;

    /// Release the management connection; best effort
    async fn disconnect(&mut self) {}

    /// Start-of-run reconciliation: make sure no domain called `name` is
    /// active
    ///
    /// Returns `true` when a stale domain had to be reclaimed. Running it twice
    /// is harmless; the second call finds nothing to do.
    async fn ensure_clean_slate(&mut self, name: &str) -> SysregResult<bool> {
        let was_running = self.is_machine_running(name, true).await?;
        if was_running && self.is_machine_running(name, false).await? {
            return Err(SysregError::vm_operation(
                "ensure_clean_slate",
                format!("domain '{}' is still running after being destroyed", name),
            ));
        }
        Ok(was_running)
    }
}

/// Factory trait for creating machines
///
/// Each backend variant registers one factory; the run picks the factory
/// matching its configured [`BackendKind`] exactly once at startup.
pub trait MachineFactory: Send + Sync {
    /// Create a new machine for the given run
    fn create_machine(&self, config: &RunConfiguration) -> SysregResult<Box<dyn Machine>>;

    /// Backend variant produced by this factory
    fn kind(&self) -> BackendKind;

    /// Get a description of this backend
    fn description(&self) -> &'static str;
}

/// Registry for machine factories
///
/// Variants live in a separate crate, so the binary registers them at startup.
#[derive(Clone, Default)]
pub struct MachineRegistry {
    factories: HashMap<BackendKind, Arc<dyn MachineFactory>>,
}

impl MachineRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend factory
    pub fn register(&mut self, factory: Arc<dyn MachineFactory>) {
        tracing::debug!(
            backend = %factory.kind(),
            "Registering machine backend: {}",
            factory.description()
        );
        self.factories.insert(factory.kind(), factory);
    }

    /// Create the machine selected by the configuration
    pub fn create_machine(&self, config: &RunConfiguration) -> SysregResult<Box<dyn Machine>> {
        let factory = self.factories.get(&config.backend).ok_or_else(|| {
            SysregError::ConfigError(format!(
                "VM backend '{}' is not available. Available backends: {:?}",
                config.backend,
                self.available_backends()
            ))
        })?;

        factory.create_machine(config)
    }

    /// List all available backend types
    pub fn available_backends(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self.factories.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{test_config, MockMachineFactory};

    #[test]
    fn test_machine_registry() {
        let mut registry = MachineRegistry::new();
        assert!(registry.available_backends().is_empty());

        registry.register(Arc::new(MockMachineFactory::new(BackendKind::Kvm)));
        assert_eq!(registry.available_backends(), vec![BackendKind::Kvm]);

        let config = test_config(0, vec![crate::config::StageConfig::new("hd")]);
        let machine = registry.create_machine(&config).unwrap();
        assert_eq!(machine.kind(), BackendKind::Kvm);
    }

    #[test]
    fn test_unregistered_backend_error() {
        let registry = MachineRegistry::new();
        let mut config = test_config(0, vec![crate::config::StageConfig::new("hd")]);
        config.backend = BackendKind::VirtualBox;

        let err = registry.create_machine(&config).err().unwrap();
        assert!(err.to_string().contains("'virtualbox' is not available"));
    }

    #[tokio::test]
    async fn test_ensure_clean_slate_reclaims_stale_domain() {
        let (mut machine, log) = crate::test_helpers::MockMachine::new();
        log.lock().running.insert("ReactOS".to_string());

        assert!(machine.ensure_clean_slate("ReactOS").await.unwrap());
        assert!(!machine.ensure_clean_slate("ReactOS").await.unwrap());
    }
}
