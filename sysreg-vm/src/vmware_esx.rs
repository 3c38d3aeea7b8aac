//! Remote VMware ESX host through libvirt's esx driver

use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use sysreg_core::config::RunConfiguration;
use sysreg_core::error::SysregResult;
use sysreg_core::machine::{Machine, MachineFactory};
use sysreg_core::types::{BackendKind, ConsoleHandle};

use crate::command::{CommandExecutor, SystemCommandExecutor};
use crate::libvirt::{impl_libvirt_machine, LibvirtSession};
use crate::virsh::VirshConnection;

/// ESX domain; storage lives on the host, so no disk is provisioned here
pub struct VmwareEsxMachine {
    session: LibvirtSession,
}

impl VmwareEsxMachine {
    pub fn new(
        config: &RunConfiguration,
        executor: Arc<dyn CommandExecutor>,
    ) -> SysregResult<Self> {
        let connection = VirshConnection::esx(&config.esx, Arc::clone(&executor))?;
        Ok(Self {
            session: LibvirtSession::new(BackendKind::VmwareEsx, connection, executor, config),
        })
    }
}

impl_libvirt_machine!(VmwareEsxMachine {
    async fn initialize_disk(&mut self) -> SysregResult<()> {
        debug!("Disk images on {} are managed by the host", self.session.uri());
        Ok(())
    }

    async fn launch_machine(
        &mut self,
        domain_description: &Path,
        boot_device: &str,
    ) -> SysregResult<()> {
        self.session.launch(domain_description, boot_device, None).await
    }

    async fn get_console(&mut self) -> SysregResult<ConsoleHandle> {
        self.session.tty_console().await
    }
});

pub struct VmwareEsxMachineFactory;

impl MachineFactory for VmwareEsxMachineFactory {
    fn create_machine(&self, config: &RunConfiguration) -> SysregResult<Box<dyn Machine>> {
        let machine = VmwareEsxMachine::new(config, Arc::new(SystemCommandExecutor))?;
        Ok(Box::new(machine))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::VmwareEsx
    }

    fn description(&self) -> &'static str {
        "Remote VMware ESX host with credential authentication"
    }
}
