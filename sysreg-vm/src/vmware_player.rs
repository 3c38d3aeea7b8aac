//! VMware Player through libvirt's player driver

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sysreg_core::config::RunConfiguration;
use sysreg_core::error::SysregResult;
use sysreg_core::machine::{Machine, MachineFactory};
use sysreg_core::types::{BackendKind, ConsoleHandle};

use crate::command::{CommandExecutor, SystemCommandExecutor};
use crate::disk::DiskFormat;
use crate::libvirt::{impl_libvirt_machine, LibvirtSession};
use crate::virsh::VirshConnection;

pub const VMWARE_PLAYER_URI: &str = "vmwareplayer:///session";

/// Player domain whose serial port connects out to a local socket
pub struct VmwarePlayerMachine {
    session: LibvirtSession,
    serial_socket: PathBuf,
}

impl VmwarePlayerMachine {
    pub fn new(config: &RunConfiguration, executor: Arc<dyn CommandExecutor>) -> Self {
        let connection = VirshConnection::new(VMWARE_PLAYER_URI, Arc::clone(&executor));
        Self {
            session: LibvirtSession::new(BackendKind::VmwarePlayer, connection, executor, config),
            serial_socket: config.serial_socket.clone(),
        }
    }
}

impl_libvirt_machine!(VmwarePlayerMachine {
    async fn initialize_disk(&mut self) -> SysregResult<()> {
        self.session.provision_disk(DiskFormat::Vmdk).await
    }

    async fn launch_machine(
        &mut self,
        domain_description: &Path,
        boot_device: &str,
    ) -> SysregResult<()> {
        self.session
            .launch(domain_description, boot_device, Some(&self.serial_socket))
            .await
    }

    async fn get_console(&mut self) -> SysregResult<ConsoleHandle> {
        self.session.serial_console()
    }
});

pub struct VmwarePlayerMachineFactory;

impl MachineFactory for VmwarePlayerMachineFactory {
    fn create_machine(&self, config: &RunConfiguration) -> SysregResult<Box<dyn Machine>> {
        Ok(Box::new(VmwarePlayerMachine::new(
            config,
            Arc::new(SystemCommandExecutor),
        )))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::VmwarePlayer
    }

    fn description(&self) -> &'static str {
        "VMware Player through libvirt, console on a local serial socket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libvirt::tests::{fake_executor, write_domain, FakeHypervisor};
    use parking_lot::Mutex;
    use sysreg_core::test_helpers::test_config;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_player_console_is_socket_bound_at_launch() {
        let dir = TempDir::new().unwrap();
        let hypervisor = Arc::new(Mutex::new(FakeHypervisor::default()));
        let executor = fake_executor(Arc::clone(&hypervisor));
        let mut config = test_config(1, vec![]);
        config.domain_description = write_domain(&dir);
        config.serial_socket = dir.path().join("player.sock");

        let mut machine = VmwarePlayerMachine::new(&config, executor.clone());
        machine.connect().await.unwrap();
        machine.initialize_disk().await.unwrap();

        // No console before a launch
        assert!(machine.get_console().await.is_err());

        machine
            .launch_machine(&config.domain_description, "cdrom")
            .await
            .unwrap();
        assert!(config.serial_socket.exists());

        let console = machine.get_console().await.unwrap();
        assert_eq!(console.path(), config.serial_socket.as_path());
        drop(console);

        machine.shutdown_machine().await.unwrap();
        assert!(!config.serial_socket.exists());

        let calls = executor.invocations.lock();
        assert!(calls.iter().any(|c| c.line().starts_with("qemu-img create -f vmdk")));
    }
}
