//! VirtualBox through libvirt's vbox driver

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

pub const VIRTUALBOX_URI: &str = "vbox:///session";

pub struct VirtualBoxMachine {
    session: LibvirtSession,
    serial_socket: PathBuf,
}

impl VirtualBoxMachine {
    pub fn new(config: &RunConfiguration, executor: Arc<dyn CommandExecutor>) -> Self {
        let connection = VirshConnection::new(VIRTUALBOX_URI, Arc::clone(&executor));
        Self {
            session: LibvirtSession::new(BackendKind::VirtualBox, connection, executor, config),
            serial_socket: config.serial_socket.clone(),
        }
    }
}

impl_libvirt_machine!(VirtualBoxMachine {
    /// VirtualBox registers media by UUID, so the image is created with its
    /// own tool rather than qemu-img
    async fn initialize_disk(&mut self) -> SysregResult<()> {
        self.session.provision_disk(DiskFormat::Vdi).await
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

pub struct VirtualBoxMachineFactory;

impl MachineFactory for VirtualBoxMachineFactory {
    fn create_machine(&self, config: &RunConfiguration) -> SysregResult<Box<dyn Machine>> {
        Ok(Box::new(VirtualBoxMachine::new(
            config,
            Arc::new(SystemCommandExecutor),
        )))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::VirtualBox
    }

    fn description(&self) -> &'static str {
        "VirtualBox through libvirt, console on a local serial socket"
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
    async fn test_virtualbox_creates_vdi_and_uses_vbox_uri() {
        let dir = TempDir::new().unwrap();
        let hypervisor = Arc::new(Mutex::new(FakeHypervisor::default()));
        let executor = fake_executor(Arc::clone(&hypervisor));
        let mut config = test_config(1, vec![]);
        config.backend = BackendKind::VirtualBox;
        config.domain_description = write_domain(&dir);
        config.serial_socket = dir.path().join("vbox.sock");

        let mut machine = VirtualBoxMachine::new(&config, executor.clone());
        assert_eq!(machine.kind(), BackendKind::VirtualBox);
        machine.connect().await.unwrap();
        machine.initialize_disk().await.unwrap();
        machine
            .launch_machine(&config.domain_description, "hd")
            .await
            .unwrap();
        assert!(matches!(
            machine.get_console().await.unwrap(),
            ConsoleHandle::Socket { .. }
        ));
        machine.shutdown_machine().await.unwrap();

        let calls = executor.invocations.lock();
        assert!(calls.iter().any(|c| c.program == "VBoxManage"));
        assert_eq!(calls[0].args[1], VIRTUALBOX_URI);
    }
}
