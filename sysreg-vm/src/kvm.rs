//! KVM/QEMU through the local libvirt session

use std::path::Path;
use std::sync::Arc;

use sysreg_core::config::RunConfiguration;
use sysreg_core::error::SysregResult;
use sysreg_core::machine::{Machine, MachineFactory};
use sysreg_core::types::{BackendKind, ConsoleHandle};

use crate::command::{CommandExecutor, SystemCommandExecutor};
use crate::disk::DiskFormat;
use crate::libvirt::{impl_libvirt_machine, LibvirtSession};
use crate::virsh::VirshConnection;

pub const KVM_URI: &str = "qemu:///session";

/// KVM domain whose console is the pty libvirt allocates
pub struct KvmMachine {
    session: LibvirtSession,
}

impl KvmMachine {
    pub fn new(config: &RunConfiguration, executor: Arc<dyn CommandExecutor>) -> Self {
        let connection = VirshConnection::new(KVM_URI, Arc::clone(&executor));
        Self {
            session: LibvirtSession::new(BackendKind::Kvm, connection, executor, config),
        }
    }
}

impl_libvirt_machine!(KvmMachine {
    async fn initialize_disk(&mut self) -> SysregResult<()> {
        self.session.provision_disk(DiskFormat::Qcow2).await
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

pub struct KvmMachineFactory;

impl MachineFactory for KvmMachineFactory {
    fn create_machine(&self, config: &RunConfiguration) -> SysregResult<Box<dyn Machine>> {
        Ok(Box::new(KvmMachine::new(config, Arc::new(SystemCommandExecutor))))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Kvm
    }

    fn description(&self) -> &'static str {
        "KVM/QEMU through the local libvirt session, console on the domain pty"
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
    async fn test_kvm_console_comes_from_live_description() {
        let dir = TempDir::new().unwrap();
        let hypervisor = Arc::new(Mutex::new(FakeHypervisor::default()));
        let executor = fake_executor(Arc::clone(&hypervisor));
        let mut config = test_config(1, vec![]);
        config.domain_description = write_domain(&dir);

        let mut machine = KvmMachine::new(&config, executor.clone());
        machine.connect().await.unwrap();
        machine.initialize_disk().await.unwrap();
        machine
            .launch_machine(&config.domain_description, "cdrom")
            .await
            .unwrap();

        let console = machine.get_console().await.unwrap();
        assert!(matches!(console, ConsoleHandle::Tty(ref p) if p == Path::new("/dev/pts/3")));

        // Forwarded straight to the libvirt session
        assert_eq!(machine.kind(), BackendKind::Kvm);
        assert_eq!(machine.machine_name(), Some("ReactOS"));
        assert!(machine.is_machine_running("reactos", false).await.unwrap());

        machine.shutdown_machine().await.unwrap();
        assert_eq!(machine.machine_name(), None);
        assert!(!machine.is_machine_running("ReactOS", false).await.unwrap());
        machine.disconnect().await;

        let calls = executor.invocations.lock();
        assert!(calls.iter().any(|c| c.line().starts_with("qemu-img create -f qcow2")));
        assert!(calls
            .iter()
            .filter(|c| c.program == "virsh")
            .all(|c| c.args[1] == KVM_URI));
    }
}
