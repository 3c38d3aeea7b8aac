pub mod command;
pub mod console_reader;
pub mod disk;
pub mod domain;
pub mod hooks;
pub mod kvm;
pub mod libvirt;
pub mod serial;
pub mod virsh;
pub mod virtualbox;
pub mod vmware_esx;
pub mod vmware_player;

use std::sync::Arc;

pub use command::{CommandExecutor, SystemCommandExecutor};
pub use console_reader::ConsoleReader;
pub use domain::DomainDescription;
pub use hooks::ShellHookRunner;
pub use kvm::{KvmMachine, KvmMachineFactory};
pub use virtualbox::{VirtualBoxMachine, VirtualBoxMachineFactory};
pub use vmware_esx::{VmwareEsxMachine, VmwareEsxMachineFactory};
pub use vmware_player::{VmwarePlayerMachine, VmwarePlayerMachineFactory};

// Re-export core types for convenience
pub use sysreg_core::{
    error::{SysregError, SysregResult},
    machine::{Machine, MachineFactory, MachineRegistry},
};

/// Register every libvirt backend variant
pub fn register_backends(registry: &mut MachineRegistry) {
    registry.register(Arc::new(KvmMachineFactory));
    registry.register(Arc::new(VmwarePlayerMachineFactory));
    registry.register(Arc::new(VmwareEsxMachineFactory));
    registry.register(Arc::new(VirtualBoxMachineFactory));
}

/// Registry with all backend variants available
pub fn default_registry() -> MachineRegistry {
    let mut registry = MachineRegistry::new();
    register_backends(&mut registry);
    registry
}
