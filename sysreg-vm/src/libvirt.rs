//! Lifecycle shared by every libvirt-managed backend
//!
//! The four variants differ only in connection URI, authentication, console
//! strategy and disk format. Everything else (clean-slate checks, define and
//! start, teardown) lives here and the variants delegate to it.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use sysreg_core::config::RunConfiguration;
use sysreg_core::error::{SysregError, SysregResult};
use sysreg_core::types::{BackendKind, ConsoleHandle};

use crate::command::CommandExecutor;
use crate::disk::{DiskFormat, DiskProvisioner};
use crate::domain::DomainDescription;
use crate::serial::SerialListener;
use crate::virsh::VirshConnection;

/// Implements `Machine` for a variant with a `session: LibvirtSession` field
///
/// Connection, clean-slate queries, naming, shutdown and disconnect forward to
/// the session. The variant supplies `initialize_disk`, `launch_machine` and
/// `get_console`.
macro_rules! impl_libvirt_machine {
    ($machine:ident { $($overrides:tt)* }) => {
        #[async_trait::async_trait]
        impl sysreg_core::machine::Machine for $machine {
            fn kind(&self) -> sysreg_core::types::BackendKind {
                self.session.kind()
            }

            async fn connect(&mut self) -> sysreg_core::error::SysregResult<()> {
                self.session.connect().await
            }

            async fn is_machine_running(
                &mut self,
                name: &str,
                destroy_if_running: bool,
            ) -> sysreg_core::error::SysregResult<bool> {
                self.session.is_machine_running(name, destroy_if_running).await
            }

            fn machine_name(&self) -> Option<&str> {
                self.session.machine_name()
            }

            async fn shutdown_machine(&mut self) -> sysreg_core::error::SysregResult<()> {
                self.session.shutdown().await
            }

            async fn disconnect(&mut self) {
                self.session.disconnect().await
            }

            $($overrides)*
        }
    };
}

pub(crate) use impl_libvirt_machine;

pub struct LibvirtSession {
    kind: BackendKind,
    connection: VirshConnection,
    executor: Arc<dyn CommandExecutor>,
    configured_name: String,
    domain_description: PathBuf,
    disk_size_mb: u64,
    connected: bool,
    /// Domain defined and started by the last launch
    domain: Option<String>,
    serial: Option<SerialListener>,
}

impl LibvirtSession {
    pub fn new(
        kind: BackendKind,
        connection: VirshConnection,
        executor: Arc<dyn CommandExecutor>,
        config: &RunConfiguration,
    ) -> Self {
        Self {
            kind,
            connection,
            executor,
            configured_name: config.machine_name.clone(),
            domain_description: config.domain_description.clone(),
            disk_size_mb: config.disk_size_mb,
            connected: false,
            domain: None,
            serial: None,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn uri(&self) -> &str {
        self.connection.uri()
    }

    pub async fn connect(&mut self) -> SysregResult<()> {
        self.connection.open().await?;
        self.connected = true;
        info!("Connected to {} hypervisor at {}", self.kind, self.uri());
        Ok(())
    }

    fn ensure_connected(&self, operation: &str) -> SysregResult<()> {
        if !self.connected {
            return Err(SysregError::InvalidOperation {
                operation: operation.to_string(),
                reason: format!("not connected to {}", self.uri()),
            });
        }
        Ok(())
    }

    pub async fn is_machine_running(
        &mut self,
        name: &str,
        destroy_if_running: bool,
    ) -> SysregResult<bool> {
        self.ensure_connected("is_machine_running")?;

        let Some(domain) = self.connection.find_active(name).await? else {
            return Ok(false);
        };

        if destroy_if_running {
            info!("Destroying running domain '{}'", domain);
            self.connection.destroy(&domain).await?;
            self.connection.undefine(&domain).await?;
        }
        Ok(true)
    }

    /// Recreate the backing image named by the domain description
    pub async fn provision_disk(&mut self, format: DiskFormat) -> SysregResult<()> {
        let description = DomainDescription::load(&self.domain_description).await?;
        let image = description.disk_image().ok_or_else(|| SysregError::DomainDescription {
            message: format!(
                "{} has no <disk device='disk'> with a source file",
                self.domain_description.display()
            ),
        })?;

        DiskProvisioner::new(format, image, self.disk_size_mb, Arc::clone(&self.executor))
            .provision()
            .await
    }

    /// Define and start a domain booting from `boot_device`
    ///
    /// With `serial_socket` set, the socket is bound before the domain starts.
    /// A domain that was defined but failed to start is undefined again.
    pub async fn launch(
        &mut self,
        domain_description: &Path,
        boot_device: &str,
        serial_socket: Option<&Path>,
    ) -> SysregResult<()> {
        self.ensure_connected("launch")?;
        if let Some(domain) = &self.domain {
            return Err(SysregError::InvalidOperation {
                operation: "launch".to_string(),
                reason: format!("domain '{}' has not been shut down", domain),
            });
        }

        let description = DomainDescription::load(domain_description).await?;
        let xml = description.with_boot_device(boot_device)?;

        let mut xml_file = tempfile::Builder::new()
            .prefix("sysreg-domain")
            .suffix(".xml")
            .tempfile()?;
        xml_file.write_all(xml.as_bytes())?;
        xml_file.flush()?;

        if let Some(path) = serial_socket {
            self.serial = Some(SerialListener::bind(path)?);
        }

        let fallback = description.name().unwrap_or(self.configured_name.as_str()).to_string();
        let name = match self.connection.define(xml_file.path(), &fallback).await {
            Ok(name) => name,
            Err(e) => {
                self.close_serial();
                return Err(e);
            }
        };
        debug!("Defined domain '{}'", name);

        if let Err(e) = self.connection.start(&name).await {
            if let Err(undefine_err) = self.connection.undefine(&name).await {
                warn!("Failed to undefine '{}' after start failure: {}", name, undefine_err);
            }
            self.close_serial();
            return Err(e);
        }

        info!("Started domain '{}' booting from '{}'", name, boot_device);
        self.domain = Some(name);
        Ok(())
    }

    fn held_domain(&self, operation: &str) -> SysregResult<&str> {
        self.domain.as_deref().ok_or_else(|| SysregError::InvalidOperation {
            operation: operation.to_string(),
            reason: "no domain has been launched".to_string(),
        })
    }

    /// Pseudo terminal libvirt allocated for the running domain
    pub async fn tty_console(&self) -> SysregResult<ConsoleHandle> {
        let domain = self.held_domain("get_console")?;
        let live = DomainDescription::parse(self.connection.dump_xml(domain).await?)?;
        let tty = live.console_tty().ok_or_else(|| SysregError::Console {
            message: format!("domain '{}' has no console tty", domain),
        })?;
        Ok(ConsoleHandle::Tty(tty.to_path_buf()))
    }

    /// Socket bound by the last launch
    pub fn serial_console(&mut self) -> SysregResult<ConsoleHandle> {
        self.held_domain("get_console")?;
        self.serial
            .as_mut()
            .ok_or_else(|| SysregError::Console {
                message: "serial socket was not prepared".to_string(),
            })?
            .take_console()
    }

    pub fn machine_name(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub async fn shutdown(&mut self) -> SysregResult<()> {
        let Some(domain) = self.domain.take() else {
            return Ok(());
        };

        let destroyed = match self.connection.domain_state(&domain).await {
            Ok(Some(state)) if !state.is_active() => {
                debug!("Domain '{}' already stopped ({:?})", domain, state);
                Ok(())
            }
            _ => self.connection.destroy(&domain).await,
        };
        let undefined = self.connection.undefine(&domain).await;
        self.close_serial();

        destroyed?;
        undefined?;
        info!("Shut down domain '{}'", domain);
        Ok(())
    }

    fn close_serial(&mut self) {
        if let Some(serial) = self.serial.take() {
            serial.close();
        }
    }

    pub async fn disconnect(&mut self) {
        if let Err(e) = self.shutdown().await {
            warn!("Failed to shut down domain while disconnecting: {}", e);
        }
        if self.connected {
            debug!("Disconnected from {}", self.uri());
        }
        self.connected = false;
    }
}
