//! Management connection to libvirt through the `virsh` CLI

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use sysreg_core::config::EsxCredentials;
use sysreg_core::error::{SysregError, SysregResult};

use crate::command::{CommandExecutor, CommandOutput, CommandSpec};

const VIRSH: &str = "virsh";

/// Environment variable libvirt reads its client auth file from
const AUTH_FILE_ENV: &str = "LIBVIRT_AUTH_FILE";

/// Run state reported by `virsh domstate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Paused,
    ShutOff,
    Crashed,
    Other(String),
}

impl DomainState {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "running" | "idle" | "in shutdown" => DomainState::Running,
            "paused" | "pmsuspended" => DomainState::Paused,
            "shut off" => DomainState::ShutOff,
            "crashed" => DomainState::Crashed,
            other => DomainState::Other(other.to_string()),
        }
    }

    /// Whether `virsh destroy` has anything to stop
    pub fn is_active(&self) -> bool {
        matches!(self, DomainState::Running | DomainState::Paused)
    }
}

/// Whether stderr says the domain is gone or already stopped
fn is_absent_or_stopped(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("domain not found")
        || stderr.contains("failed to get domain")
        || stderr.contains("domain is not running")
        || stderr.contains("no domain with matching")
}

/// libvirt connection driven by `virsh -c <uri>`
pub struct VirshConnection {
    uri: String,
    executor: Arc<dyn CommandExecutor>,
    /// Private auth file handed to libvirt; removed on drop
    auth_file: Option<tempfile::NamedTempFile>,
}

impl std::fmt::Debug for VirshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirshConnection")
            .field("uri", &self.uri)
            .field("auth_file", &self.auth_file.as_ref().map(|f| f.path().to_path_buf()))
            .finish()
    }
}

impl VirshConnection {
    pub fn new(uri: impl Into<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            uri: uri.into(),
            executor,
            auth_file: None,
        }
    }

    /// Connection to an ESX host, authenticating with the configured
    /// credentials when a password is set
    pub fn esx(creds: &EsxCredentials, executor: Arc<dyn CommandExecutor>) -> SysregResult<Self> {
        let mut connection = Self::new(esx_uri(creds), executor);

        if let Some(password) = &creds.password {
            let mut file = tempfile::Builder::new()
                .prefix("sysreg-auth")
                .suffix(".conf")
                .tempfile()?;
            let username = creds.username.as_deref().unwrap_or("root");
            write!(
                file,
                "[credentials-sysreg]\nusername={}\npassword={}\n\n[auth-esx-{}]\ncredentials=sysreg\n",
                username, password, creds.host
            )?;
            file.flush()?;
            connection.auth_file = Some(file);
        }

        Ok(connection)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    async fn virsh(&self, operation: &str, args: &[&str]) -> SysregResult<CommandOutput> {
        self.run(operation, args, true).await
    }

    /// `quiet` adds `-q`, which also silences informational messages such as
    /// the one `define` prints with the assigned name
    async fn run(&self, operation: &str, args: &[&str], quiet: bool) -> SysregResult<CommandOutput> {
        let mut full_args = vec!["-c", self.uri.as_str()];
        if quiet {
            full_args.push("-q");
        }
        full_args.extend_from_slice(args);

        let auth_path = self
            .auth_file
            .as_ref()
            .map(|f| f.path().to_string_lossy().into_owned());
        let envs: Vec<(&str, &str)> = auth_path
            .as_deref()
            .map(|path| vec![(AUTH_FILE_ENV, path)])
            .unwrap_or_default();

        let spec = CommandSpec::new(VIRSH, &full_args).envs(&envs);
        debug!("Running {}", spec);

        self.executor
            .execute(spec)
            .await
            .map_err(|e| SysregError::vm_operation(operation, format!("failed to run virsh: {}", e)))
    }

    async fn virsh_checked(&self, operation: &str, args: &[&str]) -> SysregResult<CommandOutput> {
        let output = self.virsh(operation, args).await?;
        check_status(operation, output)
    }

    /// Verify that the hypervisor answers on this URI
    pub async fn open(&self) -> SysregResult<()> {
        let output = self.virsh("connect", &["uri"]).await.map_err(|e| {
            SysregError::Connection {
                uri: self.uri.clone(),
                details: e.to_string(),
            }
        })?;

        if !output.status.success() {
            return Err(SysregError::Connection {
                uri: self.uri.clone(),
                details: output.stderr_lossy(),
            });
        }
        Ok(())
    }

    /// Names of all active domains
    pub async fn list_active(&self) -> SysregResult<Vec<String>> {
        let output = self.virsh_checked("list", &["list", "--name"]).await?;
        Ok(output
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Active domain whose name matches `name` case-insensitively
    pub async fn find_active(&self, name: &str) -> SysregResult<Option<String>> {
        Ok(self
            .list_active()
            .await?
            .into_iter()
            .find(|domain| domain.eq_ignore_ascii_case(name)))
    }

    /// `None` when the domain does not exist
    pub async fn domain_state(&self, name: &str) -> SysregResult<Option<DomainState>> {
        let output = self.virsh("domstate", &["domstate", name]).await?;
        if output.status.success() {
            return Ok(Some(DomainState::parse(&output.stdout_lossy())));
        }
        let stderr = output.stderr_lossy();
        if is_absent_or_stopped(&stderr) {
            return Ok(None);
        }
        Err(SysregError::vm_operation("domstate", stderr))
    }

    /// Define a domain from an XML file, returning the name libvirt gave it
    pub async fn define(&self, xml_path: &Path, fallback_name: &str) -> SysregResult<String> {
        let path = xml_path.to_string_lossy().into_owned();
        let output = self.run("define", &["define", path.as_str()], false).await?;
        let output = check_status("define", output)?;

        match parse_defined_name(&output.stdout_lossy()) {
            Some(name) => Ok(name),
            None => {
                warn!(
                    "virsh define printed no domain name, assuming '{}'",
                    fallback_name
                );
                Ok(fallback_name.to_string())
            }
        }
    }

    pub async fn start(&self, name: &str) -> SysregResult<()> {
        self.virsh_checked("start", &["start", name]).await.map(|_| ())
    }

    /// Force-stop; a domain that is gone or not running is not an error
    pub async fn destroy(&self, name: &str) -> SysregResult<()> {
        self.tolerant("destroy", &["destroy", name]).await
    }

    /// Remove the definition; an unknown domain is not an error
    pub async fn undefine(&self, name: &str) -> SysregResult<()> {
        self.tolerant("undefine", &["undefine", name]).await
    }

    async fn tolerant(&self, operation: &str, args: &[&str]) -> SysregResult<()> {
        let output = self.virsh(operation, args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = output.stderr_lossy();
        if is_absent_or_stopped(&stderr) {
            debug!("virsh {} tolerated: {}", operation, stderr);
            return Ok(());
        }
        warn!("virsh {} failed: {}", operation, stderr);
        Err(SysregError::vm_operation(operation, stderr))
    }

    /// Live XML description of a defined domain
    pub async fn dump_xml(&self, name: &str) -> SysregResult<String> {
        let output = self.virsh("dumpxml", &["dumpxml", name]).await?;
        if !output.status.success() && is_absent_or_stopped(&output.stderr_lossy()) {
            return Err(SysregError::NotFound {
                resource: format!("domain '{}' on {}", name, self.uri),
            });
        }
        Ok(check_status("dumpxml", output)?.stdout_lossy())
    }
}

fn check_status(operation: &str, output: CommandOutput) -> SysregResult<CommandOutput> {
    if !output.status.success() {
        return Err(SysregError::vm_operation(operation, output.stderr_lossy()));
    }
    Ok(output)
}

/// `esx://[user@]host/[?no_verify=1]`
pub fn esx_uri(creds: &EsxCredentials) -> String {
    let mut uri = String::from("esx://");
    if let Some(user) = &creds.username {
        uri.push_str(user);
        uri.push('@');
    }
    uri.push_str(&creds.host);
    uri.push('/');
    if creds.no_verify {
        uri.push_str("?no_verify=1");
    }
    uri
}

/// Name from `Domain 'x' defined from f.xml` (older virsh omits the quotes)
fn parse_defined_name(stdout: &str) -> Option<String> {
    let line = stdout.lines().find(|l| l.trim_start().starts_with("Domain "))?;
    let rest = line.trim_start().strip_prefix("Domain ")?;
    let name = rest.rsplit_once(" defined from").map(|(name, _)| name)?;
    let name = name.trim().trim_matches('\'');
    (!name.is_empty()).then(|| name.to_string())
}
