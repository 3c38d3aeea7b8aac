//! Run configuration loaded from a TOML document
//!
//! The document is read once at startup and turned into an immutable
//! [`RunConfiguration`]. Nothing in the run loop mutates it afterwards; the
//! global deadline in particular is computed here and never recomputed.
//!
//! ```toml
//! [machine]
//! backend = "kvm"
//! name = "ReactOS_Test"
//! domain_description = "domain.xml"
//! disk_size_mb = 2048
//!
//! [general]
//! timeout_ms = 120000
//! global_timeout = "2h"
//! max_retries = 30
//!
//! [[stage]]
//! boot_device = "cdrom"
//! hook_command = "./prepare-iso.sh"
//!
//! [[stage]]
//! boot_device = "hd"
//! checkpoint = "SYSREG_TESTS_DONE"
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SysregError, SysregResult};
use crate::types::BackendKind;

/// Default configuration file name when none is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = "sysreg.toml";

/// Environment variable selecting the build artifact directory
pub const OUTPUT_DIR_ENV: &str = "ROS_OUTPUT";

/// Artifact directory used when `ROS_OUTPUT` is unset
pub const DEFAULT_OUTPUT_DIR: &str = "output-i386";

/// Disk size used when the configured size is missing or not positive
pub const DEFAULT_DISK_SIZE_MB: u64 = 512;

/// Serial socket used by socket-console backends when none is configured
pub const DEFAULT_SERIAL_SOCKET: &str = "/tmp/sysreg-serial.sock";

pub const MAX_MACHINE_NAME_LEN: usize = 79;
pub const MAX_BOOT_DEVICE_LEN: usize = 7;
pub const MAX_CHECKPOINT_LEN: usize = 79;
pub const MAX_HOOK_COMMAND_LEN: usize = 254;

/// Immutable settings for one regression run
#[derive(Debug, Clone)]
pub struct RunConfiguration {
    pub backend: BackendKind,
    pub machine_name: String,
    /// Externally authored domain description (libvirt XML)
    pub domain_description: PathBuf,
    /// Console inactivity deadline in milliseconds; negative waits forever
    pub timeout_ms: i64,
    /// Absolute wall-clock bound for the whole run, fixed at load time
    pub global_deadline: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub disk_size_mb: u64,
    pub serial_socket: PathBuf,
    pub esx: EsxCredentials,
    /// Identical consecutive console lines tolerated before aborting (0 = off)
    pub max_cache_hits: u32,
    /// Kernel debugger prompts answered with the continue command
    pub max_conts: u32,
    pub console: ConsoleConfig,
    pub stages: Vec<StageConfig>,
    pub output_dir: PathBuf,
}

/// One phase of the test sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    pub boot_device: String,
    /// Shell command run once before the first attempt
    pub hook_command: Option<String>,
    /// Success marker; `None` means a single attempt whatever the verdict
    pub checkpoint: Option<String>,
}

impl StageConfig {
    pub fn new(boot_device: impl Into<String>) -> Self {
        Self {
            boot_device: boot_device.into(),
            hook_command: None,
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.checkpoint = non_empty(Some(checkpoint.into()));
        self
    }

    pub fn with_hook(mut self, command: impl Into<String>) -> Self {
        self.hook_command = non_empty(Some(command.into()));
        self
    }
}

/// Credentials for a remote ESX host
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EsxCredentials {
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Skip TLS certificate verification of the ESX host
    pub no_verify: bool,
}

impl Default for EsxCredentials {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            username: None,
            password: None,
            no_verify: false,
        }
    }
}

impl std::fmt::Debug for EsxCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsxCredentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("no_verify", &self.no_verify)
            .finish()
    }
}

/// Console markers the debug-data processor looks for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Prefix the guest prints in front of a reached checkpoint
    pub checkpoint_prefix: String,
    /// Regexes that end the run when matched
    pub abort_patterns: Vec<String>,
    /// Kernel debugger prompt
    pub debugger_prompt: String,
    /// Command sent to leave the kernel debugger
    pub continue_command: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            checkpoint_prefix: "SYSREG_CHECKPOINT:".to_string(),
            abort_patterns: vec!["SYSREG_ROSAUTOTEST_FAILURE".to_string()],
            debugger_prompt: "kdb:>".to_string(),
            continue_command: "cont".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    machine: MachineSection,
    #[serde(default)]
    general: GeneralSection,
    #[serde(default)]
    console: ConsoleConfig,
    #[serde(default, rename = "stage")]
    stages: Vec<StageSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MachineSection {
    #[serde(default = "default_backend")]
    backend: String,
    name: String,
    domain_description: PathBuf,
    #[serde(default)]
    disk_size_mb: i64,
    serial_socket: Option<PathBuf>,
    #[serde(default)]
    esx: EsxCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct GeneralSection {
    timeout_ms: i64,
    #[serde(with = "humantime_serde")]
    global_timeout: Option<Duration>,
    max_retries: u32,
    max_cache_hits: u32,
    max_conts: u32,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            timeout_ms: -1,
            global_timeout: None,
            max_retries: 0,
            max_cache_hits: 0,
            max_conts: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StageSection {
    boot_device: String,
    hook_command: Option<String>,
    checkpoint: Option<String>,
}

fn default_backend() -> String {
    BackendKind::Kvm.as_str().to_string()
}

/// Trimmed value, `None` when nothing is left
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Artifact directory from `ROS_OUTPUT`, falling back to the default
pub fn output_dir_from_env() -> PathBuf {
    std::env::var_os(OUTPUT_DIR_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
}

impl RunConfiguration {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> SysregResult<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            SysregError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate a TOML document, fixing the global deadline now
    pub fn from_toml_str(contents: &str) -> SysregResult<Self> {
        let file: ConfigFile = toml::from_str(contents)
            .map_err(|e| SysregError::ConfigError(format!("Failed to parse TOML: {}", e)))?;

        let backend: BackendKind = file.machine.backend.parse()?;

        let global_deadline = match file.general.global_timeout {
            Some(offset) => {
                let offset = chrono::Duration::from_std(offset).map_err(|e| {
                    SysregError::validation("general.global_timeout", e.to_string())
                })?;
                Some(Utc::now() + offset)
            }
            None => None,
        };

        let disk_size_mb = if file.machine.disk_size_mb <= 0 {
            DEFAULT_DISK_SIZE_MB
        } else {
            file.machine.disk_size_mb as u64
        };

        let stages = file
            .stages
            .into_iter()
            .map(|s| StageConfig {
                boot_device: s.boot_device.trim().to_string(),
                hook_command: non_empty(s.hook_command),
                checkpoint: non_empty(s.checkpoint),
            })
            .collect();

        let config = Self {
            backend,
            machine_name: file.machine.name.trim().to_string(),
            domain_description: file.machine.domain_description,
            timeout_ms: file.general.timeout_ms,
            global_deadline,
            max_retries: file.general.max_retries,
            disk_size_mb,
            serial_socket: file
                .machine
                .serial_socket
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SERIAL_SOCKET)),
            esx: file.machine.esx,
            max_cache_hits: file.general.max_cache_hits,
            max_conts: file.general.max_conts,
            console: file.console,
            stages,
            output_dir: output_dir_from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> SysregResult<()> {
        if self.machine_name.is_empty() {
            return Err(SysregError::validation("machine.name", "cannot be empty"));
        }
        if self.machine_name.len() > MAX_MACHINE_NAME_LEN {
            return Err(SysregError::validation(
                "machine.name",
                format!("longer than {} bytes", MAX_MACHINE_NAME_LEN),
            ));
        }
        if self.domain_description.as_os_str().is_empty() {
            return Err(SysregError::validation(
                "machine.domain_description",
                "cannot be empty",
            ));
        }
        if self.stages.is_empty() {
            return Err(SysregError::ConfigError(
                "At least one [[stage]] must be configured".to_string(),
            ));
        }

        for (index, stage) in self.stages.iter().enumerate() {
            let field = |name: &str| format!("stage[{}].{}", index + 1, name);

            if stage.boot_device.is_empty() || stage.boot_device.len() > MAX_BOOT_DEVICE_LEN {
                return Err(SysregError::validation(
                    &field("boot_device"),
                    format!("must be 1 to {} bytes long", MAX_BOOT_DEVICE_LEN),
                ));
            }
            if let Some(checkpoint) = &stage.checkpoint {
                if checkpoint.len() > MAX_CHECKPOINT_LEN {
                    return Err(SysregError::validation(
                        &field("checkpoint"),
                        format!("longer than {} bytes", MAX_CHECKPOINT_LEN),
                    ));
                }
            }
            if let Some(hook) = &stage.hook_command {
                if hook.len() > MAX_HOOK_COMMAND_LEN {
                    return Err(SysregError::validation(
                        &field("hook_command"),
                        format!("longer than {} bytes", MAX_HOOK_COMMAND_LEN),
                    ));
                }
            }
        }

        if self.console.checkpoint_prefix.is_empty() {
            return Err(SysregError::validation(
                "console.checkpoint_prefix",
                "cannot be empty",
            ));
        }

        Ok(())
    }

    /// Console inactivity deadline, `None` when unbounded
    pub fn console_timeout(&self) -> Option<Duration> {
        u64::try_from(self.timeout_ms).ok().map(Duration::from_millis)
    }

    /// Whether the advisory global deadline has passed
    pub fn deadline_exceeded(&self) -> bool {
        self.global_deadline
            .map_or(false, |deadline| Utc::now() >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const MINIMAL: &str = r#"
        [machine]
        name = "ReactOS_Test"
        domain_description = "domain.xml"

        [[stage]]
        boot_device = "cdrom"
    "#;

    #[test]
    #[serial]
    fn test_minimal_config_defaults() {
        std::env::remove_var(OUTPUT_DIR_ENV);
        let config = RunConfiguration::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.backend, BackendKind::Kvm);
        assert_eq!(config.machine_name, "ReactOS_Test");
        assert_eq!(config.timeout_ms, -1);
        assert_eq!(config.console_timeout(), None);
        assert_eq!(config.global_deadline, None);
        assert!(!config.deadline_exceeded());
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.disk_size_mb, DEFAULT_DISK_SIZE_MB);
        assert_eq!(config.serial_socket, PathBuf::from(DEFAULT_SERIAL_SOCKET));
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert_eq!(config.stages, vec![StageConfig::new("cdrom")]);
        assert_eq!(config.console, ConsoleConfig::default());
    }

    #[test]
    #[serial]
    fn test_full_config() {
        std::env::set_var(OUTPUT_DIR_ENV, "/srv/build/output");
        let config = RunConfiguration::from_toml_str(
            r#"
            [machine]
            backend = "VMwareESX"
            name = "ReactOS_ESX"
            domain_description = "/etc/sysreg/esx.xml"
            disk_size_mb = 2048

            [machine.esx]
            host = "esx01.lab"
            username = "root"
            password = "hunter2"
            no_verify = true

            [general]
            timeout_ms = 120000
            global_timeout = "2h"
            max_retries = 30
            max_cache_hits = 1000
            max_conts = 5

            [console]
            abort_patterns = ["SYSREG_ROSAUTOTEST_FAILURE", "\\*\\*\\* Fatal System Error"]

            [[stage]]
            boot_device = "cdrom"
            hook_command = "./make-iso.sh"
            checkpoint = ""

            [[stage]]
            boot_device = "hd"
            checkpoint = "SYSREG_TESTS_DONE"
        "#,
        )
        .unwrap();
        std::env::remove_var(OUTPUT_DIR_ENV);

        assert_eq!(config.backend, BackendKind::VmwareEsx);
        assert_eq!(config.disk_size_mb, 2048);
        assert_eq!(config.console_timeout(), Some(Duration::from_millis(120_000)));
        assert_eq!(config.max_retries, 30);
        assert_eq!(config.max_cache_hits, 1000);
        assert_eq!(config.max_conts, 5);
        assert_eq!(config.esx.host, "esx01.lab");
        assert!(config.esx.no_verify);
        assert_eq!(config.console.abort_patterns.len(), 2);
        assert_eq!(config.console.debugger_prompt, "kdb:>");
        assert_eq!(config.output_dir, PathBuf::from("/srv/build/output"));

        assert_eq!(config.stages[0].hook_command.as_deref(), Some("./make-iso.sh"));
        assert_eq!(config.stages[0].checkpoint, None);
        assert_eq!(
            config.stages[1].checkpoint.as_deref(),
            Some("SYSREG_TESTS_DONE")
        );

        let deadline = config.global_deadline.unwrap();
        let remaining = deadline - Utc::now();
        assert!(remaining > chrono::Duration::minutes(119));
        assert!(!config.deadline_exceeded());
    }

    #[test]
    #[serial]
    fn test_password_is_redacted_in_debug_output() {
        let creds = EsxCredentials {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    #[serial]
    fn test_unknown_backend_is_rejected() {
        let err = RunConfiguration::from_toml_str(
            r#"
            [machine]
            backend = "bochs"
            name = "x"
            domain_description = "d.xml"

            [[stage]]
            boot_device = "hd"
        "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown VM backend type"));
    }

    #[test]
    #[serial]
    fn test_no_stages_is_rejected() {
        let err = RunConfiguration::from_toml_str(
            r#"
            [machine]
            name = "x"
            domain_description = "d.xml"
        "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("At least one [[stage]]"));
    }

    #[test]
    #[serial]
    fn test_overlong_boot_device_is_rejected() {
        let err = RunConfiguration::from_toml_str(
            r#"
            [machine]
            name = "x"
            domain_description = "d.xml"

            [[stage]]
            boot_device = "networkboot"
        "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("stage[1].boot_device"));
    }

    #[test]
    #[serial]
    fn test_unknown_field_is_rejected() {
        let result = RunConfiguration::from_toml_str(
            r#"
            [machine]
            name = "x"
            domain_description = "d.xml"
            colour = "blue"

            [[stage]]
            boot_device = "hd"
        "#,
        );
        assert!(matches!(result, Err(SysregError::ConfigError(_))));
    }

    #[test]
    fn test_stage_builder_normalises_empty_strings() {
        let stage = StageConfig::new("hd").with_checkpoint("  ").with_hook("");
        assert_eq!(stage.checkpoint, None);
        assert_eq!(stage.hook_command, None);
    }

    #[test]
    #[serial]
    fn test_stage_markers_are_trimmed() {
        let config = RunConfiguration::from_toml_str(
            r#"
            [machine]
            name = "ReactOS_Test"
            domain_description = "domain.xml"

            [[stage]]
            boot_device = " hd "
            hook_command = "  ./prepare.sh  "
            checkpoint = " SECONDBOOT "
        "#,
        )
        .unwrap();

        let stage = &config.stages[0];
        assert_eq!(stage.boot_device, "hd");
        assert_eq!(stage.hook_command.as_deref(), Some("./prepare.sh"));
        assert_eq!(stage.checkpoint.as_deref(), Some("SECONDBOOT"));

        let stage = StageConfig::new("hd").with_checkpoint("\tTHIRDBOOT_COMPLETE\n");
        assert_eq!(stage.checkpoint.as_deref(), Some("THIRDBOOT_COMPLETE"));
    }

    #[test]
    #[serial]
    fn test_from_file_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunConfiguration::from_file(dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));

        let path = dir.path().join("sysreg.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        assert!(RunConfiguration::from_file(&path).is_ok());
    }
}
