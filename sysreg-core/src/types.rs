use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::SysregError;

/// Virtualization product driving the machine under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Kvm,
    VmwarePlayer,
    VmwareEsx,
    VirtualBox,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Kvm,
        BackendKind::VmwarePlayer,
        BackendKind::VmwareEsx,
        BackendKind::VirtualBox,
    ];

    /// Name used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Kvm => "kvm",
            BackendKind::VmwarePlayer => "vmwareplayer",
            BackendKind::VmwareEsx => "vmwareesx",
            BackendKind::VirtualBox => "virtualbox",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = SysregError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                SysregError::ConfigError(format!(
                    "Unknown VM backend type: '{}'. Available backends: {:?}",
                    s,
                    BackendKind::ALL.map(|k| k.as_str())
                ))
            })
    }
}

/// Outcome of observing one attempt's console output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    CheckpointReached,
    /// No checkpoint seen, but nothing fatal either
    Continue,
    Abort,
}

impl Verdict {
    /// Process exit code handed back to the invoking shell
    pub fn exit_code(&self) -> u8 {
        match self {
            Verdict::CheckpointReached => 0,
            Verdict::Continue => 1,
            Verdict::Abort => 2,
        }
    }

    pub fn status_line(&self) -> &'static str {
        match self {
            Verdict::CheckpointReached => "Reached the checkpoint",
            Verdict::Continue => "Failed to reach the checkpoint",
            Verdict::Abort => "Testing process aborted",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::CheckpointReached => write!(f, "checkpoint-reached"),
            Verdict::Continue => write!(f, "continue"),
            Verdict::Abort => write!(f, "abort"),
        }
    }
}

/// Readable console of a freshly launched domain
///
/// A `Socket` owns the listener that was bound before the domain started, so
/// the guest's first bytes are never lost.
#[derive(Debug)]
pub enum ConsoleHandle {
    /// Pseudo terminal allocated by the hypervisor
    Tty(PathBuf),
    /// Local socket the domain connects out to
    Socket {
        path: PathBuf,
        listener: tokio::net::UnixListener,
    },
}

impl ConsoleHandle {
    pub fn path(&self) -> &std::path::Path {
        match self {
            ConsoleHandle::Tty(path) => path,
            ConsoleHandle::Socket { path, .. } => path,
        }
    }
}
