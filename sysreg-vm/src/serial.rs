//! Local serial endpoint for backends whose domain connects out to the host

use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tracing::{debug, warn};

use sysreg_core::error::{SysregError, SysregResult};
use sysreg_core::types::ConsoleHandle;

/// Unix socket bound before the domain starts
///
/// The guest may write as soon as it is launched, so the socket has to exist
/// before `launch_machine` returns. The listener is handed out once as a
/// console; the socket file lives until [`close`](SerialListener::close) or
/// drop.
#[derive(Debug)]
pub struct SerialListener {
    path: PathBuf,
    listener: Option<UnixListener>,
}

impl SerialListener {
    /// Bind `path`, replacing a socket file left over by an earlier run
    pub fn bind(path: &Path) -> SysregResult<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale serial socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SysregError::Console {
                    message: format!("cannot remove stale socket {}: {}", path.display(), e),
                })
            }
        }

        let listener = UnixListener::bind(path).map_err(|e| SysregError::Console {
            message: format!("failed to bind serial socket {}: {}", path.display(), e),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            listener: Some(listener),
        })
    }

    /// Hand the listener out as the domain's console
    pub fn take_console(&mut self) -> SysregResult<ConsoleHandle> {
        let listener = self.listener.take().ok_or_else(|| SysregError::Console {
            message: format!("serial socket {} was already handed out", self.path.display()),
        })?;
        Ok(ConsoleHandle::Socket {
            path: self.path.clone(),
            listener,
        })
    }

    /// Remove the socket file
    pub fn close(mut self) {
        self.remove_file();
    }

    fn remove_file(&mut self) {
        self.listener = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove serial socket {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for SerialListener {
    fn drop(&mut self) {
        if self.path.exists() {
            self.remove_file();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("serial.sock");
        std::fs::write(&path, b"").unwrap();

        let serial = SerialListener::bind(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_socket());
        drop(serial);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_console_is_handed_out_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("serial.sock");

        let mut serial = SerialListener::bind(&path).unwrap();
        let console = serial.take_console().unwrap();
        assert!(matches!(console, ConsoleHandle::Socket { .. }));
        assert_eq!(console.path(), path.as_path());

        assert!(serial.take_console().is_err());
    }

    #[tokio::test]
    async fn test_close_removes_socket_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("serial.sock");

        let serial = SerialListener::bind(&path).unwrap();
        serial.close();
        assert!(!path.exists());
    }
}
