use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// One external program invocation
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec<'a> {
    pub program: &'a str,
    pub args: &'a [&'a str],
    pub envs: &'a [(&'a str, &'a str)],
}

impl<'a> CommandSpec<'a> {
    pub fn new(program: &'a str, args: &'a [&'a str]) -> Self {
        Self {
            program,
            args,
            envs: &[],
        }
    }

    pub fn envs(mut self, envs: &'a [(&'a str, &'a str)]) -> Self {
        self.envs = envs;
        self
    }
}

impl std::fmt::Display for CommandSpec<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

pub struct CommandOutput {
    pub status: std::process::ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Trait for executing commands - allows mocking in tests
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, spec: CommandSpec<'_>) -> Result<CommandOutput, std::io::Error>;
}

/// Default command executor that runs real commands
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn execute(&self, spec: CommandSpec<'_>) -> Result<CommandOutput, std::io::Error> {
        let mut cmd = Command::new(spec.program);
        cmd.args(spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in spec.envs {
            cmd.env(key, value);
        }

        let output = cmd.output().await?;

        Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::Arc;

    /// One recorded invocation: program, args and environment
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Invocation {
        pub program: String,
        pub args: Vec<String>,
        pub envs: Vec<(String, String)>,
    }

    impl Invocation {
        pub fn line(&self) -> String {
            std::iter::once(self.program.as_str())
                .chain(self.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        }
    }

    type Responder = Box<dyn Fn(&Invocation) -> (i32, String, String) + Send + Sync>;

    /// Mock command executor for testing
    ///
    /// The responder maps an invocation to (exit code, stdout, stderr).
    pub struct MockCommandExecutor {
        pub invocations: Arc<Mutex<Vec<Invocation>>>,
        responder: Responder,
    }

    impl MockCommandExecutor {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&Invocation) -> (i32, String, String) + Send + Sync + 'static,
        {
            Self {
                invocations: Arc::new(Mutex::new(Vec::new())),
                responder: Box::new(responder),
            }
        }

        pub fn succeeding() -> Self {
            Self::new(|_| (0, String::new(), String::new()))
        }
    }

    #[async_trait]
    impl CommandExecutor for MockCommandExecutor {
        async fn execute(&self, spec: CommandSpec<'_>) -> Result<CommandOutput, std::io::Error> {
            let invocation = Invocation {
                program: spec.program.to_string(),
                args: spec.args.iter().map(|a| a.to_string()).collect(),
                envs: spec
                    .envs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            };
            let (code, stdout, stderr) = (self.responder)(&invocation);
            self.invocations.lock().push(invocation);

            Ok(CommandOutput {
                // Raw wait status: exit code lives in the high byte
                status: std::process::ExitStatus::from_raw(code << 8),
                stdout: stdout.into_bytes(),
                stderr: stderr.into_bytes(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_executor_captures_output() {
        let output = SystemCommandExecutor
            .execute(CommandSpec::new("sh", &["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();

        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout_lossy().trim(), "out");
        assert_eq!(output.stderr_lossy(), "err");
    }

    #[tokio::test]
    async fn test_system_executor_passes_environment() {
        let output = SystemCommandExecutor
            .execute(
                CommandSpec::new("sh", &["-c", "printf %s \"$SYSREG_MARKER\""])
                    .envs(&[("SYSREG_MARKER", "42")]),
            )
            .await
            .unwrap();

        assert!(output.status.success());
        assert_eq!(output.stdout_lossy(), "42");
    }

    #[test]
    fn test_command_spec_display() {
        let spec = CommandSpec::new("virsh", &["-c", "qemu:///session", "list"]);
        assert_eq!(spec.to_string(), "virsh -c qemu:///session list");
    }
}
