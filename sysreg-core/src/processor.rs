use async_trait::async_trait;
use std::time::Duration;

use crate::error::SysregResult;
use crate::types::{ConsoleHandle, Verdict};

/// What one attempt is looking for on the console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationRequest<'a> {
    /// 1-based stage number
    pub stage: usize,
    /// 0-based attempt within the stage
    pub attempt: u32,
    pub checkpoint: Option<&'a str>,
    /// Inactivity deadline; `None` waits until the console closes
    pub timeout: Option<Duration>,
}

/// Classifies a live console stream into a [`Verdict`]
///
/// Running out of time is not an error: the processor answers
/// [`Verdict::Continue`] and leaves the retry decision to the caller. Errors
/// are reserved for consoles that cannot be opened at all.
#[async_trait]
pub trait DebugDataProcessor: Send {
    async fn process(
        &mut self,
        console: ConsoleHandle,
        request: ObservationRequest<'_>,
    ) -> SysregResult<Verdict>;
}

/// Runs a stage's hook command before its first attempt
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Fails on spawn errors and non-zero exits alike
    async fn run_hook(&self, command: &str) -> SysregResult<()>;
}
