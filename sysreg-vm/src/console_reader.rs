//! Console reader for guest serial output
//!
//! Turns the raw byte stream of one attempt into a [`Verdict`]. The reader
//! answers kernel debugger prompts, spots guests stuck printing the same line
//! and keeps a transcript of everything it saw.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use sysreg_core::config::RunConfiguration;
use sysreg_core::error::{SysregError, SysregResult};
use sysreg_core::processor::{DebugDataProcessor, ObservationRequest};
use sysreg_core::types::{ConsoleHandle, Verdict};

mod constants {
    /// Read chunk size
    pub const BUFFER_SIZE: usize = 4096;

    /// Line terminator sent after the debugger continue command
    pub const COMMAND_TERMINATOR: &str = "\r";
}

trait ConsoleStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConsoleStream for T {}

/// Counters that live for one attempt
#[derive(Debug, Default)]
struct AttemptState {
    last_line: Option<String>,
    repeats: u32,
    conts_sent: u32,
}

enum LineOutcome {
    Verdict(Verdict),
    DebuggerPrompt,
    Nothing,
}

/// [`DebugDataProcessor`] reading a tty or an accepted serial socket
pub struct ConsoleReader {
    checkpoint_prefix: String,
    abort_patterns: Vec<Regex>,
    debugger_prompt: String,
    continue_command: String,
    max_conts: u32,
    max_cache_hits: u32,
    transcript_dir: Option<PathBuf>,
}

impl ConsoleReader {
    pub fn new(config: &RunConfiguration) -> SysregResult<Self> {
        let abort_patterns = config
            .console
            .abort_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    SysregError::validation(
                        "console.abort_patterns",
                        format!("Invalid regex '{}': {}", pattern, e),
                    )
                })
            })
            .collect::<SysregResult<Vec<_>>>()?;

        Ok(Self {
            checkpoint_prefix: config.console.checkpoint_prefix.clone(),
            abort_patterns,
            debugger_prompt: config.console.debugger_prompt.clone(),
            continue_command: config.console.continue_command.clone(),
            max_conts: config.max_conts,
            max_cache_hits: config.max_cache_hits,
            transcript_dir: None,
        })
    }

    /// Append every attempt's raw output under `dir`
    pub fn with_transcript_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transcript_dir = Some(dir.into());
        self
    }

    async fn open(
        &self,
        console: ConsoleHandle,
        wait: Option<Duration>,
    ) -> SysregResult<Option<Box<dyn ConsoleStream>>> {
        match console {
            ConsoleHandle::Tty(path) => {
                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .await
                    .map_err(|e| SysregError::Console {
                        message: format!("Failed to open console {}: {}", path.display(), e),
                    })?;
                debug!("Opened console {}", path.display());
                Ok(Some(Box::new(file)))
            }
            ConsoleHandle::Socket { path, listener } => {
                let accepted = match wait {
                    Some(wait) => match timeout(wait, listener.accept()).await {
                        Ok(accepted) => accepted,
                        Err(_) => {
                            info!("Guest did not connect to {} within {:?}", path.display(), wait);
                            return Ok(None);
                        }
                    },
                    None => listener.accept().await,
                };
                let (stream, _) = accepted.map_err(|e| SysregError::Console {
                    message: format!("Failed to accept on {}: {}", path.display(), e),
                })?;
                debug!("Guest connected to {}", path.display());
                Ok(Some(Box::new(stream)))
            }
        }
    }

    async fn open_transcript(&self, request: &ObservationRequest<'_>) -> Option<tokio::fs::File> {
        let dir = self.transcript_dir.as_ref()?;
        let path = dir.join(format!(
            "sysreg-stage{}-attempt{}.log",
            request.stage, request.attempt
        ));

        match create_transcript(dir, &path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Cannot write transcript {}: {}", path.display(), e);
                None
            }
        }
    }

    fn classify_line(
        &self,
        line: &str,
        checkpoint: Option<&str>,
        state: &mut AttemptState,
    ) -> LineOutcome {
        if let Some(checkpoint) = checkpoint {
            if let Some(pos) = line.find(&self.checkpoint_prefix) {
                let reached = line[pos + self.checkpoint_prefix.len()..].trim();
                if reached.starts_with(checkpoint) {
                    info!("Reached checkpoint '{}'", checkpoint);
                    return LineOutcome::Verdict(Verdict::CheckpointReached);
                }
                debug!("Passed checkpoint '{}'", reached);
            }
        }

        if let Some(pattern) = self.abort_patterns.iter().find(|p| p.is_match(line)) {
            warn!("Abort pattern '{}' matched: {}", pattern.as_str(), line);
            return LineOutcome::Verdict(Verdict::Abort);
        }

        if line.contains(&self.debugger_prompt) {
            return LineOutcome::DebuggerPrompt;
        }

        if line.trim().is_empty() {
            return LineOutcome::Nothing;
        }
        if state.last_line.as_deref() == Some(line) {
            state.repeats += 1;
            if self.max_cache_hits > 0 && state.repeats > self.max_cache_hits {
                warn!(
                    "Line repeated {} times, guest seems stuck: {}",
                    state.repeats, line
                );
                return LineOutcome::Verdict(Verdict::Abort);
            }
        } else {
            state.last_line = Some(line.to_string());
            state.repeats = 0;
        }

        LineOutcome::Nothing
    }

    /// Verdict for output that stopped without a line terminator
    fn classify_tail(
        &self,
        pending: &[u8],
        checkpoint: Option<&str>,
        state: &mut AttemptState,
    ) -> Verdict {
        if pending.is_empty() {
            return Verdict::Continue;
        }
        let line = String::from_utf8_lossy(pending);
        match self.classify_line(line.trim_end_matches('\r'), checkpoint, state) {
            LineOutcome::Verdict(verdict) => verdict,
            LineOutcome::DebuggerPrompt | LineOutcome::Nothing => Verdict::Continue,
        }
    }

    /// `Some(Abort)` once the continue budget is spent
    async fn answer_prompt(
        &self,
        stream: &mut dyn ConsoleStream,
        state: &mut AttemptState,
    ) -> Option<Verdict> {
        if state.conts_sent >= self.max_conts {
            warn!(
                "Entered kernel debugger {} times, aborting",
                state.conts_sent + 1
            );
            return Some(Verdict::Abort);
        }

        state.conts_sent += 1;
        info!(
            "Kernel debugger prompt, sending '{}' ({}/{})",
            self.continue_command, state.conts_sent, self.max_conts
        );
        let command = format!("{}{}", self.continue_command, constants::COMMAND_TERMINATOR);
        if let Err(e) = stream.write_all(command.as_bytes()).await {
            warn!("Failed to answer debugger prompt: {}", e);
            return Some(Verdict::Abort);
        }
        if let Err(e) = stream.flush().await {
            warn!("Failed to flush debugger answer: {}", e);
            return Some(Verdict::Abort);
        }
        None
    }

    async fn read_until_verdict(
        &self,
        stream: &mut dyn ConsoleStream,
        request: &ObservationRequest<'_>,
        mut transcript: Option<tokio::fs::File>,
    ) -> Verdict {
        let mut buf = vec![0u8; constants::BUFFER_SIZE];
        let mut pending: Vec<u8> = Vec::new();
        let mut state = AttemptState::default();

        loop {
            let read = match request.timeout {
                Some(wait) => match timeout(wait, stream.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        info!("No console output for {:?}", wait);
                        return self.classify_tail(&pending, request.checkpoint, &mut state);
                    }
                },
                None => stream.read(&mut buf).await,
            };

            let n = match read {
                Ok(0) => {
                    debug!("Console closed");
                    return self.classify_tail(&pending, request.checkpoint, &mut state);
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("Error reading console: {}", e);
                    return self.classify_tail(&pending, request.checkpoint, &mut state);
                }
            };

            if let Some(file) = transcript.as_mut() {
                if let Err(e) = file.write_all(&buf[..n]).await {
                    warn!("Transcript write failed, disabling: {}", e);
                    transcript = None;
                }
            }

            pending.extend_from_slice(&buf[..n]);
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(&['\r', '\n'][..]);
                debug!("Console output: {}", line);

                match self.classify_line(line, request.checkpoint, &mut state) {
                    LineOutcome::Verdict(verdict) => return verdict,
                    LineOutcome::DebuggerPrompt => {
                        if let Some(verdict) = self.answer_prompt(stream, &mut state).await {
                            return verdict;
                        }
                    }
                    LineOutcome::Nothing => {}
                }
            }

            // The debugger prompt waits for input without a newline
            if String::from_utf8_lossy(&pending).contains(&self.debugger_prompt) {
                pending.clear();
                if let Some(verdict) = self.answer_prompt(stream, &mut state).await {
                    return verdict;
                }
            }
        }
    }
}

async fn create_transcript(dir: &Path, path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

#[async_trait]
impl DebugDataProcessor for ConsoleReader {
    async fn process(
        &mut self,
        console: ConsoleHandle,
        request: ObservationRequest<'_>,
    ) -> SysregResult<Verdict> {
        let Some(mut stream) = self.open(console, request.timeout).await? else {
            return Ok(Verdict::Continue);
        };
        let transcript = self.open_transcript(&request).await;

        let verdict = self
            .read_until_verdict(stream.as_mut(), &request, transcript)
            .await;
        debug!(
            "Stage {} attempt {} classified as {}",
            request.stage, request.attempt, verdict
        );
        Ok(verdict)
    }
}
