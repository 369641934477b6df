//! Subprocess orchestration with live stdout/stderr streaming.

use crate::error::{ExecError, StepFailure};
use crate::languages::{LanguageHandler, StepCommand};
use crate::protocol::{FrameSink, OutputFrame};
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info};

const CHUNK_SIZE: usize = 8 * 1024;

/// Removes every literal occurrence of the workspace path from output.
#[derive(Debug, Clone)]
pub struct PathScrubber {
    needle: String,
}

impl PathScrubber {
    pub fn new(workspace: &Path) -> Self {
        Self {
            needle: workspace.to_string_lossy().into_owned(),
        }
    }

    pub fn scrub(&self, text: &str) -> String {
        if self.needle.is_empty() {
            return text.to_string();
        }
        text.replace(&self.needle, "")
    }

    /// Length of the longest suffix of `text` that could be the start of the
    /// path, so it can be held back until the next read completes it.
    fn partial_suffix_len(&self, text: &str) -> usize {
        let max = text.len().min(self.needle.len().saturating_sub(1));
        (1..=max)
            .rev()
            .find(|&k| self.needle.is_char_boundary(k) && text.ends_with(&self.needle[..k]))
            .unwrap_or(0)
    }
}

/// Turns raw pipe reads into scrubbed text.
///
/// A trailing partial UTF-8 character, or a trailing prefix of the workspace
/// path, is held back until the next read so neither is split across frames.
#[derive(Debug)]
struct OutputDecoder {
    scrubber: PathScrubber,
    pending: Vec<u8>,
    held: String,
}

impl OutputDecoder {
    fn new(scrubber: PathScrubber) -> Self {
        Self {
            scrubber,
            pending: Vec::new(),
            held: String::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let rest = self.pending.split_off(complete);
        let decoded = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;

        let mut text = std::mem::take(&mut self.held);
        text.push_str(&decoded);
        let mut text = self.scrubber.scrub(&text);
        let keep = text.len() - self.scrubber.partial_suffix_len(&text);
        self.held = text.split_off(keep);
        text
    }

    fn finish(&mut self) -> String {
        let mut text = std::mem::take(&mut self.held);
        text.push_str(&String::from_utf8_lossy(&self.pending));
        self.pending.clear();
        self.scrubber.scrub(&text)
    }
}

/// Kills the child's whole process group when dropped, unless disarmed.
struct GroupGuard {
    #[cfg_attr(not(unix), allow(dead_code))]
    pid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) {
                if killpg(Pid::from_raw(pid), Signal::SIGKILL).is_ok() {
                    debug!(pid, "Killed process group");
                }
            }
        }
    }
}

/// Run one build or run step inside `workspace`, streaming its output.
///
/// Resolves only on exit code 0. Failures are wrapped by `classify` so build
/// and run steps report distinguishable errors. If the returned future is
/// dropped before completion the process (and its group on unix) is killed.
pub async fn run_step(
    command: &StepCommand,
    workspace: &Path,
    sink: &mut FrameSink,
    classify: fn(StepFailure) -> ExecError,
) -> Result<(), ExecError> {
    let scrubber = PathScrubber::new(workspace);
    info!(command = %scrubber.scrub(&command.to_string()), "Spawning step");

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| classify(StepFailure::Spawn(e)))?;
    let mut guard = GroupGuard { pid: child.id() };

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; CHUNK_SIZE];
    let mut err_buf = vec![0u8; CHUNK_SIZE];
    let mut out_text = OutputDecoder::new(scrubber.clone());
    let mut err_text = OutputDecoder::new(scrubber.clone());

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf) => {
                let n = read.map_err(|e| classify(StepFailure::Io(e)))?;
                let text = if n == 0 {
                    stdout = None;
                    out_text.finish()
                } else {
                    out_text.push(&out_buf[..n])
                };
                if !text.is_empty() {
                    sink.send(OutputFrame::stdout(text)).await?;
                }
            }
            read = read_chunk(&mut stderr, &mut err_buf) => {
                let n = read.map_err(|e| classify(StepFailure::Io(e)))?;
                let text = if n == 0 {
                    stderr = None;
                    err_text.finish()
                } else {
                    err_text.push(&err_buf[..n])
                };
                if !text.is_empty() {
                    sink.send(OutputFrame::stderr(text)).await?;
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| classify(StepFailure::Io(e)))?;
    guard.disarm();
    debug!(?status, "Step exited");
    check_status(status).map_err(classify)
}

/// Run a toolchain check command and return the first line it printed.
pub async fn probe_toolchain(command: &StepCommand) -> Result<String, StepFailure> {
    let output = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(StepFailure::Spawn)?;
    check_status(output.status)?;
    // Some compilers print their version on stderr.
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    Ok(String::from_utf8_lossy(&text)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string())
}

/// Run every toolchain check for `handler`. Reports the first command's
/// version line, or the first check that fails.
pub async fn probe_handler(handler: &dyn LanguageHandler) -> Result<String, StepFailure> {
    let mut version = String::new();
    for (i, command) in handler.check_commands().iter().enumerate() {
        let line = probe_toolchain(command).await?;
        if i == 0 {
            version = line;
        }
    }
    Ok(version)
}

async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

fn check_status(status: ExitStatus) -> Result<(), StepFailure> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(StepFailure::Exit(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(StepFailure::Signal(signal));
        }
    }
    Err(StepFailure::Exit(-1))
}
