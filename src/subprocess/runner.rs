use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::time::Instant;

use super::error::ProcessError;
use crate::cancel::CancelToken;

#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl ProcessCommand {
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    /// The most useful human-readable text: stderr, then stdout, then a fallback
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        "command failed".to_string()
    }

    /// Turn a non-zero exit into [`ProcessError::NonZeroExit`]
    pub fn into_result(self, command: &ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        match self.status {
            ExitStatus::Success => Ok(self),
            ExitStatus::Error(code) | ExitStatus::Signal(code) => Err(ProcessError::NonZeroExit {
                command: command.display(),
                code,
                message: self.message(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            ExitStatus::Signal(_) => None,
        }
    }
}

/// Returned by a progress handler after each output line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressControl {
    Continue,
    Abort,
}

/// Called with every stdout/stderr line of a streaming invocation
pub type ProgressHandler = Arc<dyn Fn(&str) -> ProgressControl + Send + Sync>;

/// Per-invocation streaming and abort hooks
#[derive(Clone, Default)]
pub struct RunOptions {
    pub on_progress: Option<ProgressHandler>,
    pub cancel: Option<CancelToken>,
}

impl RunOptions {
    pub fn with_progress(mut self, handler: ProgressHandler) -> Self {
        self.on_progress = Some(handler);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn report(&self, line: &str) -> ProgressControl {
        match &self.on_progress {
            Some(handler) => handler(line),
            None => ProgressControl::Continue,
        }
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run a command to completion.
    ///
    /// Fails with `Timeout` when the wall-clock bound elapses, `Cancelled`
    /// when the progress handler aborts or the cancel token is set, and
    /// `NonZeroExit` when the command exits unsuccessfully. On timeout and
    /// cancellation the whole process group is killed before returning.
    async fn run(
        &self,
        command: ProcessCommand,
        options: RunOptions,
    ) -> Result<ProcessOutput, ProcessError>;
}

/// Splits a child's output on `\n` and on bare `\r`, so progress bars that
/// redraw one terminal line reach the handler as separate updates. `\r\n`
/// ends a single line.
pub(crate) struct OutputLines<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    after_cr: bool,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
            after_cr: false,
        }
    }

    /// Next line, or `None` at end of stream. Cancel safe: bytes already
    /// consumed stay in `pending` until a delimiter arrives.
    pub(crate) async fn next_line(&mut self) -> Result<Option<String>, std::io::Error> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_pending()));
            }

            match available.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(end) => {
                    let delimiter = available[end];
                    self.pending.extend_from_slice(&available[..end]);
                    self.reader.consume(end + 1);

                    let after_cr = std::mem::replace(&mut self.after_cr, delimiter == b'\r');
                    // Skip redraw prefixes and the `\n` of `\r\n`
                    if self.pending.is_empty() && (delimiter == b'\r' || after_cr) {
                        continue;
                    }
                    return Ok(Some(self.take_pending()));
                }
                None => {
                    let len = available.len();
                    self.pending.extend_from_slice(available);
                    self.reader.consume(len);
                    self.after_cr = false;
                }
            }
        }
    }

    fn take_pending(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned()
    }
}

/// Why the watchdog stopped a running process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Timeout,
    Cancelled,
}

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_millis(200);

pub struct TokioProcessRunner;

impl TokioProcessRunner {
    fn log_command_start(command: &ProcessCommand) {
        tracing::debug!("Executing subprocess: {}", command.display());
        if let Some(ref dir) = command.working_dir {
            tracing::trace!("Working directory: {:?}", dir);
        }
        if let Some(timeout) = command.timeout {
            tracing::trace!("Timeout: {:?}", timeout);
        }
    }

    fn configure_command(command: &ProcessCommand) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&command.program);

        // Own process group so the watchdog can kill the whole subtree
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    fn map_spawn_error(error: std::io::Error, command: &ProcessCommand) -> ProcessError {
        if error.kind() == std::io::ErrorKind::NotFound {
            tracing::error!("Command '{}' not found", command.program);
            ProcessError::CommandNotFound(command.program.clone())
        } else {
            ProcessError::SpawnFailed {
                command: command.display(),
                source: error,
            }
        }
    }

    fn parse_exit_status(status: std::process::ExitStatus) -> ExitStatus {
        if status.success() {
            ExitStatus::Success
        } else if let Some(code) = status.code() {
            ExitStatus::Error(code)
        } else {
            Self::parse_signal_status(status)
        }
    }

    #[cfg(unix)]
    fn parse_signal_status(status: std::process::ExitStatus) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            Some(signal) => ExitStatus::Signal(signal),
            None => ExitStatus::Error(1),
        }
    }

    #[cfg(not(unix))]
    fn parse_signal_status(_status: std::process::ExitStatus) -> ExitStatus {
        ExitStatus::Error(1)
    }

    fn io_error(command: &ProcessCommand, source: std::io::Error) -> ProcessError {
        ProcessError::Io {
            command: command.display(),
            source,
        }
    }

    /// Kill the child and every process in its group, then reap it.
    async fn kill_process_tree(child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;

                let pgid = Pid::from_raw(pid as i32);
                let _ = killpg(pgid, Signal::SIGTERM);
                tokio::time::sleep(TERMINATE_GRACE).await;
                // The leader may be gone while grandchildren survive; always
                // finish the group off.
                let _ = killpg(pgid, Signal::SIGKILL);
            }
        }

        if let Err(e) = child.kill().await {
            tracing::trace!("Child already exited during kill: {}", e);
        }
    }

    /// Pump both output pipes until they close, the deadline passes, or the
    /// caller aborts.
    async fn pump_output(
        stdout: &mut OutputLines<ChildStdout>,
        stderr: &mut OutputLines<ChildStderr>,
        stdout_buf: &mut Vec<String>,
        stderr_buf: &mut Vec<String>,
        deadline: Option<Instant>,
        options: &RunOptions,
    ) -> Result<Option<Termination>, std::io::Error> {
        let mut deadline_timer = deadline_future(deadline);
        let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line? {
                    Some(line) => {
                        let control = options.report(&line);
                        stdout_buf.push(line);
                        if control == ProgressControl::Abort {
                            return Ok(Some(Termination::Cancelled));
                        }
                    }
                    None => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line? {
                    Some(line) => {
                        let control = options.report(&line);
                        stderr_buf.push(line);
                        if control == ProgressControl::Abort {
                            return Ok(Some(Termination::Cancelled));
                        }
                    }
                    None => stderr_open = false,
                },
                _ = &mut deadline_timer => return Ok(Some(Termination::Timeout)),
                _ = ticker.tick() => {
                    if options.cancel_requested() {
                        return Ok(Some(Termination::Cancelled));
                    }
                }
            }
        }

        Ok(None)
    }

    /// Wait for exit after the pipes closed, still honouring deadline and cancel
    async fn wait_for_exit(
        child: &mut Child,
        deadline: Option<Instant>,
        options: &RunOptions,
    ) -> Result<Result<std::process::ExitStatus, Termination>, std::io::Error> {
        let mut deadline_timer = deadline_future(deadline);
        let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);

        loop {
            tokio::select! {
                status = child.wait() => return status.map(Ok),
                _ = &mut deadline_timer => return Ok(Err(Termination::Timeout)),
                _ = ticker.tick() => {
                    if options.cancel_requested() {
                        return Ok(Err(Termination::Cancelled));
                    }
                }
            }
        }
    }

    fn termination_error(termination: Termination, command: &ProcessCommand) -> ProcessError {
        match termination {
            Termination::Timeout => ProcessError::Timeout {
                command: command.display(),
                timeout: command.timeout.unwrap_or_default(),
            },
            Termination::Cancelled => ProcessError::Cancelled {
                command: command.display(),
            },
        }
    }

    fn log_result(result: &ProcessOutput, command: &ProcessCommand) {
        match &result.status {
            ExitStatus::Success => tracing::debug!(
                "Subprocess completed successfully in {:?}: {}",
                result.duration,
                command.display()
            ),
            ExitStatus::Error(code) => {
                tracing::debug!(
                    "Subprocess failed with exit code {} in {:?}: {}",
                    code,
                    result.duration,
                    command.display()
                );
                if !result.stderr.is_empty() {
                    tracing::trace!("Stderr: {}", result.stderr);
                }
            }
            ExitStatus::Signal(signal) => tracing::warn!(
                "Subprocess terminated by signal {} in {:?}: {}",
                signal,
                result.duration,
                command.display()
            ),
        }
    }
}

type DeadlineFuture = Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

fn deadline_future(deadline: Option<Instant>) -> DeadlineFuture {
    match deadline {
        Some(deadline) => Box::pin(tokio::time::sleep_until(deadline)),
        None => Box::pin(std::future::pending()),
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        command: ProcessCommand,
        options: RunOptions,
    ) -> Result<ProcessOutput, ProcessError> {
        let start = std::time::Instant::now();
        let deadline = command.timeout.map(|timeout| Instant::now() + timeout);

        Self::log_command_start(&command);

        let mut child = Self::configure_command(&command)
            .spawn()
            .map_err(|e| Self::map_spawn_error(e, &command))?;

        let missing = |name: &str| {
            std::io::Error::other(format!("{} was not captured", name))
        };
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Self::io_error(&command, missing("stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Self::io_error(&command, missing("stderr")))?;
        let mut stdout_lines = OutputLines::new(stdout);
        let mut stderr_lines = OutputLines::new(stderr);
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let pumped = Self::pump_output(
            &mut stdout_lines,
            &mut stderr_lines,
            &mut stdout_buf,
            &mut stderr_buf,
            deadline,
            &options,
        )
        .await;

        let waited = match pumped {
            Ok(None) => Self::wait_for_exit(&mut child, deadline, &options).await,
            Ok(Some(termination)) => Ok(Err(termination)),
            Err(e) => {
                Self::kill_process_tree(&mut child).await;
                return Err(Self::io_error(&command, e));
            }
        };

        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(termination)) => {
                tracing::warn!(
                    "Watchdog terminating {:?} subprocess after {:?}: {}",
                    termination,
                    start.elapsed(),
                    command.display()
                );
                Self::kill_process_tree(&mut child).await;
                return Err(Self::termination_error(termination, &command));
            }
            Err(e) => {
                Self::kill_process_tree(&mut child).await;
                return Err(Self::io_error(&command, e));
            }
        };

        let result = ProcessOutput {
            status: Self::parse_exit_status(status),
            stdout: stdout_buf.join("\n"),
            stderr: stderr_buf.join("\n"),
            duration: start.elapsed(),
        };
        Self::log_result(&result, &command);
        result.into_result(&command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_prefers_stderr() {
        let output = ProcessOutput {
            status: ExitStatus::Error(1),
            stdout: "nothing to commit, working tree clean".to_string(),
            stderr: "  ".to_string(),
            duration: Duration::ZERO,
        };
        assert_eq!(output.message(), "nothing to commit, working tree clean");

        let output = ProcessOutput {
            stderr: "fatal: bad revision".to_string(),
            ..output
        };
        assert_eq!(output.message(), "fatal: bad revision");
    }

    #[test]
    fn test_into_result_maps_exit_code() {
        let command = crate::subprocess::ProcessCommandBuilder::new("git")
            .arg("commit")
            .build();
        let output = ProcessOutput {
            status: ExitStatus::Error(1),
            stdout: String::new(),
            stderr: "boom".to_string(),
            duration: Duration::ZERO,
        };
        match output.into_result(&command) {
            Err(ProcessError::NonZeroExit {
                command,
                code,
                message,
            }) => {
                assert_eq!(command, "git commit");
                assert_eq!(code, 1);
                assert_eq!(message, "boom");
            }
            other => panic!("expected NonZeroExit, got {:?}", other),
        }
    }

    #[test]
    fn test_exit_status_code() {
        assert_eq!(ExitStatus::Success.code(), Some(0));
        assert_eq!(ExitStatus::Error(3).code(), Some(3));
        assert_eq!(ExitStatus::Signal(9).code(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_exit_status() {
        use std::os::unix::process::ExitStatusExt;

        let status = std::process::ExitStatus::from_raw(0);
        assert_eq!(TokioProcessRunner::parse_exit_status(status), ExitStatus::Success);

        let status = std::process::ExitStatus::from_raw(256);
        assert_eq!(TokioProcessRunner::parse_exit_status(status), ExitStatus::Error(1));

        let status = std::process::ExitStatus::from_raw(9);
        assert_eq!(TokioProcessRunner::parse_exit_status(status), ExitStatus::Signal(9));
    }
}
