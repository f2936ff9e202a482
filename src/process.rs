use crate::adapters::ValidatedCommand;
use crate::errors::{AppError, AppResult};
use crate::harness::line_buffer::LineBuffer;
use crate::harness::tool_missing::spawn_error;
use std::io::Read;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use wait_timeout::ChildExt;

const MAX_TOOL_LINE_BYTES: usize = 16 * 1024;
const KILL_WAIT: Duration = Duration::from_secs(5);

/// How a tracked process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was gone before any signal was sent.
    AlreadyExited,
    /// It honoured the graceful signal within the grace period.
    Terminated,
    /// It had to be force-killed.
    Killed,
}

/// A long-running external tool whose output is forwarded to the log.
///
/// Stdin stays open for the life of the process: the REPL-style instrumentation tools
/// detach and exit on EOF.
pub struct TrackedProcess {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    output_tasks: Vec<JoinHandle<()>>,
}

impl TrackedProcess {
    pub fn spawn(command: &ValidatedCommand, label: &str) -> AppResult<Self> {
        let mut builder = Command::new(&command.program);
        builder
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            builder.current_dir(cwd);
        }
        for (key, value) in &command.env {
            builder.env(key, value);
        }

        let mut child = builder
            .spawn()
            .map_err(|error| spawn_error(&command.program, &error))?;
        tracing::debug!(process = %label, pid = ?child.id(), command = %command.display(), "spawned tool");

        let stdin = child.stdin.take();
        let mut output_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            output_tasks.push(forward_output(stdout, label.to_string(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            output_tasks.push(forward_output(stderr, label.to_string(), "stderr"));
        }

        Ok(Self {
            label: label.to_string(),
            child,
            stdin,
            output_tasks,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Exit code if the process has already ended, without blocking.
    pub fn exit_status(&mut self) -> AppResult<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Sends the graceful signal, waits up to `grace`, then force-kills once.
    pub async fn terminate_then_kill(mut self, grace: Duration) -> AppResult<Termination> {
        let pid = self.child.id();
        let outcome = terminate_then_kill(&mut self.child, grace).await?;
        drop(self.stdin.take());
        for task in self.output_tasks.drain(..) {
            let _ = timeout(Duration::from_secs(1), task).await;
        }
        tracing::debug!(process = %self.label, pid = ?pid, termination = ?outcome, "tool stopped");
        Ok(outcome)
    }
}

async fn terminate_then_kill(child: &mut Child, grace: Duration) -> AppResult<Termination> {
    if child.try_wait()?.is_some() {
        return Ok(Termination::AlreadyExited);
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    if timeout(grace, child.wait()).await.is_ok() {
        return Ok(Termination::Terminated);
    }

    child.start_kill()?;
    if timeout(KILL_WAIT, child.wait()).await.is_err() {
        return Err(AppError::Timeout(format!(
            "process {:?} survived a forced kill",
            child.id()
        )));
    }
    Ok(Termination::Killed)
}

fn forward_output<R>(mut stream: R, label: String, stream_name: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineBuffer::new(MAX_TOOL_LINE_BYTES);
        let mut chunk = [0_u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    for line in lines.push(&String::from_utf8_lossy(&chunk[..read])) {
                        tracing::debug!(process = %label, stream = stream_name, "{}", line);
                    }
                }
            }
        }
        if let Some(line) = lines.finish() {
            tracing::debug!(process = %label, stream = stream_name, "{}", line);
        }
    })
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    fn from_status(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            status: status.code(),
            success: status.success(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }
    }

    /// Turns a non-zero exit into a recoverable tool error.
    pub fn into_success(self, what: &str) -> AppResult<Self> {
        if self.success {
            return Ok(self);
        }
        let detail = [self.stderr.trim(), self.stdout.trim()]
            .into_iter()
            .find(|text| !text.is_empty())
            .unwrap_or("no output");
        Err(AppError::Tool(format!(
            "{} exited with {:?}: {}",
            what,
            self.status,
            crate::harness::line_buffer::strip_ansi(detail)
        )))
    }
}

/// Runs a short tool invocation to completion, killing it when `limit` elapses.
pub async fn run_tool(command: &ValidatedCommand, limit: Duration) -> AppResult<ToolOutput> {
    let mut builder = Command::new(&command.program);
    builder
        .args(&command.args)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if let Some(cwd) = &command.cwd {
        builder.current_dir(cwd);
    }
    for (key, value) in &command.env {
        builder.env(key, value);
    }

    let output = match timeout(limit, builder.output()).await {
        Ok(result) => result.map_err(|error| spawn_error(&command.program, &error))?,
        Err(_) => {
            return Err(AppError::Timeout(format!(
                "'{}' did not finish within {}s",
                command.display(),
                limit.as_secs()
            )))
        }
    };
    Ok(ToolOutput::from_status(output.status, output.stdout, output.stderr))
}

/// Blocking counterpart of [`run_tool`] for the sequential download loop.
///
/// With `inherit_output` the tool writes straight to the terminal and the captured
/// streams stay empty.
pub fn run_tool_blocking(
    command: &ValidatedCommand,
    limit: Duration,
    inherit_output: bool,
) -> AppResult<ToolOutput> {
    let mut builder = std::process::Command::new(&command.program);
    builder.args(&command.args).stdin(Stdio::null());
    if inherit_output {
        builder.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    } else {
        builder.stdout(Stdio::piped()).stderr(Stdio::piped());
    }
    if let Some(cwd) = &command.cwd {
        builder.current_dir(cwd);
    }
    for (key, value) in &command.env {
        builder.env(key, value);
    }

    let mut child = builder
        .spawn()
        .map_err(|error| spawn_error(&command.program, &error))?;

    // Drain pipes on helper threads so a chatty tool cannot block on a full pipe.
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let status = match child.wait_timeout(limit)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AppError::Timeout(format!(
                "'{}' did not finish within {}s",
                command.display(),
                limit.as_secs()
            )));
        }
    };

    let stdout = stdout_reader.map(join_reader).unwrap_or_default();
    let stderr = stderr_reader.map(join_reader).unwrap_or_default();
    Ok(ToolOutput::from_status(status, stdout, stderr))
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer);
        buffer
    })
}

fn join_reader(handle: std::thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::{run_tool, run_tool_blocking, Termination, TrackedProcess};
    use crate::adapters::ValidatedCommand;
    use crate::errors::AppError;
    use std::time::Duration;

    #[tokio::test]
    async fn cooperative_process_is_terminated_gracefully() {
        let process = TrackedProcess::spawn(&ValidatedCommand::new("sleep", ["30"]), "sleep")
            .expect("spawn sleep");
        let outcome = process
            .terminate_then_kill(Duration::from_secs(5))
            .await
            .expect("terminate");
        assert_eq!(outcome, Termination::Terminated);
    }

    #[tokio::test]
    async fn tool_waiting_on_stdin_outlives_the_window() {
        let command = ValidatedCommand::new("bash", ["-c", "while read -r line; do :; done; echo eof-exit"]);
        let mut process = TrackedProcess::spawn(&command, "repl").expect("spawn bash");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(process.exit_status().expect("status").is_none());
        let outcome = process
            .terminate_then_kill(Duration::from_secs(5))
            .await
            .expect("terminate");
        assert_eq!(outcome, Termination::Terminated);
    }

    #[tokio::test]
    async fn exited_process_reports_its_status() {
        let mut process = TrackedProcess::spawn(&ValidatedCommand::new("false", Vec::<String>::new()), "false")
            .expect("spawn false");
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = process.exit_status().expect("status").expect("exited");
        assert!(!status.success());
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace_period() {
        let command = ValidatedCommand::new("bash", ["-c", "trap '' TERM; echo ready; sleep 5"]);
        let process = TrackedProcess::spawn(&command, "stubborn").expect("spawn bash");
        // Let bash install the trap before signalling it.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let outcome = process
            .terminate_then_kill(Duration::from_millis(300))
            .await
            .expect("terminate");
        assert_eq!(outcome, Termination::Killed);
    }

    #[tokio::test]
    async fn exited_process_gets_no_signal() {
        let process = TrackedProcess::spawn(&ValidatedCommand::new("true", Vec::<String>::new()), "true")
            .expect("spawn true");
        tokio::time::sleep(Duration::from_millis(300)).await;
        let outcome = process
            .terminate_then_kill(Duration::from_millis(300))
            .await
            .expect("terminate");
        assert_eq!(outcome, Termination::AlreadyExited);
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_tool_missing() {
        let command = ValidatedCommand::new("pinlab-definitely-missing-tool", ["--version"]);
        assert!(matches!(
            TrackedProcess::spawn(&command, "missing"),
            Err(AppError::ToolMissing(_))
        ));
        assert!(matches!(
            run_tool(&command, Duration::from_secs(5)).await,
            Err(AppError::ToolMissing(_))
        ));
    }

    #[tokio::test]
    async fn run_tool_captures_output_and_enforces_limit() {
        let output = run_tool(
            &ValidatedCommand::new("bash", ["-c", "echo out; echo err >&2; exit 3"]),
            Duration::from_secs(5),
        )
        .await
        .expect("run");
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        let err = output.into_success("bash").expect_err("non-zero exit");
        assert!(err.to_string().contains("err"));

        let slow = run_tool(&ValidatedCommand::new("sleep", ["5"]), Duration::from_millis(200)).await;
        assert!(matches!(slow, Err(AppError::Timeout(_))));
    }

    #[test]
    fn blocking_runner_respects_cwd_and_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = run_tool_blocking(
            &ValidatedCommand::new("pwd", Vec::<String>::new()).in_dir(dir.path()),
            Duration::from_secs(5),
            false,
        )
        .expect("pwd");
        assert!(output.success);
        let reported = std::fs::canonicalize(output.stdout.trim()).expect("canonical pwd");
        assert_eq!(reported, std::fs::canonicalize(dir.path()).expect("canonical dir"));

        let slow = run_tool_blocking(&ValidatedCommand::new("sleep", ["5"]), Duration::from_millis(200), false);
        assert!(matches!(slow, Err(AppError::Timeout(_))));
    }
}
