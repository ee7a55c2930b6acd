use crate::errors::{AppError, AppResult};
use crate::escape::compose_command_line;
use crate::recorder::{CaptureStream, Recorder};
use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

const TERM_GRACE: Duration = Duration::from_millis(1_500);
const KILL_GRACE: Duration = Duration::from_secs(2);
// Readers are given this long after process exit to drain the pipes. Orphaned
// grandchildren can keep a pipe open indefinitely; resolution must not wait on
// them.
const STREAM_DRAIN_GRACE: Duration = Duration::from_millis(500);
const READ_CHUNK_BYTES: usize = 4_096;

/// Uniform result for every execution mode. Execution methods resolve to this
/// shape instead of propagating errors; the audit trail keeps the raw error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Wrap the command in a pseudo-terminal so tools that block-buffer when
    /// stdout is not a terminal still emit output line by line. PTY output
    /// arrives merged on the stdout stream.
    pub pty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Stdout(String),
    Stderr(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    Interrupt,
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CancelRequest {
    pub force: bool,
    /// Explicit signal override. When absent: graceful interrupt, or a forced
    /// kill if `force` is set.
    pub signal: Option<TermSignal>,
}

#[derive(Clone)]
enum KillHandle {
    /// Reserved slot between the busy check and a successful spawn.
    Pending,
    Child {
        pid: Option<u32>,
    },
    Pty {
        pid: Option<u32>,
        killer: Arc<StdMutex<Box<dyn portable_pty::ChildKiller + Send + Sync>>>,
    },
}

/// The single in-flight invocation slot of a runner. Idle (`None`) or Running
/// (`Some`); a second streaming invocation is rejected while Running instead of
/// silently replacing the handle.
#[derive(Clone, Default)]
struct ActiveSlot(Arc<StdMutex<Option<KillHandle>>>);

impl ActiveSlot {
    fn try_reserve(&self) -> AppResult<()> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| AppError::Internal("active slot lock poisoned".to_string()))?;
        if guard.is_some() {
            return Err(AppError::Busy(
                "a streaming invocation is already in flight; cancel it or use a separate runner"
                    .to_string(),
            ));
        }
        *guard = Some(KillHandle::Pending);
        Ok(())
    }

    fn set(&self, handle: KillHandle) {
        if let Ok(mut guard) = self.0.lock() {
            *guard = Some(handle);
        }
    }

    fn clear(&self) {
        if let Ok(mut guard) = self.0.lock() {
            *guard = None;
        }
    }

    fn is_active(&self) -> bool {
        self.0.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }

    fn snapshot(&self) -> Option<KillHandle> {
        self.0.lock().ok().and_then(|guard| guard.clone())
    }
}

/// Stateless signal-delivery handle over a runner's active slot. Escalation
/// timing (when a graceful interrupt turns into a forced kill) belongs to the
/// caller.
#[derive(Clone)]
pub struct CancelController {
    slot: ActiveSlot,
}

impl CancelController {
    pub fn has_active_invocation(&self) -> bool {
        self.slot.is_active()
    }

    /// Deliver a termination signal to the active invocation. Returns `false`
    /// when no invocation is active or the signal could not be delivered.
    pub fn cancel_active_invocation(&self, request: CancelRequest) -> bool {
        let Some(handle) = self.slot.snapshot() else {
            return false;
        };
        let signal = request.signal.unwrap_or(if request.force {
            TermSignal::Kill
        } else {
            TermSignal::Interrupt
        });
        deliver_signal(&handle, signal)
    }
}

/// Executes the external analysis tool (and helper commands) as subprocesses.
///
/// An explicit context object: construct one per concern and pass it around;
/// runners never share active-invocation state.
pub struct AgentRunner {
    recorder: Arc<Recorder>,
    agent_binary: String,
    active: ActiveSlot,
}

impl AgentRunner {
    pub fn new(agent_binary: impl Into<String>, recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            agent_binary: agent_binary.into(),
            active: ActiveSlot::default(),
        }
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn cancel_controller(&self) -> CancelController {
        CancelController {
            slot: self.active.clone(),
        }
    }

    /// Run a command to completion through the platform shell, racing the
    /// configured timeout. Never returns an error: every failure mode collapses
    /// into `ExecResult { success: false, .. }`.
    pub async fn execute(&self, command: &str, args: &[String], options: ExecOptions) -> ExecResult {
        let command_line = compose_command_line(command, args);
        let invocation = self.audit_index(command);
        if let Some(index) = invocation {
            let _ = self
                .recorder
                .log_invocation_request(index, &command_line, args, options.cwd.as_deref());
        }

        let started = Instant::now();
        let outcome = execute_shell(&command_line, &options).await;

        if let Some(index) = invocation {
            let _ = self
                .recorder
                .append_capture(index, CaptureStream::Stdout, &outcome.stdout);
            let _ = self
                .recorder
                .append_capture(index, CaptureStream::Stderr, &outcome.stderr);
        }
        let error = outcome.error.clone();
        let result = finish_result(outcome);
        if let Some(index) = invocation {
            let _ = self.recorder.log_invocation_response(
                index,
                result.success,
                result.exit_code,
                started.elapsed().as_millis() as u64,
                &result.stdout,
                &result.stderr,
                error.as_deref(),
            );
        }
        result
    }

    /// Launch a command directly from its argument vector and stream its output
    /// incrementally. There is no timeout on this path: analysis sessions can
    /// legitimately run for minutes, so termination is operator-driven through
    /// the [`CancelController`].
    ///
    /// Returns a busy error when an invocation is already in flight on this
    /// runner. Failures after the slot is reserved resolve through the returned
    /// [`StreamedRun`] instead.
    pub fn stream(
        &self,
        command: &str,
        args: &[String],
        options: StreamOptions,
    ) -> AppResult<StreamedRun> {
        self.active.try_reserve()?;

        let invocation = self.audit_index(command);
        if let Some(index) = invocation {
            let mut command_line = command.to_string();
            for arg in args {
                command_line.push(' ');
                command_line.push_str(arg);
            }
            let _ = self
                .recorder
                .log_invocation_request(index, &command_line, args, options.cwd.as_deref());
        }

        let context = StreamContext {
            recorder: self.recorder.clone(),
            active: self.active.clone(),
            invocation,
            started: Instant::now(),
        };

        let run = if options.pty {
            launch_pty(command, args, &options, context)
        } else {
            launch_piped(command, args, &options, context)
        };
        Ok(run)
    }

    fn audit_index(&self, command: &str) -> Option<u64> {
        if !self.is_agent_command(command) {
            return None;
        }
        self.recorder.next_invocation_index()
    }

    fn is_agent_command(&self, command: &str) -> bool {
        basename(command) == basename(&self.agent_binary)
    }
}

/// One streaming invocation in flight. Chunks arrive in per-stream order over
/// the channel; `wait` resolves to the uniform result once the process closes.
pub struct StreamedRun {
    chunks: mpsc::UnboundedReceiver<StreamChunk>,
    outcome: tokio::task::JoinHandle<ExecResult>,
}

impl StreamedRun {
    /// Next output chunk, or `None` once both streams have closed.
    pub async fn recv(&mut self) -> Option<StreamChunk> {
        self.chunks.recv().await
    }

    /// Await process resolution. Capturing continues even if chunks were never
    /// consumed.
    pub async fn wait(self) -> ExecResult {
        match self.outcome.await {
            Ok(result) => result,
            Err(error) => ExecResult {
                success: false,
                stdout: String::new(),
                stderr: format!("stream task failed: {error}"),
                exit_code: None,
            },
        }
    }

    fn resolved(result: ExecResult) -> Self {
        let (sender, chunks) = mpsc::unbounded_channel();
        drop(sender);
        let outcome = tokio::spawn(async move { result });
        Self { chunks, outcome }
    }
}

struct StreamContext {
    recorder: Arc<Recorder>,
    active: ActiveSlot,
    invocation: Option<u64>,
    started: Instant,
}

impl StreamContext {
    /// Single resolution point for a streaming invocation: clears the active
    /// slot, writes the response entry, and flattens the outcome.
    fn finish(self, outcome: ShellOutcome) -> ExecResult {
        self.active.clear();
        let error = outcome.error.clone();
        let result = finish_result(outcome);
        if let Some(index) = self.invocation {
            let _ = self.recorder.log_invocation_response(
                index,
                result.success,
                result.exit_code,
                self.started.elapsed().as_millis() as u64,
                &result.stdout,
                &result.stderr,
                error.as_deref(),
            );
        }
        result
    }
}

/// Raw outcome of a subprocess before trimming and message synthesis.
struct ShellOutcome {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    success: bool,
    error: Option<String>,
}

impl ShellOutcome {
    fn from_error(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            success: false,
            error: Some(message),
        }
    }
}

fn finish_result(outcome: ShellOutcome) -> ExecResult {
    let stdout = outcome.stdout.trim().to_string();
    let mut stderr = outcome.stderr.trim().to_string();
    if !outcome.success && stderr.is_empty() {
        stderr = if let Some(error) = &outcome.error {
            error.clone()
        } else if let Some(code) = outcome.exit_code {
            format!("process exited with code {code}")
        } else {
            "process terminated without an exit code".to_string()
        };
    }
    ExecResult {
        success: outcome.success,
        stdout,
        stderr,
        exit_code: outcome.exit_code,
    }
}

async fn execute_shell(command_line: &str, options: &ExecOptions) -> ShellOutcome {
    let mut command = shell_command(command_line);
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &options.env {
        command.env(key, value);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            return ShellOutcome::from_error(format!("failed to spawn process: {error}"));
        }
    };

    let stdout_buffer = Arc::new(StdMutex::new(String::new()));
    let stderr_buffer = Arc::new(StdMutex::new(String::new()));
    let stdout_task = collect_stream(child.stdout.take(), stdout_buffer.clone());
    let stderr_task = collect_stream(child.stderr.take(), stderr_buffer.clone());

    let mut timed_out = false;
    let mut error_note = None;
    let wait_result = match options.timeout {
        Some(limit) => match timeout(limit, child.wait()).await {
            Ok(waited) => waited,
            Err(_) => {
                timed_out = true;
                error_note = Some(format!("process timed out after {} ms", limit.as_millis()));
                terminate_then_kill(&mut child).await;
                child.wait().await
            }
        },
        None => child.wait().await,
    };

    if let Some(task) = stdout_task {
        let _ = timeout(STREAM_DRAIN_GRACE, task).await;
    }
    if let Some(task) = stderr_task {
        let _ = timeout(STREAM_DRAIN_GRACE, task).await;
    }
    let stdout = read_buffer(&stdout_buffer);
    let stderr = read_buffer(&stderr_buffer);

    match wait_result {
        Ok(status) => ShellOutcome {
            success: !timed_out && status.code() == Some(0),
            exit_code: status.code(),
            stdout,
            stderr,
            error: error_note,
        },
        Err(error) => ShellOutcome {
            success: false,
            exit_code: None,
            stdout,
            stderr,
            error: Some(format!("failed to wait on process: {error}")),
        },
    }
}

fn launch_piped(
    command: &str,
    args: &[String],
    options: &StreamOptions,
    context: StreamContext,
) -> StreamedRun {
    let mut builder = Command::new(command);
    builder
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &options.cwd {
        builder.current_dir(cwd);
    }
    for (key, value) in &options.env {
        builder.env(key, value);
    }

    let mut child = match builder.spawn() {
        Ok(child) => child,
        Err(error) => {
            let outcome = ShellOutcome::from_error(format!("failed to spawn process: {error}"));
            return StreamedRun::resolved(context.finish(outcome));
        }
    };

    context.active.set(KillHandle::Child { pid: child.id() });

    let (sender, chunks) = mpsc::unbounded_channel();
    let stdout_buffer = Arc::new(StdMutex::new(String::new()));
    let stderr_buffer = Arc::new(StdMutex::new(String::new()));
    let stdout_pump = pump_stream(
        child.stdout.take(),
        CaptureStream::Stdout,
        sender.clone(),
        context.recorder.clone(),
        context.invocation,
        stdout_buffer.clone(),
    );
    let stderr_pump = pump_stream(
        child.stderr.take(),
        CaptureStream::Stderr,
        sender,
        context.recorder.clone(),
        context.invocation,
        stderr_buffer.clone(),
    );

    let outcome = tokio::spawn(async move {
        let wait_result = child.wait().await;
        if let Some(task) = stdout_pump {
            let _ = timeout(STREAM_DRAIN_GRACE, task).await;
        }
        if let Some(task) = stderr_pump {
            let _ = timeout(STREAM_DRAIN_GRACE, task).await;
        }
        let stdout = read_buffer(&stdout_buffer);
        let stderr = read_buffer(&stderr_buffer);
        let outcome = match wait_result {
            Ok(status) => {
                let code = status.code();
                ShellOutcome {
                    success: code == Some(0),
                    exit_code: code,
                    stdout,
                    stderr,
                    error: None,
                }
            }
            Err(error) => ShellOutcome {
                stdout,
                stderr,
                exit_code: None,
                success: false,
                error: Some(format!("stream error: {error}")),
            },
        };
        context.finish(outcome)
    });

    StreamedRun { chunks, outcome }
}

fn launch_pty(
    command: &str,
    args: &[String],
    options: &StreamOptions,
    context: StreamContext,
) -> StreamedRun {
    let pty_system = native_pty_system();
    let PtyPair { master, slave } = match pty_system.openpty(PtySize {
        rows: 30,
        cols: 120,
        pixel_width: 0,
        pixel_height: 0,
    }) {
        Ok(pair) => pair,
        Err(error) => {
            let outcome = ShellOutcome::from_error(format!("failed to open pty: {error}"));
            return StreamedRun::resolved(context.finish(outcome));
        }
    };

    let mut builder = CommandBuilder::new(command);
    builder.args(args);
    if let Some(cwd) = &options.cwd {
        builder.cwd(cwd);
    }
    for (key, value) in &options.env {
        builder.env(key, value);
    }
    if !options.env.contains_key("TERM") {
        builder.env("TERM", "xterm-256color");
    }

    let mut child = match slave.spawn_command(builder) {
        Ok(child) => child,
        Err(error) => {
            let outcome = ShellOutcome::from_error(format!("failed to spawn pty process: {error}"));
            return StreamedRun::resolved(context.finish(outcome));
        }
    };
    // The slave side must close or the master reader never reaches EOF.
    drop(slave);

    let killer = Arc::new(StdMutex::new(child.clone_killer()));
    context.active.set(KillHandle::Pty {
        pid: child.process_id(),
        killer,
    });

    let reader = match master.try_clone_reader() {
        Ok(reader) => reader,
        Err(error) => {
            let _ = child.clone_killer().kill();
            let outcome = ShellOutcome::from_error(format!("failed to open pty reader: {error}"));
            return StreamedRun::resolved(context.finish(outcome));
        }
    };

    // PTY reads are blocking; a dedicated thread feeds the async side.
    let (raw_sender, mut raw_chunks) = mpsc::unbounded_channel::<Result<String, String>>();
    std::thread::spawn(move || {
        let mut reader = reader;
        let mut buffer = [0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(size) => {
                    let text = String::from_utf8_lossy(&buffer[..size]).to_string();
                    if raw_sender.send(Ok(text)).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    let _ = raw_sender.send(Err(error.to_string()));
                    break;
                }
            }
        }
    });

    let (sender, chunks) = mpsc::unbounded_channel();
    let recorder = context.recorder.clone();
    let invocation = context.invocation;
    let output_buffer = Arc::new(StdMutex::new(String::new()));
    let forward_buffer = output_buffer.clone();
    let forward = tokio::spawn(async move {
        while let Some(chunk) = raw_chunks.recv().await {
            match chunk {
                Ok(chunk) => {
                    if let Ok(mut buffer) = forward_buffer.lock() {
                        buffer.push_str(&chunk);
                    }
                    if let Some(index) = invocation {
                        let _ = recorder.append_capture(index, CaptureStream::Stdout, &chunk);
                    }
                    let _ = sender.send(StreamChunk::Stdout(chunk));
                }
                Err(error) => {
                    // Expected at EOF on some platforms once the child exits;
                    // the exit status decides success.
                    tracing::debug!(error = %error, "pty read ended with error");
                    break;
                }
            }
        }
    });

    let outcome = tokio::spawn(async move {
        let wait_result = tokio::task::spawn_blocking(move || child.wait()).await;
        let _ = timeout(STREAM_DRAIN_GRACE, forward).await;
        let stdout = read_buffer(&output_buffer);
        drop(master);
        let outcome = match wait_result {
            Ok(Ok(status)) => ShellOutcome {
                success: status.success(),
                exit_code: i32::try_from(status.exit_code()).ok(),
                stdout,
                stderr: String::new(),
                error: None,
            },
            Ok(Err(error)) => ShellOutcome {
                stdout,
                stderr: String::new(),
                exit_code: None,
                success: false,
                error: Some(format!("failed to wait on pty process: {error}")),
            },
            Err(error) => ShellOutcome {
                stdout,
                stderr: String::new(),
                exit_code: None,
                success: false,
                error: Some(format!("pty wait join failed: {error}")),
            },
        };
        context.finish(outcome)
    });

    StreamedRun { chunks, outcome }
}

fn pump_stream<R>(
    stream: Option<R>,
    capture: CaptureStream,
    sender: mpsc::UnboundedSender<StreamChunk>,
    recorder: Arc<Recorder>,
    invocation: Option<u64>,
    collected: Arc<StdMutex<String>>,
) -> Option<tokio::task::JoinHandle<()>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut stream = stream?;
    Some(tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match stream.read(&mut buffer).await {
                Ok(0) => break,
                Ok(size) => {
                    let chunk = String::from_utf8_lossy(&buffer[..size]).to_string();
                    if let Ok(mut collected) = collected.lock() {
                        collected.push_str(&chunk);
                    }
                    if let Some(index) = invocation {
                        let _ = recorder.append_capture(index, capture, &chunk);
                    }
                    let wrapped = match capture {
                        CaptureStream::Stdout => StreamChunk::Stdout(chunk),
                        CaptureStream::Stderr => StreamChunk::Stderr(chunk),
                    };
                    let _ = sender.send(wrapped);
                }
                Err(error) => {
                    tracing::warn!(stream = capture.as_str(), error = %error, "stream read failed");
                    break;
                }
            }
        }
    }))
}

fn collect_stream<R>(
    stream: Option<R>,
    collected: Arc<StdMutex<String>>,
) -> Option<tokio::task::JoinHandle<()>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut stream = stream?;
    Some(tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match stream.read(&mut buffer).await {
                Ok(0) => break,
                Ok(size) => {
                    if let Ok(mut collected) = collected.lock() {
                        collected.push_str(&String::from_utf8_lossy(&buffer[..size]));
                    }
                }
                Err(_) => break,
            }
        }
    }))
}

fn read_buffer(buffer: &Arc<StdMutex<String>>) -> String {
    buffer.lock().map(|guard| guard.clone()).unwrap_or_default()
}

fn shell_command(command_line: &str) -> Command {
    #[cfg(unix)]
    {
        let mut command = Command::new("sh");
        command.arg("-c").arg(command_line);
        command
    }
    #[cfg(windows)]
    {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(command_line);
        command
    }
}

async fn terminate_then_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            let _ = signal_pid(pid, TermSignal::Terminate);
        }
        #[cfg(windows)]
        {
            let _ = signal_pid(pid, TermSignal::Kill);
        }
    }

    if timeout(TERM_GRACE, child.wait()).await.is_ok() {
        return;
    }
    let _ = child.start_kill();
    let _ = timeout(KILL_GRACE, child.wait()).await;
}

fn deliver_signal(handle: &KillHandle, signal: TermSignal) -> bool {
    match handle {
        KillHandle::Pending => false,
        KillHandle::Child { pid } => match pid {
            Some(pid) => signal_pid(*pid, signal),
            None => false,
        },
        KillHandle::Pty { pid, killer } => {
            if signal == TermSignal::Kill {
                match killer.lock() {
                    Ok(mut killer) => killer.kill().is_ok(),
                    Err(_) => false,
                }
            } else if let Some(pid) = pid {
                signal_pid(*pid, signal)
            } else {
                false
            }
        }
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: TermSignal) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let signal = match signal {
        TermSignal::Interrupt => Signal::SIGINT,
        TermSignal::Terminate => Signal::SIGTERM,
        TermSignal::Kill => Signal::SIGKILL,
    };
    kill(Pid::from_raw(pid as i32), signal).is_ok()
}

#[cfg(windows)]
fn signal_pid(pid: u32, _signal: TermSignal) -> bool {
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .spawn()
        .is_ok()
}

fn basename(command: &str) -> &str {
    Path::new(command)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(command)
}
