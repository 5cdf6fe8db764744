/// Process management for external tools
///
/// This module spawns the bridge tool, the debug server and the debugger
/// client. A process either runs to completion with its output captured, or
/// stays alive and streams its output line by line to a sink.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};

/// How long reader tasks may keep draining pipes after the process exited.
/// Daemonized grandchildren can hold a pipe open indefinitely.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Queued-but-undelivered events before a slow sink is reported
const BACKLOG_WARNING: usize = 1000;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} did not exit within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("Process already started: {0}")]
    AlreadyStarted(String),
    #[error("Process terminated")]
    Terminated,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Signal error: {0}")]
    SignalError(String),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Executable, arguments and working directory of a process to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Arguments joined into the single string used in log entries
    pub fn arg_string(&self) -> String {
        self.args.join(" ")
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a process run to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Delivered to the sink of a streamed process, in emission order.
/// `Exited` is always the last event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Line(OutputLine),
    Exited(Option<i32>),
}

pub type EventSink = Arc<dyn Fn(ProcessEvent) + Send + Sync>;

/// Wrap a closure as an [`EventSink`]
pub fn sink<F>(f: F) -> EventSink
where
    F: Fn(ProcessEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Exited(Option<i32>),
}

/// One external process, configured first and started explicitly
///
/// Dropping a handle whose process is still running kills the process.
pub struct ProcessHandle {
    spec: CommandSpec,
    pid: Option<u32>,
    started_at: Option<SystemTime>,
    state_rx: Option<watch::Receiver<ProcessState>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl ProcessHandle {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            pid: None,
            started_at: None,
            state_rx: None,
            kill_tx: Mutex::new(None),
            stdin: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at
    }

    pub fn state(&self) -> ProcessState {
        self.state_rx
            .as_ref()
            .map_or(ProcessState::NotStarted, |rx| *rx.borrow())
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.state() {
            ProcessState::Exited(code) => code,
            _ => None,
        }
    }

    fn mark_started(&mut self) -> Result<()> {
        if self.state_rx.is_some() {
            return Err(ProcessError::AlreadyStarted(self.spec.to_string()));
        }
        log::info!(
            "Start: {} (args=\"{}\" cwd=\"{}\")",
            self.spec.program.display(),
            self.spec.arg_string(),
            self.spec
                .cwd
                .as_ref()
                .map(|dir| dir.display().to_string())
                .unwrap_or_default()
        );
        self.started_at = Some(SystemTime::now());
        Ok(())
    }

    fn launch_error(&self, source: std::io::Error) -> ProcessError {
        log::error!("Failed to launch {}: {}", self.spec, source);
        ProcessError::Launch {
            program: self.spec.program.display().to_string(),
            source,
        }
    }

    /// Run the process to completion, capturing stdout and stderr.
    /// A process still running when `timeout` elapses is killed.
    pub async fn run_to_completion(&mut self, timeout: Option<Duration>) -> Result<ProcessOutput> {
        self.mark_started()?;
        let started = Instant::now();

        let mut child = self
            .spec
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.launch_error(e))?;

        self.pid = child.id();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        self.state_rx = Some(state_rx);

        let stdout_task = tokio::spawn(read_all(child.stdout.take()));
        let stderr_task = tokio::spawn(read_all(child.stderr.take()));

        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    log::warn!("Timeout: {} after {:?}, killing", self.spec, limit);
                    if let Err(e) = child.kill().await {
                        log::debug!("Kill: {} -> {}", self.spec, e);
                    }
                    stdout_task.abort();
                    stderr_task.abort();
                    state_tx.send_replace(ProcessState::Exited(None));
                    return Err(ProcessError::Timeout {
                        command: self.spec.to_string(),
                        timeout: limit,
                    });
                }
            },
            None => child.wait().await?,
        };

        let exit_code = status.code();
        state_tx.send_replace(ProcessState::Exited(exit_code));

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;
        let elapsed = started.elapsed();

        log::debug!(
            "Exited: {} code={:?} elapsed={:?}",
            self.spec,
            exit_code,
            elapsed
        );

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code,
            elapsed,
        })
    }

    /// Start the process and stream its output to `sink`.
    ///
    /// Output is read by dedicated tasks and queued, so a slow sink delays
    /// delivery but never the process's exit handling. Must be called from
    /// within a tokio runtime.
    pub fn start(&mut self, sink: EventSink) -> Result<()> {
        self.mark_started()?;
        let started = Instant::now();

        let mut child = self
            .spec
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.launch_error(e))?;

        self.pid = child.id();
        log::debug!("Process {} started with PID: {:?}", self.spec, self.pid);

        if let Ok(mut stdin) = self.stdin.lock() {
            *stdin = child.stdin.take();
        }

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ProcessEvent>();
        let backlog = Arc::new(AtomicUsize::new(0));

        let stdout_reader = tokio::spawn(forward_lines(
            child.stdout.take(),
            OutputStream::Stdout,
            event_tx.clone(),
            backlog.clone(),
        ));
        let stderr_reader = tokio::spawn(forward_lines(
            child.stderr.take(),
            OutputStream::Stderr,
            event_tx.clone(),
            backlog.clone(),
        ));

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        if let Ok(mut slot) = self.kill_tx.lock() {
            *slot = Some(kill_tx);
        }

        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        self.state_rx = Some(state_rx);

        // Exit monitor: owns the child, reaps it, then reports the exit
        // after the readers have drained both pipes.
        let description = self.spec.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Fires on an explicit kill and when the handle is dropped
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        log::debug!("Kill: {} -> {}", description, e);
                    }
                    child.wait().await
                }
            };

            let exit_code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    log::warn!("Wait failed for {}: {}", description, e);
                    None
                }
            };
            log::info!(
                "Exited: {} code={:?} elapsed={:?}",
                description,
                exit_code,
                started.elapsed()
            );

            let stdout_abort = stdout_reader.abort_handle();
            let stderr_abort = stderr_reader.abort_handle();
            let drained = tokio::time::timeout(READER_GRACE, async {
                let _ = stdout_reader.await;
                let _ = stderr_reader.await;
            })
            .await;
            if drained.is_err() {
                log::warn!("Output of {} still open after exit, closing", description);
                stdout_abort.abort();
                stderr_abort.abort();
            }

            let _ = event_tx.send(ProcessEvent::Exited(exit_code));
            state_tx.send_replace(ProcessState::Exited(exit_code));
        });

        // Dispatcher: the only place the sink is called
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let exited = matches!(event, ProcessEvent::Exited(_));
                sink(event);
                if exited {
                    break;
                }
                backlog.fetch_sub(1, Ordering::Relaxed);
            }
        });

        Ok(())
    }

    /// Take the write end of the process's standard input
    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.stdin.lock().ok().and_then(|mut stdin| stdin.take())
    }

    /// Wait for the process to exit and return its exit code
    pub async fn wait(&self) -> Option<i32> {
        let mut rx = self.state_rx.clone()?;
        let code = match rx
            .wait_for(|state| matches!(state, ProcessState::Exited(_)))
            .await
        {
            Ok(state) => match *state {
                ProcessState::Exited(code) => code,
                _ => None,
            },
            Err(_) => None,
        };
        code
    }

    /// Force the process to exit. Safe to call repeatedly, before start,
    /// and after the process already exited; failures are only logged.
    pub fn kill(&self) {
        let sender = match self.kill_tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match sender {
            Some(sender) => {
                log::info!("Kill: {}", self.spec);
                if sender.send(()).is_err() {
                    log::debug!("Kill: {} already exited", self.spec);
                }
            }
            None => log::debug!("Kill: {} not running", self.spec),
        }
    }

    /// Send an interrupt (SIGINT / CTRL_C_EVENT) to the process
    pub fn interrupt(&self) -> Result<()> {
        match self.pid {
            Some(pid) if self.is_running() => {
                log::debug!("Sending interrupt to PID: {}", pid);
                send_interrupt_signal(pid)
            }
            _ => Err(ProcessError::Terminated),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_running() {
            self.kill();
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("spec", &self.spec)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

/// Launches processes in either of the two supported modes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    default_timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout: Some(timeout),
        }
    }

    /// Run to completion; `timeout` falls back to the runner's default
    pub async fn run_sync(
        &self,
        spec: CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput> {
        let mut handle = ProcessHandle::new(spec);
        handle
            .run_to_completion(timeout.or(self.default_timeout))
            .await
    }

    /// Start a streamed process; the returned handle owns its lifetime
    pub fn run_async(&self, spec: CommandSpec, sink: EventSink) -> Result<ProcessHandle> {
        let mut handle = ProcessHandle::new(spec);
        handle.start(sink)?;
        Ok(handle)
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buffer).await {
            log::warn!("Output read error: {}", e);
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

async fn collect(task: tokio::task::JoinHandle<String>) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(READER_GRACE, task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            log::warn!("Output reader failed: {}", e);
            String::new()
        }
        Err(_) => {
            log::warn!("Output still open after exit, discarding");
            abort.abort();
            String::new()
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: Option<R>,
    stream: OutputStream,
    events: mpsc::UnboundedSender<ProcessEvent>,
    backlog: Arc<AtomicUsize>,
) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                let text = text.trim_end_matches('\r').to_string();
                let queued = backlog.fetch_add(1, Ordering::Relaxed) + 1;
                if queued % BACKLOG_WARNING == 0 {
                    log::warn!("Output consumer is slow: {} lines queued", queued);
                }
                if events
                    .send(ProcessEvent::Line(OutputLine { stream, text }))
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("{:?} read error: {}", stream, e);
                break;
            }
        }
    }
}

#[cfg(windows)]
fn send_interrupt_signal(pid: u32) -> Result<()> {
    unsafe {
        use winapi::um::wincon::{GenerateConsoleCtrlEvent, CTRL_C_EVENT};

        if GenerateConsoleCtrlEvent(CTRL_C_EVENT, pid) == 0 {
            log::error!("GenerateConsoleCtrlEvent failed for PID {}", pid);
            Err(ProcessError::SignalError("Failed to send Ctrl+C event".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(unix)]
fn send_interrupt_signal(pid: u32) -> Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| ProcessError::SignalError(format!("PID out of range: {pid}")))?;
    let result = unsafe { libc::kill(pid, libc::SIGINT) };
    if result != 0 {
        log::error!("Failed to send SIGINT to PID {}", pid);
        Err(ProcessError::SignalError("Failed to send SIGINT".into()))
    } else {
        Ok(())
    }
}

#[cfg(not(any(windows, unix)))]
fn send_interrupt_signal(_pid: u32) -> Result<()> {
    Err(ProcessError::SignalError(
        "Interrupt not supported on this platform".into(),
    ))
}
