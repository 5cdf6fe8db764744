/// Debug session orchestration
///
/// A session pairs one device with a debug server and an MI debugger client.
/// Every operation is a transition of [`SessionState`]: [`plan`] decides what
/// an operation means in the current state, and [`SessionOrchestrator`]
/// carries it out. Operations are serialized, so a repeated call observes
/// the state the first one reached and does nothing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::commands::{CommandError, MiCommands};
use crate::communication::{CommunicationError, MiChannel};
use crate::config::BridgeConfig;
use crate::device::{AdbBridge, Device, DeviceError};
use crate::events::{ConsoleLog, EventHub, ExecutionInfo, MiEvent, TargetState};
use crate::process::{self, CommandSpec, ProcessError, ProcessEvent, ProcessHandle, ProcessRunner};
use crate::registry::{DeviceListener, DeviceRegistry, ListenerId};
use crate::types::{RecordKind, ResultRecord};

/// How long a detached client may take to exit before it is killed
const CLIENT_EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Idle,
    ServerStarting,
    ServerRunning,
    ClientAttaching,
    Attached,
    Continuing,
    /// The target is gone; only detach and terminate remain
    Stopped,
    Detaching,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    StartServer,
    AttachClient,
    Continue,
    Detach,
    Terminate,
}

/// Work an operation performs once its intermediate state is entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    SpawnServer,
    SpawnClient,
    SendContinue,
    SendDetach,
    StopAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Already where the operation leads
    NoOp,
    Run { via: SessionState, effect: Effect },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Attach failed: {0}")]
    Attach(String),
    #[error("Cannot {op:?} while {state}")]
    InvalidTransition { op: SessionOp, state: SessionState },
    #[error("No debugger client attached")]
    NotAttached,
    #[error("Target still running after {0:?}")]
    StillRunning(Duration),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Decide what `op` does in `state`
pub fn plan(state: SessionState, op: SessionOp) -> Result<Plan> {
    use SessionState::*;

    let run = |via: SessionState, effect: Effect| -> Result<Plan> { Ok(Plan::Run { via, effect }) };
    match (op, state) {
        (SessionOp::StartServer, Idle) => run(ServerStarting, Effect::SpawnServer),
        (
            SessionOp::StartServer,
            ServerStarting | ServerRunning | ClientAttaching | Attached | Continuing | Detaching,
        ) => Ok(Plan::NoOp),

        (SessionOp::AttachClient, ServerRunning) => run(ClientAttaching, Effect::SpawnClient),
        (SessionOp::AttachClient, ClientAttaching | Attached | Continuing) => Ok(Plan::NoOp),

        (SessionOp::Continue, Attached) => run(Continuing, Effect::SendContinue),
        (SessionOp::Continue, Continuing) => Ok(Plan::NoOp),

        (SessionOp::Detach, Attached | Stopped) => run(Detaching, Effect::SendDetach),
        (SessionOp::Detach, Detaching | ServerRunning) => Ok(Plan::NoOp),

        (SessionOp::Terminate, Terminated) => Ok(Plan::NoOp),
        (SessionOp::Terminate, _) => run(Terminated, Effect::StopAll),

        (op, state) => Err(SessionError::InvalidTransition { op, state }),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Inner {
    device: Arc<Device>,
    bridge: AdbBridge,
    config: BridgeConfig,
    runner: ProcessRunner,
    op_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<SessionState>,
    server: Mutex<Option<ProcessHandle>>,
    client: Mutex<Option<ProcessHandle>>,
    channel: Mutex<Option<Arc<MiChannel>>>,
    /// Bumped whenever a client is spawned or released
    client_generation: AtomicU64,
    forwarded_port: Mutex<Option<u16>>,
    events: Arc<EventHub>,
    console: Arc<ConsoleLog>,
    execution: Mutex<ExecutionInfo>,
}

/// Drives one debug session against one device
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    pub fn new(device: Arc<Device>, bridge: AdbBridge, config: BridgeConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let inner = Arc::new(Inner {
            device,
            bridge,
            config,
            runner: ProcessRunner::new(),
            op_lock: tokio::sync::Mutex::new(()),
            state_tx,
            server: Mutex::new(None),
            client: Mutex::new(None),
            channel: Mutex::new(None),
            client_generation: AtomicU64::new(0),
            forwarded_port: Mutex::new(None),
            events: Arc::new(EventHub::new()),
            console: Arc::new(ConsoleLog::default()),
            execution: Mutex::new(ExecutionInfo::default()),
        });

        let weak = Arc::downgrade(&inner);
        inner.events.subscribe(move |event: &MiEvent| {
            if let (MiEvent::Async(record), Some(inner)) = (event, weak.upgrade()) {
                inner.on_async(record);
            }
        });

        Self { inner }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.inner.device
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn execution(&self) -> ExecutionInfo {
        lock(&self.inner.execution).clone()
    }

    /// Observers of asynchronous debugger output; survives re-attaching
    pub fn events(&self) -> &Arc<EventHub> {
        &self.inner.events
    }

    pub fn console(&self) -> &Arc<ConsoleLog> {
        &self.inner.console
    }

    /// Command channel of the current client
    pub fn channel(&self) -> Option<Arc<MiChannel>> {
        self.inner.channel()
    }

    pub async fn send_command(&self, command: &str) -> Result<ResultRecord> {
        let channel = self.inner.channel().ok_or(SessionError::NotAttached)?;
        Ok(channel.send_command(command).await?)
    }

    /// Idle -> ServerRunning
    pub async fn start_server(&self) -> Result<()> {
        self.run(SessionOp::StartServer).await
    }

    /// ServerRunning -> Attached. On failure the client is discarded and
    /// the session returns to ServerRunning, ready for another attempt.
    pub async fn attach_client(&self) -> Result<()> {
        self.run(SessionOp::AttachClient).await
    }

    /// Attached -> Continuing. The session returns to Attached when the
    /// target stops, or moves to Stopped when it exits.
    pub async fn continue_execution(&self) -> Result<()> {
        self.run(SessionOp::Continue).await
    }

    /// Wait until a continued target stops and return the state reached
    pub async fn wait_for_stop(&self, timeout: Duration) -> Result<SessionState> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| *state != SessionState::Continuing),
        )
        .await;
        match waited {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Ok(self.state()),
            Err(_) => Err(SessionError::StillRunning(timeout)),
        }
    }

    /// Break into a continued target. Falls back to signalling the client
    /// when it refuses `-exec-interrupt`.
    pub async fn interrupt(&self) -> Result<()> {
        let inner = &self.inner;
        let state = inner.state();
        if state != SessionState::Continuing {
            log::debug!("Interrupt ignored while {}", state);
            return Ok(());
        }
        let channel = inner.channel().ok_or(SessionError::NotAttached)?;

        match MiCommands::new(&channel).exec_interrupt().await {
            Ok(_) => Ok(()),
            Err(CommandError::Communication(CommunicationError::CommandFailed(message))) => {
                log::warn!("-exec-interrupt refused ({}), signalling client", message);
                let signalled = lock(&inner.client).as_ref().map(ProcessHandle::interrupt);
                match signalled {
                    Some(result) => Ok(result?),
                    None => Err(SessionError::NotAttached),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Attached or Stopped -> ServerRunning. The server keeps running.
    pub async fn detach(&self) -> Result<()> {
        self.run(SessionOp::Detach).await
    }

    /// Any state -> Terminated: stop the client and the server
    pub async fn terminate(&self) -> Result<()> {
        self.run(SessionOp::Terminate).await
    }

    /// Enter the intermediate state `op` plans for, then perform its effect
    async fn run(&self, op: SessionOp) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let Plan::Run { via, effect } = plan(inner.state(), op)? else {
            log::debug!("{:?} has nothing to do while {}", op, inner.state());
            return Ok(());
        };
        inner.set_state(via);

        match effect {
            Effect::SpawnServer => inner.launch_server().await,
            Effect::SpawnClient => inner.attach().await,
            Effect::SendContinue => inner.resume().await,
            Effect::SendDetach => inner.release().await,
            Effect::StopAll => {
                inner.kill_all();
                inner.remove_forward().await;
                Ok(())
            }
        }
    }

    /// Listener that stops this session when its device disconnects
    pub fn disconnect_listener(&self) -> Arc<dyn DeviceListener> {
        Arc::new(DisconnectWatch {
            serial: self.inner.device.serial().to_string(),
            session: Arc::downgrade(&self.inner),
        })
    }

    pub fn watch_registry(&self, registry: &DeviceRegistry) -> ListenerId {
        registry.register_listener(self.disconnect_listener())
    }
}

impl Inner {
    async fn launch_server(self: &Arc<Self>) -> Result<()> {
        match self.spawn_server().await {
            Ok(handle) => *lock(&self.server) = Some(handle),
            Err(e) => {
                log::error!("Debug server failed to start: {}", e);
                self.remove_forward().await;
                self.set_state(SessionState::Idle);
                return Err(e);
            }
        }

        if self.transition_if(&[SessionState::ServerStarting], SessionState::ServerRunning) {
            Ok(())
        } else {
            Err(ProcessError::Terminated.into())
        }
    }

    async fn attach(self: &Arc<Self>) -> Result<()> {
        let channel = match self.spawn_client().await {
            Ok(channel) => channel,
            Err(e) => {
                self.transition_if(&[SessionState::ClientAttaching], SessionState::ServerRunning);
                return Err(SessionError::Attach(e.to_string()));
            }
        };

        let attach_timeout = self.config.attach_timeout();
        let error = match tokio::time::timeout(attach_timeout, self.handshake(&channel)).await {
            Ok(Ok(())) => {
                if self.transition_if(&[SessionState::ClientAttaching], SessionState::Attached) {
                    return Ok(());
                }
                format!("session became {} during handshake", self.state())
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("handshake did not complete within {attach_timeout:?}"),
        };

        log::error!(
            "Attach to {} failed: {}",
            self.config.server.endpoint(),
            error
        );
        self.kill_client();
        self.transition_if(&[SessionState::ClientAttaching], SessionState::ServerRunning);
        Err(SessionError::Attach(error))
    }

    async fn resume(&self) -> Result<()> {
        let Some(channel) = self.channel() else {
            self.transition_if(&[SessionState::Continuing], SessionState::Attached);
            return Err(SessionError::NotAttached);
        };

        match MiCommands::new(&channel).exec_continue().await {
            Ok(_) => Ok(()),
            Err(e) => {
                let fallback = if channel.is_closed() {
                    SessionState::Stopped
                } else {
                    SessionState::Attached
                };
                self.transition_if(&[SessionState::Continuing], fallback);
                Err(e.into())
            }
        }
    }

    async fn release(&self) -> Result<()> {
        if let Some(channel) = self.channel().filter(|channel| !channel.is_closed()) {
            let commands = MiCommands::new(&channel);
            if let Err(e) = commands.target_detach().await {
                log::warn!("Detach: {}", e);
            }
            if let Err(e) = commands.gdb_exit().await {
                log::debug!("Exit: {}", e);
            }
        }

        let (client, channel) = self.take_client();
        if let Some(client) = client {
            if tokio::time::timeout(CLIENT_EXIT_GRACE, client.wait()).await.is_err() {
                log::warn!("Debugger client still running after detach, killing");
                client.kill();
            }
        }
        if let Some(channel) = channel {
            channel.terminate(None);
        }

        let next = if self.server_running() {
            SessionState::ServerRunning
        } else {
            SessionState::Terminated
        };
        self.set_state(next);
        Ok(())
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, to: SessionState) {
        let from = self.state_tx.send_replace(to);
        if from != to {
            log::info!("Session {}: {} -> {}", self.device.serial(), from, to);
        }
    }

    /// Move to `to` only from one of `from`; returns whether it moved
    fn transition_if(&self, from: &[SessionState], to: SessionState) -> bool {
        let mut previous = None;
        self.state_tx.send_if_modified(|state| {
            if *state == to || !from.contains(state) {
                return false;
            }
            previous = Some(*state);
            *state = to;
            true
        });

        match previous {
            Some(from) => {
                log::info!("Session {}: {} -> {}", self.device.serial(), from, to);
                true
            }
            None => false,
        }
    }

    fn channel(&self) -> Option<Arc<MiChannel>> {
        lock(&self.channel).clone()
    }

    fn server_running(&self) -> bool {
        lock(&self.server)
            .as_ref()
            .map_or(false, ProcessHandle::is_running)
    }

    async fn spawn_server(self: &Arc<Self>) -> Result<ProcessHandle> {
        let server = &self.config.server;
        let serial = self.device.serial();

        let weak = Arc::downgrade(self);
        let sink = process::sink(move |event| match event {
            ProcessEvent::Line(line) => log::debug!("server[{:?}]: {}", line.stream, line.text),
            ProcessEvent::Exited(code) => {
                if let Some(inner) = weak.upgrade() {
                    inner.server_exited(code);
                }
            }
        });

        let args = server.server_args();
        if server.on_device {
            self.bridge.forward(serial, server.port, server.port).await?;
            *lock(&self.forwarded_port) = Some(server.port);

            let mut shell_args = vec![server.executable.as_str()];
            shell_args.extend(args.iter().map(String::as_str));
            Ok(self.bridge.command_async(serial, "shell", &shell_args, sink)?)
        } else {
            let spec = CommandSpec::new(&server.executable).args(args);
            Ok(self.runner.run_async(spec, sink)?)
        }
    }

    async fn spawn_client(self: &Arc<Self>) -> Result<Arc<MiChannel>> {
        let generation = self.client_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = Arc::new(
            MiChannel::new(self.events.clone(), self.console.clone())
                .with_timeout(self.config.command_timeout()),
        );

        let sink = {
            let channel = channel.clone();
            let weak = Arc::downgrade(self);
            process::sink(move |event| {
                let exited = match &event {
                    ProcessEvent::Exited(code) => Some(*code),
                    ProcessEvent::Line(_) => None,
                };
                channel.handle_process_event(event);
                if let (Some(code), Some(inner)) = (exited, weak.upgrade()) {
                    inner.client_exited(generation, code);
                }
            })
        };

        let debugger = &self.config.debugger;
        let mut spec = CommandSpec::new(&debugger.program).args(debugger.args.iter().cloned());
        if let Some(dir) = &debugger.working_dir {
            spec = spec.current_dir(dir);
        }

        let handle = self.runner.run_async(spec, sink)?;
        let stdin = handle.take_stdin().ok_or(ProcessError::Terminated)?;
        channel.attach_writer(stdin).await;

        *lock(&self.execution) = ExecutionInfo::default();
        *lock(&self.client) = Some(handle);
        *lock(&self.channel) = Some(channel.clone());
        Ok(channel)
    }

    async fn handshake(&self, channel: &MiChannel) -> Result<()> {
        for command in &self.config.debugger.init_commands {
            channel.send_checked(command).await?;
        }
        MiCommands::new(channel)
            .target_select_remote(&self.config.server.endpoint())
            .await?;
        Ok(())
    }

    /// Detach the current client from the session without stopping it
    fn take_client(&self) -> (Option<ProcessHandle>, Option<Arc<MiChannel>>) {
        self.client_generation.fetch_add(1, Ordering::SeqCst);
        let client = lock(&self.client).take();
        let channel = lock(&self.channel).take();
        (client, channel)
    }

    fn kill_client(&self) {
        let (client, channel) = self.take_client();
        if let Some(client) = client {
            client.kill();
        }
        // Fails whatever is still waiting for a reply
        if let Some(channel) = channel {
            channel.terminate(None);
        }
    }

    fn kill_all(&self) {
        self.kill_client();
        let server = lock(&self.server).take();
        if let Some(server) = server {
            server.kill();
        }
    }

    async fn remove_forward(&self) {
        let port = lock(&self.forwarded_port).take();
        if let Some(port) = port {
            if let Err(e) = self.bridge.remove_forward(self.device.serial(), port).await {
                log::warn!("Failed to remove forward tcp:{}: {}", port, e);
            }
        }
    }

    fn on_async(&self, record: &ResultRecord) {
        let target = {
            let mut execution = lock(&self.execution);
            execution.apply(record);
            execution.state
        };

        match (record.kind, record.class.as_str()) {
            (RecordKind::Exec, "running") => {
                self.transition_if(&[SessionState::Attached], SessionState::Continuing);
            }
            (RecordKind::Exec, "stopped") | (RecordKind::Notify, "thread-group-exited") => {
                if let TargetState::Exited(code) = target {
                    if self.transition_if(
                        &[SessionState::Attached, SessionState::Continuing],
                        SessionState::Stopped,
                    ) {
                        log::info!("Target exited (code={:?})", code);
                    }
                } else {
                    self.transition_if(&[SessionState::Continuing], SessionState::Attached);
                }
            }
            _ => {}
        }
    }

    fn client_exited(&self, generation: u64, code: Option<i32>) {
        if self.client_generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if self.transition_if(
            &[SessionState::Attached, SessionState::Continuing],
            SessionState::Stopped,
        ) {
            log::warn!("Debugger client exited (code={:?}) while attached", code);
        }
    }

    fn server_exited(&self, code: Option<i32>) {
        log::info!("Debug server for {} exited (code={:?})", self.device.serial(), code);
        self.transition_if(
            &[SessionState::ServerStarting, SessionState::ServerRunning],
            SessionState::Terminated,
        );
        self.transition_if(
            &[SessionState::Attached, SessionState::Continuing],
            SessionState::Stopped,
        );
    }

    fn device_lost(&self) {
        log::warn!("Device {} disconnected, stopping session", self.device.serial());
        self.transition_if(
            &[
                SessionState::ClientAttaching,
                SessionState::Attached,
                SessionState::Continuing,
                SessionState::Detaching,
            ],
            SessionState::Stopped,
        );
        self.transition_if(
            &[SessionState::ServerStarting, SessionState::ServerRunning],
            SessionState::Terminated,
        );
        self.kill_all();
        // adb drops forwards of a vanished device
        lock(&self.forwarded_port).take();
    }
}

struct DisconnectWatch {
    serial: String,
    session: Weak<Inner>,
}

impl DeviceListener for DisconnectWatch {
    fn device_connected(&self, _device: &Arc<Device>) {}

    fn device_disconnected(&self, device: &Arc<Device>) {
        if device.serial() != self.serial {
            return;
        }
        if let Some(inner) = self.session.upgrade() {
            inner.device_lost();
        }
    }

    fn device_persisted(&self, device: &Arc<Device>) {
        if device.serial() == self.serial && !device.state().is_online() {
            log::warn!("Device {} is {}", self.serial, device.state());
        }
    }
}
