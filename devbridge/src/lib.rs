/// Device bridge library
///
/// This crate tracks Android devices reachable through `adb`, runs the
/// external processes a debug session needs, and drives an MI debugger
/// client: parsing its output, correlating replies with commands, and
/// sequencing server start, attach, continue, detach and terminate.

use thiserror::Error;

pub mod commands;
pub mod communication;
pub mod config;
pub mod device;
pub mod events;
pub mod parser;
pub mod process;
pub mod registry;
pub mod session;
pub mod types;

pub use commands::{Breakpoint, CommandError, MiCommands, Register, StackFrame, Variable};
pub use communication::{CommandTimeoutError, CommunicationError, MiChannel};
pub use config::{BridgeConfig, ConfigError, DebugServerConfig, DebuggerConfig};
pub use device::{AdbBridge, ConnectionState, Device, DeviceError, DeviceProcess};
pub use events::{ConsoleLog, EventHub, ExecutionInfo, MiEvent, SubscriptionId, TargetState};
pub use parser::{parse_line, parse_value, ParseError};
pub use process::{
    CommandSpec, EventSink, OutputLine, OutputStream, ProcessError, ProcessEvent, ProcessHandle,
    ProcessOutput, ProcessRunner, ProcessState,
};
pub use registry::{DeviceListener, DeviceRegistry, ListenerId, RefreshSummary};
pub use session::{SessionError, SessionOrchestrator, SessionState};
pub use types::*;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
