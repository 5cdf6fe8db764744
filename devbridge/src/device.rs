/// Android devices and the bridge tool
///
/// This module wraps `adb`: starting its server, listing attached devices,
/// and running per-device commands. A [`Device`] is shared by reference and
/// updated in place, so holders always see the latest connection state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use regex::Regex;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::config::BridgeConfig;
use crate::process::{CommandSpec, EventSink, ProcessError, ProcessHandle, ProcessOutput, ProcessRunner};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("{command} failed (code={code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Connectivity class reported by `adb devices`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Device,
    Offline,
    Unauthorized,
    Recovery,
    Sideload,
    Other(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionState::Device => "device",
            ConnectionState::Offline => "offline",
            ConnectionState::Unauthorized => "unauthorized",
            ConnectionState::Recovery => "recovery",
            ConnectionState::Sideload => "sideload",
            ConnectionState::Other(state) => state,
        }
    }

    /// Ready for shell and debugging commands
    pub fn is_online(&self) -> bool {
        *self == ConnectionState::Device
    }
}

impl From<&str> for ConnectionState {
    fn from(s: &str) -> Self {
        match s {
            "device" => ConnectionState::Device,
            "offline" => ConnectionState::Offline,
            "unauthorized" => ConnectionState::Unauthorized,
            "recovery" => ConnectionState::Recovery,
            "sideload" => ConnectionState::Sideload,
            other => ConnectionState::Other(other.to_string()),
        }
    }
}

impl FromStr for ConnectionState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(ConnectionState::from(s))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ConnectionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One row of `adb shell ps`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProcess {
    pub user: String,
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
}

/// An attached device
pub struct Device {
    serial: String,
    state: RwLock<ConnectionState>,
    properties: Mutex<Option<Arc<HashMap<String, String>>>>,
    processes: Mutex<Option<Arc<Vec<DeviceProcess>>>>,
}

impl Device {
    pub fn new(serial: impl Into<String>, state: ConnectionState) -> Self {
        Self {
            serial: serial.into(),
            state: RwLock::new(state),
            properties: Mutex::new(None),
            processes: Mutex::new(None),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        match self.state.write() {
            Ok(mut current) => *current = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    /// Port name presented to debugger frontends
    pub fn port_name(&self) -> String {
        format!("adb://{}", self.serial)
    }

    /// Drop derived properties; they are fetched again on next use
    pub fn invalidate(&self) {
        clear(&self.properties);
        clear(&self.processes);
    }

    /// System properties (`getprop`), fetched once per refresh cycle
    pub async fn properties(&self, bridge: &AdbBridge) -> Result<Arc<HashMap<String, String>>> {
        if let Some(cached) = cached(&self.properties) {
            return Ok(cached);
        }
        let output = bridge.shell(&self.serial, &["getprop"]).await?;
        let properties = Arc::new(parse_getprop(&output));
        store(&self.properties, properties.clone());
        Ok(properties)
    }

    pub async fn property(&self, bridge: &AdbBridge, key: &str) -> Result<Option<String>> {
        Ok(self.properties(bridge).await?.get(key).cloned())
    }

    /// Running processes (`ps`), fetched once per refresh cycle
    pub async fn processes(&self, bridge: &AdbBridge) -> Result<Arc<Vec<DeviceProcess>>> {
        if let Some(cached) = cached(&self.processes) {
            return Ok(cached);
        }
        let output = bridge.shell(&self.serial, &["ps"]).await?;
        let processes = Arc::new(parse_ps(&output));
        store(&self.processes, processes.clone());
        Ok(processes)
    }

    /// Pid of the first process with this exact name
    pub async fn find_process(&self, bridge: &AdbBridge, name: &str) -> Result<Option<u32>> {
        Ok(self
            .processes(bridge)
            .await?
            .iter()
            .find(|process| process.name == name)
            .map(|process| process.pid))
    }
}

fn cached<T>(slot: &Mutex<Option<Arc<T>>>) -> Option<Arc<T>> {
    slot.lock().ok().and_then(|value| value.clone())
}

fn store<T>(slot: &Mutex<Option<Arc<T>>>, value: Arc<T>) {
    if let Ok(mut slot) = slot.lock() {
        *slot = Some(value);
    }
}

fn clear<T>(slot: &Mutex<Option<Arc<T>>>) {
    if let Ok(mut slot) = slot.lock() {
        *slot = None;
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.serial)
            .field("state", &self.state())
            .finish()
    }
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut device = serializer.serialize_struct("Device", 3)?;
        device.serialize_field("serial", &self.serial)?;
        device.serialize_field("state", &self.state())?;
        device.serialize_field("port", &self.port_name())?;
        device.end()
    }
}

/// Parse `adb devices` output into `(serial, state)` pairs.
///
/// Only `<serial>\t<state>` lines count; the header, blank lines, daemon
/// chatter and multi-word states are skipped. A repeated serial keeps its
/// first state.
pub fn parse_listing(output: &str) -> Vec<(String, ConnectionState)> {
    static LINE: OnceLock<Regex> = OnceLock::new();
    let line_re = LINE.get_or_init(|| Regex::new(r"^(\S+)\t([a-z]+)$").expect("listing pattern is valid"));

    let mut seen = HashSet::new();
    let mut devices = Vec::new();

    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        let Some(captures) = line_re.captures(line) else {
            if !line.is_empty() {
                log::trace!("Listing: skipping {:?}", line);
            }
            continue;
        };
        let serial = &captures[1];
        if !seen.insert(serial.to_string()) {
            log::warn!("Listing: duplicate serial {}", serial);
            continue;
        }
        devices.push((serial.to_string(), ConnectionState::from(&captures[2])));
    }

    devices
}

/// Parse `getprop` lines of the form `[key]: [value]`
pub fn parse_getprop(output: &str) -> HashMap<String, String> {
    static PROP: OnceLock<Regex> = OnceLock::new();
    let prop_re = PROP.get_or_init(|| Regex::new(r"^\[([^\]]+)\]:\s*\[(.*)\]$").expect("property pattern is valid"));

    output
        .lines()
        .filter_map(|line| prop_re.captures(line.trim_end_matches('\r')))
        .map(|captures| (captures[1].to_string(), captures[2].to_string()))
        .collect()
}

/// Parse `ps` output. Column positions come from the header, so both the
/// legacy and the toybox layouts work; the name is always the last column.
pub fn parse_ps(output: &str) -> Vec<DeviceProcess> {
    let mut lines = output.lines().map(|line| line.trim_end_matches('\r'));
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<&str> = header.split_whitespace().collect();
    let position = |name: &str| columns.iter().position(|column| *column == name);
    let (Some(pid_col), Some(ppid_col)) = (position("PID"), position("PPID")) else {
        log::warn!("Unrecognized ps header: {}", header);
        return Vec::new();
    };

    lines
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < columns.len() {
                return None;
            }
            Some(DeviceProcess {
                user: fields[0].to_string(),
                pid: fields[pid_col].parse().ok()?,
                ppid: fields[ppid_col].parse().ok()?,
                name: fields[fields.len() - 1].to_string(),
            })
        })
        .collect()
}

/// The bridge tool and the budgets its invocations run under
#[derive(Debug, Clone)]
pub struct AdbBridge {
    base: CommandSpec,
    runner: ProcessRunner,
    listing_timeout: Duration,
    command_timeout: Duration,
}

impl AdbBridge {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_base(CommandSpec::new(path))
    }

    /// Use `base` as the invocation prefix; bridge arguments are appended
    pub fn with_base(base: CommandSpec) -> Self {
        Self {
            base,
            runner: ProcessRunner::new(),
            listing_timeout: Duration::from_millis(1000),
            command_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.adb_path.clone()).with_timeouts(config.listing_timeout(), config.command_timeout())
    }

    pub fn with_timeouts(mut self, listing: Duration, command: Duration) -> Self {
        self.listing_timeout = listing;
        self.command_timeout = command;
        self
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// `adb <args>`
    pub fn spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base.clone().args(args)
    }

    /// `adb -s <serial> <command> <args>`
    pub fn command_spec(&self, serial: &str, command: &str, args: &[&str]) -> CommandSpec {
        self.spec(["-s", serial, command]).args(args.iter().copied())
    }

    /// Make sure the adb server is up. A non-zero exit is only logged; the
    /// listing that follows reports whether it worked.
    pub async fn start_server(&self) -> Result<()> {
        let output = self
            .runner
            .run_sync(self.spec(["start-server"]), Some(self.command_timeout))
            .await?;
        if !output.success() {
            log::warn!(
                "adb start-server exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(())
    }

    /// Raw output of `adb devices`
    pub async fn list_devices(&self) -> Result<String> {
        let spec = self.spec(["devices"]);
        let output = self.runner.run_sync(spec.clone(), Some(self.listing_timeout)).await?;
        log::trace!("Refresh: {}", output.stdout);
        checked(&spec, output).map(|output| output.stdout)
    }

    pub async fn command(&self, serial: &str, command: &str, args: &[&str]) -> Result<ProcessOutput> {
        log::debug!(
            "AdbCommand: target={} cmd={} args={}",
            serial,
            command,
            args.join(" ")
        );
        let spec = self.command_spec(serial, command, args);
        Ok(self.runner.run_sync(spec, Some(self.command_timeout)).await?)
    }

    pub fn command_async(
        &self,
        serial: &str,
        command: &str,
        args: &[&str],
        sink: EventSink,
    ) -> Result<ProcessHandle> {
        log::debug!(
            "AdbCommandAsync: target={} cmd={} args={}",
            serial,
            command,
            args.join(" ")
        );
        Ok(self.runner.run_async(self.command_spec(serial, command, args), sink)?)
    }

    /// Run `adb -s <serial> shell <args>` and return its stdout
    pub async fn shell(&self, serial: &str, args: &[&str]) -> Result<String> {
        let spec = self.command_spec(serial, "shell", args);
        let output = self.command(serial, "shell", args).await?;
        checked(&spec, output).map(|output| output.stdout)
    }

    /// Forward a host TCP port to the device
    pub async fn forward(&self, serial: &str, local: u16, remote: u16) -> Result<()> {
        let local = format!("tcp:{local}");
        let remote = format!("tcp:{remote}");
        let spec = self.command_spec(serial, "forward", &[&local, &remote]);
        let output = self.command(serial, "forward", &[&local, &remote]).await?;
        checked(&spec, output).map(|_| ())
    }

    pub async fn remove_forward(&self, serial: &str, local: u16) -> Result<()> {
        let local = format!("tcp:{local}");
        let spec = self.command_spec(serial, "forward", &["--remove", &local]);
        let output = self.command(serial, "forward", &["--remove", &local]).await?;
        checked(&spec, output).map(|_| ())
    }
}

fn checked(spec: &CommandSpec, output: ProcessOutput) -> Result<ProcessOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(DeviceError::CommandFailed {
            command: spec.to_string(),
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}
