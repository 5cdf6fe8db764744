/// Event fan-out and execution tracking for debugger sessions
///
/// This module provides the observer registry for asynchronous debugger
/// output, a bounded history of unsolicited console output, and the
/// execution state derived from `*running` / `*stopped` notifications.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use serde::Serialize;

use crate::commands::StackFrame;
use crate::types::{RecordKind, ResultRecord, StopReason, StreamRecord, StreamType};

/// Output of a debugger that is not the reply to a pending command
#[derive(Debug, Clone, PartialEq)]
pub enum MiEvent {
    /// `*`, `+` or `=` notification
    Async(ResultRecord),
    /// Stream record observed while no command was outstanding
    Stream(StreamRecord),
    /// Non-MI line, e.g. output of the debugged program
    Output(String),
    /// `^` record whose token matched no pending command
    UnmatchedResult(ResultRecord),
    /// The debugger process exited
    Terminated(Option<i32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type EventCallback = Arc<dyn Fn(&MiEvent) + Send + Sync>;

/// Registered observers, invoked in registration order
pub struct EventHub {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(SubscriptionId, EventCallback)>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&MiEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.push((id, Arc::new(callback)));
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.callbacks.write() {
            Ok(mut callbacks) => {
                let before = callbacks.len();
                callbacks.retain(|(existing, _)| *existing != id);
                callbacks.len() != before
            }
            Err(_) => false,
        }
    }

    /// Deliver `event` to every observer. The list is copied first so an
    /// observer may subscribe or unsubscribe from inside its callback.
    pub fn emit(&self, event: &MiEvent) {
        let callbacks: Vec<EventCallback> = match self.callbacks.read() {
            Ok(callbacks) => callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(event);
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Console output not attached to any command
#[derive(Debug, Clone, Serialize)]
pub struct ConsoleOutput {
    pub content: String,
    pub stream_type: StreamType,
    pub timestamp: SystemTime,
}

/// Bounded history of unsolicited stream output
pub struct ConsoleLog {
    capacity: usize,
    entries: Mutex<VecDeque<ConsoleOutput>>,
}

impl ConsoleLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, record: &StreamRecord) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(ConsoleOutput {
                content: record.content.clone(),
                stream_type: record.stream_type,
                timestamp: SystemTime::now(),
            });
        }
    }

    /// Most recent entries, oldest first
    pub fn recent(&self, limit: Option<usize>) -> Vec<ConsoleOutput> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |limit| entries.len().saturating_sub(limit));
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl Default for ConsoleLog {
    fn default() -> Self {
        Self::with_capacity(1000)
    }
}

/// What the debugged program is doing, as far as notifications tell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TargetState {
    Unknown,
    Running,
    Stopped,
    Exited(Option<i32>),
}

/// Information about the current execution state
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    pub state: TargetState,
    pub current_frame: Option<StackFrame>,
    pub reason: Option<String>,
    pub signal_name: Option<String>,
    pub signal_meaning: Option<String>,
    pub exit_code: Option<i32>,
}

impl Default for ExecutionInfo {
    fn default() -> Self {
        Self {
            state: TargetState::Unknown,
            current_frame: None,
            reason: None,
            signal_name: None,
            signal_meaning: None,
            exit_code: None,
        }
    }
}

impl ExecutionInfo {
    /// Fold an asynchronous record into the execution state.
    /// Returns true when `state` changed.
    pub fn apply(&mut self, record: &ResultRecord) -> bool {
        let before = self.state;

        match (record.kind, record.class.as_str()) {
            (RecordKind::Exec, "running") => {
                self.state = TargetState::Running;
                self.current_frame = None;
                self.reason = None;
                self.signal_name = None;
                self.signal_meaning = None;
            }
            (RecordKind::Exec, "stopped") => self.apply_stopped(record),
            (RecordKind::Notify, "thread-group-exited") => {
                let code = record
                    .get_str("exit-code")
                    .and_then(parse_exit_code);
                self.exit_code = code;
                self.state = TargetState::Exited(code);
            }
            _ => log::trace!("Ignoring async class: {}", record.class),
        }

        self.state != before
    }

    fn apply_stopped(&mut self, record: &ResultRecord) {
        self.state = TargetState::Stopped;
        self.reason = record.get_str("reason").map(str::to_string);

        match self.reason.as_deref().and_then(|r| r.parse::<StopReason>().ok()) {
            Some(StopReason::ExitedNormally) => {
                self.exit_code = Some(0);
                self.state = TargetState::Exited(Some(0));
            }
            Some(StopReason::Exited) => {
                let code = record.get_str("exit-code").and_then(parse_exit_code);
                self.exit_code = code;
                self.state = TargetState::Exited(code);
            }
            Some(StopReason::ExitedSignalled) => {
                self.signal_name = record.get_str("signal-name").map(str::to_string);
                self.signal_meaning = record.get_str("signal-meaning").map(str::to_string);
                self.state = TargetState::Exited(None);
            }
            Some(StopReason::SignalReceived) => {
                self.signal_name = record.get_str("signal-name").map(str::to_string);
                self.signal_meaning = record.get_str("signal-meaning").map(str::to_string);
            }
            _ => {}
        }

        if let Some(frame) = record.get("frame") {
            match StackFrame::from_value(frame) {
                Ok(frame) => self.current_frame = Some(frame),
                Err(e) => log::debug!("Unreadable frame in stop record: {}", e),
            }
        }
    }

    pub fn has_exited(&self) -> bool {
        matches!(self.state, TargetState::Exited(_))
    }
}

/// Exit codes arrive in octal (`exit-code="01"`)
fn parse_exit_code(text: &str) -> Option<i32> {
    i32::from_str_radix(text, 8)
        .or_else(|_| text.parse())
        .ok()
}
