/// MI protocol types and data structures
///
/// This module defines the data structures used to represent one parsed line
/// of debugger machine-interface output.

use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::str::FromStr;
use thiserror::Error;

/// Represents the different kinds of debugger output lines
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "record", rename_all = "snake_case")]
pub enum MiOutput {
    Result(ResultRecord),
    Stream(StreamRecord),
    /// A line that is not an MI record, e.g. stdout of the debugged program
    Text(String),
}

/// Prefix-derived classification of a result-shaped record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// `^` reply to an issued command
    Result,
    /// `*` execution state change
    Exec,
    /// `+` progress notification
    Status,
    /// `=` general notification
    Notify,
}

impl RecordKind {
    pub fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            '^' => Some(RecordKind::Result),
            '*' => Some(RecordKind::Exec),
            '+' => Some(RecordKind::Status),
            '=' => Some(RecordKind::Notify),
            _ => None,
        }
    }

    pub fn prefix(self) -> char {
        match self {
            RecordKind::Result => '^',
            RecordKind::Exec => '*',
            RecordKind::Status => '+',
            RecordKind::Notify => '=',
        }
    }

    /// Asynchronous records never answer a command
    pub fn is_async(self) -> bool {
        !matches!(self, RecordKind::Result)
    }
}

/// A named value, `name=value` on the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    pub value: Value,
}

impl Field {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Represents values in MI output
///
/// Tuples keep their fields in wire order and do not require unique names.
/// Lists come in two shapes: plain values (`["a","b"]`) and named results
/// (`[frame={..},frame={..}]`). An empty result list has the same text as
/// an empty plain list, so the two compare equal.
///
/// Values nest as deep as the debugger sends them. Dropping, cloning,
/// comparing and formatting walk the tree with a worklist instead of
/// recursing.
pub enum Value {
    String(String),
    List(Vec<Value>),
    ResultList(Vec<Field>),
    Tuple(Vec<Field>),
}

impl Value {
    /// Get the value as a string, if possible
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a plain list, if possible
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            Value::ResultList(fields) if fields.is_empty() => Some(&[]),
            _ => None,
        }
    }

    /// Get the named fields of a tuple or result list
    pub fn fields(&self) -> Option<&[Field]> {
        match self {
            Value::Tuple(fields) | Value::ResultList(fields) => Some(fields),
            Value::List(list) if list.is_empty() => Some(&[]),
            _ => None,
        }
    }

    /// First field called `name` in a tuple or result list
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields()?
            .iter()
            .find(|field| field.name == name)
            .map(|field| &field.value)
    }

    /// Positional access into any container
    pub fn at(&self, index: usize) -> Option<&Value> {
        match self {
            Value::List(list) => list.get(index),
            Value::ResultList(fields) | Value::Tuple(fields) => {
                fields.get(index).map(|field| &field.value)
            }
            Value::String(_) => None,
        }
    }

    /// Number of children; a scalar counts as zero
    pub fn len(&self) -> usize {
        match self {
            Value::String(_) => 0,
            Value::List(list) => list.len(),
            Value::ResultList(fields) | Value::Tuple(fields) => fields.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate the children of a container, dropping field names
    pub fn values(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Value::String(_) => Box::new(std::iter::empty()),
            Value::List(list) => Box::new(list.iter()),
            Value::ResultList(fields) | Value::Tuple(fields) => {
                Box::new(fields.iter().map(|field| &field.value))
            }
        }
    }

    /// Shorthand for `get(name)` followed by `as_string`
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_string)
    }

    fn events(&self) -> Events<'_> {
        Events {
            start: Some(self),
            stack: Vec::new(),
        }
    }
}

/// Deepest tree handed to a serializer; serde recurses once per level
const MAX_SERIALIZE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    List,
    ResultList,
    Tuple,
}

impl Shape {
    fn open(self) -> char {
        match self {
            Shape::Tuple => '{',
            Shape::List | Shape::ResultList => '[',
        }
    }

    fn close(self) -> char {
        match self {
            Shape::Tuple => '}',
            Shape::List | Shape::ResultList => ']',
        }
    }

    fn variant(self) -> &'static str {
        match self {
            Shape::List => "List",
            Shape::ResultList => "ResultList",
            Shape::Tuple => "Tuple",
        }
    }
}

/// One step of a depth-first walk; `name` is set inside named containers
#[derive(Debug, PartialEq)]
enum Event<'a> {
    Open { name: Option<&'a str>, shape: Shape },
    Scalar { name: Option<&'a str>, text: &'a str },
    Close,
}

enum Children<'a> {
    Values(std::slice::Iter<'a, Value>),
    Fields(std::slice::Iter<'a, Field>),
}

struct Events<'a> {
    start: Option<&'a Value>,
    stack: Vec<Children<'a>>,
}

impl<'a> Events<'a> {
    fn enter(&mut self, name: Option<&'a str>, value: &'a Value) -> Event<'a> {
        let shape = match value {
            Value::String(text) => {
                return Event::Scalar {
                    name,
                    text: text.as_str(),
                }
            }
            Value::List(list) => {
                self.stack.push(Children::Values(list.iter()));
                Shape::List
            }
            Value::ResultList(fields) => {
                self.stack.push(Children::Fields(fields.iter()));
                if fields.is_empty() {
                    Shape::List
                } else {
                    Shape::ResultList
                }
            }
            Value::Tuple(fields) => {
                self.stack.push(Children::Fields(fields.iter()));
                Shape::Tuple
            }
        };
        Event::Open { name, shape }
    }
}

impl<'a> Iterator for Events<'a> {
    type Item = Event<'a>;

    fn next(&mut self) -> Option<Event<'a>> {
        if let Some(value) = self.start.take() {
            return Some(self.enter(None, value));
        }
        let child = match self.stack.last_mut()? {
            Children::Values(iter) => iter.next().map(|value| (None, value)),
            Children::Fields(iter) => iter
                .next()
                .map(|field| (Some(field.name.as_str()), &field.value)),
        };
        match child {
            Some((name, value)) => Some(self.enter(name, value)),
            None => {
                self.stack.pop();
                Some(Event::Close)
            }
        }
    }
}

/// Moves the children of `value` onto `out`, leaving it shallow
fn detach_children(value: &mut Value, out: &mut Vec<Value>) {
    match value {
        Value::String(_) => {}
        Value::List(list) => out.append(list),
        Value::ResultList(fields) | Value::Tuple(fields) => {
            out.extend(std::mem::take(fields).into_iter().map(|field| field.value));
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        detach_children(self, &mut pending);
        while let Some(mut value) = pending.pop() {
            detach_children(&mut value, &mut pending);
        }
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        struct Building<'a> {
            name: Option<&'a str>,
            shape: Shape,
            children: Vec<(Option<&'a str>, Value)>,
        }

        let mut stack: Vec<Building<'_>> = Vec::new();
        for event in self.events() {
            let (name, value) = match event {
                Event::Open { name, shape } => {
                    stack.push(Building {
                        name,
                        shape,
                        children: Vec::new(),
                    });
                    continue;
                }
                Event::Scalar { name, text } => (name, Value::String(text.to_owned())),
                Event::Close => {
                    let Some(done) = stack.pop() else { break };
                    let value = match done.shape {
                        Shape::List => Value::List(done.children.into_iter().map(|(_, v)| v).collect()),
                        Shape::ResultList | Shape::Tuple => {
                            let fields = done
                                .children
                                .into_iter()
                                .map(|(name, value)| Field::new(name.unwrap_or_default(), value))
                                .collect();
                            if done.shape == Shape::Tuple {
                                Value::Tuple(fields)
                            } else {
                                Value::ResultList(fields)
                            }
                        }
                    };
                    (done.name, value)
                }
            };
            match stack.last_mut() {
                Some(parent) => parent.children.push((name, value)),
                None => return value,
            }
        }
        Value::List(Vec::new())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.events().eq(other.events())
    }
}

/// Writes the separator before an item and clears the first-item flag
fn separate(f: &mut fmt::Formatter<'_>, first: &mut bool, sep: &str) -> fmt::Result {
    if !std::mem::replace(first, false) {
        f.write_str(sep)?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut shapes = Vec::new();
        let mut first = true;
        for event in self.events() {
            match event {
                Event::Open { name, shape } => {
                    separate(f, &mut first, ",")?;
                    if let Some(name) = name {
                        write!(f, "{name}=")?;
                    }
                    f.write_char(shape.open())?;
                    shapes.push(shape);
                    first = true;
                }
                Event::Scalar { name, text } => {
                    separate(f, &mut first, ",")?;
                    if let Some(name) = name {
                        write!(f, "{name}=")?;
                    }
                    write_c_string(f, text)?;
                }
                Event::Close => {
                    if let Some(shape) = shapes.pop() {
                        f.write_char(shape.close())?;
                    }
                    first = false;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Each open container remembers whether it sits inside a Field
        let mut named = Vec::new();
        let mut first = true;
        for event in self.events() {
            match event {
                Event::Open { name, shape } => {
                    separate(f, &mut first, ", ")?;
                    if let Some(name) = name {
                        write!(f, "Field {{ name: {name:?}, value: ")?;
                    }
                    write!(f, "{}([", shape.variant())?;
                    named.push(name.is_some());
                    first = true;
                }
                Event::Scalar { name, text } => {
                    separate(f, &mut first, ", ")?;
                    match name {
                        Some(name) => write!(f, "Field {{ name: {name:?}, value: String({text:?}) }}")?,
                        None => write!(f, "String({text:?})")?,
                    }
                }
                Event::Close => {
                    f.write_str("])")?;
                    if named.pop() == Some(true) {
                        f.write_str(" }")?;
                    }
                    first = false;
                }
            }
        }
        Ok(())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Nested(self, 0).serialize(serializer)
    }
}

struct Nested<'a>(&'a Value, usize);

impl Serialize for Nested<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Nested(value, depth) = *self;
        if depth >= MAX_SERIALIZE_DEPTH {
            return Err(S::Error::custom(format!(
                "value nested deeper than {MAX_SERIALIZE_DEPTH} levels"
            )));
        }
        match value {
            Value::String(s) => serializer.serialize_str(s),
            Value::List(list) => {
                let mut seq = serializer.serialize_seq(Some(list.len()))?;
                for value in list {
                    seq.serialize_element(&Nested(value, depth + 1))?;
                }
                seq.end()
            }
            // Named list entries keep their names as single-entry maps
            Value::ResultList(fields) => {
                let mut seq = serializer.serialize_seq(Some(fields.len()))?;
                for field in fields {
                    seq.serialize_element(&SingleField(field, depth + 1))?;
                }
                seq.end()
            }
            Value::Tuple(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for field in fields {
                    map.serialize_entry(&field.name, &Nested(&field.value, depth + 1))?;
                }
                map.end()
            }
        }
    }
}

struct SingleField<'a>(&'a Field, usize);

impl Serialize for SingleField<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.0.name, &Nested(&self.0.value, self.1))?;
        map.end()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("duplicate result field: {0}")]
pub struct DuplicateFieldError(pub String);

/// Represents a result-shaped MI record: a command reply or an async notification
///
/// Asynchronous notifications (`*`, `+`, `=`) always carry token 0 and are
/// told apart by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub token: u32,
    pub kind: RecordKind,
    pub class: String,
    fields: Vec<Field>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    /// Stream records observed while the command was outstanding
    pub records: Vec<StreamRecord>,
}

impl ResultRecord {
    pub fn new(
        token: u32,
        kind: RecordKind,
        class: impl Into<String>,
        fields: Vec<Field>,
    ) -> Result<Self, DuplicateFieldError> {
        let mut index = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            if index.insert(field.name.clone(), i).is_some() {
                return Err(DuplicateFieldError(field.name.clone()));
            }
        }

        Ok(Self {
            token,
            kind,
            class: class.into(),
            fields,
            index,
            records: Vec::new(),
        })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.index.get(name).map(|&i| &self.fields[i].value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_string)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn is_error(&self) -> bool {
        self.kind == RecordKind::Result && self.class == "error"
    }

    pub fn is_async(&self) -> bool {
        self.kind.is_async()
    }

    /// The `msg` field of an `^error` reply
    pub fn error_message(&self) -> Option<&str> {
        if self.is_error() {
            self.get_str("msg")
        } else {
            None
        }
    }

    /// Concatenated console stream text captured with this reply
    pub fn console_text(&self) -> String {
        self.records
            .iter()
            .filter(|record| record.stream_type == StreamType::Console)
            .map(|record| record.content.as_str())
            .collect()
    }
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.token != 0 {
            write!(f, "{}", self.token)?;
        }
        write!(f, "{}{}", self.kind.prefix(), self.class)?;
        if !self.fields.is_empty() {
            f.write_char(',')?;
            write_fields(f, &self.fields)?;
        }
        Ok(())
    }
}

/// Represents an MI stream record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamRecord {
    pub stream_type: StreamType,
    pub content: String,
}

impl fmt::Display for StreamRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char(self.stream_type.prefix())?;
        write_c_string(f, &self.content)
    }
}

/// Types of MI streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Console, // ~ prefix
    Target,  // @ prefix
    Log,     // & prefix
}

impl StreamType {
    pub fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            '~' => Some(StreamType::Console),
            '@' => Some(StreamType::Target),
            '&' => Some(StreamType::Log),
            _ => None,
        }
    }

    pub fn prefix(self) -> char {
        match self {
            StreamType::Console => '~',
            StreamType::Target => '@',
            StreamType::Log => '&',
        }
    }
}

/// Stop reason carried by `*stopped` notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BreakpointHit,
    WatchpointTrigger,
    ReadWatchpointTrigger,
    AccessWatchpointTrigger,
    FunctionFinished,
    LocationReached,
    WatchpointScope,
    EndSteppingRange,
    ExitedSignalled,
    Exited,
    ExitedNormally,
    SignalReceived,
    SolibEvent,
    Fork,
    Vfork,
    SyscallEntry,
    SyscallReturn,
    Exec,
    NoHistory,
}

impl StopReason {
    /// True when the target process is gone
    pub fn is_exit(self) -> bool {
        matches!(
            self,
            StopReason::Exited | StopReason::ExitedNormally | StopReason::ExitedSignalled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::BreakpointHit => "breakpoint-hit",
            StopReason::WatchpointTrigger => "watchpoint-trigger",
            StopReason::ReadWatchpointTrigger => "read-watchpoint-trigger",
            StopReason::AccessWatchpointTrigger => "access-watchpoint-trigger",
            StopReason::FunctionFinished => "function-finished",
            StopReason::LocationReached => "location-reached",
            StopReason::WatchpointScope => "watchpoint-scope",
            StopReason::EndSteppingRange => "end-stepping-range",
            StopReason::ExitedSignalled => "exited-signalled",
            StopReason::Exited => "exited",
            StopReason::ExitedNormally => "exited-normally",
            StopReason::SignalReceived => "signal-received",
            StopReason::SolibEvent => "solib-event",
            StopReason::Fork => "fork",
            StopReason::Vfork => "vfork",
            StopReason::SyscallEntry => "syscall-entry",
            StopReason::SyscallReturn => "syscall-return",
            StopReason::Exec => "exec",
            StopReason::NoHistory => "no-history",
        }
    }
}

impl FromStr for StopReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reason = match s {
            "breakpoint-hit" => StopReason::BreakpointHit,
            "watchpoint-trigger" => StopReason::WatchpointTrigger,
            "read-watchpoint-trigger" => StopReason::ReadWatchpointTrigger,
            "access-watchpoint-trigger" => StopReason::AccessWatchpointTrigger,
            "function-finished" => StopReason::FunctionFinished,
            "location-reached" => StopReason::LocationReached,
            "watchpoint-scope" => StopReason::WatchpointScope,
            "end-stepping-range" => StopReason::EndSteppingRange,
            "exited-signalled" => StopReason::ExitedSignalled,
            "exited" => StopReason::Exited,
            "exited-normally" => StopReason::ExitedNormally,
            "signal-received" => StopReason::SignalReceived,
            "solib-event" => StopReason::SolibEvent,
            "fork" => StopReason::Fork,
            "vfork" => StopReason::Vfork,
            "syscall-entry" => StopReason::SyscallEntry,
            "syscall-return" => StopReason::SyscallReturn,
            "exec" => StopReason::Exec,
            "no-history" => StopReason::NoHistory,
            other => return Err(format!("Unknown stop reason: {other}")),
        };
        Ok(reason)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn write_fields(f: &mut fmt::Formatter<'_>, fields: &[Field]) -> fmt::Result {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            f.write_char(',')?;
        }
        write!(f, "{field}")?;
    }
    Ok(())
}

/// Write `s` as a quoted C string, the inverse of the parser's unescaping
fn write_c_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_char('"')?;
    for ch in s.chars() {
        match ch {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c if c.is_ascii_control() => write!(f, "\\{:03o}", c as u32)?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('"')
}
