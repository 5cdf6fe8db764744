/// MI output parser
///
/// This module turns raw debugger output lines into structured records.
/// Values are parsed with an explicit stack, so nesting depth is bounded by
/// memory rather than by the call stack.

use crate::types::*;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("malformed MI output ({message}): {line}")]
pub struct ParseError {
    /// The offending line, as received
    pub line: String,
    pub message: String,
}

impl ParseError {
    fn new(line: &str, message: impl Into<String>) -> Self {
        Self {
            line: line.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParseError>;

fn record_header() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"^(\d*)([\^*+=])([A-Za-z][A-Za-z0-9_-]*)(?:,(.*))?$")
            .expect("record header pattern is valid")
    })
}

/// Parse one line of debugger output
///
/// Returns `Ok(None)` for blank lines and the `(gdb)` prompt. Lines that are
/// not MI records come back as [`MiOutput::Text`] rather than being dropped.
pub fn parse_line(line: &str) -> Result<Option<MiOutput>> {
    let line = line.trim_end_matches(['\r', '\n']);
    let trimmed = line.trim();

    if trimmed.is_empty() || trimmed == "(gdb)" {
        return Ok(None);
    }

    // Stream records: single character prefix followed by a C string
    let mut chars = line.chars();
    if let (Some(prefix), Some('"')) = (chars.next(), chars.next()) {
        if let Some(stream_type) = StreamType::from_prefix(prefix) {
            let mut cursor = Cursor::new(&line[1..]);
            let content = cursor.c_string().map_err(|e| ParseError::new(line, e))?;
            if !cursor.at_end() {
                return Err(ParseError::new(line, "trailing characters after stream record"));
            }
            return Ok(Some(MiOutput::Stream(StreamRecord {
                stream_type,
                content,
            })));
        }
    }

    if let Some(caps) = record_header().captures(line) {
        return parse_record(line, &caps).map(|record| Some(MiOutput::Result(record)));
    }

    Ok(Some(MiOutput::Text(line.to_string())))
}

/// Parse the textual form of a single value, e.g. `{a="1",b=["x"]}`
pub fn parse_value(text: &str) -> Result<Value> {
    let mut cursor = Cursor::new(text);
    let value = cursor.value().map_err(|e| ParseError::new(text, e))?;
    if !cursor.at_end() {
        return Err(ParseError::new(text, "trailing characters after value"));
    }
    Ok(value)
}

fn parse_record(line: &str, caps: &regex::Captures<'_>) -> Result<ResultRecord> {
    let kind = caps
        .get(2)
        .and_then(|m| m.as_str().chars().next())
        .and_then(RecordKind::from_prefix)
        .ok_or_else(|| ParseError::new(line, "missing record prefix"))?;

    let token = match caps.get(1).map(|m| m.as_str()) {
        // Notifications are never correlated with a command
        _ if kind.is_async() => 0,
        Some("") | None => 0,
        Some(digits) => digits
            .parse()
            .map_err(|_| ParseError::new(line, format!("token out of range: {digits}")))?,
    };

    let class = caps.get(3).map_or("", |m| m.as_str());

    let fields = match caps.get(4) {
        Some(rest) => {
            let mut cursor = Cursor::new(rest.as_str());
            cursor.results().map_err(|e| ParseError::new(line, e))?
        }
        None => Vec::new(),
    };

    ResultRecord::new(token, kind, class, fields).map_err(|e| ParseError::new(line, e.to_string()))
}

/// Container being filled while parsing a value
enum Open {
    Tuple {
        fields: Vec<Field>,
        pending: String,
    },
    List(Vec<Value>),
    ResultList {
        fields: Vec<Field>,
        pending: String,
    },
}

impl Open {
    fn push(&mut self, value: Value) {
        match self {
            Open::Tuple { fields, pending } | Open::ResultList { fields, pending } => {
                fields.push(Field::new(std::mem::take(pending), value));
            }
            Open::List(values) => values.push(value),
        }
    }

    fn closer(&self) -> u8 {
        match self {
            Open::Tuple { .. } => b'}',
            Open::List(_) | Open::ResultList { .. } => b']',
        }
    }

    fn is_named(&self) -> bool {
        !matches!(self, Open::List(_))
    }

    fn set_pending(&mut self, name: String) {
        if let Open::Tuple { pending, .. } | Open::ResultList { pending, .. } = self {
            *pending = name;
        }
    }

    fn finish(self) -> Value {
        match self {
            Open::Tuple { fields, .. } => Value::Tuple(fields),
            Open::List(values) => Value::List(values),
            Open::ResultList { fields, .. } => Value::ResultList(fields),
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn unexpected(&self, what: &str) -> String {
        match self.peek() {
            Some(byte) => format!("unexpected '{}' at column {}, {what}", byte as char, self.pos),
            None => format!("unexpected end of line, {what}"),
        }
    }

    /// `name=value(,name=value)*`
    fn results(&mut self) -> std::result::Result<Vec<Field>, String> {
        let mut fields = Vec::new();
        loop {
            self.skip_spaces();
            let name = self.name()?;
            let value = self.value()?;
            fields.push(Field::new(name, value));

            if self.eat(b',') {
                continue;
            }
            if self.at_end() {
                return Ok(fields);
            }
            return Err(self.unexpected("expected ',' between results"));
        }
    }

    /// Identifier followed by '='
    fn name(&mut self) -> std::result::Result<String, String> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.') {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.unexpected("expected a result name"));
        }
        let name = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
        if !self.eat(b'=') {
            return Err(self.unexpected("expected '=' after result name"));
        }
        Ok(name)
    }

    /// True when a list element starts with `name=` rather than a bare value
    fn starts_result(&self) -> bool {
        !matches!(self.peek(), Some(b'"' | b'{' | b'[') | None)
    }

    fn value(&mut self) -> std::result::Result<Value, String> {
        let mut stack: Vec<Open> = Vec::new();

        loop {
            let mut value = match self.peek() {
                Some(b'"') => Value::String(self.c_string()?),
                Some(b'{') => {
                    self.bump();
                    if self.eat(b'}') {
                        Value::Tuple(Vec::new())
                    } else {
                        let pending = self.name()?;
                        stack.push(Open::Tuple {
                            fields: Vec::new(),
                            pending,
                        });
                        continue;
                    }
                }
                Some(b'[') => {
                    self.bump();
                    if self.eat(b']') {
                        Value::List(Vec::new())
                    } else if self.starts_result() {
                        let pending = self.name()?;
                        stack.push(Open::ResultList {
                            fields: Vec::new(),
                            pending,
                        });
                        continue;
                    } else {
                        stack.push(Open::List(Vec::new()));
                        continue;
                    }
                }
                _ => return Err(self.unexpected("expected a value")),
            };

            // Attach the finished value and close as many containers as the input closes
            loop {
                let Some(top) = stack.last_mut() else {
                    return Ok(value);
                };
                top.push(value);
                let closer = top.closer();

                match self.bump() {
                    Some(b',') => {
                        if top.is_named() {
                            let name = self.name()?;
                            top.set_pending(name);
                        }
                        break;
                    }
                    Some(byte) if byte == closer => {
                        value = match stack.pop() {
                            Some(open) => open.finish(),
                            None => return Err("container stack underflow".into()),
                        };
                    }
                    Some(byte) => {
                        return Err(format!(
                            "unexpected '{}' at column {}, expected ',' or '{}'",
                            byte as char,
                            self.pos - 1,
                            closer as char
                        ));
                    }
                    None => {
                        let what = if closer == b'}' { "tuple" } else { "list" };
                        return Err(format!("unterminated {what}"));
                    }
                }
            }
        }
    }

    /// Quoted C string with backslash escapes, including octal byte escapes
    fn c_string(&mut self) -> std::result::Result<String, String> {
        if !self.eat(b'"') {
            return Err(self.unexpected("expected '\"'"));
        }

        let mut out: Vec<u8> = Vec::new();
        loop {
            let byte = self.bump().ok_or_else(|| "unterminated string".to_string())?;
            match byte {
                b'"' => break,
                b'\\' => {
                    let escaped = self.bump().ok_or_else(|| "unterminated string".to_string())?;
                    match escaped {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'a' => out.push(0x07),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'v' => out.push(0x0b),
                        b'e' => out.push(0x1b),
                        b'\\' | b'"' | b'\'' => out.push(escaped),
                        b'0'..=b'7' => {
                            let mut code = u32::from(escaped - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(digit @ b'0'..=b'7') => {
                                        code = code * 8 + u32::from(digit - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push((code & 0xff) as u8);
                        }
                        other => {
                            out.push(b'\\');
                            out.push(other);
                        }
                    }
                }
                other => out.push(other),
            }
        }

        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}
