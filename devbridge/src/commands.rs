/// Typed MI command helpers
///
/// This module wraps the raw command channel with the commands a debug
/// session needs, and converts their replies into typed values.

use serde::Serialize;

use crate::communication::{CommunicationError, MiChannel};
use crate::types::{ResultRecord, Value};

pub type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Communication error: {0}")]
    Communication(#[from] CommunicationError),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Type conversion error: {0}")]
    TypeError(String),
}

/// High-level interface for MI commands
pub struct MiCommands<'a> {
    channel: &'a MiChannel,
}

impl<'a> MiCommands<'a> {
    pub fn new(channel: &'a MiChannel) -> Self {
        Self { channel }
    }

    /// Connect to a debug server, e.g. `localhost:5039`
    pub async fn target_select_remote(&self, endpoint: &str) -> Result<ResultRecord> {
        Ok(self
            .channel
            .send_checked(&format!("-target-select remote {endpoint}"))
            .await?)
    }

    pub async fn target_detach(&self) -> Result<ResultRecord> {
        Ok(self.channel.send_checked("-target-detach").await?)
    }

    pub async fn gdb_exit(&self) -> Result<ResultRecord> {
        Ok(self.channel.send_command("-gdb-exit").await?)
    }

    pub async fn gdb_set(&self, setting: &str) -> Result<ResultRecord> {
        Ok(self.channel.send_checked(&format!("-gdb-set {setting}")).await?)
    }

    pub async fn exec_continue(&self) -> Result<ResultRecord> {
        Ok(self.channel.send_checked("-exec-continue").await?)
    }

    pub async fn exec_interrupt(&self) -> Result<ResultRecord> {
        Ok(self.channel.send_checked("-exec-interrupt").await?)
    }

    /// Set a breakpoint and return its number
    pub async fn break_insert(&self, location: &str) -> Result<u32> {
        let result = self
            .channel
            .send_checked(&format!("-break-insert {location}"))
            .await?;
        let bkpt = result
            .get("bkpt")
            .ok_or_else(|| CommandError::MissingField("bkpt".into()))?;
        Ok(Breakpoint::from_value(bkpt)?.number)
    }

    pub async fn break_delete(&self, number: u32) -> Result<()> {
        self.channel
            .send_checked(&format!("-break-delete {number}"))
            .await?;
        Ok(())
    }

    pub async fn break_list(&self) -> Result<Vec<Breakpoint>> {
        let result = self.channel.send_checked("-break-list").await?;
        let body = result
            .get("BreakpointTable")
            .and_then(|table| table.get("body"))
            .ok_or_else(|| CommandError::MissingField("BreakpointTable.body".into()))?;
        body.values().map(Breakpoint::from_value).collect()
    }

    /// Frames `low..=high`, or the whole stack
    pub async fn stack_list_frames(&self, range: Option<(u32, u32)>) -> Result<Vec<StackFrame>> {
        let command = match range {
            Some((low, high)) => format!("-stack-list-frames {low} {high}"),
            None => "-stack-list-frames".to_string(),
        };
        let result = self.channel.send_checked(&command).await?;
        let stack = result
            .get("stack")
            .ok_or_else(|| CommandError::MissingField("stack".into()))?;
        stack.values().map(StackFrame::from_value).collect()
    }

    /// Argument names (and values, if requested) of the frame at `level`
    pub async fn stack_list_arguments(&self, level: u32, print_values: bool) -> Result<Vec<Variable>> {
        let command = format!(
            "-stack-list-arguments {} {level} {level}",
            u8::from(print_values)
        );
        let result = self.channel.send_checked(&command).await?;
        let args = result
            .get("stack-args")
            .and_then(|frames| frames.at(0))
            .and_then(|frame| frame.get("args"))
            .ok_or_else(|| CommandError::MissingField("stack-args[0].args".into()))?;
        args.values().map(Variable::from_value).collect()
    }

    /// Locals of the frame at `level`
    pub async fn stack_list_locals(&self, level: u32, print_values: bool) -> Result<Vec<Variable>> {
        self.channel
            .send_checked(&format!("-stack-select-frame {level}"))
            .await?;
        let result = self
            .channel
            .send_checked(&format!("-stack-list-locals {}", u8::from(print_values)))
            .await?;
        let locals = result
            .get("locals")
            .ok_or_else(|| CommandError::MissingField("locals".into()))?;
        locals.values().map(Variable::from_value).collect()
    }

    /// Register names paired with their current values (hex)
    pub async fn registers(&self) -> Result<Vec<Register>> {
        let names = self.channel.send_checked("-data-list-register-names").await?;
        let values = self.channel.send_checked("-data-list-register-values x").await?;

        let names = names
            .get("register-names")
            .ok_or_else(|| CommandError::MissingField("register-names".into()))?;
        let values = values
            .get("register-values")
            .ok_or_else(|| CommandError::MissingField("register-values".into()))?;

        Register::pair(names, values)
    }

    pub async fn data_evaluate_expression(&self, expression: &str) -> Result<String> {
        let escaped = expression.replace('\\', "\\\\").replace('"', "\\\"");
        let result = self
            .channel
            .send_checked(&format!("-data-evaluate-expression \"{escaped}\""))
            .await?;
        result
            .get_str("value")
            .map(str::to_string)
            .ok_or_else(|| CommandError::MissingField("value".into()))
    }
}

fn opt_string(value: &Value, name: &str) -> Option<String> {
    value.get_str(name).map(str::to_string)
}

fn opt_number<T: std::str::FromStr>(value: &Value, name: &str) -> Option<T> {
    value.get_str(name).and_then(|s| s.parse().ok())
}

fn require_tuple(value: &Value, what: &str) -> Result<()> {
    match value {
        Value::Tuple(_) => Ok(()),
        _ => Err(CommandError::TypeError(format!("Expected tuple for {what}"))),
    }
}

/// Represents a breakpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breakpoint {
    pub number: u32,
    pub enabled: bool,
    pub addr: Option<String>,
    pub func: Option<String>,
    pub file: Option<String>,
    pub fullname: Option<String>,
    pub line: Option<u32>,
    pub times: u32,
}

impl Breakpoint {
    pub fn from_value(value: &Value) -> Result<Self> {
        require_tuple(value, "bkpt")?;
        let number = value
            .get_str("number")
            .ok_or_else(|| CommandError::MissingField("number".into()))?
            .parse()
            .map_err(|_| CommandError::TypeError("Invalid breakpoint number".into()))?;

        Ok(Breakpoint {
            number,
            enabled: value.get_str("enabled") == Some("y"),
            addr: opt_string(value, "addr"),
            func: opt_string(value, "func"),
            file: opt_string(value, "file"),
            fullname: opt_string(value, "fullname"),
            line: opt_number(value, "line"),
            times: opt_number(value, "times").unwrap_or(0),
        })
    }
}

/// Represents a stack frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackFrame {
    pub level: u32,
    pub addr: String,
    pub func: Option<String>,
    pub file: Option<String>,
    pub fullname: Option<String>,
    pub line: Option<u32>,
    pub from: Option<String>,
}

impl StackFrame {
    pub fn from_value(value: &Value) -> Result<Self> {
        require_tuple(value, "frame")?;
        let addr = value
            .get_str("addr")
            .ok_or_else(|| CommandError::MissingField("addr".into()))?
            .to_string();

        Ok(StackFrame {
            // `*stopped` frames omit the level; they are always the innermost
            level: opt_number(value, "level").unwrap_or(0),
            addr,
            func: opt_string(value, "func"),
            file: opt_string(value, "file"),
            fullname: opt_string(value, "fullname"),
            line: opt_number(value, "line"),
            from: opt_string(value, "from"),
        })
    }
}

/// Represents a variable
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variable {
    pub name: String,
    pub value: Option<String>,
    pub var_type: Option<String>,
}

impl Variable {
    /// Accepts both `{name="x",value="1"}` and the bare `"x"` of
    /// `--no-values` listings
    pub fn from_value(value: &Value) -> Result<Self> {
        if let Some(name) = value.as_string() {
            return Ok(Variable {
                name: name.to_string(),
                value: None,
                var_type: None,
            });
        }
        require_tuple(value, "variable")?;
        let name = value
            .get_str("name")
            .ok_or_else(|| CommandError::MissingField("name".into()))?
            .to_string();

        Ok(Variable {
            name,
            value: opt_string(value, "value"),
            var_type: opt_string(value, "type"),
        })
    }
}

/// A named register and its value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Register {
    pub number: u32,
    pub name: String,
    pub value: String,
}

impl Register {
    /// Join `register-names` (indexed by number, gaps are "") with
    /// `register-values` (`[{number="0",value="0x0"},...]`)
    pub fn pair(names: &Value, values: &Value) -> Result<Vec<Register>> {
        let names: Vec<&str> = names.values().filter_map(Value::as_string).collect();
        let mut registers = Vec::new();

        for entry in values.values() {
            let number: u32 = opt_number(entry, "number")
                .ok_or_else(|| CommandError::MissingField("number".into()))?;
            let name = names.get(number as usize).copied().unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            registers.push(Register {
                number,
                name: name.to_string(),
                value: opt_string(entry, "value").unwrap_or_default(),
            });
        }

        Ok(registers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_value;

    #[test]
    fn test_breakpoint_from_value() {
        let value = parse_value(
            r#"{number="1",type="breakpoint",disp="keep",enabled="y",addr="0x08048564",func="main",file="myprog.c",fullname="/home/user/myprog.c",line="68",thread-groups=["i1"],times="0"}"#,
        )
        .unwrap();
        let bkpt = Breakpoint::from_value(&value).unwrap();
        assert_eq!(bkpt.number, 1);
        assert!(bkpt.enabled);
        assert_eq!(bkpt.func.as_deref(), Some("main"));
        assert_eq!(bkpt.line, Some(68));
    }

    #[test]
    fn test_frame_requires_addr() {
        let value = parse_value(r#"{level="0",func="main"}"#).unwrap();
        assert!(matches!(
            StackFrame::from_value(&value),
            Err(CommandError::MissingField(field)) if field == "addr"
        ));
        let value = parse_value(r#""not a tuple""#).unwrap();
        assert!(matches!(
            StackFrame::from_value(&value),
            Err(CommandError::TypeError(_))
        ));
    }

    #[test]
    fn test_variables_with_and_without_values() {
        let value = parse_value(r#"{name="argc",value="1",type="int"}"#).unwrap();
        let var = Variable::from_value(&value).unwrap();
        assert_eq!(var.name, "argc");
        assert_eq!(var.value.as_deref(), Some("1"));
        assert_eq!(var.var_type.as_deref(), Some("int"));

        let value = parse_value(r#""argv""#).unwrap();
        assert_eq!(Variable::from_value(&value).unwrap().value, None);
    }

    #[test]
    fn test_register_pairing_skips_gaps() {
        let names = parse_value(r#"["r0","","pc"]"#).unwrap();
        let values = parse_value(
            r#"[{number="0",value="0x1"},{number="1",value="0x2"},{number="2",value="0x8000"}]"#,
        )
        .unwrap();
        let registers = Register::pair(&names, &values).unwrap();
        assert_eq!(registers.len(), 2);
        assert_eq!(registers[1].name, "pc");
        assert_eq!(registers[1].value, "0x8000");
    }
}
