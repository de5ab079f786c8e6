use std::fmt;
use std::sync::Arc;

use devbus_api::Reason;
use serde::Serialize;
use strum::Display;

use super::Device;
use crate::error::CoreError;
use crate::model::Value;

/// Argument and result shapes a command can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum ArgType {
    Void,
    Bool,
    Long,
    Double,
    String,
    State,
    BoolArray,
    LongArray,
    DoubleArray,
    StringArray,
}

impl ArgType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Void => Self::Void,
            Value::Bool(_) => Self::Bool,
            Value::Long(_) => Self::Long,
            Value::Double(_) => Self::Double,
            Value::Str(_) => Self::String,
            Value::State(_) => Self::State,
            Value::BoolArray(_) => Self::BoolArray,
            Value::LongArray(_) => Self::LongArray,
            Value::DoubleArray(_) => Self::DoubleArray,
            Value::StrArray(_) => Self::StringArray,
        }
    }
}

pub trait CommandBehavior: Send + Sync {
    fn execute(&self, device: &Device, arg: Value) -> Result<Value, CoreError>;

    fn is_allowed(&self, _device: &Device) -> bool {
        true
    }
}

/// Command behaviour from a closure.
pub struct CommandFn<F>(F);

/// Wrap a closure as a shared command behaviour.
pub fn command_fn<F>(f: F) -> Arc<dyn CommandBehavior>
where
    F: Fn(&Device, Value) -> Result<Value, CoreError> + Send + Sync + 'static,
{
    Arc::new(CommandFn(f))
}

impl<F> CommandBehavior for CommandFn<F>
where
    F: Fn(&Device, Value) -> Result<Value, CoreError> + Send + Sync,
{
    fn execute(&self, device: &Device, arg: Value) -> Result<Value, CoreError> {
        (self.0)(device, arg)
    }
}

#[derive(Clone)]
pub struct CmdDescriptor {
    pub name: String,
    pub in_type: ArgType,
    pub out_type: ArgType,
    pub polling_period_ms: Option<u64>,
    pub behavior: Arc<dyn CommandBehavior>,
}

impl fmt::Debug for CmdDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdDescriptor")
            .field("name", &self.name)
            .field("in_type", &self.in_type)
            .field("out_type", &self.out_type)
            .finish_non_exhaustive()
    }
}

impl CmdDescriptor {
    pub fn new(
        name: impl Into<String>,
        in_type: ArgType,
        out_type: ArgType,
        behavior: Arc<dyn CommandBehavior>,
    ) -> Self {
        Self {
            name: name.into(),
            in_type,
            out_type,
            polling_period_ms: None,
            behavior,
        }
    }

    #[must_use]
    pub fn polled_every(mut self, period_ms: u64) -> Self {
        self.polling_period_ms = Some(period_ms);
        self
    }

    pub fn same_definition(&self, other: &Self) -> bool {
        self.in_type == other.in_type && self.out_type == other.out_type
    }

    pub(crate) fn check_argument(&self, arg: &Value) -> Result<(), CoreError> {
        let got = ArgType::of(arg);
        if got == self.in_type {
            Ok(())
        } else {
            Err(CoreError::InvalidValue {
                reason: Reason::IncompatibleCmdArgumentType,
                message: format!(
                    "Incompatible command argument type for {}: expected {}, got {got}",
                    self.name, self.in_type
                ),
            })
        }
    }
}

// ── Built-in commands ───────────────────────────────────────────────

pub const STATE_COMMAND: &str = "State";
pub const STATUS_COMMAND: &str = "Status";
pub const INIT_COMMAND: &str = "Init";

struct StateCmd;

impl CommandBehavior for StateCmd {
    fn execute(&self, device: &Device, _arg: Value) -> Result<Value, CoreError> {
        Ok(Value::State(device.dev_state()))
    }
}

struct StatusCmd;

impl CommandBehavior for StatusCmd {
    fn execute(&self, device: &Device, _arg: Value) -> Result<Value, CoreError> {
        Ok(Value::Str(device.dev_status()))
    }
}

struct InitCmd;

impl CommandBehavior for InitCmd {
    fn execute(&self, device: &Device, _arg: Value) -> Result<Value, CoreError> {
        device.reinit()?;
        Ok(Value::Void)
    }
}

/// Commands every class gets.
pub(crate) fn builtin_commands() -> Vec<CmdDescriptor> {
    vec![
        CmdDescriptor::new(STATE_COMMAND, ArgType::Void, ArgType::State, Arc::new(StateCmd)),
        CmdDescriptor::new(STATUS_COMMAND, ArgType::Void, ArgType::String, Arc::new(StatusCmd)),
        CmdDescriptor::new(INIT_COMMAND, ArgType::Void, ArgType::Void, Arc::new(InitCmd)),
    ]
}
