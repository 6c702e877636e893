use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use threadline_checkpoint::types::MESSAGES;
use threadline_core::error::StateError;
use threadline_core::value::ChannelValue;

use crate::reducer::ChannelOp;
use crate::sandbox::{ScriptContext, ScriptSandbox};

/// A named channel with its merge policy and default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDeclaration {
    pub key: String,
    #[serde(default)]
    pub operation: ChannelOp,
    #[serde(default, alias = "defaultValue")]
    pub default_value: ChannelValue,
}

impl ChannelDeclaration {
    pub fn new(key: impl Into<String>, operation: ChannelOp, default_value: ChannelValue) -> Self {
        Self {
            key: key.into(),
            operation,
            default_value,
        }
    }

    pub fn replace(key: impl Into<String>, default_value: ChannelValue) -> Self {
        Self::new(key, ChannelOp::Replace, default_value)
    }

    pub fn append(key: impl Into<String>, default_value: ChannelValue) -> Self {
        Self::new(key, ChannelOp::Append, default_value)
    }

    /// Parse one row of a tabular declaration:
    /// `{"key": ..., "operation": "replace"|"append", "default_value": ...}`.
    pub fn from_value(value: &Value) -> Result<Self, StateError> {
        let row = value.as_object().ok_or_else(|| {
            StateError::InvalidDeclaration(format!("channel row must be an object, got {value}"))
        })?;
        let key = row
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| StateError::InvalidDeclaration("channel row is missing a key".into()))?;
        let operation = match row.get("operation") {
            None | Some(Value::Null) => ChannelOp::default(),
            Some(Value::String(op)) => op.parse()?,
            Some(other) => return Err(StateError::UnknownOperation(other.to_string())),
        };
        let default_value = row
            .get("default_value")
            .or_else(|| row.get("defaultValue"))
            .cloned()
            .map(ChannelValue::from)
            .unwrap_or_default();
        Ok(Self::new(key, operation, default_value))
    }
}

/// How a State node declares its channels.
#[derive(Debug, Clone, PartialEq)]
pub enum StateDeclaration {
    /// Rows of `{key, operation, default_value}`.
    Table(Vec<ChannelDeclaration>),
    /// A map of channel name to either a plain default (replace) or an
    /// `{"operation": ..., "default_value": ...}` entry.
    Object(Map<String, Value>),
    /// A sandboxed script that evaluates to an `Object` declaration.
    Script(String),
}

impl StateDeclaration {
    /// Interpret raw node configuration: an array is a table, an object is an
    /// object declaration, a string is a script.
    pub fn from_value(value: Value) -> Result<Self, StateError> {
        match value {
            Value::Array(rows) => rows
                .iter()
                .map(ChannelDeclaration::from_value)
                .collect::<Result<Vec<_>, _>>()
                .map(StateDeclaration::Table),
            Value::Object(map) => Ok(StateDeclaration::Object(map)),
            Value::String(source) => Ok(StateDeclaration::Script(source)),
            other => Err(StateError::InvalidDeclaration(format!(
                "expected a table, an object or a script, got {other}"
            ))),
        }
    }
}

/// The channels of a run and how each one merges.
///
/// `messages` is always declared, always as an append channel.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSchema {
    channels: Vec<ChannelDeclaration>,
}

impl Default for StateSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSchema {
    /// A schema with only the `messages` channel.
    pub fn new() -> Self {
        Self {
            channels: vec![ChannelDeclaration::append(MESSAGES, ChannelValue::Null)],
        }
    }

    /// Declare (or redeclare) a channel. Defaults are shaped for the
    /// operation: append defaults always become sequences.
    pub fn with_channel(mut self, declaration: ChannelDeclaration) -> Self {
        self.declare(declaration);
        self
    }

    fn declare(&mut self, mut declaration: ChannelDeclaration) {
        if declaration.key == MESSAGES && declaration.operation != ChannelOp::Append {
            tracing::debug!("messages channel is always append; ignoring declared operation");
            declaration.operation = ChannelOp::Append;
        }
        declaration.default_value = declaration.operation.initial(declaration.default_value);
        match self.channels.iter_mut().find(|c| c.key == declaration.key) {
            Some(existing) => *existing = declaration,
            None => self.channels.push(declaration),
        }
    }

    /// Build a schema from a declaration. Scripts run in a default sandbox.
    pub fn from_declaration(
        declaration: &StateDeclaration,
        ctx: &ScriptContext,
    ) -> Result<Self, StateError> {
        Self::from_declaration_with(declaration, ctx, &ScriptSandbox::default())
    }

    pub fn from_declaration_with(
        declaration: &StateDeclaration,
        ctx: &ScriptContext,
        sandbox: &ScriptSandbox,
    ) -> Result<Self, StateError> {
        let rows = match declaration {
            StateDeclaration::Table(rows) => rows.clone(),
            StateDeclaration::Object(map) => object_rows(map)?,
            StateDeclaration::Script(source) => object_rows(&sandbox.evaluate(source, ctx)?)?,
        };

        let mut schema = Self::new();
        for row in rows {
            if row.key.trim().is_empty() {
                return Err(StateError::InvalidDeclaration("channel key is empty".into()));
            }
            schema.declare(row);
        }
        Ok(schema)
    }

    pub fn channels(&self) -> &[ChannelDeclaration] {
        &self.channels
    }

    pub fn get(&self, key: &str) -> Option<&ChannelDeclaration> {
        self.channels.iter().find(|c| c.key == key)
    }

    /// The merge policy for a channel. Undeclared channels replace.
    pub fn operation(&self, key: &str) -> ChannelOp {
        if key == MESSAGES {
            return ChannelOp::Append;
        }
        self.get(key).map(|c| c.operation).unwrap_or_default()
    }

    /// Declared defaults, keyed by channel.
    pub fn defaults(&self) -> HashMap<String, ChannelValue> {
        self.channels
            .iter()
            .map(|c| (c.key.clone(), c.default_value.clone()))
            .collect()
    }
}

fn object_rows(map: &Map<String, Value>) -> Result<Vec<ChannelDeclaration>, StateError> {
    let mut rows = Vec::with_capacity(map.len());
    for (key, entry) in map {
        let row = match entry {
            Value::Object(fields) if fields.get("operation").is_some_and(Value::is_string) => {
                let mut fields = fields.clone();
                fields.insert("key".into(), Value::String(key.clone()));
                ChannelDeclaration::from_value(&Value::Object(fields))?
            }
            plain => ChannelDeclaration::replace(key.clone(), ChannelValue::from(plain.clone())),
        };
        rows.push(row);
    }
    Ok(rows)
}
