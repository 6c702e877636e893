use std::collections::HashMap;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::{Map, Number, Value};

use crate::message::Message;

/// A value held by a state channel.
///
/// Values have a fixed set of shapes so decoders can dispatch on the variant
/// instead of sniffing map keys. Conversion from JSON is purely structural:
/// a map never turns into a [`Message`] on its own; only the checkpoint
/// serializer and the reducer engine promote message-shaped values.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ChannelValue {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Sequence(Vec<ChannelValue>),
    Map(HashMap<String, ChannelValue>),
    Message(Message),
}

impl ChannelValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ChannelValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ChannelValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[ChannelValue]> {
        match self {
            ChannelValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            ChannelValue::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Coerce into a sequence: `Null` becomes empty, scalars become a
    /// one-element sequence.
    pub fn into_sequence(self) -> Vec<ChannelValue> {
        match self {
            ChannelValue::Null => Vec::new(),
            ChannelValue::Sequence(items) => items,
            other => vec![other],
        }
    }

    /// Build a sequence of message values.
    pub fn messages(messages: impl IntoIterator<Item = Message>) -> Self {
        ChannelValue::Sequence(messages.into_iter().map(ChannelValue::Message).collect())
    }

    /// Promote message-shaped maps inside a sequence to [`ChannelValue::Message`].
    ///
    /// Elements that do not look like a message are kept as they are.
    pub fn promote_messages(self) -> Self {
        match self {
            ChannelValue::Sequence(items) => {
                ChannelValue::Sequence(items.into_iter().map(ChannelValue::promote_message).collect())
            }
            other => other.promote_message(),
        }
    }

    fn promote_message(self) -> Self {
        if let ChannelValue::Map(_) = &self {
            if let Some(message) = Message::from_value(&self.to_json()) {
                return ChannelValue::Message(message);
            }
        }
        self
    }

    /// Structural JSON form of the value. Messages render as their own
    /// serde representation.
    pub fn to_json(&self) -> Value {
        match self {
            ChannelValue::Null => Value::Null,
            ChannelValue::Bool(b) => Value::Bool(*b),
            ChannelValue::Number(n) => Value::Number(n.clone()),
            ChannelValue::String(s) => Value::String(s.clone()),
            ChannelValue::Sequence(items) => {
                Value::Array(items.iter().map(ChannelValue::to_json).collect())
            }
            ChannelValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
            ChannelValue::Message(m) => message_to_json(m),
        }
    }
}

fn message_to_json(message: &Message) -> Value {
    let mut obj = Map::new();
    obj.insert("type".into(), Value::String(message.kind.type_name().into()));
    obj.insert("content".into(), Value::String(message.content.clone()));
    if let Some(id) = &message.id {
        obj.insert("id".into(), Value::String(id.clone()));
    }
    if let Some(name) = &message.name {
        obj.insert("name".into(), Value::String(name.clone()));
    }
    if !message.tool_calls.is_empty() {
        let calls = message
            .tool_calls
            .iter()
            .map(|tc| {
                let mut call = Map::new();
                call.insert("id".into(), Value::String(tc.id.clone()));
                call.insert("name".into(), Value::String(tc.name.clone()));
                call.insert("arguments".into(), tc.arguments.clone());
                Value::Object(call)
            })
            .collect();
        obj.insert("tool_calls".into(), Value::Array(calls));
    }
    if let Some(tool_call_id) = &message.tool_call_id {
        obj.insert("tool_call_id".into(), Value::String(tool_call_id.clone()));
    }
    Value::Object(obj)
}

impl From<Value> for ChannelValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ChannelValue::Null,
            Value::Bool(b) => ChannelValue::Bool(b),
            Value::Number(n) => ChannelValue::Number(n),
            Value::String(s) => ChannelValue::String(s),
            Value::Array(items) => {
                ChannelValue::Sequence(items.into_iter().map(ChannelValue::from).collect())
            }
            Value::Object(map) => ChannelValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, ChannelValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&ChannelValue> for Value {
    fn from(value: &ChannelValue) -> Self {
        value.to_json()
    }
}

impl From<&str> for ChannelValue {
    fn from(s: &str) -> Self {
        ChannelValue::String(s.to_string())
    }
}

impl From<String> for ChannelValue {
    fn from(s: String) -> Self {
        ChannelValue::String(s)
    }
}

impl From<bool> for ChannelValue {
    fn from(b: bool) -> Self {
        ChannelValue::Bool(b)
    }
}

impl From<i64> for ChannelValue {
    fn from(n: i64) -> Self {
        ChannelValue::Number(n.into())
    }
}

impl From<f64> for ChannelValue {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(ChannelValue::Null, ChannelValue::Number)
    }
}

impl From<Message> for ChannelValue {
    fn from(m: Message) -> Self {
        ChannelValue::Message(m)
    }
}

impl From<Vec<ChannelValue>> for ChannelValue {
    fn from(items: Vec<ChannelValue>) -> Self {
        ChannelValue::Sequence(items)
    }
}

impl Serialize for ChannelValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ChannelValue::Null => serializer.serialize_unit(),
            ChannelValue::Bool(b) => serializer.serialize_bool(*b),
            ChannelValue::Number(n) => n.serialize(serializer),
            ChannelValue::String(s) => serializer.serialize_str(s),
            ChannelValue::Sequence(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            ChannelValue::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
            ChannelValue::Message(m) => m.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ChannelValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(ChannelValue::from)
    }
}
