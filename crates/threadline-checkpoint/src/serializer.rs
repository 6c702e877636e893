//! Serialization protocol for checkpoints.
//!
//! Durable backends store checkpoints and metadata as opaque blobs produced by
//! a [`SerializerProtocol`]. The default [`MessageSerializer`] keeps message
//! type identity across a round-trip; [`StructuralSerializer`] is a plain deep
//! JSON encoding.

use serde_json::{Map, Value};

use threadline_core::error::CheckpointError;
use threadline_core::message::{Message, MessageKind};
use threadline_core::value::ChannelValue;

use crate::types::{Checkpoint, CheckpointMetadata, MESSAGES};

type SerResult<T> = std::result::Result<T, CheckpointError>;

/// Converts checkpoints and metadata to bytes and back.
pub trait SerializerProtocol: Send + Sync {
    fn dumps_checkpoint(&self, checkpoint: &Checkpoint) -> SerResult<Vec<u8>>;

    fn loads_checkpoint(&self, data: &[u8]) -> SerResult<Checkpoint>;

    fn dumps_metadata(&self, metadata: &CheckpointMetadata) -> SerResult<Vec<u8>> {
        serde_json::to_vec(metadata)
            .map_err(|e| CheckpointError::CorruptRecord(format!("encode metadata: {e}")))
    }

    fn loads_metadata(&self, data: &[u8]) -> SerResult<CheckpointMetadata> {
        serde_json::from_slice(data)
            .map_err(|e| CheckpointError::CorruptRecord(format!("decode metadata: {e}")))
    }
}

/// Deep JSON encoding with no special cases.
///
/// Message values come back as plain maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralSerializer;

impl SerializerProtocol for StructuralSerializer {
    fn dumps_checkpoint(&self, checkpoint: &Checkpoint) -> SerResult<Vec<u8>> {
        serde_json::to_vec(checkpoint)
            .map_err(|e| CheckpointError::CorruptRecord(format!("encode checkpoint: {e}")))
    }

    fn loads_checkpoint(&self, data: &[u8]) -> SerResult<Checkpoint> {
        serde_json::from_slice(data)
            .map_err(|e| CheckpointError::CorruptRecord(format!("decode checkpoint: {e}")))
    }
}

/// JSON encoding that stores each entry of the `messages` channel as
/// `{"type": ..., "data": {...}}` and rebuilds it through the message-type
/// registry on load.
///
/// Decoding is tolerant: an entry whose type is not registered, or whose data
/// is not a valid message, is kept as its raw structural value.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageSerializer;

impl SerializerProtocol for MessageSerializer {
    fn dumps_checkpoint(&self, checkpoint: &Checkpoint) -> SerResult<Vec<u8>> {
        let mut doc = serde_json::to_value(checkpoint)
            .map_err(|e| CheckpointError::CorruptRecord(format!("encode checkpoint: {e}")))?;
        if let Some(messages) = checkpoint.channel_values.get(MESSAGES) {
            if let Some(values) = doc.get_mut("channel_values").and_then(Value::as_object_mut) {
                values.insert(MESSAGES.to_string(), encode_messages(messages));
            }
        }
        serde_json::to_vec(&doc)
            .map_err(|e| CheckpointError::CorruptRecord(format!("encode checkpoint: {e}")))
    }

    fn loads_checkpoint(&self, data: &[u8]) -> SerResult<Checkpoint> {
        let mut doc: Value = serde_json::from_slice(data)
            .map_err(|e| CheckpointError::CorruptRecord(format!("decode checkpoint: {e}")))?;
        let raw_messages = doc
            .get_mut("channel_values")
            .and_then(Value::as_object_mut)
            .and_then(|values| values.remove(MESSAGES));
        let mut checkpoint: Checkpoint = serde_json::from_value(doc)
            .map_err(|e| CheckpointError::CorruptRecord(format!("decode checkpoint: {e}")))?;
        if let Some(raw) = raw_messages {
            checkpoint
                .channel_values
                .insert(MESSAGES.to_string(), decode_messages(raw));
        }
        Ok(checkpoint)
    }
}

fn encode_messages(value: &ChannelValue) -> Value {
    match value {
        ChannelValue::Sequence(items) => Value::Array(items.iter().map(encode_message).collect()),
        other => encode_message(other),
    }
}

fn encode_message(value: &ChannelValue) -> Value {
    match value {
        ChannelValue::Message(message) => {
            let mut data = match value.to_json() {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            data.remove("type");
            let mut stored = Map::new();
            stored.insert("type".into(), Value::String(message.kind.type_name().into()));
            stored.insert("data".into(), Value::Object(data));
            Value::Object(stored)
        }
        other => other.to_json(),
    }
}

fn decode_messages(raw: Value) -> ChannelValue {
    match raw {
        Value::Array(items) => ChannelValue::Sequence(items.into_iter().map(decode_message).collect()),
        other => decode_message(other),
    }
}

fn decode_message(raw: Value) -> ChannelValue {
    match revive_message(&raw) {
        Some(message) => ChannelValue::Message(message),
        None => {
            tracing::debug!("stored message entry has an unknown shape; keeping raw value");
            ChannelValue::from(raw)
        }
    }
}

fn revive_message(raw: &Value) -> Option<Message> {
    let obj = raw.as_object()?;
    if obj.len() != 2 {
        return None;
    }
    let kind = MessageKind::from_type_name(obj.get("type")?.as_str()?)?;
    let mut data = obj.get("data")?.as_object()?.clone();
    data.insert("type".into(), Value::String(kind.type_name().into()));
    Message::from_value(&Value::Object(data))
}
