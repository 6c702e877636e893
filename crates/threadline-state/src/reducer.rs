use serde::{Deserialize, Serialize};

use threadline_checkpoint::types::{Checkpoint, MESSAGES};
use threadline_core::error::StateError;
use threadline_core::value::ChannelValue;

use crate::declaration::StateSchema;

/// How a channel merges a new value into its current one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOp {
    /// Keep only the latest value. A null update leaves the value untouched.
    #[default]
    Replace,
    /// Accumulate values into a sequence.
    Append,
}

impl ChannelOp {
    /// Merge `update` into `current`.
    ///
    /// `Append` flattens sequence updates and pushes anything else as one
    /// element; the result is always a sequence. `Replace` with a null update
    /// is a no-op, not a deletion.
    pub fn apply(self, current: Option<ChannelValue>, update: ChannelValue) -> ChannelValue {
        match self {
            ChannelOp::Replace => {
                if update.is_null() {
                    current.unwrap_or_default()
                } else {
                    update
                }
            }
            ChannelOp::Append => {
                let mut items = current.map(ChannelValue::into_sequence).unwrap_or_default();
                items.extend(update.into_sequence());
                ChannelValue::Sequence(items)
            }
        }
    }

    /// Shape a declared default for this operation.
    pub fn initial(self, default: ChannelValue) -> ChannelValue {
        match self {
            ChannelOp::Replace => default,
            ChannelOp::Append => ChannelValue::Sequence(default.into_sequence()),
        }
    }
}

impl std::fmt::Display for ChannelOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelOp::Replace => write!(f, "replace"),
            ChannelOp::Append => write!(f, "append"),
        }
    }
}

impl std::str::FromStr for ChannelOp {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(ChannelOp::Replace),
            "append" => Ok(ChannelOp::Append),
            other => Err(StateError::UnknownOperation(other.to_string())),
        }
    }
}

/// Merge one update into the checkpoint through the channel's reducer.
///
/// Message-shaped maps written to `messages` are promoted to messages. The
/// channel version is bumped only when the value actually changes.
pub fn merge_channel(
    checkpoint: &mut Checkpoint,
    schema: &StateSchema,
    channel: &str,
    update: ChannelValue,
) -> bool {
    let update = if channel == MESSAGES {
        update.promote_messages()
    } else {
        update
    };
    let current = checkpoint.channel_values.get(channel).cloned();
    let merged = schema.operation(channel).apply(current.clone(), update);
    if current.as_ref() == Some(&merged) {
        return false;
    }
    checkpoint.set_channel(channel, merged);
    true
}

/// Drain the checkpoint's pending writes into its channel values, in order.
///
/// Returns how many writes were applied.
pub fn fold_pending_writes(checkpoint: &mut Checkpoint, schema: &StateSchema) -> usize {
    let writes = std::mem::take(&mut checkpoint.pending_sends);
    let applied = writes.len();
    for write in writes {
        merge_channel(checkpoint, schema, &write.channel, write.value);
    }
    applied
}
