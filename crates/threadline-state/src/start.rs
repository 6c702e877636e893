use std::collections::HashMap;

use futures::StreamExt;
use serde_json::{Map, Value};

use threadline_checkpoint::store::collect_tuples;
use threadline_checkpoint::thread::ThreadCheckpointer;
use threadline_checkpoint::types::{
    Checkpoint, CheckpointMetadata, CheckpointSource, CheckpointTuple, ListOptions, MESSAGES,
};
use threadline_core::error::Result;
use threadline_core::value::ChannelValue;

use crate::constants::START;
use crate::declaration::StateSchema;
use crate::reducer::{fold_pending_writes, merge_channel};

/// Rows read per page while skipping carriers to find the latest checkpoint.
const SCAN_PAGE: usize = 8;

pub(crate) fn is_carrier(tuple: &CheckpointTuple) -> bool {
    tuple.metadata.source == CheckpointSource::PendingWrites
}

/// Load the thread's latest real checkpoint with its task writes queued.
///
/// Durable stores keep task writes in carrier checkpoints keyed by task id,
/// which sort anywhere relative to the checkpoint they belong to. Carriers
/// are skipped when picking the checkpoint, then the writes of those whose
/// parent it is are queued on its `pending_sends`.
pub async fn resolve_latest(checkpointer: &ThreadCheckpointer) -> Result<Option<CheckpointTuple>> {
    let Some(mut base) = latest_checkpoint(checkpointer).await? else {
        return Ok(None);
    };
    attach_pending(checkpointer, &mut base).await?;
    Ok(Some(base))
}

async fn latest_checkpoint(checkpointer: &ThreadCheckpointer) -> Result<Option<CheckpointTuple>> {
    let Some(latest) = checkpointer.get_tuple().await? else {
        return Ok(None);
    };
    if !is_carrier(&latest) {
        return Ok(Some(latest));
    }

    // Page backwards, decoding lazily, until a real checkpoint turns up.
    let mut cursor = latest.checkpoint.id;
    let mut carriers = 1;
    loop {
        let mut page = checkpointer.list(ListOptions::new().before(cursor.clone()).limit(SCAN_PAGE));
        let mut seen = 0;
        while let Some(tuple) = page.next().await {
            let tuple = tuple?;
            if !is_carrier(&tuple) {
                return Ok(Some(tuple));
            }
            seen += 1;
            cursor = tuple.checkpoint.id;
        }
        carriers += seen;
        if seen < SCAN_PAGE {
            tracing::warn!(
                thread_id = checkpointer.thread_id(),
                carriers,
                "pending writes recorded on a thread without checkpoints; ignoring"
            );
            return Ok(None);
        }
    }
}

/// Queue the writes recorded against `base` on its `pending_sends`.
///
/// Only the checkpoint's direct children are read.
pub(crate) async fn attach_pending(
    checkpointer: &ThreadCheckpointer,
    base: &mut CheckpointTuple,
) -> Result<()> {
    let children = collect_tuples(
        checkpointer.list(ListOptions::new().parent(base.checkpoint.id.clone())),
    )
    .await?;
    attach_carriers(base, children.into_iter().filter(is_carrier).collect());
    Ok(())
}

/// Queue the writes of carriers parented on `base`, oldest carrier first.
fn attach_carriers(base: &mut CheckpointTuple, carriers: Vec<CheckpointTuple>) {
    let base_id = base.checkpoint.id.as_str();
    let mut writes = Vec::new();
    for carrier in carriers.into_iter().rev() {
        let parent = carrier.parent_config.as_ref().and_then(|p| p.checkpoint_id.as_deref());
        if parent == Some(base_id) {
            writes.extend(carrier.checkpoint.pending_sends);
        }
    }
    if !writes.is_empty() {
        tracing::debug!(
            checkpoint_id = %base.checkpoint.id,
            writes = writes.len(),
            "queued pending writes from carriers"
        );
    }
    base.checkpoint.pending_sends.extend(writes);
}

/// Compute the initial checkpoint of a run.
///
/// Precedence, lowest first: schema defaults, values already in `base`,
/// inbound values. Inbound custom channels merge through their reducer. An
/// inbound `messages` list replaces the stored history when it is non-empty.
pub fn seed_checkpoint(
    base: Option<&CheckpointTuple>,
    schema: &StateSchema,
    mut inbound: HashMap<String, ChannelValue>,
) -> (Checkpoint, CheckpointMetadata) {
    let record: Map<String, Value> = inbound
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();

    let mut checkpoint = base.map_or_else(Checkpoint::new, |t| t.checkpoint.successor());
    for (key, default) in schema.defaults() {
        if !checkpoint.channel_values.contains_key(&key) {
            checkpoint.set_channel(key, default);
        }
    }
    fold_pending_writes(&mut checkpoint, schema);

    if let Some(messages) = inbound.remove(MESSAGES) {
        let messages = messages.promote_messages().into_sequence();
        if !messages.is_empty() {
            let messages = ChannelValue::Sequence(messages);
            if checkpoint.channel_values.get(MESSAGES) != Some(&messages) {
                checkpoint.set_channel(MESSAGES, messages);
            }
        }
    }
    for (key, value) in inbound {
        merge_channel(&mut checkpoint, schema, &key, value);
    }

    let step = base.map_or(-1, |t| t.metadata.step + 1);
    let mut metadata = CheckpointMetadata::new(CheckpointSource::Input, step)
        .with_writes(Value::Object(Map::from_iter([(START.to_string(), Value::Object(record))])));
    if let Some(parent) = base {
        metadata = metadata.with_parent("", parent.checkpoint.id.clone());
    }
    (checkpoint, metadata)
}

/// Run the Start node: seed state from the thread's latest checkpoint and the
/// inbound values, then persist it.
pub async fn start(
    checkpointer: &ThreadCheckpointer,
    schema: &StateSchema,
    inbound: HashMap<String, ChannelValue>,
) -> Result<CheckpointTuple> {
    let latest = resolve_latest(checkpointer).await?;
    let (checkpoint, metadata) = seed_checkpoint(latest.as_ref(), schema, inbound);
    let parent_id = latest.map(|t| t.checkpoint.id);

    let tuple = CheckpointTuple::from_row(checkpointer.thread_id(), checkpoint, metadata, parent_id);
    checkpointer.put_tuple(tuple.clone()).await?;
    tracing::debug!(
        thread_id = checkpointer.thread_id(),
        checkpoint_id = %tuple.checkpoint.id,
        step = tuple.metadata.step,
        "run started"
    );
    Ok(tuple)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use threadline_checkpoint::sqlite::SqliteCheckpointStore;
    use threadline_checkpoint::types::PendingWrite;
    use threadline_core::message::Message;

    use crate::declaration::ChannelDeclaration;

    fn inbound(pairs: Value) -> HashMap<String, ChannelValue> {
        match pairs {
            Value::Object(map) => map.into_iter().map(|(k, v)| (k, ChannelValue::from(v))).collect(),
            _ => HashMap::new(),
        }
    }

    fn stored(messages: Vec<Message>, extra: &[(&str, ChannelValue)]) -> CheckpointTuple {
        let mut cp = Checkpoint::new();
        cp.set_channel(MESSAGES, ChannelValue::messages(messages));
        for (k, v) in extra {
            cp.set_channel(*k, v.clone());
        }
        CheckpointTuple::from_row("conv-1", cp, CheckpointMetadata::new(CheckpointSource::Loop, 3), None)
    }

    #[tokio::test]
    async fn fresh_thread_takes_inbound_messages() {
        let handle = ThreadCheckpointer::transient("conv-1");
        let tuple = start(
            &handle,
            &StateSchema::new(),
            inbound(json!({"messages": [{"role": "human", "content": "hi"}]})),
        )
        .await
        .unwrap();

        assert_eq!(
            tuple.checkpoint.channel_values[MESSAGES],
            ChannelValue::messages([Message::human("hi")])
        );
        assert_eq!(tuple.checkpoint.channel_values[MESSAGES].to_json(), json!([{"type": "human", "content": "hi"}]));
        assert_eq!(tuple.metadata.source, CheckpointSource::Input);
        assert_eq!(tuple.metadata.step, -1);
        assert!(tuple.parent_config.is_none());

        let persisted = handle.get_tuple().await.unwrap().unwrap();
        assert_eq!(persisted.checkpoint, tuple.checkpoint);
    }

    #[test]
    fn precedence_defaults_then_checkpoint_then_inbound() {
        let schema = StateSchema::new()
            .with_channel(ChannelDeclaration::replace("topic", "default".into()))
            .with_channel(ChannelDeclaration::replace("mode", "fast".into()))
            .with_channel(ChannelDeclaration::append("notes", ChannelValue::Null));
        let base = stored(
            vec![Message::human("earlier")],
            &[("topic", "stored".into()), ("notes", ChannelValue::from(json!(["a"])))],
        );

        let (cp, meta) = seed_checkpoint(
            Some(&base),
            &schema,
            inbound(json!({"topic": "inbound", "notes": ["b"], "messages": []})),
        );
        assert_eq!(cp.channel_values["topic"], ChannelValue::from("inbound"));
        assert_eq!(cp.channel_values["mode"], ChannelValue::from("fast"));
        assert_eq!(cp.channel_values["notes"], ChannelValue::from(json!(["a", "b"])));
        // Empty inbound messages keep the stored history.
        assert_eq!(cp.messages().len(), 1);
        assert_eq!(meta.step, 4);
        assert_eq!(meta.parents[""], base.checkpoint.id);
        assert_ne!(cp.id, base.checkpoint.id);
    }

    #[test]
    fn inbound_messages_replace_stored_history() {
        let base = stored(vec![Message::human("old"), Message::ai("reply")], &[]);
        let (cp, _) = seed_checkpoint(
            Some(&base),
            &StateSchema::new(),
            inbound(json!({"messages": [{"type": "human", "content": "new"}]})),
        );
        assert_eq!(cp.channel_values[MESSAGES], ChannelValue::messages([Message::human("new")]));
        assert_eq!(
            cp.channel_versions[MESSAGES],
            base.checkpoint.channel_versions[MESSAGES] + 1
        );
    }

    #[test]
    fn null_inbound_value_keeps_stored_value() {
        let base = stored(vec![], &[("topic", "stored".into())]);
        let (cp, _) = seed_checkpoint(Some(&base), &StateSchema::new(), inbound(json!({"topic": null})));
        assert_eq!(cp.channel_values["topic"], ChannelValue::from("stored"));
        assert_eq!(cp.channel_versions["topic"], base.checkpoint.channel_versions["topic"]);
    }

    #[test]
    fn inbound_is_recorded_under_start_key() {
        let (_, meta) = seed_checkpoint(None, &StateSchema::new(), inbound(json!({"topic": "x"})));
        assert_eq!(meta.writes.unwrap(), json!({"__start__": {"topic": "x"}}));
    }

    #[test]
    fn pending_writes_on_base_are_folded() {
        let mut base = stored(vec![], &[]);
        base.checkpoint.pending_sends.push(PendingWrite {
            task_id: "task-1".into(),
            channel: MESSAGES.into(),
            value: ChannelValue::Message(Message::tool("42", "call_1")),
        });
        let (cp, _) = seed_checkpoint(Some(&base), &StateSchema::new(), HashMap::new());
        assert!(cp.pending_sends.is_empty());
        assert_eq!(cp.messages().len(), 1);
    }

    #[tokio::test]
    async fn carriers_resolve_to_their_parent() {
        let handle = sqlite_handle();
        let first = start(
            &handle,
            &StateSchema::new(),
            inbound(json!({"messages": [{"role": "human", "content": "2+2?"}]})),
        )
        .await
        .unwrap();
        handle
            .put_writes(
                Some(first.checkpoint.id.as_str()),
                vec![(MESSAGES.into(), ChannelValue::Message(Message::tool("4", "call_1")))],
                "task-1",
            )
            .await
            .unwrap();

        let resolved = resolve_latest(&handle).await.unwrap().unwrap();
        assert_eq!(resolved.checkpoint.id, first.checkpoint.id);
        assert_eq!(resolved.checkpoint.pending_sends.len(), 1);

        let second = start(&handle, &StateSchema::new(), HashMap::new()).await.unwrap();
        assert_eq!(second.checkpoint.messages().len(), 2);
        assert_eq!(second.metadata.step, 0);
        assert_eq!(
            second.parent_config.unwrap().checkpoint_id.as_deref(),
            Some(first.checkpoint.id.as_str())
        );
    }

    fn sqlite_handle() -> ThreadCheckpointer {
        ThreadCheckpointer::new(Arc::new(SqliteCheckpointStore::in_memory()), "conv-1")
    }

    fn tool_write(content: &str) -> Vec<(String, ChannelValue)> {
        vec![(MESSAGES.into(), ChannelValue::Message(Message::tool(content, "call_1")))]
    }

    #[tokio::test]
    async fn task_writes_sorting_below_the_head_are_folded() {
        let handle = sqlite_handle();
        let hi = inbound(json!({"messages": [{"role": "human", "content": "hi"}]}));
        let first = start(&handle, &StateSchema::new(), hi).await.unwrap();
        handle
            .put_writes(Some(first.checkpoint.id.as_str()), tool_write("42"), "0-task")
            .await
            .unwrap();

        // The carrier sorts below the head, so the head is still the latest row.
        let latest = handle.get_tuple().await.unwrap().unwrap();
        assert_eq!(latest.checkpoint.id, first.checkpoint.id);

        let second = start(&handle, &StateSchema::new(), HashMap::new()).await.unwrap();
        assert_eq!(second.checkpoint.messages().len(), 2);
        assert_eq!(second.checkpoint.last_message().unwrap().content, "42");
    }

    #[tokio::test]
    async fn many_carriers_above_the_head_are_skipped() {
        let handle = sqlite_handle();
        let first = start(&handle, &StateSchema::new(), HashMap::new()).await.unwrap();
        for i in 0..SCAN_PAGE + 3 {
            let task_id = format!("task-{i:02}");
            handle
                .put_writes(Some(first.checkpoint.id.as_str()), tool_write(&i.to_string()), &task_id)
                .await
                .unwrap();
        }

        let resolved = resolve_latest(&handle).await.unwrap().unwrap();
        assert_eq!(resolved.checkpoint.id, first.checkpoint.id);
        assert_eq!(resolved.checkpoint.pending_sends.len(), SCAN_PAGE + 3);
        // Oldest carrier first.
        assert_eq!(resolved.checkpoint.pending_sends[0].task_id, "task-00");
    }

    #[tokio::test]
    async fn carriers_without_a_checkpoint_are_ignored() {
        let handle = sqlite_handle();
        handle.put_writes(None, tool_write("lost"), "task-1").await.unwrap();
        assert!(resolve_latest(&handle).await.unwrap().is_none());

        let started = start(&handle, &StateSchema::new(), HashMap::new()).await.unwrap();
        assert!(started.checkpoint.messages().is_empty());
        assert_eq!(started.metadata.step, -1);
    }
}
