use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use threadline_checkpoint::types::{
    Checkpoint, CheckpointMetadata, CheckpointSource, CheckpointTuple, MESSAGES,
};
use threadline_core::error::{Result, StateError, ThreadlineError};
use threadline_core::message::Message;
use threadline_core::model::{CallOptions, ChatModel};
use threadline_core::value::ChannelValue;

use crate::constants::END;

/// Rewrites the final message of a run before it is persisted.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Produce the replacement for `message`. `history` is the full message
    /// channel, ending with `message`.
    async fn process(&self, message: &Message, history: &[ChannelValue]) -> Result<Message>;
}

/// Post-processing by a secondary chat model.
pub struct ModelPostProcessor {
    model: Arc<dyn ChatModel>,
    instructions: Option<String>,
    options: CallOptions,
}

impl ModelPostProcessor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            instructions: None,
            options: CallOptions::default(),
        }
    }

    /// System prompt telling the model how to rework the answer.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl PostProcessor for ModelPostProcessor {
    async fn process(&self, message: &Message, _history: &[ChannelValue]) -> Result<Message> {
        let mut prompt = Vec::with_capacity(2);
        if let Some(instructions) = &self.instructions {
            prompt.push(Message::system(instructions.clone()));
        }
        prompt.push(Message::human(message.content.clone()));

        let result = self
            .model
            .generate(&prompt, &self.options)
            .await
            .map_err(|e| StateError::PostProcess(format!("{}: {e}", self.model.model_name())))?;
        Ok(result.message)
    }
}

/// How the finalized answer reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Post-processing produced the answer; it is delivered as a stream.
    Streamed,
    /// The answer is returned as a single value.
    Terminal,
}

/// Result of the End node, ready to be persisted.
#[derive(Debug, Clone)]
pub struct EndOutput {
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    /// The final message, after post-processing.
    pub message: Option<Message>,
    pub delivery: Delivery,
}

/// Whether a checkpoint was written by the End node.
pub fn is_terminal(metadata: &CheckpointMetadata) -> bool {
    metadata
        .writes
        .as_ref()
        .and_then(Value::as_object)
        .is_some_and(|writes| writes.contains_key(END))
}

/// Run the End node over `prior`.
///
/// The returned checkpoint has a new id, `v` one higher than `prior`, and a
/// timestamp strictly after `prior.ts`. When a post-processor is given, the
/// last message is replaced by its output, keeping the original message id.
pub async fn finalize(
    prior: &CheckpointTuple,
    post_processor: Option<&dyn PostProcessor>,
) -> Result<EndOutput> {
    let mut checkpoint = prior.checkpoint.successor();
    checkpoint.v = prior.checkpoint.v + 1;
    checkpoint.ts = Utc::now().max(prior.checkpoint.ts + Duration::microseconds(1));

    let last = checkpoint.last_message().cloned();
    let (message, delivery) = match (post_processor, last) {
        (Some(processor), Some(original)) => {
            let mut replacement = processor.process(&original, checkpoint.messages()).await?;
            replacement.id = original.id.clone();
            replace_last_message(&mut checkpoint, replacement.clone())?;
            (Some(replacement), Delivery::Streamed)
        }
        (_, last) => (last, Delivery::Terminal),
    };

    let record = json!({
        END: {
            "message": message.as_ref().map(|m| ChannelValue::Message(m.clone()).to_json()),
            "delivery": delivery,
        }
    });
    let metadata = CheckpointMetadata::new(CheckpointSource::Loop, prior.metadata.step + 1)
        .with_writes(record)
        .with_parent("", prior.checkpoint.id.clone());

    tracing::debug!(
        checkpoint_id = %checkpoint.id,
        v = checkpoint.v,
        ?delivery,
        "run finalized"
    );
    Ok(EndOutput {
        checkpoint,
        metadata,
        message,
        delivery,
    })
}

fn replace_last_message(checkpoint: &mut Checkpoint, replacement: Message) -> Result<()> {
    let mut messages = checkpoint
        .channel_values
        .get(MESSAGES)
        .and_then(ChannelValue::as_sequence)
        .map(<[ChannelValue]>::to_vec)
        .ok_or_else(|| ThreadlineError::Other("messages channel is not a sequence".into()))?;
    if let Some(last) = messages.last_mut() {
        *last = ChannelValue::Message(replacement);
    }
    checkpoint.set_channel(MESSAGES, ChannelValue::Sequence(messages));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadline_core::model::ChatResult;

    struct Upper;

    #[async_trait]
    impl PostProcessor for Upper {
        async fn process(&self, message: &Message, _history: &[ChannelValue]) -> Result<Message> {
            Ok(Message::ai(message.content.to_uppercase()).with_id("fresh-id"))
        }
    }

    struct EchoModel;

    #[async_trait]
    impl ChatModel for EchoModel {
        async fn generate(&self, messages: &[Message], _options: &CallOptions) -> Result<ChatResult> {
            let seen: Vec<_> = messages.iter().map(|m| m.kind.to_string()).collect();
            Ok(ChatResult {
                message: Message::ai(format!("[{}] {}", seen.join(","), messages.last().map_or("", |m| m.content.as_str()))),
            })
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        async fn generate(&self, _: &[Message], _: &CallOptions) -> Result<ChatResult> {
            Err(ThreadlineError::Model("rate limited".into()))
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    fn prior() -> CheckpointTuple {
        let mut cp = Checkpoint::new();
        cp.set_channel(
            MESSAGES,
            ChannelValue::messages([Message::human("hi"), Message::ai("hello there").with_id("m-1")]),
        );
        CheckpointTuple::from_row("conv-1", cp, CheckpointMetadata::new(CheckpointSource::Loop, 2), None)
    }

    #[tokio::test]
    async fn without_post_processing_is_terminal() {
        let prior = prior();
        let out = finalize(&prior, None).await.unwrap();

        assert_eq!(out.checkpoint.v, prior.checkpoint.v + 1);
        assert!(out.checkpoint.ts > prior.checkpoint.ts);
        assert_eq!(out.checkpoint.channel_values[MESSAGES], prior.checkpoint.channel_values[MESSAGES]);
        assert_eq!(out.delivery, Delivery::Terminal);
        assert_eq!(out.message.unwrap().content, "hello there");
        assert!(is_terminal(&out.metadata));
        assert_eq!(out.metadata.step, 3);
        assert_eq!(out.metadata.parents[""], prior.checkpoint.id);
    }

    #[tokio::test]
    async fn post_processing_keeps_original_id() {
        let prior = prior();
        let out = finalize(&prior, Some(&Upper)).await.unwrap();

        let last = out.checkpoint.last_message().unwrap();
        assert_eq!(last.content, "HELLO THERE");
        assert_eq!(last.id.as_deref(), Some("m-1"));
        assert_eq!(out.checkpoint.messages().len(), 2);
        assert_eq!(out.delivery, Delivery::Streamed);
        assert_eq!(
            out.checkpoint.channel_versions[MESSAGES],
            prior.checkpoint.channel_versions[MESSAGES] + 1
        );
    }

    #[tokio::test]
    async fn model_post_processor_sends_instructions() {
        let processor = ModelPostProcessor::new(Arc::new(EchoModel)).with_instructions("be brief");
        let out = finalize(&prior(), Some(&processor)).await.unwrap();
        assert_eq!(out.message.unwrap().content, "[system,human] hello there");
    }

    #[tokio::test]
    async fn model_failure_is_a_post_process_error() {
        let processor = ModelPostProcessor::new(Arc::new(FailingModel));
        let err = finalize(&prior(), Some(&processor)).await.unwrap_err();
        assert!(matches!(err, ThreadlineError::State(StateError::PostProcess(ref m)) if m.contains("flaky")));
    }

    #[tokio::test]
    async fn empty_history_has_no_message() {
        let tuple = CheckpointTuple::from_row("conv-1", Checkpoint::new(), CheckpointMetadata::default(), None);
        let out = finalize(&tuple, Some(&Upper)).await.unwrap();
        assert!(out.message.is_none());
        assert_eq!(out.delivery, Delivery::Terminal);
        assert_eq!(out.checkpoint.v, tuple.checkpoint.v + 1);
    }

    #[test]
    fn terminal_marker_detection() {
        assert!(!is_terminal(&CheckpointMetadata::default()));
        let meta = CheckpointMetadata::default().with_writes(json!({"__end__": null}));
        assert!(is_terminal(&meta));
    }
}
