use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;

/// Options controlling a ChatModel invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallOptions {
    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature (0.0 - 2.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Stop sequences.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// Result of a chat model generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResult {
    /// The generated message.
    pub message: Message,
}

/// Trait for chat language models.
///
/// The checkpoint store never talks to a provider itself; this is the seam the
/// End node uses when a secondary model reformats the final answer.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generate a response for the given messages.
    async fn generate(&self, messages: &[Message], options: &CallOptions) -> Result<ChatResult>;

    /// Return the model name/identifier.
    fn model_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockChatModel {
        response: String,
    }

    #[async_trait]
    impl ChatModel for MockChatModel {
        async fn generate(
            &self,
            _messages: &[Message],
            _options: &CallOptions,
        ) -> Result<ChatResult> {
            Ok(ChatResult {
                message: Message::ai(self.response.clone()),
            })
        }

        fn model_name(&self) -> &str {
            "mock-model"
        }
    }

    #[tokio::test]
    async fn mock_chat_model_generate() {
        let model = MockChatModel {
            response: "Hello!".into(),
        };
        let messages = vec![Message::human("Hi")];
        let result = model
            .generate(&messages, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(result.message.content, "Hello!");
        assert_eq!(model.model_name(), "mock-model");
    }

    #[test]
    fn call_options_default() {
        let opts = CallOptions::default();
        assert!(opts.max_tokens.is_none());
        assert!(opts.temperature.is_none());
        assert!(opts.stop.is_empty());
        assert_eq!(serde_json::to_string(&opts).unwrap(), "{}");
    }
}
