use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request from the AI to call a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The conversational role of a message.
///
/// Serialized as `human`, `ai`, `system` or `tool`. The provider-style names
/// `user` and `assistant` are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[serde(alias = "user")]
    Human,
    #[serde(alias = "assistant")]
    Ai,
    System,
    Tool,
}

impl MessageKind {
    /// Resolve a stored type name through the message-type registry.
    ///
    /// Returns `None` for names no message kind is registered under.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "human" | "user" | "humanmessage" => Some(Self::Human),
            "ai" | "assistant" | "aimessage" => Some(Self::Ai),
            "system" | "systemmessage" => Some(Self::System),
            "tool" | "toolmessage" => Some(Self::Tool),
            _ => None,
        }
    }

    /// Canonical type name written by the serializers.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Ai => "ai",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A chat message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type", alias = "role")]
    pub kind: MessageKind,

    pub content: String,

    /// Stable identity token; the End node carries it over to rewritten messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            id: None,
            name: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Human, content)
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Ai, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageKind::System, content)
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(MessageKind::Tool, content)
        }
    }

    pub fn ai_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(MessageKind::Ai, content)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Interpret a JSON value as a message, if it has a message shape.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if !obj.get("content").is_some_and(Value::is_string) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}
