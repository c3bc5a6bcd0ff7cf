/// A piece of content inside a turn.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ContentPart {
    /// Plain text.
    Text(String),
    /// Structured JSON, such as a decoded final value.
    Json(serde_json::Value),
}

/// One exchange unit in a conversation.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    /// Input from the user.
    User { content: Vec<ContentPart> },
    /// A function invocation chosen by the model.
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// The result of a function invocation.
    ToolResult {
        call_id: String,
        name: String,
        result: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Output produced by the model.
    Model { content: Vec<ContentPart> },
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Turn::User {
            content: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Turn::Model {
            content: vec![ContentPart::Text(text.into())],
        }
    }

    /// A model turn carrying a structured value.
    pub fn model_json(value: serde_json::Value) -> Self {
        Turn::Model {
            content: vec![ContentPart::Json(value)],
        }
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Turn::ToolCall {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        result: serde_json::Value,
    ) -> Self {
        Turn::ToolResult {
            call_id: call_id.into(),
            name: name.into(),
            result,
            is_error: false,
        }
    }

    /// Short role name used in logs.
    pub fn role(&self) -> &'static str {
        match self {
            Turn::User { .. } => "user",
            Turn::ToolCall { .. } => "tool_call",
            Turn::ToolResult { .. } => "tool_result",
            Turn::Model { .. } => "model",
        }
    }

    /// Concatenates all text parts in order and ignores non-text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        if let Turn::User { content } | Turn::Model { content } = self {
            for part in content {
                if let ContentPart::Text(text) = part {
                    out.push_str(text);
                }
            }
        }
        out
    }
}

/// A turn as stored in a context log.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TurnRecord {
    /// Zero-based position in the conversation, assigned on append.
    pub index: u64,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
    pub turn: Turn,
}
