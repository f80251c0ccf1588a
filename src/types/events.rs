use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque single-use credential binding one prepared turn to its stream
/// endpoint. Consumed on the first successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamToken(String);

impl StreamToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Caller input for one chat turn. `model` is mandatory; there is no
/// implicit default because the model choice drives tool-schema negotiation.
#[derive(Debug, Clone, Serialize)]
pub struct TurnInput {
    pub message: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl TurnInput {
    pub fn new(message: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Control-plane response allocating a stream for one turn.
#[derive(Debug, Clone, Deserialize)]
pub struct PreparedTurn {
    pub stream_token: StreamToken,
    pub stream_url: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Approved,
    Rejected,
    AutoApproved,
    Expired,
    Executing,
    Completed,
    Failed,
}

impl ToolCallStatus {
    /// A tool call reaches at most one of these; later transitions are
    /// refused.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ToolCallStatus::Rejected
                | ToolCallStatus::Expired
                | ToolCallStatus::Completed
                | ToolCallStatus::Failed
        )
    }
}

impl Default for ToolCallStatus {
    fn default() -> Self {
        ToolCallStatus::Pending
    }
}

/// A model-requested tool invocation detected mid-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    #[serde(default = "default_json_object")]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub status: ToolCallStatus,
}

fn default_json_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool_call_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Wire form of a pending approval. The server may bound the decision window
/// with `expires_in_ms`; absent that, the local policy expiry applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPayload {
    pub id: String,
    pub tool_call_id: String,
    #[serde(default)]
    pub expires_in_ms: Option<u64>,
}

/// One framed event on the turn stream. Unknown `type` discriminants decode
/// to `Unknown` and are ignored for forward compatibility.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ContentChunk { text: String },
    ToolsAvailable { tools: Vec<ToolDescriptor> },
    ToolCallDetected { call: ToolCall },
    ToolExecuting { tool_name: String },
    ToolResult { result: ToolResultPayload },
    ToolApprovalRequired { approval: ApprovalPayload },
    AssistantMessageComplete { message: String },
    Done,
    Error { message: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthPayload {
    pub status: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub services: HashMap<String, String>,
}
