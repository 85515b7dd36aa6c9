//! Upstream wire types for `generateAssistantResponse`.
//!
//! The upstream speaks a camelCase `conversationState` envelope: an ordered
//! `history` of user/assistant turns plus the `currentMessage` lifted out of
//! it. Serialization must match the wire exactly.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    pub conversation_state: ConversationState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub chat_trigger_type: &'static str,
    pub conversation_id: String,
    pub current_message: Turn,
    pub history: Vec<Turn>,
}

pub const CHAT_TRIGGER_MANUAL: &str = "MANUAL";

/// One conversation turn. Externally tagged so a user turn serializes as
/// `{"userInputMessage": {…}}` and an assistant turn as
/// `{"assistantResponseMessage": {…}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Turn {
    UserInputMessage(UserInputMessage),
    AssistantResponseMessage(AssistantResponseMessage),
}

impl Turn {
    pub fn is_user(&self) -> bool {
        matches!(self, Turn::UserInputMessage(_))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    /// Set on the current message only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub origin: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<UserInputMessageContext>,
}

pub const ORIGIN_AI_EDITOR: &str = "AI_EDITOR";

impl UserInputMessage {
    pub fn text(content: String) -> Self {
        Self {
            content,
            model_id: None,
            origin: ORIGIN_AI_EDITOR,
            user_input_message_context: None,
        }
    }

    /// Context accessor that materialises the optional envelope on demand.
    pub fn context_mut(&mut self) -> &mut UserInputMessageContext {
        self.user_input_message_context
            .get_or_insert_with(UserInputMessageContext::default)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolEnvelope>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEnvelope {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

/// The upstream nests the JSON Schema under a `json` key.
#[derive(Debug, Clone, Serialize)]
pub struct InputSchema {
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<ToolUse>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: Vec<ToolResultContent>,
    pub status: &'static str,
}

pub const TOOL_RESULT_SUCCESS: &str = "success";

#[derive(Debug, Clone, Serialize)]
pub struct ToolResultContent {
    pub text: String,
}
