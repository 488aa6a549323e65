// Kiro (AWS CodeWhisperer) wire models
//
// The request body is a ConversationState: a flat history of user/assistant
// messages plus the current user message. Tools attach only to the current
// message's context. Responses come back as AWS EventStream binary frames.

use serde::{Deserialize, Serialize};

pub const CHAT_TRIGGER_MANUAL: &str = "MANUAL";
pub const ORIGIN_AI_EDITOR: &str = "AI_EDITOR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroRequest {
    pub conversation_state: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_config: Option<InferenceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: String,
    pub history: Vec<KiroMessage>,
    pub current_message: KiroMessage,
    pub chat_trigger_type: String,
}

/// One history entry: either side of the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum KiroMessage {
    #[serde(rename_all = "camelCase")]
    User {
        user_input_message: UserInputMessage,
    },
    #[serde(rename_all = "camelCase")]
    Assistant {
        assistant_response_message: AssistantResponseMessage,
    },
}

impl KiroMessage {
    pub fn user(content: impl Into<String>, model_id: impl Into<String>) -> Self {
        KiroMessage::User {
            user_input_message: UserInputMessage {
                content: content.into(),
                model_id: model_id.into(),
                origin: ORIGIN_AI_EDITOR.to_string(),
                user_input_message_context: None,
            },
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        KiroMessage::Assistant {
            assistant_response_message: AssistantResponseMessage {
                content: content.into(),
                tool_uses: None,
            },
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, KiroMessage::User { .. })
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, KiroMessage::Assistant { .. })
    }

    pub fn content(&self) -> &str {
        match self {
            KiroMessage::User {
                user_input_message,
            } => &user_input_message.content,
            KiroMessage::Assistant {
                assistant_response_message,
            } => &assistant_response_message.content,
        }
    }

    pub fn tool_uses(&self) -> Option<&[KiroToolUse]> {
        match self {
            KiroMessage::Assistant {
                assistant_response_message,
            } => assistant_response_message.tool_uses.as_deref(),
            _ => None,
        }
    }

    pub fn tool_results(&self) -> Option<&[KiroToolResult]> {
        match self {
            KiroMessage::User {
                user_input_message,
            } => user_input_message
                .user_input_message_context
                .as_ref()
                .and_then(|ctx| ctx.tool_results.as_deref()),
            _ => None,
        }
    }

    pub fn has_tool_results(&self) -> bool {
        self.tool_results().is_some_and(|r| !r.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    pub model_id: String,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<UserInputMessageContext>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<KiroToolResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<KiroToolSpec>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_uses: Option<Vec<KiroToolUse>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolResult {
    pub tool_use_id: String,
    pub status: String,
    pub content: Vec<KiroTextBlock>,
}

impl KiroToolResult {
    pub fn success(tool_use_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            status: "success".to_string(),
            content: vec![KiroTextBlock { text: text.into() }],
        }
    }

    pub fn error(tool_use_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            status: "error".to_string(),
            content: vec![KiroTextBlock { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiroTextBlock {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolSpec {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl InferenceConfig {
    pub fn is_empty(&self) -> bool {
        self.max_tokens.is_none() && self.temperature.is_none() && self.top_p.is_none()
    }
}
