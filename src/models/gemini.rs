// Google Gemini GenerateContent wire models
//
// Gemini speaks `contents` with role user/model, typed `parts`, a separate
// `systemInstruction`, and `generationConfig` for sampling knobs. Streaming
// responses to Gemini-protocol clients are newline-delimited JSON candidates,
// not SSE.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GeminiToolDecl>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<GeminiPart>,
}

impl GeminiContent {
    pub fn text(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(|r| r.to_string()),
            parts: vec![GeminiPart::Text { text: text.into() }],
        }
    }

    /// Newline-join of all text parts
    pub fn joined_text(&self) -> String {
        let texts: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                GeminiPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        texts.join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeminiPart {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    FunctionCall {
        function_call: GeminiFunctionCall,
    },
    #[serde(rename_all = "camelCase")]
    FunctionResponse {
        function_response: GeminiFunctionResponse,
    },
    #[serde(rename_all = "camelCase")]
    InlineData {
        inline_data: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// Tool declarations nest as `tools[0].functionDeclarations`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiToolDecl {
    pub function_declarations: Vec<GeminiFunctionDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionDecl {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

// ==================================================================================================
// Response Models
// ==================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    pub content: GeminiContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

// ==================================================================================================
// Finish-reason mapping
// ==================================================================================================

/// Gemini finishReason -> OpenAI finish_reason
pub fn finish_reason_from_gemini(reason: &str) -> &'static str {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" => "content_filter",
        _ => "stop",
    }
}

/// OpenAI finish_reason -> Gemini finishReason
pub fn gemini_finish_reason(finish: &str) -> &'static str {
    match finish {
        "stop" => "STOP",
        "length" => "MAX_TOKENS",
        "content_filter" => "SAFETY",
        "tool_calls" => "STOP",
        _ => "STOP",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_table() {
        assert_eq!(finish_reason_from_gemini("STOP"), "stop");
        assert_eq!(finish_reason_from_gemini("MAX_TOKENS"), "length");
        assert_eq!(finish_reason_from_gemini("SAFETY"), "content_filter");
        assert_eq!(finish_reason_from_gemini("RECITATION"), "content_filter");
        assert_eq!(finish_reason_from_gemini("OTHER"), "stop");
    }

    #[test]
    fn test_part_untagged_decoding() {
        let part: GeminiPart = serde_json::from_str(r#"{"text":"hello"}"#).unwrap();
        assert!(matches!(part, GeminiPart::Text { .. }));

        let part: GeminiPart =
            serde_json::from_str(r#"{"functionCall":{"name":"f","args":{"a":1}}}"#).unwrap();
        assert!(matches!(part, GeminiPart::FunctionCall { .. }));
    }

    #[test]
    fn test_joined_text() {
        let content = GeminiContent {
            role: Some("user".into()),
            parts: vec![
                GeminiPart::Text { text: "a".into() },
                GeminiPart::Text { text: "b".into() },
            ],
        };
        assert_eq!(content.joined_text(), "a\nb");
    }

    #[test]
    fn test_usage_metadata_defaults() {
        let usage: UsageMetadata = serde_json::from_str(r#"{"promptTokenCount": 7}"#).unwrap();
        assert_eq!(usage.prompt_token_count, 7);
        assert_eq!(usage.candidates_token_count, 0);
    }
}
