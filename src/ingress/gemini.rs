// Gemini ingress converter
//
// Clients send GenerateContent bodies with the model in the URL path.
// `contents` roles map user/model onto user/assistant, `systemInstruction`
// demotes to a leading system message, and streaming responses go back as
// newline-delimited JSON candidates rather than SSE.

use serde_json::{json, Value};

use super::{IngressConverter, StreamFormatter};
use crate::error::{GatewayError, Result};
use crate::models::gemini::{gemini_finish_reason, GeminiPart, GeminiRequest};
use crate::models::unified::{
    Message, ToolCall, Tool, ToolFunction, UnifiedRequest, UnifiedResponse, ROLE_ASSISTANT,
    ROLE_SYSTEM, ROLE_TOOL, ROLE_USER,
};

pub struct GeminiConverter;

impl IngressConverter for GeminiConverter {
    fn parse_request(&self, raw: &[u8], model_hint: Option<&str>) -> Result<UnifiedRequest> {
        let parsed: GeminiRequest = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Validation(format!("invalid request body: {}", e)))?;

        let model = model_hint
            .ok_or_else(|| GatewayError::Validation("missing model in request path".to_string()))?;

        let mut messages = Vec::new();

        if let Some(system) = &parsed.system_instruction {
            let text = system.joined_text();
            if !text.is_empty() {
                messages.push(Message::text(ROLE_SYSTEM, text));
            }
        }

        for content in &parsed.contents {
            let role = match content.role.as_deref() {
                Some("model") => ROLE_ASSISTANT,
                _ => ROLE_USER,
            };

            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();
            let mut tool_messages = Vec::new();

            for part in &content.parts {
                match part {
                    GeminiPart::Text { text } => text_parts.push(text.as_str()),
                    GeminiPart::FunctionCall { function_call } => {
                        tool_calls.push(ToolCall::function(
                            format!("call_{}", uuid::Uuid::new_v4().simple()),
                            &function_call.name,
                            function_call.args.to_string(),
                        ));
                    }
                    GeminiPart::FunctionResponse { function_response } => {
                        tool_messages.push(Message {
                            role: ROLE_TOOL.to_string(),
                            content: function_response.response.to_string(),
                            name: Some(function_response.name.clone()),
                            tool_call_id: Some(function_response.name.clone()),
                            tool_calls: None,
                        });
                    }
                    // Binary payloads pass through as nothing
                    GeminiPart::InlineData { .. } => {}
                }
            }

            if !text_parts.is_empty() || !tool_calls.is_empty() {
                messages.push(Message {
                    role: role.to_string(),
                    content: text_parts.join("\n"),
                    name: None,
                    tool_call_id: None,
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                });
            }
            messages.extend(tool_messages);
        }

        let tools = parsed.tools.as_ref().and_then(|decls| {
            let functions: Vec<Tool> = decls
                .iter()
                .flat_map(|d| &d.function_declarations)
                .map(|f| Tool {
                    tool_type: "function".to_string(),
                    function: ToolFunction {
                        name: f.name.clone(),
                        description: f.description.clone(),
                        parameters: f.parameters.clone(),
                    },
                })
                .collect();
            if functions.is_empty() {
                None
            } else {
                Some(functions)
            }
        });

        let mut request = UnifiedRequest::new(model, messages);
        if let Some(config) = &parsed.generation_config {
            request.temperature = config.temperature;
            request.top_p = config.top_p;
            request.top_k = config.top_k;
            request.max_tokens = config.max_output_tokens;
            request.stop = config.stop_sequences.as_ref().map(|seq| {
                Value::Array(seq.iter().cloned().map(Value::String).collect())
            });
        }
        request.tools = tools;
        request.validate()?;
        Ok(request)
    }

    fn format_response(&self, response: &UnifiedResponse) -> Value {
        let choice = response.first_choice();
        let mut parts = Vec::new();

        if let Some(choice) = choice {
            if !choice.message.content.is_empty() {
                parts.push(json!({"text": choice.message.content}));
            }
            for call in choice.message.tool_calls.as_deref().unwrap_or_default() {
                let args: Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                parts.push(json!({
                    "functionCall": {"name": call.function.name, "args": args}
                }));
            }
        }

        let finish_reason = choice
            .and_then(|c| c.finish_reason.as_deref())
            .map(gemini_finish_reason)
            .unwrap_or("STOP");

        json!({
            "candidates": [{
                "content": {"role": "model", "parts": parts},
                "finishReason": finish_reason,
                "index": 0
            }],
            "usageMetadata": {
                "promptTokenCount": response.usage.map(|u| u.prompt_tokens).unwrap_or(0),
                "candidatesTokenCount": response.usage.map(|u| u.completion_tokens).unwrap_or(0),
                "totalTokenCount": response.usage.map(|u| u.total_tokens).unwrap_or(0),
            },
            "modelVersion": response.model,
        })
    }

    fn stream_formatter(&self, _model: &str) -> Box<dyn StreamFormatter> {
        Box::new(GeminiStreamFormatter)
    }
}

/// Newline-delimited JSON candidates; the DONE marker is suppressed
struct GeminiStreamFormatter;

impl StreamFormatter for GeminiStreamFormatter {
    fn format_chunk(&mut self, line: &str) -> Option<String> {
        let data = line.strip_prefix("data: ")?;
        if data.trim() == "[DONE]" {
            return None;
        }
        let chunk: Value = serde_json::from_str(data).ok()?;

        let choice = chunk.get("choices").and_then(|c| c.get(0))?;
        let text = choice
            .pointer("/delta/content")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let finish = choice.get("finish_reason").and_then(|v| v.as_str());

        if text.is_empty() && finish.is_none() {
            return None;
        }

        let mut candidate = json!({
            "content": {"role": "model", "parts": [{"text": text}]},
            "index": 0
        });
        if let Some(finish) = finish {
            candidate["finishReason"] = Value::String(gemini_finish_reason(finish).to_string());
        }

        let mut body = json!({ "candidates": [candidate] });
        if let Some(usage) = chunk.get("usage") {
            body["usageMetadata"] = json!({
                "promptTokenCount": usage.get("prompt_tokens").cloned().unwrap_or(json!(0)),
                "candidatesTokenCount": usage.get("completion_tokens").cloned().unwrap_or(json!(0)),
                "totalTokenCount": usage.get("total_tokens").cloned().unwrap_or(json!(0)),
            });
        }

        Some(format!("{}\n", body))
    }

    fn finish(&mut self) -> Option<String> {
        None
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
