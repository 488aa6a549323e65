// Anthropic ingress converter
//
// Clients speak the Messages API: top-level `system`, content that is either
// a string or typed parts, named SSE events on streams. Parsing demotes
// `system` into a leading system-role message, flattens text parts by
// newline join, and promotes `tool_use` parts into tool calls. The stream
// formatter bridges internal OpenAI-style chunks into Anthropic events.

use serde_json::{json, Value};

use super::{IngressConverter, StreamFormatter};
use crate::error::{GatewayError, Result};
use crate::models::anthropic::{stop_reason_from_finish, AnthropicMessagesRequest, ContentBlock};
use crate::models::unified::{
    Message, Tool, ToolCall, ToolFunction, UnifiedRequest, UnifiedResponse, ROLE_SYSTEM, ROLE_TOOL,
};

pub struct AnthropicConverter;

impl IngressConverter for AnthropicConverter {
    fn parse_request(&self, raw: &[u8], _model_hint: Option<&str>) -> Result<UnifiedRequest> {
        let parsed: AnthropicMessagesRequest = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Validation(format!("invalid request body: {}", e)))?;

        let mut messages = Vec::new();

        // Top-level system demotes to a leading system message
        if let Some(system) = &parsed.system {
            let text = match system {
                Value::String(s) => s.clone(),
                Value::Array(parts) => parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => String::new(),
            };
            if !text.is_empty() {
                messages.push(Message::text(ROLE_SYSTEM, text));
            }
        }

        for msg in &parsed.messages {
            messages.extend(convert_message(&msg.role, &msg.content)?);
        }

        let tools = parsed.tools.map(|tools| {
            tools
                .into_iter()
                .map(|t| Tool {
                    tool_type: "function".to_string(),
                    function: ToolFunction {
                        name: t.name,
                        description: t.description,
                        parameters: Some(t.input_schema),
                    },
                })
                .collect()
        });

        let mut request = UnifiedRequest::new(parsed.model, messages);
        request.max_tokens = Some(parsed.max_tokens);
        request.temperature = parsed.temperature;
        request.top_p = parsed.top_p;
        request.top_k = parsed.top_k;
        request.stream = parsed.stream;
        request.tools = tools;
        request.tool_choice = parsed.tool_choice;
        request.stop = parsed
            .stop_sequences
            .map(|seq| Value::Array(seq.into_iter().map(Value::String).collect()));
        request.validate()?;
        Ok(request)
    }

    fn format_response(&self, response: &UnifiedResponse) -> Value {
        let choice = response.first_choice();
        let mut content = Vec::new();

        if let Some(choice) = choice {
            if !choice.message.content.is_empty() {
                content.push(json!({"type": "text", "text": choice.message.content}));
            }
            for call in choice.message.tool_calls.as_deref().unwrap_or_default() {
                let input: Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                content.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.function.name,
                    "input": input,
                }));
            }
        }

        let stop_reason = choice
            .and_then(|c| c.finish_reason.as_deref())
            .map(stop_reason_from_finish)
            .unwrap_or("end_turn");

        json!({
            "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
            "type": "message",
            "role": "assistant",
            "model": response.model,
            "content": content,
            "stop_reason": stop_reason,
            "stop_sequence": null,
            "usage": {
                "input_tokens": response.usage.map(|u| u.prompt_tokens).unwrap_or(0),
                "output_tokens": response.usage.map(|u| u.completion_tokens).unwrap_or(0),
            }
        })
    }

    fn stream_formatter(&self, model: &str) -> Box<dyn StreamFormatter> {
        Box::new(AnthropicStreamFormatter::new(model.to_string()))
    }
}

fn convert_message(role: &str, content: &Value) -> Result<Vec<Message>> {
    match content {
        Value::String(text) => Ok(vec![Message::text(role, text.clone())]),
        Value::Array(parts) => {
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();
            let mut tool_messages = Vec::new();

            for part in parts {
                let block: ContentBlock = match serde_json::from_value(part.clone()) {
                    Ok(block) => block,
                    Err(_) => continue,
                };
                match block {
                    ContentBlock::Text { text } => text_parts.push(text),
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(ToolCall::function(id, name, input.to_string()));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        let text = match content {
                            Some(Value::String(s)) => s,
                            Some(Value::Array(inner)) => inner
                                .iter()
                                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                                .collect::<Vec<_>>()
                                .join("\n"),
                            _ => String::new(),
                        };
                        tool_messages.push(Message {
                            role: ROLE_TOOL.to_string(),
                            content: text,
                            name: None,
                            tool_call_id: Some(tool_use_id),
                            tool_calls: None,
                        });
                    }
                    // Images pass through as nothing; the gateway does not
                    // transcode multimodal payloads
                    ContentBlock::Image { .. } => {}
                }
            }

            let mut out = Vec::new();
            if !text_parts.is_empty() || !tool_calls.is_empty() {
                out.push(Message {
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
            out.extend(tool_messages);
            Ok(out)
        }
        _ => Err(GatewayError::Validation(format!(
            "unsupported content shape for role {}",
            role
        ))),
    }
}

/// Bridges internal OpenAI chunk lines to Anthropic SSE events
struct AnthropicStreamFormatter {
    model: String,
    message_id: String,
    started: bool,
    text_block_open: bool,
    /// tool_calls index -> anthropic block index
    open_tool_blocks: Vec<u32>,
    next_block_index: u32,
    output_tokens: u32,
}

impl AnthropicStreamFormatter {
    fn new(model: String) -> Self {
        Self {
            model,
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            text_block_open: false,
            open_tool_blocks: Vec::new(),
            next_block_index: 0,
            output_tokens: 0,
        }
    }

    fn event(name: &str, data: Value) -> String {
        format!("event: {}\ndata: {}\n\n", name, data)
    }

    fn ensure_started(&mut self, out: &mut String) {
        if self.started {
            return;
        }
        self.started = true;
        out.push_str(&Self::event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        ));
    }

    fn ensure_text_block(&mut self, out: &mut String) -> u32 {
        if !self.text_block_open {
            self.text_block_open = true;
            out.push_str(&Self::event(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": self.next_block_index,
                    "content_block": {"type": "text", "text": ""}
                }),
            ));
        }
        self.next_block_index
    }
}

impl StreamFormatter for AnthropicStreamFormatter {
    fn format_chunk(&mut self, line: &str) -> Option<String> {
        let data = line.strip_prefix("data: ")?;

        if data.trim() == "[DONE]" {
            let mut out = String::new();
            out.push_str(&Self::event("message_stop", json!({"type": "message_stop"})));
            return Some(out);
        }

        let chunk: Value = serde_json::from_str(data).ok()?;
        let mut out = String::new();
        self.ensure_started(&mut out);

        let choice = chunk.get("choices").and_then(|c| c.get(0));

        if let Some(usage) = chunk.get("usage") {
            if let Some(output) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                self.output_tokens = output as u32;
            }
        }

        if let Some(choice) = choice {
            let delta = choice.get("delta");

            if let Some(text) = delta
                .and_then(|d| d.get("content"))
                .and_then(|v| v.as_str())
            {
                if !text.is_empty() {
                    let index = self.ensure_text_block(&mut out);
                    out.push_str(&Self::event(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": {"type": "text_delta", "text": text}
                        }),
                    ));
                }
            }

            if let Some(tool_calls) = delta
                .and_then(|d| d.get("tool_calls"))
                .and_then(|v| v.as_array())
            {
                for call in tool_calls {
                    let tool_index =
                        call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;

                    // A fresh id opens a new tool_use block
                    if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                        if self.text_block_open {
                            out.push_str(&Self::event(
                                "content_block_stop",
                                json!({"type": "content_block_stop", "index": self.next_block_index}),
                            ));
                            self.text_block_open = false;
                            self.next_block_index += 1;
                        }
                        while self.open_tool_blocks.len() <= tool_index {
                            self.open_tool_blocks.push(self.next_block_index);
                            self.next_block_index += 1;
                        }
                        let block_index = self.open_tool_blocks[tool_index];
                        out.push_str(&Self::event(
                            "content_block_start",
                            json!({
                                "type": "content_block_start",
                                "index": block_index,
                                "content_block": {
                                    "type": "tool_use",
                                    "id": id,
                                    "name": call.pointer("/function/name").and_then(|v| v.as_str()).unwrap_or(""),
                                    "input": {}
                                }
                            }),
                        ));
                    }

                    if let Some(fragment) = call
                        .pointer("/function/arguments")
                        .and_then(|v| v.as_str())
                    {
                        if !fragment.is_empty() {
                            let block_index = self
                                .open_tool_blocks
                                .get(tool_index)
                                .copied()
                                .unwrap_or(self.next_block_index);
                            out.push_str(&Self::event(
                                "content_block_delta",
                                json!({
                                    "type": "content_block_delta",
                                    "index": block_index,
                                    "delta": {"type": "input_json_delta", "partial_json": fragment}
                                }),
                            ));
                        }
                    }
                }
            }

            if let Some(finish) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                if self.text_block_open {
                    out.push_str(&Self::event(
                        "content_block_stop",
                        json!({"type": "content_block_stop", "index": self.next_block_index}),
                    ));
                    self.text_block_open = false;
                }
                out.push_str(&Self::event(
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": stop_reason_from_finish(finish), "stop_sequence": null},
                        "usage": {"output_tokens": self.output_tokens}
                    }),
                ));
            }
        }

        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn finish(&mut self) -> Option<String> {
        None
    }
}
