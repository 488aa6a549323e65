// Anthropic upstream adapter
//
// Promotes system-role messages into the top-level `system` field, carries
// tool calls as `tool_use`/`tool_result` content blocks, and bridges the
// Anthropic SSE event stream back into the internal OpenAI chunk shape.

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::{check_status, http_client, ByteStream, UpstreamAdapter};
use crate::error::{GatewayError, Result};
use crate::models::anthropic::{
    finish_reason_from_stop, AnthropicMessage, AnthropicMessagesRequest, AnthropicMessagesResponse,
    AnthropicTool, ContentBlock, ANTHROPIC_VERSION, DEFAULT_MAX_TOKENS,
};
use crate::models::unified::{
    ChunkDelta, FunctionCallDelta, Message, ToolCall, ToolCallDelta, UnifiedChunk, UnifiedRequest,
    UnifiedResponse, UsageInfo, ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_TOOL, ROLE_USER,
};
use crate::store::entities::ProviderKind;

pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    extra_headers: HashMap<String, String>,
}

impl AnthropicAdapter {
    pub fn new(
        base_url: String,
        api_key: String,
        extra_headers: HashMap<String, String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            base_url,
            api_key,
            extra_headers,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, request: &UnifiedRequest, stream: bool) -> AnthropicMessagesRequest {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();

        for msg in &request.messages {
            match msg.role.as_str() {
                ROLE_SYSTEM => system_parts.push(msg.content.clone()),
                ROLE_TOOL => {
                    messages.push(AnthropicMessage {
                        role: ROLE_USER.to_string(),
                        content: json!([{
                            "type": "tool_result",
                            "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                            "content": msg.content,
                        }]),
                    });
                }
                ROLE_ASSISTANT if msg.has_tool_calls() => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": msg.content}));
                    }
                    for call in msg.tool_calls.as_deref().unwrap_or_default() {
                        let input: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.function.name,
                            "input": input,
                        }));
                    }
                    messages.push(AnthropicMessage {
                        role: ROLE_ASSISTANT.to_string(),
                        content: Value::Array(blocks),
                    });
                }
                _ => {
                    messages.push(AnthropicMessage {
                        role: msg.role.clone(),
                        content: Value::String(msg.content.clone()),
                    });
                }
            }
        }

        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    input_schema: t
                        .function
                        .parameters
                        .clone()
                        .unwrap_or_else(|| json!({"type": "object"})),
                })
                .collect()
        });

        let stop_sequences = request.stop.as_ref().and_then(|stop| match stop {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(arr) => Some(
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect(),
            ),
            _ => None,
        });

        AnthropicMessagesRequest {
            model: request.model.clone(),
            messages,
            // Anthropic requires a positive max_tokens
            max_tokens: request.max_tokens.filter(|t| *t > 0).unwrap_or(DEFAULT_MAX_TOKENS),
            system: if system_parts.is_empty() {
                None
            } else {
                Some(Value::String(system_parts.join("\n")))
            },
            stream,
            tools,
            tool_choice: request.tool_choice.clone(),
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            stop_sequences,
        }
    }

    fn request_builder(&self, body: &AnthropicMessagesRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body);
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

#[async_trait]
impl UpstreamAdapter for AnthropicAdapter {
    async fn call(&self, request: &UnifiedRequest) -> Result<UnifiedResponse> {
        let body = self.build_body(request, false);
        let response = self.request_builder(&body).send().await.map_err(|e| {
            GatewayError::Internal(anyhow::anyhow!("anthropic request failed: {}", e))
        })?;
        let response = check_status(response).await?;

        let parsed: AnthropicMessagesResponse = response.json().await.map_err(|e| {
            GatewayError::Internal(anyhow::anyhow!("bad anthropic response: {}", e))
        })?;

        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in &parsed.content {
            match block {
                ContentBlock::Text { text } => text_parts.push(text.clone()),
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall::function(id, name, input.to_string()));
                }
                _ => {}
            }
        }

        let finish_reason = parsed
            .stop_reason
            .as_deref()
            .map(finish_reason_from_stop)
            .unwrap_or("stop");

        let message = Message {
            role: ROLE_ASSISTANT.to_string(),
            content: text_parts.join("\n"),
            name: None,
            tool_call_id: None,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        };

        let mut unified = UnifiedResponse::new(request.model.clone(), message, finish_reason);
        unified.usage = Some(UsageInfo::new(
            parsed.usage.input_tokens,
            parsed.usage.output_tokens,
        ));
        Ok(unified)
    }

    async fn call_stream(&self, request: &UnifiedRequest) -> Result<ByteStream> {
        let body = self.build_body(request, true);
        let response = self.request_builder(&body).send().await.map_err(|e| {
            GatewayError::Internal(anyhow::anyhow!("anthropic request failed: {}", e))
        })?;
        let response = check_status(response).await?;

        let (mut tx, rx) = mpsc::channel::<Result<Bytes>>(32);
        let model = request.model.clone();

        tokio::spawn(async move {
            let mut bridge = AnthropicStreamBridge::new(model);
            let mut body_stream = response.bytes_stream();
            let mut line_buf = String::new();

            while let Some(chunk) = body_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(GatewayError::Internal(anyhow::anyhow!(
                                "anthropic stream error: {}",
                                e
                            ))))
                            .await;
                        return;
                    }
                };
                line_buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = line_buf.find('\n') {
                    let line = line_buf[..pos].trim_end_matches('\r').to_string();
                    line_buf.drain(..=pos);
                    for out in bridge.handle_line(&line) {
                        if tx.send(Ok(Bytes::from(out))).await.is_err() {
                            return;
                        }
                    }
                }
            }

            for out in bridge.finish() {
                let _ = tx.send(Ok(Bytes::from(out))).await;
            }
        });

        Ok(Box::pin(rx))
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }
}

/// Translates Anthropic SSE events into OpenAI chunk SSE lines
struct AnthropicStreamBridge {
    model: String,
    chunk_id: String,
    /// content_block index -> tool_calls index
    tool_indices: HashMap<u64, u32>,
    usage: UsageInfo,
    done_sent: bool,
}

impl AnthropicStreamBridge {
    fn new(model: String) -> Self {
        Self {
            model,
            chunk_id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            tool_indices: HashMap::new(),
            usage: UsageInfo::default(),
            done_sent: false,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> String {
        let chunk =
            UnifiedChunk::new(self.chunk_id.clone(), self.model.clone()).with_delta(delta, finish_reason);
        format!("data: {}\n\n", serde_json::to_string(&chunk).unwrap_or_default())
    }

    fn handle_line(&mut self, line: &str) -> Vec<String> {
        let Some(data) = line.strip_prefix("data: ") else {
            return Vec::new();
        };
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        match event.get("type").and_then(|v| v.as_str()) {
            Some("message_start") => {
                if let Some(input) = event
                    .pointer("/message/usage/input_tokens")
                    .and_then(|v| v.as_u64())
                {
                    self.usage.prompt_tokens = input as u32;
                }
                out.push(self.chunk(
                    ChunkDelta {
                        role: Some(ROLE_ASSISTANT.to_string()),
                        ..Default::default()
                    },
                    None,
                ));
            }
            Some("content_block_start") => {
                let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some(block) = event.get("content_block") {
                    if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                        let tool_index = self.tool_indices.len() as u32;
                        self.tool_indices.insert(index, tool_index);
                        out.push(self.chunk(
                            ChunkDelta {
                                tool_calls: Some(vec![ToolCallDelta {
                                    index: tool_index,
                                    id: block
                                        .get("id")
                                        .and_then(|v| v.as_str())
                                        .map(|s| s.to_string()),
                                    call_type: Some("function".to_string()),
                                    function: Some(FunctionCallDelta {
                                        name: block
                                            .get("name")
                                            .and_then(|v| v.as_str())
                                            .map(|s| s.to_string()),
                                        arguments: Some(String::new()),
                                    }),
                                }]),
                                ..Default::default()
                            },
                            None,
                        ));
                    }
                }
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                match event.pointer("/delta/type").and_then(|v| v.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) =
                            event.pointer("/delta/text").and_then(|v| v.as_str())
                        {
                            out.push(self.chunk(
                                ChunkDelta {
                                    content: Some(text.to_string()),
                                    ..Default::default()
                                },
                                None,
                            ));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) =
                            event.pointer("/delta/partial_json").and_then(|v| v.as_str())
                        {
                            let tool_index =
                                self.tool_indices.get(&index).copied().unwrap_or(0);
                            out.push(self.chunk(
                                ChunkDelta {
                                    tool_calls: Some(vec![ToolCallDelta {
                                        index: tool_index,
                                        id: None,
                                        call_type: None,
                                        function: Some(FunctionCallDelta {
                                            name: None,
                                            arguments: Some(partial.to_string()),
                                        }),
                                    }]),
                                    ..Default::default()
                                },
                                None,
                            ));
                        }
                    }
                    _ => {}
                }
            }
            Some("message_delta") => {
                if let Some(output) = event
                    .pointer("/usage/output_tokens")
                    .and_then(|v| v.as_u64())
                {
                    self.usage.completion_tokens = output as u32;
                    self.usage.total_tokens =
                        self.usage.prompt_tokens + self.usage.completion_tokens;
                }
                let stop_reason = event
                    .pointer("/delta/stop_reason")
                    .and_then(|v| v.as_str())
                    .map(finish_reason_from_stop)
                    .unwrap_or("stop");
                let mut chunk =
                    UnifiedChunk::new(self.chunk_id.clone(), self.model.clone()).with_delta(
                        ChunkDelta::default(),
                        Some(stop_reason.to_string()),
                    );
                chunk.usage = Some(self.usage);
                out.push(format!(
                    "data: {}\n\n",
                    serde_json::to_string(&chunk).unwrap_or_default()
                ));
            }
            Some("message_stop") => {
                out.push("data: [DONE]\n\n".to_string());
                self.done_sent = true;
            }
            _ => {}
        }
        out
    }

    fn finish(&mut self) -> Vec<String> {
        if self.done_sent {
            Vec::new()
        } else {
            self.done_sent = true;
            vec!["data: [DONE]\n\n".to_string()]
        }
    }
}
