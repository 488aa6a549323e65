// Gemini upstream adapter
//
// System-role messages never enter `contents`; their text rides in
// `systemInstruction`. The response role `model` is renamed to `assistant`
// on the way back. Streaming uses `:streamGenerateContent?alt=sse` and is
// bridged into the internal OpenAI chunk shape.

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};

use super::{check_status, http_client, ByteStream, UpstreamAdapter};
use crate::error::{GatewayError, Result};
use crate::models::gemini::{
    finish_reason_from_gemini, GeminiContent, GeminiFunctionCall, GeminiFunctionDecl,
    GeminiFunctionResponse, GeminiPart, GeminiRequest, GeminiResponse, GeminiToolDecl,
    GenerationConfig,
};
use crate::models::unified::{
    ChunkDelta, Message, ToolCall, UnifiedChunk, UnifiedRequest, UnifiedResponse, UsageInfo,
    ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_TOOL, ROLE_USER,
};
use crate::store::entities::ProviderKind;

pub struct GeminiAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiAdapter {
    pub fn new(base_url: String, api_key: String, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            base_url,
            api_key,
        })
    }

    fn url(&self, model: &str, stream: bool) -> String {
        let base = self.base_url.trim_end_matches('/');
        if stream {
            format!(
                "{}/v1/models/{}:streamGenerateContent?alt=sse&key={}",
                base, model, self.api_key
            )
        } else {
            format!(
                "{}/v1/models/{}:generateContent?key={}",
                base, model, self.api_key
            )
        }
    }

    fn build_body(&self, request: &UnifiedRequest) -> GeminiRequest {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for msg in &request.messages {
            match msg.role.as_str() {
                ROLE_SYSTEM => system_parts.push(msg.content.clone()),
                ROLE_TOOL => {
                    contents.push(GeminiContent {
                        role: Some(ROLE_USER.to_string()),
                        parts: vec![GeminiPart::FunctionResponse {
                            function_response: GeminiFunctionResponse {
                                name: msg.name.clone().unwrap_or_else(|| "tool".to_string()),
                                response: json!({ "result": msg.content }),
                            },
                        }],
                    });
                }
                ROLE_ASSISTANT => {
                    let mut parts = Vec::new();
                    if !msg.content.is_empty() {
                        parts.push(GeminiPart::Text {
                            text: msg.content.clone(),
                        });
                    }
                    for call in msg.tool_calls.as_deref().unwrap_or_default() {
                        parts.push(GeminiPart::FunctionCall {
                            function_call: GeminiFunctionCall {
                                name: call.function.name.clone(),
                                args: serde_json::from_str(&call.function.arguments)
                                    .unwrap_or_else(|_| json!({})),
                            },
                        });
                    }
                    if parts.is_empty() {
                        parts.push(GeminiPart::Text {
                            text: String::new(),
                        });
                    }
                    contents.push(GeminiContent {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
                _ => {
                    contents.push(GeminiContent::text(Some(ROLE_USER), msg.content.clone()));
                }
            }
        }

        let stop_sequences = request.stop.as_ref().and_then(|stop| match stop {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(arr) => Some(
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect(),
            ),
            _ => None,
        });

        let generation_config = GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            max_output_tokens: request.max_tokens.filter(|t| *t > 0),
            stop_sequences,
        };

        let tools = request.tools.as_ref().map(|tools| {
            vec![GeminiToolDecl {
                function_declarations: tools
                    .iter()
                    .map(|t| GeminiFunctionDecl {
                        name: t.function.name.clone(),
                        description: t.function.description.clone(),
                        parameters: t.function.parameters.clone(),
                    })
                    .collect(),
            }]
        });

        GeminiRequest {
            contents,
            system_instruction: if system_parts.is_empty() {
                None
            } else {
                Some(GeminiContent {
                    role: None,
                    parts: vec![GeminiPart::Text {
                        text: system_parts.join("\n"),
                    }],
                })
            },
            generation_config: Some(generation_config),
            tools,
        }
    }

    fn unify_response(&self, model: &str, parsed: GeminiResponse) -> Result<UnifiedResponse> {
        let candidate = parsed.candidates.into_iter().next().ok_or_else(|| {
            GatewayError::Internal(anyhow::anyhow!("gemini returned no candidates"))
        })?;

        let mut tool_calls = Vec::new();
        for part in &candidate.content.parts {
            if let GeminiPart::FunctionCall { function_call } = part {
                tool_calls.push(ToolCall::function(
                    format!("call_{}", uuid::Uuid::new_v4().simple()),
                    &function_call.name,
                    function_call.args.to_string(),
                ));
            }
        }

        let finish_reason = if !tool_calls.is_empty() {
            "tool_calls"
        } else {
            candidate
                .finish_reason
                .as_deref()
                .map(finish_reason_from_gemini)
                .unwrap_or("stop")
        };

        // Response role `model` becomes `assistant`
        let message = Message {
            role: ROLE_ASSISTANT.to_string(),
            content: candidate.content.joined_text(),
            name: None,
            tool_call_id: None,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        };

        let mut unified = UnifiedResponse::new(model, message, finish_reason);
        if let Some(usage) = parsed.usage_metadata {
            unified.usage = Some(UsageInfo {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
                total_tokens: usage.total_token_count,
            });
        }
        Ok(unified)
    }
}

#[async_trait]
impl UpstreamAdapter for GeminiAdapter {
    async fn call(&self, request: &UnifiedRequest) -> Result<UnifiedResponse> {
        let body = self.build_body(request);
        let response = self
            .client
            .post(self.url(&request.model, false))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("gemini request failed: {}", e)))?;
        let response = check_status(response).await?;

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("bad gemini response: {}", e)))?;
        self.unify_response(&request.model, parsed)
    }

    async fn call_stream(&self, request: &UnifiedRequest) -> Result<ByteStream> {
        let body = self.build_body(request);
        let response = self
            .client
            .post(self.url(&request.model, true))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("gemini request failed: {}", e)))?;
        let response = check_status(response).await?;

        let (mut tx, rx) = mpsc::channel::<Result<Bytes>>(32);
        let model = request.model.clone();

        tokio::spawn(async move {
            let chunk_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
            let mut usage: Option<UsageInfo> = None;
            let mut body_stream = response.bytes_stream();
            let mut line_buf = String::new();

            while let Some(chunk) = body_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(GatewayError::Internal(anyhow::anyhow!(
                                "gemini stream error: {}",
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

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let Ok(parsed) = serde_json::from_str::<GeminiResponse>(data) else {
                        tracing::warn!("Unparseable gemini stream chunk");
                        continue;
                    };

                    if let Some(meta) = parsed.usage_metadata {
                        usage = Some(UsageInfo {
                            prompt_tokens: meta.prompt_token_count,
                            completion_tokens: meta.candidates_token_count,
                            total_tokens: meta.total_token_count,
                        });
                    }

                    for candidate in &parsed.candidates {
                        let text = candidate.content.joined_text();
                        let finish = candidate
                            .finish_reason
                            .as_deref()
                            .map(|r| finish_reason_from_gemini(r).to_string());

                        if text.is_empty() && finish.is_none() {
                            continue;
                        }
                        let mut out = UnifiedChunk::new(chunk_id.clone(), model.clone())
                            .with_delta(
                                ChunkDelta {
                                    content: if text.is_empty() { None } else { Some(text) },
                                    ..Default::default()
                                },
                                finish.clone(),
                            );
                        if finish.is_some() {
                            out.usage = usage;
                        }
                        let line = format!(
                            "data: {}\n\n",
                            serde_json::to_string(&out).unwrap_or_default()
                        );
                        if tx.send(Ok(Bytes::from(line))).await.is_err() {
                            return;
                        }
                    }
                }
            }

            let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
        });

        Ok(Box::pin(rx))
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(base: &str) -> GeminiAdapter {
        GeminiAdapter::new(base.into(), "test-key".into(), 30).unwrap()
    }

    #[test]
    fn test_system_suppressed_from_contents() {
        let request = UnifiedRequest::new(
            "gemini-pro",
            vec![
                Message::text(ROLE_SYSTEM, "S"),
                Message::text(ROLE_USER, "U"),
            ],
        );
        let body = adapter("https://example.com").build_body(&request);

        assert_eq!(body.contents.len(), 1);
        assert_eq!(body.contents[0].role.as_deref(), Some("user"));
        assert_eq!(body.contents[0].joined_text(), "U");
        assert_eq!(
            body.system_instruction.as_ref().unwrap().joined_text(),
            "S"
        );
    }

    #[test]
    fn test_assistant_maps_to_model_role() {
        let request = UnifiedRequest::new(
            "gemini-pro",
            vec![
                Message::text(ROLE_USER, "U"),
                Message::text(ROLE_ASSISTANT, "A"),
                Message::text(ROLE_USER, "U2"),
            ],
        );
        let body = adapter("x").build_body(&request);
        assert_eq!(body.contents[1].role.as_deref(), Some("model"));
    }

    #[test]
    fn test_tools_nest_as_function_declarations() {
        let mut request = UnifiedRequest::new("gemini-pro", vec![Message::text(ROLE_USER, "U")]);
        request.tools = Some(vec![crate::models::unified::Tool {
            tool_type: "function".into(),
            function: crate::models::unified::ToolFunction {
                name: "search".into(),
                description: None,
                parameters: None,
            },
        }]);
        let body = adapter("x").build_body(&request);
        let tools = body.tools.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function_declarations[0].name, "search");
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "POST",
                "/v1/models/gemini-pro:generateContent?key=test-key",
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "candidates": [{
                        "content": {"role": "model", "parts": [{"text": "Hi"}]},
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": {
                        "promptTokenCount": 4,
                        "candidatesTokenCount": 2,
                        "totalTokenCount": 6
                    }
                }"#,
            )
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        let request = UnifiedRequest::new("gemini-pro", vec![Message::text(ROLE_USER, "Hello")]);
        let response = adapter.call(&request).await.unwrap();

        assert_eq!(response.choices[0].message.role, "assistant");
        assert_eq!(response.choices[0].message.content, "Hi");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.unwrap().total_tokens, 6);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_safety_maps_to_content_filter() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock(
                "POST",
                "/v1/models/gemini-pro:generateContent?key=test-key",
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"candidates": [{"content": {"role": "model", "parts": [{"text": ""}]}, "finishReason": "SAFETY"}]}"#,
            )
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        let request = UnifiedRequest::new("gemini-pro", vec![Message::text(ROLE_USER, "x")]);
        let response = adapter.call(&request).await.unwrap();
        assert_eq!(
            response.choices[0].finish_reason.as_deref(),
            Some("content_filter")
        );
    }
}
