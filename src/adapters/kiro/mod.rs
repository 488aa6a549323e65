// Kiro (AWS CodeWhisperer) upstream adapter
//
// Speaks the generateAssistantResponse API: bearer token, a fresh
// amz-sdk-invocation-id per request, a stable machine ID in the user agent,
// and EventStream binary frames coming back. Responses are EventStream even
// for non-streaming calls, so `call` collects the parsed stream.

pub mod eventstream;
pub mod history;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use uuid::Uuid;

use super::{check_status, http_client, ByteStream, UpstreamAdapter};
use crate::error::{GatewayError, Result};
use crate::mapper::ModelMapper;
use crate::models::unified::{
    ChunkDelta, FunctionCallDelta, Message, ToolCall, ToolCallDelta, UnifiedChunk, UnifiedRequest,
    UnifiedResponse, UsageInfo, ROLE_ASSISTANT,
};
use crate::oauth::machine_fingerprint;
use crate::store::entities::ProviderKind;
use eventstream::{
    deduplicate_tool_calls, extract_bracketed_tool_calls, KiroEvent, KiroStreamParser,
    ParsedToolCall,
};

const AGENT_MODE: &str = "vibe";

pub struct KiroAdapter {
    client: reqwest::Client,
    mapper: Arc<ModelMapper>,
    access_token: String,
    region: String,
    profile_arn: Option<String>,
    machine_id: String,
    base_url: Option<String>,
}

impl KiroAdapter {
    pub fn new(
        mapper: Arc<ModelMapper>,
        access_token: String,
        region: String,
        profile_arn: Option<String>,
        machine_id: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            mapper,
            access_token,
            region,
            profile_arn,
            machine_id: machine_id.unwrap_or_else(machine_fingerprint),
            base_url: None,
        })
    }

    /// Point at a non-default endpoint (tests, private gateways)
    pub fn with_base_url(mut self, base_url: String) -> Self {
        if !base_url.is_empty() {
            self.base_url = Some(base_url);
        }
        self
    }

    fn endpoint(&self) -> String {
        match &self.base_url {
            Some(base) => format!(
                "{}/generateAssistantResponse",
                base.trim_end_matches('/')
            ),
            None => format!(
                "https://q.{}.amazonaws.com/generateAssistantResponse",
                self.region
            ),
        }
    }

    async fn send(&self, request: &UnifiedRequest, streaming: bool) -> Result<reqwest::Response> {
        let model_id = self.mapper.resolve(&request.model).await;
        let conversation_id = Uuid::new_v4().to_string();
        let body = history::build_kiro_request(
            request,
            &model_id,
            &conversation_id,
            self.profile_arn.as_deref(),
        );

        let mut builder = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Content-Type", "application/json")
            .header("amz-sdk-invocation-id", Uuid::new_v4().to_string())
            .header("x-amzn-kiro-agent-mode", AGENT_MODE)
            .header(
                "x-amz-user-agent",
                format!("aws-sdk-js/1.0.7 KiroIDE-{}", self.machine_id),
            )
            .json(&body);
        if streaming {
            builder = builder.header("Accept", "application/vnd.amazon.eventstream");
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("kiro request failed: {}", e)))?;
        check_status(response).await
    }
}

#[async_trait]
impl UpstreamAdapter for KiroAdapter {
    async fn call(&self, request: &UnifiedRequest) -> Result<UnifiedResponse> {
        let response = self.send(request, false).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("kiro body read failed: {}", e)))?;

        let mut parser = KiroStreamParser::new();
        let mut text = String::new();
        let mut tool_calls: Vec<ParsedToolCall> = Vec::new();
        let mut usage: Option<UsageInfo> = None;

        let mut events = parser.feed(&body);
        events.extend(parser.finish());
        for event in events {
            match event {
                KiroEvent::Text(t) => text.push_str(&t),
                KiroEvent::ToolCall(call) => tool_calls.push(call),
                KiroEvent::Usage(u) => usage = Some(u),
            }
        }

        // Kiro's fallback format narrates tool calls into the text
        let (cleaned, bracketed) = extract_bracketed_tool_calls(&text);
        tool_calls.extend(bracketed);
        let tool_calls = deduplicate_tool_calls(tool_calls);

        let finish_reason = if tool_calls.is_empty() {
            "stop"
        } else {
            "tool_calls"
        };

        let message = Message {
            role: ROLE_ASSISTANT.to_string(),
            content: cleaned.trim_end().to_string(),
            name: None,
            tool_call_id: None,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(
                    tool_calls
                        .into_iter()
                        .map(|c| ToolCall::function(c.tool_use_id, c.name, c.arguments))
                        .collect(),
                )
            },
        };

        let mut unified = UnifiedResponse::new(request.model.clone(), message, finish_reason);
        unified.usage = usage;
        Ok(unified)
    }

    async fn call_stream(&self, request: &UnifiedRequest) -> Result<ByteStream> {
        let response = self.send(request, true).await?;

        let (mut tx, rx) = mpsc::channel::<Result<Bytes>>(32);
        let model = request.model.clone();

        tokio::spawn(async move {
            let chunk_id = format!("chatcmpl-{}", Uuid::new_v4());
            let mut parser = KiroStreamParser::new();
            let mut usage: Option<UsageInfo> = None;
            let mut sent_role = false;
            let mut body_stream = response.bytes_stream();

            let emit = |chunk: &UnifiedChunk| -> Bytes {
                Bytes::from(format!(
                    "data: {}\n\n",
                    serde_json::to_string(chunk).unwrap_or_default()
                ))
            };

            loop {
                let events = match body_stream.next().await {
                    Some(Ok(bytes)) => parser.feed(&bytes),
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(GatewayError::Internal(anyhow::anyhow!(
                                "kiro stream error: {}",
                                e
                            ))))
                            .await;
                        return;
                    }
                    // EOF: flush pending tools before the terminal chunk
                    None => {
                        let tail = parser.finish();
                        let closed = stream_events(
                            tail, &mut tx, &chunk_id, &model, &mut usage, &mut sent_role, &emit,
                        )
                        .await;
                        if closed {
                            return;
                        }
                        break;
                    }
                };

                let closed = stream_events(
                    events, &mut tx, &chunk_id, &model, &mut usage, &mut sent_role, &emit,
                )
                .await;
                if closed {
                    return;
                }
            }

            // Terminal chunk with finish_reason, then the DONE marker
            let mut terminal = UnifiedChunk::new(chunk_id.clone(), model.clone()).with_delta(
                ChunkDelta::default(),
                Some("stop".to_string()),
            );
            terminal.usage = usage;
            if tx.send(Ok(emit(&terminal))).await.is_err() {
                return;
            }
            let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
        });

        Ok(Box::pin(rx))
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Kiro
    }
}

/// Forward parsed events as OpenAI chunks; returns true when the client hung up
async fn stream_events(
    events: Vec<KiroEvent>,
    tx: &mut mpsc::Sender<Result<Bytes>>,
    chunk_id: &str,
    model: &str,
    usage: &mut Option<UsageInfo>,
    sent_role: &mut bool,
    emit: &impl Fn(&UnifiedChunk) -> Bytes,
) -> bool {
    for event in events {
        let chunk = match event {
            KiroEvent::Text(text) => {
                let delta = ChunkDelta {
                    role: if *sent_role {
                        None
                    } else {
                        *sent_role = true;
                        Some(ROLE_ASSISTANT.to_string())
                    },
                    content: Some(text),
                    ..Default::default()
                };
                UnifiedChunk::new(chunk_id.to_string(), model.to_string()).with_delta(delta, None)
            }
            KiroEvent::ToolCall(call) => {
                let delta = ChunkDelta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index: 0,
                        id: Some(call.tool_use_id),
                        call_type: Some("function".to_string()),
                        function: Some(FunctionCallDelta {
                            name: Some(call.name),
                            arguments: Some(call.arguments),
                        }),
                    }]),
                    ..Default::default()
                };
                UnifiedChunk::new(chunk_id.to_string(), model.to_string()).with_delta(delta, None)
            }
            KiroEvent::Usage(u) => {
                *usage = Some(u);
                continue;
            }
        };
        if tx.send(Ok(emit(&chunk))).await.is_err() {
            return true;
        }
    }
    false
}
