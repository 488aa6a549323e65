// Stream wrapper: the bridge between an upstream adapter stream and the
// client response body.
//
// Bytes copy through a bounded pipe so the client reads immediately; a tee
// parses each line for usage counters (later chunks supersede earlier ones,
// providers send final totals in the tail). When the upstream ends or the
// client goes away, the finalizer runs exactly once: metering, credential
// report, request log. If no usage was ever observed the documented
// `messages * 100 + 100` estimate applies and is logged as a warning.

use bytes::Bytes;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;

use crate::adapters::ByteStream;
use crate::error::Result;
use crate::ingress::StreamFormatter;
use crate::models::unified::UsageInfo;

/// What the finalizer learns about the finished stream
#[derive(Debug, Clone, Copy)]
pub struct StreamOutcome {
    pub usage: UsageInfo,
    pub estimated: bool,
    pub success: bool,
}

pub type Finalizer = Box<dyn FnOnce(StreamOutcome) -> BoxFuture<'static, ()> + Send>;

/// Running usage aggregate; each observation replaces the previous one
#[derive(Debug, Default)]
pub struct UsageExtractor {
    usage: Option<UsageInfo>,
}

impl UsageExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect one stream line in any of the recognized shapes: an SSE data
    /// line with an OpenAI `usage` object, or a raw JSON line carrying
    /// Gemini `usageMetadata`
    pub fn observe_line(&mut self, line: &str) {
        let payload = line.strip_prefix("data: ").unwrap_or(line).trim();
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let Ok(json) = serde_json::from_str::<Value>(payload) else {
            return;
        };

        if let Some(usage) = json.get("usage").filter(|u| u.is_object()) {
            let prompt = usage
                .get("prompt_tokens")
                .or_else(|| usage.get("input_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            let completion = usage
                .get("completion_tokens")
                .or_else(|| usage.get("output_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            if prompt > 0 || completion > 0 {
                self.usage = Some(UsageInfo::new(prompt, completion));
            }
        }

        if let Some(meta) = json.get("usageMetadata") {
            let prompt = meta
                .get("promptTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            let completion = meta
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            if prompt > 0 || completion > 0 {
                self.usage = Some(UsageInfo::new(prompt, completion));
            }
        }
    }

    pub fn current(&self) -> Option<UsageInfo> {
        self.usage
    }
}

/// The documented fallback when a provider never reports usage
pub fn estimate_usage(message_count: usize) -> UsageInfo {
    let estimate = (message_count * 100 + 100) as u32;
    UsageInfo::new(estimate, 0)
}

/// Wrap an upstream stream for delivery to the client. The returned stream
/// yields protocol-formatted bytes; the upstream reader runs as its own task
/// joined to the client by a bounded pipe.
pub fn wrap_stream(
    upstream: ByteStream,
    mut formatter: Box<dyn StreamFormatter>,
    message_count: usize,
    finalizer: Finalizer,
) -> impl Stream<Item = Result<Bytes>> + Send {
    let (mut tx, rx) = mpsc::channel::<Result<Bytes>>(32);

    tokio::spawn(async move {
        let mut upstream = upstream;
        let mut extractor = UsageExtractor::new();
        let mut line_buf = String::new();
        let mut finalizer = Some(finalizer);
        let mut success = true;

        'read: while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Upstream stream error: {}", e);
                    success = false;
                    let _ = tx.send(Err(e)).await;
                    break 'read;
                }
            };

            line_buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = line_buf.find('\n') {
                let line = line_buf[..pos].trim_end_matches('\r').to_string();
                line_buf.drain(..=pos);
                if line.is_empty() {
                    continue;
                }

                extractor.observe_line(&line);

                if let Some(formatted) = formatter.format_chunk(&line) {
                    if tx.send(Ok(Bytes::from(formatted))).await.is_err() {
                        // Client went away; the upstream request aborts when
                        // the body stream drops
                        tracing::debug!("Client disconnected mid-stream");
                        success = false;
                        break 'read;
                    }
                }
            }
        }

        if success {
            if !line_buf.is_empty() {
                extractor.observe_line(line_buf.trim_end());
            }
            if let Some(tail) = formatter.finish() {
                let _ = tx.send(Ok(Bytes::from(tail))).await;
            }
        }

        let (usage, estimated) = match extractor.current() {
            Some(usage) => (usage, false),
            None => {
                tracing::warn!(
                    "No usage observed in stream, estimating from {} messages",
                    message_count
                );
                (estimate_usage(message_count), true)
            }
        };

        if let Some(finalize) = finalizer.take() {
            finalize(StreamOutcome {
                usage,
                estimated,
                success,
            })
            .await;
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    struct PassThrough;
    impl StreamFormatter for PassThrough {
        fn format_chunk(&mut self, line: &str) -> Option<String> {
            Some(format!("{}\n\n", line))
        }
        fn finish(&mut self) -> Option<String> {
            None
        }
    }

    fn upstream_of(lines: Vec<&'static str>) -> ByteStream {
        Box::pin(futures::stream::iter(
            lines
                .into_iter()
                .map(|l| Ok(Bytes::from(format!("{}\n\n", l)))),
        ))
    }

    #[test]
    fn test_usage_extractor_supersedes() {
        let mut extractor = UsageExtractor::new();
        extractor.observe_line(r#"data: {"usage":{"prompt_tokens":5,"completion_tokens":1}}"#);
        extractor.observe_line(r#"data: {"usage":{"prompt_tokens":5,"completion_tokens":9}}"#);
        let usage = extractor.current().unwrap();
        assert_eq!(usage.completion_tokens, 9);
    }

    #[test]
    fn test_usage_extractor_gemini_metadata() {
        let mut extractor = UsageExtractor::new();
        extractor
            .observe_line(r#"{"usageMetadata":{"promptTokenCount":7,"candidatesTokenCount":3}}"#);
        let usage = extractor.current().unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn test_usage_extractor_anthropic_shape() {
        let mut extractor = UsageExtractor::new();
        extractor.observe_line(r#"data: {"usage":{"input_tokens":4,"output_tokens":2}}"#);
        let usage = extractor.current().unwrap();
        assert_eq!(usage.prompt_tokens, 4);
    }

    #[test]
    fn test_estimate_formula() {
        let usage = estimate_usage(3);
        assert_eq!(usage.prompt_tokens, 400);
        assert_eq!(usage.total_tokens, 400);
    }

    #[tokio::test]
    async fn test_wrap_stream_copies_and_finalizes_once() {
        let finalized = Arc::new(Mutex::new(Vec::<StreamOutcome>::new()));
        let finalized_clone = Arc::clone(&finalized);

        let finalizer: Finalizer = Box::new(move |outcome| {
            Box::pin(async move {
                finalized_clone.lock().unwrap().push(outcome);
            })
        });

        let upstream = upstream_of(vec![
            r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":2,"completion_tokens":8}}"#,
            "data: [DONE]",
        ]);

        let mut wrapped = Box::pin(wrap_stream(upstream, Box::new(PassThrough), 1, finalizer));
        let mut collected = String::new();
        while let Some(item) = wrapped.next().await {
            collected.push_str(&String::from_utf8_lossy(&item.unwrap()));
        }

        assert!(collected.contains("Hi"));
        assert!(collected.contains("[DONE]"));

        let outcomes = finalized.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert!(!outcomes[0].estimated);
        assert_eq!(outcomes[0].usage.completion_tokens, 8);
    }

    #[tokio::test]
    async fn test_wrap_stream_estimates_when_no_usage() {
        let estimated = Arc::new(AtomicBool::new(false));
        let estimated_clone = Arc::clone(&estimated);

        let finalizer: Finalizer = Box::new(move |outcome| {
            Box::pin(async move {
                estimated_clone.store(outcome.estimated, Ordering::SeqCst);
                assert_eq!(outcome.usage.prompt_tokens, 2 * 100 + 100);
            })
        });

        let upstream = upstream_of(vec![
            r#"data: {"choices":[{"delta":{"content":"x"}}]}"#,
            "data: [DONE]",
        ]);

        let mut wrapped = Box::pin(wrap_stream(upstream, Box::new(PassThrough), 2, finalizer));
        while let Some(item) = wrapped.next().await {
            item.unwrap();
        }
        // Give the spawned task a breath to finalize
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(estimated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_client_hangup_finalizes_with_error() {
        let outcome_success = Arc::new(Mutex::new(None::<bool>));
        let outcome_clone = Arc::clone(&outcome_success);

        let finalizer: Finalizer = Box::new(move |outcome| {
            Box::pin(async move {
                *outcome_clone.lock().unwrap() = Some(outcome.success);
            })
        });

        // An endless upstream; the client reads one item then drops
        let upstream: ByteStream = Box::pin(futures::stream::repeat_with(|| {
            Ok(Bytes::from(
                "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
            ))
        }));

        let mut wrapped = Box::pin(wrap_stream(upstream, Box::new(PassThrough), 1, finalizer));
        let _first = wrapped.next().await;
        drop(wrapped);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*outcome_success.lock().unwrap(), Some(false));
    }
}
