// AWS EventStream parsing for the Kiro upstream
//
// Each message is framed as:
//   [4B total_len | 4B headers_len | 4B prelude_crc | headers | payload | 4B message_crc]
// all big-endian. The prelude CRC covers the first 8 bytes; the message CRC
// covers everything before it. The decoder walks a growing buffer, returns
// every complete frame and keeps partial trailing bytes pending.
//
// Payloads are JSON, one level of nesting deep (`assistantResponseEvent` or
// `toolUseEvent`). Text arrives as content fragments with literal \n escapes;
// tool input arrives fragmented and keyed by toolUseId, finalized on
// stop:true. A malformed frame or truncated tool-argument JSON never aborts
// the stream.

use bytes::{Buf, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::models::unified::UsageInfo;

const PRELUDE_LEN: usize = 12;
const FRAME_OVERHEAD: usize = PRELUDE_LEN + 4;
/// Upper bound on a sane frame; larger prelude values mean corruption
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub const TRUNCATION_ERROR: &str = "Tool input truncated by Kiro API (output token limit exceeded)";
const PARTIAL_INPUT_LIMIT: usize = 500;

// ==================================================================================================
// Frame decoding
// ==================================================================================================

#[derive(Debug, Clone)]
pub struct Frame {
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn event_type(&self) -> Option<&str> {
        self.headers.get(":event-type").map(|s| s.as_str())
    }
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Feed raw bytes; returns every frame completed by this chunk
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match self.try_decode_one() {
                DecodeStep::Frame(frame) => frames.push(frame),
                DecodeStep::Skip(n) => {
                    warn!("Skipping {} corrupt byte(s) in EventStream buffer", n);
                    self.buffer.advance(n);
                }
                DecodeStep::Dropped => {}
                DecodeStep::NeedMore => break,
            }
        }
        frames
    }

    fn try_decode_one(&mut self) -> DecodeStep {
        if self.buffer.len() < PRELUDE_LEN {
            return DecodeStep::NeedMore;
        }

        let total_len = u32::from_be_bytes(self.buffer[0..4].try_into().unwrap()) as usize;
        let headers_len = u32::from_be_bytes(self.buffer[4..8].try_into().unwrap()) as usize;
        let prelude_crc = u32::from_be_bytes(self.buffer[8..12].try_into().unwrap());

        if crc32fast::hash(&self.buffer[0..8]) != prelude_crc {
            // Prelude is untrustworthy; resync one byte at a time
            return DecodeStep::Skip(1);
        }
        if total_len < FRAME_OVERHEAD
            || total_len > MAX_FRAME_LEN
            || headers_len > total_len - FRAME_OVERHEAD
        {
            return DecodeStep::Skip(1);
        }
        if self.buffer.len() < total_len {
            return DecodeStep::NeedMore;
        }

        let message_crc =
            u32::from_be_bytes(self.buffer[total_len - 4..total_len].try_into().unwrap());
        if crc32fast::hash(&self.buffer[0..total_len - 4]) != message_crc {
            warn!("EventStream message CRC mismatch, dropping frame");
            self.buffer.advance(total_len);
            return DecodeStep::Dropped;
        }

        let headers = parse_headers(&self.buffer[PRELUDE_LEN..PRELUDE_LEN + headers_len]);
        let payload = self.buffer[PRELUDE_LEN + headers_len..total_len - 4].to_vec();
        self.buffer.advance(total_len);

        DecodeStep::Frame(Frame { headers, payload })
    }
}

enum DecodeStep {
    Frame(Frame),
    Skip(usize),
    Dropped,
    NeedMore,
}

/// Parse EventStream headers; only string values (type 7) are kept, other
/// value types are skipped over by length
fn parse_headers(mut data: &[u8]) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    while !data.is_empty() {
        let name_len = data[0] as usize;
        data = &data[1..];
        if data.len() < name_len + 1 {
            break;
        }
        let name = String::from_utf8_lossy(&data[..name_len]).to_string();
        data = &data[name_len..];

        let value_type = data[0];
        data = &data[1..];

        match value_type {
            // bool true / bool false carry no value bytes
            0 | 1 => {}
            2 => {
                if data.is_empty() {
                    break;
                }
                data = &data[1..];
            }
            3 => {
                if data.len() < 2 {
                    break;
                }
                data = &data[2..];
            }
            4 => {
                if data.len() < 4 {
                    break;
                }
                data = &data[4..];
            }
            5 | 8 => {
                if data.len() < 8 {
                    break;
                }
                data = &data[8..];
            }
            6 | 7 => {
                if data.len() < 2 {
                    break;
                }
                let len = u16::from_be_bytes([data[0], data[1]]) as usize;
                data = &data[2..];
                if data.len() < len {
                    break;
                }
                if value_type == 7 {
                    headers.insert(name, String::from_utf8_lossy(&data[..len]).to_string());
                }
                data = &data[len..];
            }
            9 => {
                if data.len() < 16 {
                    break;
                }
                data = &data[16..];
            }
            _ => break,
        }
    }

    headers
}

/// Build an EventStream frame (mock upstreams in tests, and the wire format
/// documentation in executable form)
pub fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        header_bytes.push(7u8); // string
        header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_bytes.extend_from_slice(value.as_bytes());
    }

    let total_len = (FRAME_OVERHEAD + header_bytes.len() + payload.len()) as u32;
    let mut frame = Vec::with_capacity(total_len as usize);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&frame[0..8]).to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc32fast::hash(&frame).to_be_bytes());
    frame
}

// ==================================================================================================
// Event semantics
// ==================================================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub tool_use_id: String,
    pub name: String,
    /// Raw JSON string; canonicalized at finalization only
    pub arguments: String,
}

#[derive(Debug, Clone)]
pub enum KiroEvent {
    Text(String),
    ToolCall(ParsedToolCall),
    Usage(UsageInfo),
}

#[derive(Debug, Default)]
struct PendingTool {
    name: String,
    buffer: String,
}

/// Accumulates fragmented tool input keyed by toolUseId
#[derive(Debug, Default)]
pub struct ToolAccumulator {
    pending: HashMap<String, PendingTool>,
    order: Vec<String>,
}

impl ToolAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one toolUse event; a completed call comes back on stop
    pub fn process(&mut self, event: &Value) -> Option<ParsedToolCall> {
        let tool_use_id = event
            .get("toolUseId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if tool_use_id.is_empty() {
            return None;
        }

        if !self.pending.contains_key(&tool_use_id) {
            self.order.push(tool_use_id.clone());
        }
        let entry = self.pending.entry(tool_use_id.clone()).or_default();

        if let Some(name) = event.get("name").and_then(|v| v.as_str()) {
            if entry.name.is_empty() {
                entry.name = name.to_string();
            }
        }

        match event.get("input") {
            // String fragments concatenate
            Some(Value::String(s)) => entry.buffer.push_str(s),
            // An object replaces the buffer outright
            Some(obj @ Value::Object(_)) => {
                entry.buffer = obj.to_string();
            }
            Some(other) if !other.is_null() => {
                entry.buffer.push_str(&other.to_string());
            }
            _ => {}
        }

        if event.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
            return self.finalize(&tool_use_id);
        }
        None
    }

    fn finalize(&mut self, tool_use_id: &str) -> Option<ParsedToolCall> {
        let tool = self.pending.remove(tool_use_id)?;
        self.order.retain(|id| id != tool_use_id);
        Some(finalize_arguments(tool_use_id, &tool.name, &tool.buffer))
    }

    /// Flush whatever is still pending at end of stream, in arrival order
    pub fn drain(&mut self) -> Vec<ParsedToolCall> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|id| {
                let tool = self.pending.remove(&id)?;
                Some(finalize_arguments(&id, &tool.name, &tool.buffer))
            })
            .collect()
    }
}

/// Re-parse the accumulated argument string; truncated JSON gets the
/// synthetic error object instead of aborting the stream
fn finalize_arguments(tool_use_id: &str, name: &str, buffer: &str) -> ParsedToolCall {
    let arguments = if buffer.is_empty() {
        "{}".to_string()
    } else {
        match serde_json::from_str::<Value>(buffer) {
            Ok(parsed) => parsed.to_string(),
            Err(e) => {
                warn!(
                    "Tool '{}' arguments failed to parse ({}), substituting error object",
                    name, e
                );
                let partial: String = buffer.chars().take(PARTIAL_INPUT_LIMIT).collect();
                json!({
                    "_error": TRUNCATION_ERROR,
                    "_partialInput": partial,
                })
                .to_string()
            }
        }
    };

    ParsedToolCall {
        tool_use_id: tool_use_id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

/// Drop tool calls that repeat an already-seen (name, arguments) identity
pub fn deduplicate_tool_calls(calls: Vec<ParsedToolCall>) -> Vec<ParsedToolCall> {
    let mut seen = std::collections::HashSet::new();
    calls
        .into_iter()
        .filter(|call| seen.insert(format!("{}\u{0}{}", call.name, call.arguments)))
        .collect()
}

// ==================================================================================================
// Stream parser
// ==================================================================================================

/// Frame-walks the response body and yields gateway-level events
#[derive(Debug, Default)]
pub struct KiroStreamParser {
    decoder: FrameDecoder,
    accumulator: ToolAccumulator,
}

impl KiroStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<KiroEvent> {
        let mut events = Vec::new();

        for frame in self.decoder.feed(data) {
            let Ok(mut payload) = serde_json::from_slice::<Value>(&frame.payload) else {
                debug!("Non-JSON EventStream payload, skipping frame");
                continue;
            };

            // Unwrap one level of event nesting
            for key in ["assistantResponseEvent", "toolUseEvent"] {
                if let Some(inner) = payload.get(key) {
                    payload = inner.clone();
                    break;
                }
            }

            if payload.get("followupPrompt").is_some() {
                continue;
            }

            if let Some(content) = payload.get("content").and_then(|v| v.as_str()) {
                let decoded = content.replace("\\n", "\n");
                if !decoded.is_empty() {
                    events.push(KiroEvent::Text(decoded));
                }
                continue;
            }

            if payload.get("toolUseId").is_some() {
                if let Some(call) = self.accumulator.process(&payload) {
                    events.push(KiroEvent::ToolCall(call));
                }
                continue;
            }

            if let Some(usage) = payload.get("usage") {
                let prompt = usage
                    .get("inputTokens")
                    .or_else(|| usage.get("input_tokens"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                let completion = usage
                    .get("outputTokens")
                    .or_else(|| usage.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                events.push(KiroEvent::Usage(UsageInfo::new(prompt, completion)));
            }
        }

        events
    }

    /// End of stream: flush pending tools
    pub fn finish(&mut self) -> Vec<KiroEvent> {
        self.accumulator
            .drain()
            .into_iter()
            .map(KiroEvent::ToolCall)
            .collect()
    }
}

// ==================================================================================================
// Bracketed fallback
// ==================================================================================================

static CALLED_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[Called\s+([A-Za-z0-9_\-]+)\s+with\s+args:\s*").unwrap());

/// Kiro sometimes narrates tool calls into the text as
/// `[Called name with args: {...}]`. Extract them and strip the markers.
pub fn extract_bracketed_tool_calls(text: &str) -> (String, Vec<ParsedToolCall>) {
    let mut calls = Vec::new();
    let mut cleaned = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some(m) = CALLED_PATTERN.captures(&text[cursor..]) {
        let whole = m.get(0).unwrap();
        let name = m.get(1).unwrap().as_str().to_string();
        let args_start = cursor + whole.end();

        let Some(args_end) = find_matching_brace(text, args_start) else {
            break;
        };
        // The pattern must close with ']' right after the JSON
        let after_json = text[args_end + 1..].trim_start();
        if !after_json.starts_with(']') {
            cleaned.push_str(&text[cursor..args_start]);
            cursor = args_start;
            continue;
        }
        let close = text[args_end + 1..]
            .find(']')
            .map(|i| args_end + 1 + i)
            .unwrap();

        cleaned.push_str(&text[cursor..cursor + whole.start()]);
        let args = &text[args_start..=args_end];
        if serde_json::from_str::<Value>(args).is_ok() {
            calls.push(ParsedToolCall {
                tool_use_id: format!("fallback_{}", uuid::Uuid::new_v4().simple()),
                name,
                arguments: args.to_string(),
            });
        }
        cursor = close + 1;
    }
    cleaned.push_str(&text[cursor..]);

    (cleaned, calls)
}

/// Position of the matching closing brace, honoring strings and escapes
fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if start >= bytes.len() || bytes[start] != b'{' {
        return None;
    }

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in bytes.iter().enumerate().skip(start) {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == b'\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == b'"' {
            in_string = !in_string;
            continue;
        }
        if !in_string {
            if ch == b'{' {
                depth += 1;
            } else if ch == b'}' {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn text_frame(content: &str) -> Vec<u8> {
        let payload = json!({ "assistantResponseEvent": { "content": content } }).to_string();
        encode_frame(
            &[
                (":message-type", "event"),
                (":event-type", "assistantResponseEvent"),
            ],
            payload.as_bytes(),
        )
    }

    fn tool_frame(body: Value) -> Vec<u8> {
        let payload = json!({ "toolUseEvent": body }).to_string();
        encode_frame(
            &[(":message-type", "event"), (":event-type", "toolUseEvent")],
            payload.as_bytes(),
        )
    }

    #[test]
    fn test_single_frame_roundtrip() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&text_frame("Hello"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), Some("assistantResponseEvent"));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_partial_tail_stays_pending() {
        let frame = text_frame("Hello world");
        let mut decoder = FrameDecoder::new();

        let cut = frame.len() - 5;
        let frames = decoder.feed(&frame[..cut]);
        assert!(frames.is_empty());
        assert_eq!(decoder.pending(), cut);

        let frames = decoder.feed(&frame[cut..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_corrupt_prelude_resyncs() {
        let mut bad = vec![0xFFu8; 7];
        bad.extend_from_slice(&text_frame("ok"));
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&bad);
        assert_eq!(frames.len(), 1);
    }

    proptest! {
        /// Any concatenation of valid frames cut at any point yields all
        /// complete frames with the partial tail pending
        #[test]
        fn prop_truncation_preserves_frames(
            contents in proptest::collection::vec("[a-z]{1,20}", 1..5),
            cut_fraction in 0.0f64..1.0
        ) {
            let mut stream = Vec::new();
            for c in &contents {
                stream.extend_from_slice(&text_frame(c));
            }
            let cut = ((stream.len() as f64) * cut_fraction) as usize;

            let mut decoder = FrameDecoder::new();
            let mut frames = decoder.feed(&stream[..cut]);
            frames.extend(decoder.feed(&stream[cut..]));

            prop_assert_eq!(frames.len(), contents.len());
            prop_assert_eq!(decoder.pending(), 0);
        }
    }

    #[test]
    fn test_stream_parser_text_and_newline_decoding() {
        let mut parser = KiroStreamParser::new();
        let events = parser.feed(&text_frame("line1\\nline2"));
        assert_eq!(events.len(), 1);
        match &events[0] {
            KiroEvent::Text(t) => assert_eq!(t, "line1\nline2"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_tool_fragments_accumulate_and_finalize() {
        let mut parser = KiroStreamParser::new();

        let mut events = Vec::new();
        events.extend(parser.feed(&tool_frame(json!({
            "toolUseId": "t1", "name": "read_file", "input": "{\"pa"
        }))));
        events.extend(parser.feed(&tool_frame(json!({
            "toolUseId": "t1", "name": "read_file", "input": "th\": \"/tmp\"}"
        }))));
        assert!(events.is_empty());

        let events = parser.feed(&tool_frame(json!({ "toolUseId": "t1", "stop": true })));
        assert_eq!(events.len(), 1);
        match &events[0] {
            KiroEvent::ToolCall(call) => {
                assert_eq!(call.name, "read_file");
                assert_eq!(call.arguments, r#"{"path":"/tmp"}"#);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_tool_input_substitutes_error_object() {
        let mut parser = KiroStreamParser::new();
        parser.feed(&tool_frame(json!({
            "toolUseId": "t1", "name": "read_file", "input": "{\"path\": \"/etc/pass"
        })));
        let events = parser.feed(&tool_frame(json!({ "toolUseId": "t1", "stop": true })));

        let KiroEvent::ToolCall(call) = &events[0] else {
            panic!("expected a tool call");
        };
        let args: Value = serde_json::from_str(&call.arguments).unwrap();
        assert_eq!(args["_error"], TRUNCATION_ERROR);
        assert_eq!(args["_partialInput"], "{\"path\": \"/etc/pass");
    }

    #[test]
    fn test_object_input_replaces_buffer() {
        let mut parser = KiroStreamParser::new();
        parser.feed(&tool_frame(json!({
            "toolUseId": "t1", "name": "search", "input": "garbage prefix"
        })));
        let events = parser.feed(&tool_frame(json!({
            "toolUseId": "t1", "input": {"query": "rust"}, "stop": true
        })));

        let KiroEvent::ToolCall(call) = &events[0] else {
            panic!("expected a tool call");
        };
        assert_eq!(call.arguments, r#"{"query":"rust"}"#);
    }

    #[test]
    fn test_usage_event() {
        let mut parser = KiroStreamParser::new();
        let payload = json!({ "usage": { "inputTokens": 12, "outputTokens": 34 } }).to_string();
        let frame = encode_frame(&[(":message-type", "event")], payload.as_bytes());
        let events = parser.feed(&frame);
        match &events[0] {
            KiroEvent::Usage(u) => {
                assert_eq!(u.prompt_tokens, 12);
                assert_eq!(u.completion_tokens, 34);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_deduplicate_tool_calls() {
        let call = |id: &str, name: &str, args: &str| ParsedToolCall {
            tool_use_id: id.into(),
            name: name.into(),
            arguments: args.into(),
        };
        let deduped = deduplicate_tool_calls(vec![
            call("a", "read", "{\"p\":1}"),
            call("b", "read", "{\"p\":1}"),
            call("c", "read", "{\"p\":2}"),
        ]);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn test_bracketed_fallback_extraction() {
        let text = "Sure. [Called search with args: {\"q\": \"rust\"}] Done.";
        let (cleaned, calls) = extract_bracketed_tool_calls(text);
        assert_eq!(cleaned, "Sure.  Done.");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments, "{\"q\": \"rust\"}");
    }

    #[test]
    fn test_bracketed_fallback_ignores_plain_text() {
        let text = "No tool calls here, just [brackets] and {braces}.";
        let (cleaned, calls) = extract_bracketed_tool_calls(text);
        assert_eq!(cleaned, text);
        assert!(calls.is_empty());
    }
}
