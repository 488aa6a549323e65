// Ingress protocol converters
//
// One converter per client protocol. Parsing turns the raw body into a
// UnifiedRequest; formatting turns the unified response (or one internal SSE
// chunk line) back into the client's wire shape. Stream formatters are
// stateful per request because the Anthropic event bridge tracks block
// indices.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use serde_json::Value;

use crate::error::Result;
use crate::models::unified::{UnifiedRequest, UnifiedResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressProtocol {
    OpenAI,
    Anthropic,
    Gemini,
}

pub trait IngressConverter: Send + Sync {
    /// Parse a raw request body; `model_hint` carries the model when the
    /// protocol encodes it in the URL (Gemini)
    fn parse_request(&self, raw: &[u8], model_hint: Option<&str>) -> Result<UnifiedRequest>;

    fn format_response(&self, response: &UnifiedResponse) -> Value;

    /// Per-request stream formatter
    fn stream_formatter(&self, model: &str) -> Box<dyn StreamFormatter>;
}

pub trait StreamFormatter: Send {
    /// Convert one internal SSE data line (`data: {chunk}` or `data: [DONE]`)
    /// into protocol bytes; None suppresses the line
    fn format_chunk(&mut self, line: &str) -> Option<String>;

    /// Flush anything the protocol requires at end of stream
    fn finish(&mut self) -> Option<String>;

    /// Content type of the stream sent to the client
    fn content_type(&self) -> &'static str {
        "text/event-stream"
    }
}

pub fn converter_for(protocol: IngressProtocol) -> &'static dyn IngressConverter {
    match protocol {
        IngressProtocol::OpenAI => &openai::OpenAIConverter,
        IngressProtocol::Anthropic => &anthropic::AnthropicConverter,
        IngressProtocol::Gemini => &gemini::GeminiConverter,
    }
}
