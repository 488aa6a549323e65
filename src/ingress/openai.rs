// OpenAI ingress converter
//
// The internal shape is OpenAI's, so parsing is a direct decode and the
// stream formatter is a pass-through.

use serde_json::Value;

use super::{IngressConverter, StreamFormatter};
use crate::error::{GatewayError, Result};
use crate::models::unified::{UnifiedRequest, UnifiedResponse};

pub struct OpenAIConverter;

impl IngressConverter for OpenAIConverter {
    fn parse_request(&self, raw: &[u8], _model_hint: Option<&str>) -> Result<UnifiedRequest> {
        let request: UnifiedRequest = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Validation(format!("invalid request body: {}", e)))?;
        request.validate()?;
        Ok(request)
    }

    fn format_response(&self, response: &UnifiedResponse) -> Value {
        serde_json::to_value(response).unwrap_or_default()
    }

    fn stream_formatter(&self, _model: &str) -> Box<dyn StreamFormatter> {
        Box::new(PassThroughFormatter)
    }
}

struct PassThroughFormatter;

impl StreamFormatter for PassThroughFormatter {
    fn format_chunk(&mut self, line: &str) -> Option<String> {
        Some(format!("{}\n\n", line))
    }

    fn finish(&mut self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::unified::{Message, ROLE_ASSISTANT};

    #[test]
    fn test_parse_valid_request() {
        let converter = OpenAIConverter;
        let body = r#"{"model": "gpt-4", "messages": [{"role": "user", "content": "Hello"}]}"#;
        let request = converter.parse_request(body.as_bytes(), None).unwrap();
        assert_eq!(request.model, "gpt-4");
        assert_eq!(request.messages.len(), 1);
        assert!(!request.stream);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let converter = OpenAIConverter;
        assert!(matches!(
            converter.parse_request(b"not json", None),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty_messages() {
        let converter = OpenAIConverter;
        let body = r#"{"model": "gpt-4", "messages": []}"#;
        assert!(matches!(
            converter.parse_request(body.as_bytes(), None),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_format_response_is_identity_shape() {
        let converter = OpenAIConverter;
        let response =
            UnifiedResponse::new("gpt-4", Message::text(ROLE_ASSISTANT, "Hi"), "stop");
        let value = converter.format_response(&response);
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["choices"][0]["message"]["content"], "Hi");
    }

    #[test]
    fn test_stream_pass_through() {
        let converter = OpenAIConverter;
        let mut formatter = converter.stream_formatter("gpt-4");
        assert_eq!(
            formatter.format_chunk("data: {\"x\":1}").as_deref(),
            Some("data: {\"x\":1}\n\n")
        );
        assert_eq!(
            formatter.format_chunk("data: [DONE]").as_deref(),
            Some("data: [DONE]\n\n")
        );
        assert!(formatter.finish().is_none());
    }
}
