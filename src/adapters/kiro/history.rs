// Kiro conversation construction and sanitization
//
// AWS rejects malformed histories, so the gateway repairs the conversation
// shape before sending. Sanitization enforces, in fixed order:
//   (a) the sequence starts with a user message
//   (b) empty user messages other than the first are dropped unless they
//       carry tool results
//   (c) every assistant tool use is answered by a user message with matching
//       tool results, synthesizing error results for orphans
//   (d) user/assistant strictly alternate, bridged by "understood" /
//       "Continue" messages
//   (e) the sequence ends with a user message
// Bridging inserts never reorder the client's messages.

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::models::kiro::{
    ConversationState, InferenceConfig, InputSchema, KiroMessage, KiroRequest, KiroToolResult,
    KiroToolSpec, KiroToolUse, ToolSpecification, UserInputMessage, UserInputMessageContext,
    CHAT_TRIGGER_MANUAL, ORIGIN_AI_EDITOR,
};
use crate::models::unified::{Tool, UnifiedRequest, ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_TOOL, ROLE_USER};

/// Kiro drops tool descriptions beyond this length
pub const TOOL_DESCRIPTION_LIMIT: usize = 10_237;
/// Kiro rejects tool names beyond this length
pub const TOOL_NAME_LIMIT: usize = 64;

const EXECUTION_DIRECTIVE: &str = "Execute the user's instructions exactly as given. \
Do not skip steps, do not substitute your own plan, and do not stop before the task is complete. \
When tools are available, prefer calling them over describing what you would do.";

const EMPTY_WITH_TOOLS_SUBSTITUTE: &str = "Using tools.";
const EMPTY_ASSISTANT_SUBSTITUTE: &str = "I understand.";
const BRIDGE_ASSISTANT: &str = "understood";
const BRIDGE_USER: &str = "Continue";
const CONTINUE_CURRENT: &str = "Continue.";

// ==================================================================================================
// Request construction
// ==================================================================================================

/// Build the full Kiro request body from a unified request
pub fn build_kiro_request(
    request: &UnifiedRequest,
    kiro_model_id: &str,
    conversation_id: &str,
    profile_arn: Option<&str>,
) -> KiroRequest {
    let system_prompt = collect_system_prompt(request);
    let mut messages = walk_messages(request, kiro_model_id, &system_prompt);
    messages = sanitize_history(messages, kiro_model_id);

    let (history, mut current) = split_current(messages, kiro_model_id);

    if let Some(tools) = build_tool_specs(request.tools.as_deref()) {
        attach_tools(&mut current, tools);
    }

    let inference_config = InferenceConfig {
        max_tokens: request.max_tokens.filter(|t| *t > 0),
        temperature: request.temperature,
        top_p: request.top_p,
    };

    KiroRequest {
        conversation_state: ConversationState {
            conversation_id: conversation_id.to_string(),
            history,
            current_message: current,
            chat_trigger_type: CHAT_TRIGGER_MANUAL.to_string(),
        },
        profile_arn: profile_arn.map(|s| s.to_string()),
        inference_config: if inference_config.is_empty() {
            None
        } else {
            Some(inference_config)
        },
    }
}

/// All system messages joined, with the time-context line in front and the
/// execution directive appended
fn collect_system_prompt(request: &UnifiedRequest) -> String {
    let system_text: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == ROLE_SYSTEM)
        .map(|m| m.content.as_str())
        .collect();

    let context_line = format!("[Context: Current time is {}]", Utc::now().to_rfc3339());
    let mut parts = vec![context_line];
    if !system_text.is_empty() {
        parts.push(system_text.join("\n"));
    }
    parts.push(EXECUTION_DIRECTIVE.to_string());
    parts.join("\n")
}

/// Walk the non-system messages into Kiro form; tool results accumulate and
/// flush as a single synthesized user message
fn walk_messages(
    request: &UnifiedRequest,
    model_id: &str,
    system_prompt: &str,
) -> Vec<KiroMessage> {
    let mut out = Vec::new();
    let mut pending_results: Vec<KiroToolResult> = Vec::new();
    let mut system_merged = false;

    let flush_results = |out: &mut Vec<KiroMessage>, pending: &mut Vec<KiroToolResult>| {
        if pending.is_empty() {
            return;
        }
        out.push(KiroMessage::User {
            user_input_message: UserInputMessage {
                content: String::new(),
                model_id: model_id.to_string(),
                origin: ORIGIN_AI_EDITOR.to_string(),
                user_input_message_context: Some(UserInputMessageContext {
                    tool_results: Some(std::mem::take(pending)),
                    tools: None,
                }),
            },
        });
    };

    for msg in &request.messages {
        match msg.role.as_str() {
            ROLE_SYSTEM => continue,
            ROLE_TOOL => {
                let content = if msg.content.is_empty() {
                    "(empty result)"
                } else {
                    msg.content.as_str()
                };
                pending_results.push(KiroToolResult::success(
                    msg.tool_call_id.clone().unwrap_or_default(),
                    content,
                ));
            }
            ROLE_USER => {
                flush_results(&mut out, &mut pending_results);
                let content = if system_merged {
                    msg.content.clone()
                } else {
                    system_merged = true;
                    format!("{}\n\n{}", system_prompt, msg.content)
                };
                out.push(KiroMessage::user(content, model_id));
            }
            ROLE_ASSISTANT => {
                flush_results(&mut out, &mut pending_results);
                out.push(assistant_message(msg));
            }
            other => {
                debug!("Dropping message with unknown role '{}'", other);
            }
        }
    }
    flush_results(&mut out, &mut pending_results);

    if !system_merged {
        // No user message carried the system prompt; lead with one
        out.insert(0, KiroMessage::user(system_prompt.to_string(), model_id));
    }

    out
}

fn assistant_message(msg: &crate::models::unified::Message) -> KiroMessage {
    let tool_uses: Option<Vec<KiroToolUse>> = msg.tool_calls.as_ref().map(|calls| {
        calls
            .iter()
            .map(|tc| KiroToolUse {
                tool_use_id: tc.id.clone(),
                name: tc.function.name.clone(),
                // A broken argument string degrades to an empty object
                input: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or_else(|_| Value::Object(Default::default())),
            })
            .collect()
    });

    let content = if msg.content.is_empty() {
        if msg.has_tool_calls() {
            EMPTY_WITH_TOOLS_SUBSTITUTE.to_string()
        } else {
            EMPTY_ASSISTANT_SUBSTITUTE.to_string()
        }
    } else {
        msg.content.clone()
    };

    KiroMessage::Assistant {
        assistant_response_message: crate::models::kiro::AssistantResponseMessage {
            content,
            tool_uses: tool_uses.filter(|t| !t.is_empty()),
        },
    }
}

// ==================================================================================================
// Sanitization
// ==================================================================================================

pub fn sanitize_history(messages: Vec<KiroMessage>, model_id: &str) -> Vec<KiroMessage> {
    let mut messages = messages;

    // (a) must start with a user message
    if messages.first().map_or(true, |m| !m.is_user()) {
        messages.insert(0, KiroMessage::user("Hello", model_id));
    }

    // (b) drop empty user messages except the first, unless they carry tool results
    let mut kept = Vec::with_capacity(messages.len());
    for (i, msg) in messages.into_iter().enumerate() {
        let drop = i > 0
            && msg.is_user()
            && msg.content().is_empty()
            && !msg.has_tool_results();
        if !drop {
            kept.push(msg);
        }
    }
    let messages = kept;

    // (c) every assistant tool use must be answered by matching tool results
    let mut repaired: Vec<KiroMessage> = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();
    while let Some(msg) = iter.next() {
        let tool_use_ids: Vec<String> = msg
            .tool_uses()
            .map(|uses| uses.iter().map(|u| u.tool_use_id.clone()).collect())
            .unwrap_or_default();
        repaired.push(msg);

        if tool_use_ids.is_empty() {
            continue;
        }

        let answered: Vec<String> = iter
            .peek()
            .and_then(|next| next.tool_results())
            .map(|results| results.iter().map(|r| r.tool_use_id.clone()).collect())
            .unwrap_or_default();

        let orphans: Vec<&String> = tool_use_ids
            .iter()
            .filter(|id| !answered.contains(id))
            .collect();
        if orphans.is_empty() {
            continue;
        }

        let error_results: Vec<KiroToolResult> = orphans
            .iter()
            .map(|id| KiroToolResult::error(id.as_str(), "Tool result missing"))
            .collect();

        if let Some(KiroMessage::User {
            user_input_message,
        }) = iter.peek_mut().filter(|next| next.has_tool_results())
        {
            // Partial answer: extend the existing tool-results message
            let ctx = user_input_message
                .user_input_message_context
                .get_or_insert_with(Default::default);
            ctx.tool_results
                .get_or_insert_with(Vec::new)
                .extend(error_results);
        } else {
            repaired.push(KiroMessage::User {
                user_input_message: UserInputMessage {
                    content: String::new(),
                    model_id: model_id.to_string(),
                    origin: ORIGIN_AI_EDITOR.to_string(),
                    user_input_message_context: Some(UserInputMessageContext {
                        tool_results: Some(error_results),
                        tools: None,
                    }),
                },
            });
        }
    }

    // (d) strict user/assistant alternation
    let mut alternating: Vec<KiroMessage> = Vec::with_capacity(repaired.len());
    for msg in repaired {
        if let Some(last) = alternating.last() {
            if last.is_user() && msg.is_user() {
                alternating.push(KiroMessage::assistant(BRIDGE_ASSISTANT));
            } else if last.is_assistant() && msg.is_assistant() {
                alternating.push(KiroMessage::user(BRIDGE_USER, model_id));
            }
        }
        alternating.push(msg);
    }

    // (e) must end with a user message; the split step pops this back off as
    // the current message when nothing follows it
    if alternating.last().is_some_and(|m| m.is_assistant()) {
        alternating.push(KiroMessage::user(CONTINUE_CURRENT, model_id));
    }

    alternating
}

/// Split off the current message. A plain trailing user message becomes the
/// current; a trailing tool-results user message stays in history and a
/// synthetic "Continue." user takes its place.
fn split_current(mut messages: Vec<KiroMessage>, model_id: &str) -> (Vec<KiroMessage>, KiroMessage) {
    match messages.last() {
        Some(last) if last.is_user() && !last.has_tool_results() => {
            let current = messages.pop().unwrap();
            (messages, current)
        }
        _ => (messages, KiroMessage::user(CONTINUE_CURRENT, model_id)),
    }
}

// ==================================================================================================
// Tool specifications
// ==================================================================================================

fn build_tool_specs(tools: Option<&[Tool]>) -> Option<Vec<KiroToolSpec>> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }

    let specs = tools
        .iter()
        .map(|tool| {
            let mut description = tool.function.description.clone().unwrap_or_default();
            if description.len() > TOOL_DESCRIPTION_LIMIT {
                description.truncate(floor_char_boundary(&description, TOOL_DESCRIPTION_LIMIT));
            }
            KiroToolSpec {
                tool_specification: ToolSpecification {
                    name: shorten_tool_name(&tool.function.name),
                    description,
                    input_schema: InputSchema {
                        json: sanitize_json_schema(
                            tool.function
                                .parameters
                                .as_ref()
                                .unwrap_or(&Value::Object(Default::default())),
                        ),
                    },
                },
            }
        })
        .collect();
    Some(specs)
}

fn attach_tools(current: &mut KiroMessage, tools: Vec<KiroToolSpec>) {
    if let KiroMessage::User {
        user_input_message,
    } = current
    {
        user_input_message
            .user_input_message_context
            .get_or_insert_with(Default::default)
            .tools = Some(tools);
    }
}

/// Names over the limit: MCP-style `mcp__server__tool` collapses to
/// `mcp__tool`, anything else is hard-truncated
pub fn shorten_tool_name(name: &str) -> String {
    if name.len() <= TOOL_NAME_LIMIT {
        return name.to_string();
    }
    if name.starts_with("mcp__") {
        let parts: Vec<&str> = name.split("__").collect();
        if parts.len() >= 3 {
            let shortened = format!("mcp__{}", parts[parts.len() - 1]);
            if shortened.len() <= TOOL_NAME_LIMIT {
                return shortened;
            }
        }
    }
    name[..floor_char_boundary(name, TOOL_NAME_LIMIT)].to_string()
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Kiro returns 400 "Improperly formed request" on empty `required` arrays
/// and `additionalProperties` keys; strip them recursively
pub fn sanitize_json_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return schema.clone();
    };

    let mut result = serde_json::Map::new();
    for (key, value) in obj {
        if key == "required" && value.as_array().is_some_and(|a| a.is_empty()) {
            continue;
        }
        if key == "additionalProperties" {
            continue;
        }
        let sanitized = match value {
            Value::Object(_) => sanitize_json_schema(value),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| {
                        if item.is_object() {
                            sanitize_json_schema(item)
                        } else {
                            item.clone()
                        }
                    })
                    .collect(),
            ),
            other => other.clone(),
        };
        result.insert(key.clone(), sanitized);
    }
    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::unified::{Message, ToolCall, ToolFunction};

    const MODEL: &str = "claude-sonnet-4.5";

    fn roles(messages: &[KiroMessage]) -> Vec<&'static str> {
        messages
            .iter()
            .map(|m| if m.is_user() { "user" } else { "assistant" })
            .collect()
    }

    fn assert_sanitized_shape(messages: &[KiroMessage]) {
        assert!(messages.first().unwrap().is_user(), "must start with user");
        assert!(messages.last().unwrap().is_user(), "must end with user");
        for pair in messages.windows(2) {
            assert_ne!(
                pair[0].is_user(),
                pair[1].is_user(),
                "must strictly alternate"
            );
        }
        for (i, msg) in messages.iter().enumerate() {
            if let Some(uses) = msg.tool_uses() {
                let next = &messages[i + 1];
                let results = next.tool_results().expect("tool use must be answered");
                for use_ in uses {
                    assert!(
                        results.iter().any(|r| r.tool_use_id == use_.tool_use_id),
                        "missing result for {}",
                        use_.tool_use_id
                    );
                }
            }
        }
    }

    #[test]
    fn test_sanitize_prepends_hello_for_assistant_start() {
        let messages = vec![KiroMessage::assistant("hi")];
        let sanitized = sanitize_history(messages, MODEL);
        assert_eq!(sanitized[0].content(), "Hello");
        assert_sanitized_shape(&sanitized);
    }

    #[test]
    fn test_sanitize_drops_empty_users_but_keeps_tool_results() {
        let tool_results_user = KiroMessage::User {
            user_input_message: UserInputMessage {
                content: String::new(),
                model_id: MODEL.into(),
                origin: ORIGIN_AI_EDITOR.into(),
                user_input_message_context: Some(UserInputMessageContext {
                    tool_results: Some(vec![KiroToolResult::success("t1", "ok")]),
                    tools: None,
                }),
            },
        };
        let messages = vec![
            KiroMessage::user("first", MODEL),
            KiroMessage::assistant("a"),
            KiroMessage::user("", MODEL),
            KiroMessage::assistant("b"),
            tool_results_user,
        ];
        let sanitized = sanitize_history(messages, MODEL);
        // The empty plain user is gone; the tool-results user survives
        assert!(sanitized.iter().any(|m| m.has_tool_results()));
        assert!(!sanitized
            .iter()
            .any(|m| m.is_user() && m.content().is_empty() && !m.has_tool_results()));
    }

    #[test]
    fn test_sanitize_synthesizes_orphan_tool_results() {
        let assistant_with_tools = KiroMessage::Assistant {
            assistant_response_message: crate::models::kiro::AssistantResponseMessage {
                content: "Using tools.".into(),
                tool_uses: Some(vec![KiroToolUse {
                    tool_use_id: "t9".into(),
                    name: "search".into(),
                    input: serde_json::json!({}),
                }]),
            },
        };
        let messages = vec![
            KiroMessage::user("go", MODEL),
            assistant_with_tools,
            KiroMessage::user("next question", MODEL),
        ];
        let sanitized = sanitize_history(messages, MODEL);
        assert_sanitized_shape(&sanitized);

        let synthesized = sanitized
            .iter()
            .find(|m| m.has_tool_results())
            .expect("error result synthesized");
        assert_eq!(synthesized.tool_results().unwrap()[0].status, "error");
        assert_eq!(synthesized.tool_results().unwrap()[0].tool_use_id, "t9");
    }

    #[test]
    fn test_scenario_conversation_repair() {
        // user "A", user "B", assistant "", tool t1 "res"
        let request = UnifiedRequest::new(
            MODEL,
            vec![
                Message::text(ROLE_USER, "A"),
                Message::text(ROLE_USER, "B"),
                Message::text(ROLE_ASSISTANT, ""),
                Message {
                    role: ROLE_TOOL.into(),
                    content: "res".into(),
                    name: None,
                    tool_call_id: Some("t1".into()),
                    tool_calls: None,
                },
            ],
        );
        let kiro = build_kiro_request(&request, MODEL, "conv-1", None);
        let state = kiro.conversation_state;

        let mut all = state.history.clone();
        all.push(state.current_message.clone());

        assert_eq!(
            roles(&all),
            vec!["user", "assistant", "user", "assistant", "user", "user"]
        );
        // user "A" (with system prompt merged in)
        assert!(all[0].content().ends_with("A"));
        assert_eq!(all[1].content(), "understood");
        assert_eq!(all[2].content(), "B");
        assert_eq!(all[3].content(), "I understand.");
        // the tool-results user
        let results = all[4].tool_results().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_use_id, "t1");
        assert_eq!(results[0].status, "success");
        assert_eq!(results[0].content[0].text, "res");
        // final synthetic current
        assert_eq!(all[5].content(), "Continue.");
    }

    #[test]
    fn test_assistant_tail_gets_continue_current() {
        let request = UnifiedRequest::new(
            MODEL,
            vec![
                Message::text(ROLE_USER, "hi"),
                Message::text(ROLE_ASSISTANT, "hello"),
            ],
        );
        let kiro = build_kiro_request(&request, MODEL, "conv-1", None);
        let state = kiro.conversation_state;
        assert!(state.current_message.is_user());
        assert_eq!(state.current_message.content(), "Continue.");
        assert!(state.history.last().unwrap().is_assistant());
    }

    #[test]
    fn test_system_prompt_merged_into_first_user() {
        let request = UnifiedRequest::new(
            MODEL,
            vec![
                Message::text(ROLE_SYSTEM, "You are terse."),
                Message::text(ROLE_USER, "U"),
            ],
        );
        let kiro = build_kiro_request(&request, MODEL, "conv-1", None);
        let current = kiro.conversation_state.current_message;
        assert!(current.content().starts_with("[Context: Current time is "));
        assert!(current.content().contains("You are terse."));
        assert!(current.content().ends_with("U"));
    }

    #[test]
    fn test_empty_assistant_substitutes() {
        let with_tools = Message {
            role: ROLE_ASSISTANT.into(),
            content: String::new(),
            name: None,
            tool_call_id: None,
            tool_calls: Some(vec![ToolCall::function("t1", "search", "{}".into())]),
        };
        let msg = assistant_message(&with_tools);
        assert_eq!(msg.content(), "Using tools.");

        let without = Message::text(ROLE_ASSISTANT, "");
        assert_eq!(assistant_message(&without).content(), "I understand.");
    }

    #[test]
    fn test_broken_tool_arguments_degrade_to_empty_object() {
        let msg = Message {
            role: ROLE_ASSISTANT.into(),
            content: "x".into(),
            name: None,
            tool_call_id: None,
            tool_calls: Some(vec![ToolCall::function("t1", "search", "{broken".into())]),
        };
        let kiro = assistant_message(&msg);
        let uses = kiro.tool_uses().unwrap();
        assert_eq!(uses[0].input, serde_json::json!({}));
    }

    #[test]
    fn test_tools_attach_to_current_only() {
        let mut request = UnifiedRequest::new(
            MODEL,
            vec![
                Message::text(ROLE_USER, "first"),
                Message::text(ROLE_ASSISTANT, "ok"),
                Message::text(ROLE_USER, "second"),
            ],
        );
        request.tools = Some(vec![Tool {
            tool_type: "function".into(),
            function: ToolFunction {
                name: "search".into(),
                description: Some("desc".into()),
                parameters: Some(serde_json::json!({"type": "object"})),
            },
        }]);
        let kiro = build_kiro_request(&request, MODEL, "conv-1", None);
        let state = kiro.conversation_state;

        for msg in &state.history {
            if let KiroMessage::User {
                user_input_message,
            } = msg
            {
                let has_tools = user_input_message
                    .user_input_message_context
                    .as_ref()
                    .is_some_and(|ctx| ctx.tools.is_some());
                assert!(!has_tools, "history must not carry tools");
            }
        }
        let KiroMessage::User {
            user_input_message,
        } = &state.current_message
        else {
            panic!("current must be a user message");
        };
        assert!(user_input_message
            .user_input_message_context
            .as_ref()
            .unwrap()
            .tools
            .is_some());
    }

    #[test]
    fn test_tool_name_shortening() {
        assert_eq!(shorten_tool_name("read_file"), "read_file");

        let long_mcp = format!("mcp__{}__do_thing", "s".repeat(80));
        assert_eq!(shorten_tool_name(&long_mcp), "mcp__do_thing");

        let long_plain = "x".repeat(100);
        assert_eq!(shorten_tool_name(&long_plain).len(), TOOL_NAME_LIMIT);
    }

    #[test]
    fn test_long_description_truncated() {
        let request = {
            let mut r = UnifiedRequest::new(MODEL, vec![Message::text(ROLE_USER, "hi")]);
            r.tools = Some(vec![Tool {
                tool_type: "function".into(),
                function: ToolFunction {
                    name: "big".into(),
                    description: Some("d".repeat(20_000)),
                    parameters: None,
                },
            }]);
            r
        };
        let kiro = build_kiro_request(&request, MODEL, "conv-1", None);
        let KiroMessage::User {
            user_input_message,
        } = &kiro.conversation_state.current_message
        else {
            panic!();
        };
        let tools = user_input_message
            .user_input_message_context
            .as_ref()
            .unwrap()
            .tools
            .as_ref()
            .unwrap();
        assert_eq!(
            tools[0].tool_specification.description.len(),
            TOOL_DESCRIPTION_LIMIT
        );
    }

    #[test]
    fn test_schema_sanitization() {
        let schema = serde_json::json!({
            "type": "object",
            "required": [],
            "additionalProperties": false,
            "properties": {
                "nested": {
                    "type": "object",
                    "required": ["a"],
                    "additionalProperties": true
                }
            }
        });
        let sanitized = sanitize_json_schema(&schema);
        assert!(sanitized.get("required").is_none());
        assert!(sanitized.get("additionalProperties").is_none());
        assert_eq!(sanitized["properties"]["nested"]["required"][0], "a");
        assert!(sanitized["properties"]["nested"]
            .get("additionalProperties")
            .is_none());
    }

    #[test]
    fn test_inference_config_from_sampling_knobs() {
        let mut request = UnifiedRequest::new(MODEL, vec![Message::text(ROLE_USER, "hi")]);
        request.temperature = Some(0.3);
        request.max_tokens = Some(512);
        let kiro = build_kiro_request(&request, MODEL, "c", None);
        let cfg = kiro.inference_config.unwrap();
        assert_eq!(cfg.max_tokens, Some(512));
        assert_eq!(cfg.temperature, Some(0.3));

        let bare = UnifiedRequest::new(MODEL, vec![Message::text(ROLE_USER, "hi")]);
        assert!(build_kiro_request(&bare, MODEL, "c", None)
            .inference_config
            .is_none());
    }
}
