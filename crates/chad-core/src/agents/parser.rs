//! Normalized parsing of provider JSON-line output.
//!
//! Each provider CLI streams its own JSON shapes; this module flattens them
//! into one normalized event alphabet so nothing downstream branches on
//! provider kind. Lines that fail to parse as JSON degrade to plain text.

use serde_json::{Map, Value};

use chad_protocol::ProviderKind;

/// Normalized agent output event.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Text(String),
    Thinking(String),
    ToolCall {
        id: String,
        name: String,
        args: Map<String, Value>,
    },
    ToolResult {
        id: String,
        content: String,
    },
    Result(String),
}

/// Parse one output line into normalized events.
pub fn parse_stream_line(kind: ProviderKind, line: &str) -> Vec<AgentEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }

    match kind {
        ProviderKind::Mistral => vec![AgentEvent::Text(line.to_string())],
        ProviderKind::Anthropic => parse_claude_line(line),
        ProviderKind::Openai => parse_codex_line(line),
        _ => parse_generic_line(line),
    }
}

/// Extract a provider-native session/thread id from a stream line, for
/// providers that support native resume.
pub fn extract_native_session_id(kind: ProviderKind, line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    match kind {
        ProviderKind::Openai => {
            if value.get("type")?.as_str()? == "thread.started" {
                return value.get("thread_id")?.as_str().map(str::to_string);
            }
            None
        }
        _ => value
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Claude Code stream-json: assistant/user envelopes with content blocks,
/// plus a final `result` object.
fn parse_claude_line(line: &str) -> Vec<AgentEvent> {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return vec![AgentEvent::Text(line.to_string())];
    };

    let mut events = Vec::new();
    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            for block in content_blocks(&value) {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            events.push(AgentEvent::Text(text.to_string()));
                        }
                    }
                    Some("thinking") => {
                        if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                            events.push(AgentEvent::Thinking(text.to_string()));
                        }
                    }
                    Some("tool_use") => {
                        let id = str_field_map(block, "id");
                        let name = str_field_map(block, "name");
                        let args = block
                            .get("input")
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default();
                        events.push(AgentEvent::ToolCall { id, name, args });
                    }
                    _ => {}
                }
            }
        }
        Some("user") => {
            for block in content_blocks(&value) {
                if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                    let id = str_field_map(block, "tool_use_id");
                    let content = match block.get("content") {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    events.push(AgentEvent::ToolResult { id, content });
                }
            }
        }
        Some("result") => {
            if let Some(result) = value.get("result").and_then(Value::as_str) {
                events.push(AgentEvent::Result(result.to_string()));
            }
        }
        _ => {}
    }
    events
}

/// Codex `--json`: `item.completed` envelopes with typed items.
fn parse_codex_line(line: &str) -> Vec<AgentEvent> {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return vec![AgentEvent::Text(line.to_string())];
    };

    if value.get("type").and_then(Value::as_str) != Some("item.completed") {
        return Vec::new();
    }
    let Some(item) = value.get("item") else {
        return Vec::new();
    };

    let mut events = Vec::new();
    match item.get("type").and_then(Value::as_str) {
        Some("agent_message") => {
            if let Some(text) = item.get("text").and_then(Value::as_str) {
                events.push(AgentEvent::Text(text.to_string()));
            }
        }
        Some("reasoning") => {
            if let Some(text) = item.get("text").and_then(Value::as_str) {
                events.push(AgentEvent::Thinking(text.to_string()));
            }
        }
        Some("command_execution") => {
            let id = str_field(item, "id");
            let mut args = Map::new();
            if let Some(command) = item.get("command").and_then(Value::as_str) {
                args.insert("command".to_string(), Value::from(command));
            }
            events.push(AgentEvent::ToolCall {
                id: id.clone(),
                name: "bash".to_string(),
                args,
            });
            if let Some(output) = item.get("aggregated_output").and_then(Value::as_str) {
                events.push(AgentEvent::ToolResult {
                    id,
                    content: output.to_string(),
                });
            }
        }
        _ => {}
    }
    events
}

/// Tolerant mapping for gemini/qwen/kimi/opencode/mock stream-json shapes.
fn parse_generic_line(line: &str) -> Vec<AgentEvent> {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return vec![AgentEvent::Text(line.to_string())];
    };
    let Some(obj) = value.as_object() else {
        return vec![AgentEvent::Text(line.to_string())];
    };

    if let Some(thought) = obj
        .get("thinking")
        .or_else(|| obj.get("thought"))
        .and_then(Value::as_str)
    {
        return vec![AgentEvent::Thinking(thought.to_string())];
    }

    if let Some(tool) = obj.get("tool_call").or_else(|| obj.get("toolCall")) {
        let id = str_field(tool, "id");
        let name = str_field(tool, "name");
        let args = tool
            .get("args")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        return vec![AgentEvent::ToolCall { id, name, args }];
    }

    if let Some(result) = obj.get("tool_result") {
        let id = str_field(result, "id");
        let content = str_field(result, "content");
        return vec![AgentEvent::ToolResult { id, content }];
    }

    if let Some(result) = obj.get("result").and_then(Value::as_str) {
        return vec![AgentEvent::Result(result.to_string())];
    }

    for key in ["text", "content", "response"] {
        if let Some(text) = obj.get(key).and_then(Value::as_str) {
            return vec![AgentEvent::Text(text.to_string())];
        }
    }

    Vec::new()
}

fn content_blocks(value: &Value) -> Vec<&Map<String, Value>> {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(|blocks| blocks.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn str_field_map(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
