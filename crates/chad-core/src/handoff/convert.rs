//! Conversation extraction and per-provider formatting for handoffs.
//!
//! Different providers want different context shapes: Claude regenerates
//! its own thinking so prior thinking blocks are dropped; Codex supports
//! extended reasoning so a truncated `[Reasoning]` block is kept; everyone
//! else gets an XML-tagged transcript.

use chad_protocol::{BlockKind, Event, EventPayload, MessageBlock, ProviderKind};

use crate::events::EventLog;

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub role: Role,
    pub blocks: Vec<MessageBlock>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

const THINKING_TRUNCATE: usize = 1000;
const RESULT_TRUNCATE: usize = 500;

/// Extract conversation turns from the event log.
pub fn extract_conversation(
    event_log: &EventLog,
    since_seq: u64,
    max_turns: Option<usize>,
) -> Vec<ConversationTurn> {
    let types = ["user_message".to_string(), "assistant_message".to_string()];
    let events = event_log
        .read_events(since_seq, Some(&types))
        .unwrap_or_default();

    let mut turns: Vec<ConversationTurn> = events
        .into_iter()
        .filter_map(|event| turn_from_event(event))
        .collect();

    if let Some(max) = max_turns {
        if turns.len() > max {
            turns.drain(..turns.len() - max);
        }
    }

    turns
}

fn turn_from_event(event: Event) -> Option<ConversationTurn> {
    let timestamp = Some(event.ts);
    match event.payload {
        EventPayload::UserMessage { content } if !content.is_empty() => Some(ConversationTurn {
            role: Role::User,
            blocks: vec![MessageBlock::text(content)],
            timestamp,
        }),
        EventPayload::AssistantMessage { blocks } if !blocks.is_empty() => {
            Some(ConversationTurn {
                role: Role::Assistant,
                blocks,
                timestamp,
            })
        }
        _ => None,
    }
}

/// Format conversation turns for a target provider.
pub fn format_for_provider(
    turns: &[ConversationTurn],
    target: ProviderKind,
    new_message: Option<&str>,
) -> String {
    match target {
        ProviderKind::Anthropic => format_flat(turns, new_message, false),
        ProviderKind::Openai => format_flat(turns, new_message, true),
        _ => format_generic(turns, new_message),
    }
}

fn truncate(content: &str, max: usize) -> String {
    if content.len() > max {
        let mut end = max;
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &content[..end])
    } else {
        content.to_string()
    }
}

fn user_text(blocks: &[MessageBlock]) -> String {
    blocks
        .iter()
        .filter(|b| b.kind == BlockKind::Text && !b.content.is_empty())
        .map(|b| b.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Flat `[User]:` / `[Assistant]:` transcript. With `include_reasoning`,
/// thinking blocks appear as truncated `[Reasoning]` entries; without, they
/// are dropped entirely.
fn format_flat(
    turns: &[ConversationTurn],
    new_message: Option<&str>,
    include_reasoning: bool,
) -> String {
    let mut lines: Vec<String> = Vec::new();

    for turn in turns {
        match turn.role {
            Role::User => {
                let text = user_text(&turn.blocks);
                if !text.is_empty() {
                    lines.push(format!("[User]: {text}"));
                    lines.push(String::new());
                }
            }
            Role::Assistant => {
                let mut parts: Vec<String> = Vec::new();
                for block in &turn.blocks {
                    match block.kind {
                        BlockKind::Thinking if include_reasoning => {
                            if !block.content.is_empty() {
                                parts.push(format!(
                                    "[Reasoning]: {}",
                                    truncate(&block.content, THINKING_TRUNCATE)
                                ));
                            }
                        }
                        BlockKind::Thinking => {}
                        BlockKind::Text => {
                            if !block.content.is_empty() {
                                parts.push(block.content.clone());
                            }
                        }
                        BlockKind::ToolCall => {
                            let tool = block.tool.as_deref().unwrap_or("unknown");
                            let summary = format_tool_call_compact(tool, block);
                            if !summary.is_empty() {
                                parts.push(format!("[Tool: {tool}] {summary}"));
                            }
                        }
                        BlockKind::ToolResult => {
                            if !block.content.is_empty() {
                                parts.push(format!(
                                    "[Result]: {}",
                                    truncate(&block.content, RESULT_TRUNCATE)
                                ));
                            }
                        }
                        BlockKind::Error => {}
                    }
                }
                if !parts.is_empty() {
                    lines.push("[Assistant]:".to_string());
                    lines.extend(parts);
                    lines.push(String::new());
                }
            }
        }
    }

    let mut result = lines.join("\n").trim().to_string();
    if let Some(msg) = new_message {
        result.push_str(&format!("\n\n[User]: {msg}"));
    }
    result
}

/// XML-tagged transcript for providers without a preferred native format.
fn format_generic(turns: &[ConversationTurn], new_message: Option<&str>) -> String {
    let mut lines: Vec<String> = Vec::new();

    for turn in turns {
        match turn.role {
            Role::User => {
                let text = user_text(&turn.blocks);
                if !text.is_empty() {
                    lines.push(format!("<turn role=\"user\">{text}</turn>"));
                    lines.push(String::new());
                }
            }
            Role::Assistant => {
                lines.push("<turn role=\"assistant\">".to_string());
                for block in &turn.blocks {
                    match block.kind {
                        BlockKind::Thinking => {
                            if !block.content.is_empty() {
                                lines.push(format!(
                                    "<thinking>{}</thinking>",
                                    truncate(&block.content, THINKING_TRUNCATE)
                                ));
                            }
                        }
                        BlockKind::Text => {
                            if !block.content.is_empty() {
                                lines.push(format!("<response>{}</response>", block.content));
                            }
                        }
                        BlockKind::ToolCall => {
                            let tool = block.tool.as_deref().unwrap_or("unknown");
                            let summary = format_tool_call_compact(tool, block);
                            if !summary.is_empty() {
                                lines.push(format!("<tool name=\"{tool}\">{summary}</tool>"));
                            }
                        }
                        BlockKind::ToolResult => {
                            if !block.content.is_empty() {
                                lines.push(format!(
                                    "<result>{}</result>",
                                    truncate(&block.content, RESULT_TRUNCATE)
                                ));
                            }
                        }
                        BlockKind::Error => {}
                    }
                }
                lines.push("</turn>".to_string());
                lines.push(String::new());
            }
        }
    }

    let mut result = lines.join("\n").trim().to_string();
    if let Some(msg) = new_message {
        result.push_str(&format!("\n\n<turn role=\"user\">{msg}</turn>"));
    }
    result
}

/// Compact one-line rendering of a tool call for transcripts.
fn format_tool_call_compact(tool: &str, block: &MessageBlock) -> String {
    let args = block.args.as_ref();
    let string_arg = |key: &str| -> String {
        args.and_then(|a| a.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };

    match tool {
        "Read" | "Write" | "Edit" => string_arg("file_path"),
        "Bash" => truncate(&string_arg("command"), 80),
        "Glob" | "Grep" => string_arg("pattern"),
        "Task" => string_arg("description"),
        "WebSearch" => string_arg("query"),
        "WebFetch" => string_arg("url"),
        _ => {
            // Generic: first non-empty string argument
            args.and_then(|a| {
                a.values()
                    .find_map(|v| v.as_str().filter(|s| !s.is_empty()))
            })
            .map(|s| truncate(s, 50))
            .unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn assistant_turn(blocks: Vec<MessageBlock>) -> ConversationTurn {
        ConversationTurn {
            role: Role::Assistant,
            blocks,
            timestamp: None,
        }
    }

    fn user_turn(text: &str) -> ConversationTurn {
        ConversationTurn {
            role: Role::User,
            blocks: vec![MessageBlock::text(text)],
            timestamp: None,
        }
    }

    fn tool_call(tool: &str, key: &str, value: &str) -> MessageBlock {
        let mut args = Map::new();
        args.insert(key.to_string(), Value::from(value));
        MessageBlock {
            kind: BlockKind::ToolCall,
            content: String::new(),
            tool: Some(tool.to_string()),
            tool_call_id: Some("tc_1".to_string()),
            args: Some(args),
        }
    }

    #[test]
    fn test_claude_format_omits_thinking() {
        let turns = vec![
            user_turn("fix the bug"),
            assistant_turn(vec![
                MessageBlock::thinking("let me think about this"),
                MessageBlock::text("I fixed it"),
            ]),
        ];
        let out = format_for_provider(&turns, ProviderKind::Anthropic, None);
        assert!(out.contains("[User]: fix the bug"));
        assert!(out.contains("I fixed it"));
        assert!(!out.contains("let me think"));
        assert!(!out.contains("[Reasoning]"));
    }

    #[test]
    fn test_codex_format_includes_truncated_reasoning() {
        let long_thinking = "t".repeat(1500);
        let turns = vec![assistant_turn(vec![
            MessageBlock::thinking(long_thinking),
            MessageBlock::text("done"),
        ])];
        let out = format_for_provider(&turns, ProviderKind::Openai, None);
        assert!(out.contains("[Reasoning]: "));
        assert!(out.contains("..."));
        assert!(!out.contains(&"t".repeat(1001)));
    }

    #[test]
    fn test_generic_format_uses_xml_tags() {
        let turns = vec![
            user_turn("do it"),
            assistant_turn(vec![
                MessageBlock::thinking("hmm"),
                MessageBlock::text("ok"),
            ]),
        ];
        let out = format_for_provider(&turns, ProviderKind::Gemini, None);
        assert!(out.contains("<turn role=\"user\">do it</turn>"));
        assert!(out.contains("<thinking>hmm</thinking>"));
        assert!(out.contains("<response>ok</response>"));
        assert!(out.contains("</turn>"));
    }

    #[test]
    fn test_tool_calls_render_compactly() {
        let turns = vec![assistant_turn(vec![
            tool_call("Read", "file_path", "src/main.rs"),
            tool_call("Bash", "command", "cargo test --workspace"),
        ])];
        let out = format_for_provider(&turns, ProviderKind::Anthropic, None);
        assert!(out.contains("[Tool: Read] src/main.rs"));
        assert!(out.contains("[Tool: Bash] cargo test --workspace"));
    }

    #[test]
    fn test_long_bash_command_truncated() {
        let cmd = "x".repeat(120);
        let turns = vec![assistant_turn(vec![tool_call("Bash", "command", &cmd)])];
        let out = format_for_provider(&turns, ProviderKind::Anthropic, None);
        assert!(out.contains(&format!("{}...", "x".repeat(80))));
    }

    #[test]
    fn test_tool_result_truncated() {
        let big = "r".repeat(600);
        let turns = vec![assistant_turn(vec![MessageBlock {
            kind: BlockKind::ToolResult,
            content: big,
            tool: None,
            tool_call_id: None,
            args: None,
        }])];
        let out = format_for_provider(&turns, ProviderKind::Openai, None);
        assert!(out.contains("[Result]: "));
        assert!(out.contains("..."));
    }

    #[test]
    fn test_new_message_appended() {
        let turns = vec![user_turn("original")];
        let out = format_for_provider(&turns, ProviderKind::Anthropic, Some("keep going"));
        assert!(out.ends_with("[User]: keep going"));

        let out = format_for_provider(&turns, ProviderKind::Qwen, Some("keep going"));
        assert!(out.ends_with("<turn role=\"user\">keep going</turn>"));
    }

    #[test]
    fn test_unknown_tool_uses_first_string_arg() {
        let turns = vec![assistant_turn(vec![tool_call(
            "CustomTool",
            "target",
            "the-thing",
        )])];
        let out = format_for_provider(&turns, ProviderKind::Anthropic, None);
        assert!(out.contains("[Tool: CustomTool] the-thing"));
    }
}
