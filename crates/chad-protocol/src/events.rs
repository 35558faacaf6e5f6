//! The persisted event model.
//!
//! Events are a tagged union with a `type` field, serialized one JSON object
//! per line by the event log. `seq` is the only cross-component reference:
//! consumers look events up by `(session_id, seq)` and events never point at
//! each other directly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{MilestoneType, SessionId};

/// Reference to an artifact stored outside the event log.
///
/// Large tool output (≥ 10 KiB) is written to a sidecar file and the event
/// embeds this reference instead of the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Path relative to the log directory.
    pub path: String,
    /// Hex sha256 of the stored content (post-truncation).
    pub sha256: String,
    /// Stored size in bytes.
    pub size: u64,
}

/// Kind tag for a block within an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Thinking,
    ToolCall,
    ToolResult,
    Error,
}

/// A block within an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBlock {
    pub kind: BlockKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

impl MessageBlock {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Text,
            content: content.into(),
            tool: None,
            tool_call_id: None,
            args: None,
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Thinking,
            content: content.into(),
            tool: None,
            tool_call_id: None,
            args: None,
        }
    }
}

/// The tagged event payload union.
///
/// Serialized with `"type"` as the tag so each log line reads
/// `{"type":"terminal_output","seq":…,…}` after envelope flattening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStarted {
        task_description: String,
        project_path: String,
        coding_provider: String,
        coding_account: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coding_model: Option<String>,
    },
    SessionEnded {
        success: bool,
        reason: String,
    },
    UserMessage {
        content: String,
    },
    AssistantMessage {
        blocks: Vec<MessageBlock>,
    },
    ToolCallStarted {
        tool_call_id: String,
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Map<String, Value>>,
    },
    ToolCallFinished {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdout_ref: Option<ArtifactRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr_ref: Option<ArtifactRef>,
        /// Bounded summary used when rebuilding context for a handoff.
        #[serde(default)]
        llm_summary: String,
    },
    TerminalOutput {
        /// Base64-encoded raw PTY bytes.
        data: String,
        /// Best-effort UTF-8 decode for human readers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Milestone {
        milestone_type: MilestoneType,
        title: String,
        summary: String,
        #[serde(default)]
        details: Map<String, Value>,
        /// Independent per-session milestone counter for polling catch-up.
        milestone_seq: u64,
    },
    ModelSelected {
        provider: String,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning_effort: Option<String>,
    },
    ProviderSwitched {
        from_provider: String,
        to_provider: String,
        from_model: String,
        to_model: String,
        reason: String,
        /// Seq of the `context_condensed` checkpoint carrying the handoff
        /// payload. The switch event references it rather than inlining it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint_seq: Option<u64>,
    },
    VerificationAttempt {
        attempt_number: u32,
        passed: bool,
        summary: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        issues: Vec<String>,
    },
    ContextCondensed {
        /// Inclusive seq range this summary replaces.
        replaces_seq_range: (u64, u64),
        summary_text: String,
        policy: String,
        #[serde(default)]
        original_task: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files_changed: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files_created: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        key_commands: Vec<String>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        remaining_work: String,
        /// Native session id of the prior provider, for native resume.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_session_id: Option<String>,
    },
}

impl EventPayload {
    /// The wire name of this payload's `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::SessionStarted { .. } => "session_started",
            EventPayload::SessionEnded { .. } => "session_ended",
            EventPayload::UserMessage { .. } => "user_message",
            EventPayload::AssistantMessage { .. } => "assistant_message",
            EventPayload::ToolCallStarted { .. } => "tool_call_started",
            EventPayload::ToolCallFinished { .. } => "tool_call_finished",
            EventPayload::TerminalOutput { .. } => "terminal_output",
            EventPayload::Milestone { .. } => "milestone",
            EventPayload::ModelSelected { .. } => "model_selected",
            EventPayload::ProviderSwitched { .. } => "provider_switched",
            EventPayload::VerificationAttempt { .. } => "verification_attempt",
            EventPayload::ContextCondensed { .. } => "context_condensed",
        }
    }
}

/// The event envelope written to the log.
///
/// `seq` starts at 1 and is strictly increasing and gap-free per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    /// UTC timestamp, RFC3339.
    pub ts: String,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// A milestone record as surfaced to polling consumers.
///
/// Milestones carry their own monotonic sequence, independent of event seq.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub seq: u64,
    pub milestone_type: MilestoneType,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Fixed display title for each milestone type. UIs render these directly.
pub fn milestone_title(milestone_type: MilestoneType) -> &'static str {
    match milestone_type {
        MilestoneType::Exploration => "Discovery",
        MilestoneType::CodingComplete => "Coding Complete",
        MilestoneType::SessionLimitReached => "Session Limit",
        MilestoneType::WeeklyLimitReached => "Weekly Limit",
        MilestoneType::UsageThreshold => "Usage Warning",
        MilestoneType::VerificationStarted => "Verification",
        MilestoneType::VerificationPassed => "Verification Passed",
        MilestoneType::VerificationFailed => "Verification Failed",
        MilestoneType::RevisionStarted => "Re-coding",
    }
}
