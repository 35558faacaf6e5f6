use serde::{Deserialize, Serialize};

/// Generate a newtype wrapper around `String` with standard trait impls.
///
/// Each generated type gets: `Debug`, `Clone`, `PartialEq`, `Eq`, `Hash`,
/// `Serialize`/`Deserialize` (transparent), `Display`, `Deref<Target=str>`,
/// `AsRef<str>`, `Borrow<str>`, `From<String>`, `From<&str>`.
macro_rules! newtype_string {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

newtype_string! {
    /// Unique identifier for an orchestrator session (a UUID string).
    SessionId
}

newtype_string! {
    /// Unique identifier for a task within a session (a UUID string).
    TaskId
}

newtype_string! {
    /// Identifier of a live PTY stream owned by the stream service.
    StreamId
}

/// Supported agent provider kinds.
///
/// Each variant maps to an external coding-assistant CLI with its own
/// credential layout. `Mock` spawns a local interpreter script producing
/// canned events for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    Openai,
    Gemini,
    Qwen,
    Mistral,
    Opencode,
    Kimi,
    Mock,
}

impl ProviderKind {
    /// Canonical lowercase name for this provider kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Openai => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Qwen => "qwen",
            ProviderKind::Mistral => "mistral",
            ProviderKind::Opencode => "opencode",
            ProviderKind::Kimi => "kimi",
            ProviderKind::Mock => "mock",
        }
    }

    /// Parse a provider kind from a string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "anthropic" => Some(ProviderKind::Anthropic),
            "openai" => Some(ProviderKind::Openai),
            "gemini" => Some(ProviderKind::Gemini),
            "qwen" => Some(ProviderKind::Qwen),
            "mistral" => Some(ProviderKind::Mistral),
            "opencode" => Some(ProviderKind::Opencode),
            "kimi" => Some(ProviderKind::Kimi),
            "mock" => Some(ProviderKind::Mock),
            _ => None,
        }
    }

    /// All supported provider kinds.
    pub fn all() -> &'static [ProviderKind] {
        &[
            ProviderKind::Anthropic,
            ProviderKind::Openai,
            ProviderKind::Gemini,
            ProviderKind::Qwen,
            ProviderKind::Mistral,
            ProviderKind::Opencode,
            ProviderKind::Kimi,
            ProviderKind::Mock,
        ]
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| {
            let supported = ProviderKind::all()
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            format!("Unknown provider '{}'. Supported: {}", s, supported)
        })
    }
}

/// A single child-process run of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Exploration,
    Combined,
    Continuation,
    Revision,
    Verification,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Exploration => "exploration",
            Phase::Combined => "combined",
            Phase::Continuation => "continuation",
            Phase::Revision => "revision",
            Phase::Verification => "verification",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task lifecycle state. Terminal states never transition back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Whether this state is terminal (no further transitions allowed).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of quota/limit indications found in agent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    SessionLimit,
    WeeklyLimit,
    RateLimit,
    Billing,
    Resource,
}

impl LimitKind {
    /// The milestone type emitted when this limit is detected.
    pub fn milestone_type(&self) -> MilestoneType {
        match self {
            LimitKind::SessionLimit => MilestoneType::SessionLimitReached,
            LimitKind::WeeklyLimit => MilestoneType::WeeklyLimitReached,
            // Rate limits and billing/resource exhaustion end the session the
            // same way a session limit does; the summary carries the detail.
            LimitKind::RateLimit | LimitKind::Billing | LimitKind::Resource => {
                MilestoneType::SessionLimitReached
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::SessionLimit => "session_limit",
            LimitKind::WeeklyLimit => "weekly_limit",
            LimitKind::RateLimit => "rate_limit",
            LimitKind::Billing => "billing",
            LimitKind::Resource => "resource",
        }
    }
}

/// Typed, user-visible phase markers within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneType {
    Exploration,
    CodingComplete,
    SessionLimitReached,
    WeeklyLimitReached,
    UsageThreshold,
    VerificationStarted,
    VerificationPassed,
    VerificationFailed,
    RevisionStarted,
}

impl MilestoneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneType::Exploration => "exploration",
            MilestoneType::CodingComplete => "coding_complete",
            MilestoneType::SessionLimitReached => "session_limit_reached",
            MilestoneType::WeeklyLimitReached => "weekly_limit_reached",
            MilestoneType::UsageThreshold => "usage_threshold",
            MilestoneType::VerificationStarted => "verification_started",
            MilestoneType::VerificationPassed => "verification_passed",
            MilestoneType::VerificationFailed => "verification_failed",
            MilestoneType::RevisionStarted => "revision_started",
        }
    }
}

impl std::fmt::Display for MilestoneType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
