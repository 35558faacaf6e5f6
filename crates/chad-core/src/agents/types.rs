//! Inputs and outputs of agent command construction.

use std::path::PathBuf;

use chad_protocol::{Phase, ProviderKind};

/// Everything needed to spawn one agent phase run.
///
/// Produced by [`crate::agents::build_command`]; consumed by the PTY stream
/// service. Spawning and I/O live elsewhere; this is pure data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin right after spawn, then stdin closes.
    pub initial_stdin: Option<String>,
}

/// Request for one agent phase run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub provider: ProviderKind,
    pub account: String,
    pub project_path: PathBuf,
    pub phase: Phase,
    pub task_description: String,
    /// Accumulated output of earlier phases, for continuation/revision.
    pub prior_output: Option<String>,
    /// Screenshot paths referenced in the prompt, if any.
    pub screenshots: Vec<String>,
    pub model: Option<String>,
    pub reasoning: Option<String>,
    /// Native session/thread id for providers that support resume.
    pub resume_session_id: Option<String>,
    /// Full prompt override; when set, the phase templates are skipped.
    pub override_prompt: Option<String>,
}

impl CommandSpec {
    pub fn new(
        provider: ProviderKind,
        account: impl Into<String>,
        project_path: impl Into<PathBuf>,
        phase: Phase,
        task_description: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            account: account.into(),
            project_path: project_path.into(),
            phase,
            task_description: task_description.into(),
            prior_output: None,
            screenshots: Vec::new(),
            model: None,
            reasoning: None,
            resume_session_id: None,
            override_prompt: None,
        }
    }
}
