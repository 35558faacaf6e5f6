use std::path::{Path, PathBuf};

use chad_protocol::ProviderKind;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("home directory not found — set $HOME environment variable")]
    HomeNotFound,
}

/// Centralized path construction for the `~/.chad/` directory layout and
/// the per-project worktree layout.
///
/// Single source of truth for every path the orchestrator touches on disk.
/// Use `resolve()` in production code and `from_dir()` in tests.
#[derive(Debug, Clone)]
pub struct ChadPaths {
    chad_dir: PathBuf,
    home_dir: PathBuf,
}

/// Directory under the project root holding per-session worktrees.
pub const WORKTREE_DIR: &str = ".chad-worktrees";

/// Prefix of per-session task branches.
pub const TASK_BRANCH_PREFIX: &str = "chad-task-";

/// Environment variable overriding the event-log root directory.
pub const LOG_DIR_ENV: &str = "CHAD_LOG_DIR";

/// Environment variable overriding the provider-binary cache directory.
pub const BIN_DIR_ENV: &str = "CHAD_BIN_DIR";

impl ChadPaths {
    /// Resolve paths from the user's home directory (`~/.chad`).
    pub fn resolve() -> Result<Self, PathError> {
        let home = dirs::home_dir().ok_or(PathError::HomeNotFound)?;
        Ok(Self {
            chad_dir: home.join(".chad"),
            home_dir: home,
        })
    }

    /// Create paths from an explicit base directory. Use in tests.
    ///
    /// The home directory is taken to be the parent of `chad_dir` so that
    /// shared (non-isolated) credential dirs resolve under it.
    pub fn from_dir(chad_dir: PathBuf) -> Self {
        let home_dir = chad_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| chad_dir.clone());
        Self { chad_dir, home_dir }
    }

    /// The base `~/.chad` directory.
    pub fn chad_dir(&self) -> &Path {
        &self.chad_dir
    }

    // --- Event log layout ---

    /// Event-log root: `$CHAD_LOG_DIR` if set, else `~/.chad/logs`.
    pub fn log_dir(&self) -> PathBuf {
        match std::env::var_os(LOG_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => self.chad_dir.join("logs"),
        }
    }

    /// Event log file for a session: `<logdir>/<session_id>.jsonl`.
    pub fn session_log_file(&self, session_id: &str) -> PathBuf {
        self.log_dir().join(format!("{session_id}.jsonl"))
    }

    /// Artifact sidecar directory for a session:
    /// `<logdir>/artifacts/<session_id>`.
    pub fn artifacts_dir(&self, session_id: &str) -> PathBuf {
        self.log_dir().join("artifacts").join(session_id)
    }

    // --- Provider binary cache ---

    /// Cache directory for installed provider binaries:
    /// `$CHAD_BIN_DIR` if set, else `~/.chad/bin`.
    pub fn provider_bin_dir(&self) -> PathBuf {
        match std::env::var_os(BIN_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => self.chad_dir.join("bin"),
        }
    }

    // --- Per-account credential isolation ---

    /// Credential root for an account of the given provider kind.
    ///
    /// Anthropic, openai, opencode, and kimi accounts get isolated
    /// directories keyed by account name so multiple accounts of the same
    /// provider do not collide. Gemini, qwen, and mistral CLIs only support
    /// a single shared credential directory under the user's home.
    pub fn credential_dir(&self, kind: ProviderKind, account: &str) -> PathBuf {
        match kind {
            ProviderKind::Anthropic => self.chad_dir.join("claude-configs").join(account),
            ProviderKind::Openai => self.chad_dir.join("codex-homes").join(account),
            ProviderKind::Opencode => self.chad_dir.join("opencode-data").join(account),
            ProviderKind::Kimi => self.chad_dir.join("kimi-homes").join(account),
            ProviderKind::Gemini => self.home_dir.join(".gemini"),
            ProviderKind::Qwen => self.home_dir.join(".qwen"),
            ProviderKind::Mistral => self.home_dir.join(".vibe"),
            ProviderKind::Mock => self.chad_dir.join("mock").join(account),
        }
    }

    /// Whether accounts of this kind are isolated from one another.
    pub fn is_isolated(kind: ProviderKind) -> bool {
        matches!(
            kind,
            ProviderKind::Anthropic
                | ProviderKind::Openai
                | ProviderKind::Opencode
                | ProviderKind::Kimi
                | ProviderKind::Mock
        )
    }

    // --- Config files ---

    pub fn user_config(&self) -> PathBuf {
        self.chad_dir.join("config.toml")
    }

    // --- Static helpers (no self) ---

    /// Per-session worktree path: `<project>/.chad-worktrees/<session_id>`.
    pub fn worktree_path(project_path: &Path, session_id: &str) -> PathBuf {
        project_path.join(WORKTREE_DIR).join(session_id)
    }

    /// Per-session task branch name: `chad-task-<session_id>`.
    pub fn task_branch(session_id: &str) -> String {
        format!("{TASK_BRANCH_PREFIX}{session_id}")
    }
}
