#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Task {0} not found")]
    TaskNotFound(String),

    #[error("Session {0} already has an active task")]
    SessionAlreadyActive(String),

    #[error("Stream {0} not found")]
    StreamNotFound(String),

    #[error("No active PTY session")]
    NoActivePty,

    #[error("Invalid request: {message}")]
    Validation { message: String },

    #[error("PTY error: {0}")]
    PtyError(String),

    #[error("Git error: {source}")]
    Git {
        #[from]
        source: chad_git::GitError,
    },

    #[error("Event log error: {source}")]
    EventLog {
        #[from]
        source: chad_core::EventLogError,
    },

    #[error("Agent error: {source}")]
    Agent {
        #[from]
        source: chad_core::AgentError,
    },

    #[error("Config error: {source}")]
    Config {
        #[from]
        source: chad_config::ConfigError,
    },

    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

impl DaemonError {
    /// Stable error code for the protocol surface. The HTTP collaborator
    /// maps these onto status codes (validation/state → 400/404,
    /// external-tool → 500).
    pub fn error_code(&self) -> &'static str {
        match self {
            DaemonError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            DaemonError::TaskNotFound(_) => "TASK_NOT_FOUND",
            DaemonError::SessionAlreadyActive(_) => "SESSION_ALREADY_ACTIVE",
            DaemonError::StreamNotFound(_) => "STREAM_NOT_FOUND",
            DaemonError::NoActivePty => "NO_ACTIVE_PTY",
            DaemonError::Validation { .. } => "VALIDATION",
            DaemonError::PtyError(_) => "PTY_ERROR",
            DaemonError::Git { .. } => "GIT_ERROR",
            DaemonError::EventLog { .. } => "EVENT_LOG_ERROR",
            DaemonError::Agent { .. } => "AGENT_ERROR",
            DaemonError::Config { .. } => "CONFIG_ERROR",
            DaemonError::IoError { .. } => "IO_ERROR",
        }
    }
}
