#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Provider binary '{binary}' not found. Install it with: {hint}")]
    BinaryMissing { binary: String, hint: String },
}
