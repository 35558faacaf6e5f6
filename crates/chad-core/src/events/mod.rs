//! Structured event logging for session history and handovers.
//!
//! Events are stored as JSONL, one object per line, at
//! `<logdir>/<session_id>.jsonl`. Tool output above the inline threshold is
//! stored separately under `<logdir>/artifacts/<session_id>/`.

mod log;

pub use log::{ARTIFACT_SIZE_THRESHOLD, EventLog, MAX_ARTIFACT_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("Failed to serialize event: {message}")]
    SerializeFailed { message: String },

    #[error("IO error in event log: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}
