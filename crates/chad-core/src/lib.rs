//! chad-core: Core library for the chad coding-agent orchestrator
//!
//! Provides the pieces the session engine is built from:
//!
//! - [`events`] - Append-only, sequence-numbered event log with artifact sidecars
//! - [`quota`] - Tail-only quota/limit detection over agent output
//! - [`handoff`] - Cross-provider handoff summaries and checkpoints
//! - [`agents`] - Agent command construction and output normalization
//!
//! The PTY service, session loop, and managers live in `chad-daemon`.

pub mod agents;
pub mod events;
pub mod handoff;
pub mod logging;
pub mod quota;

// Re-export newtypes and shared domain enums from chad-protocol
pub use chad_protocol::{
    ArtifactRef, Event, EventPayload, LimitKind, MessageBlock, Milestone, MilestoneType, Phase,
    ProviderKind, SessionId, StreamFrame, StreamId, TaskId, TaskState,
};

pub use agents::{AgentError, AgentEvent, AgentInvocation, CommandSpec};
pub use events::{EventLog, EventLogError};
pub use logging::init_logging;
