//! # chad-protocol
//!
//! Shared domain types for the chad session execution engine.
//!
//! Pure data: newtyped identifiers, the tagged event model persisted by the
//! event log, milestone records, and the frame model the multiplexer emits
//! to streaming consumers. No I/O lives here.

pub mod events;
pub mod frames;
pub mod types;

pub use events::{
    ArtifactRef, BlockKind, Event, EventPayload, MessageBlock, Milestone, milestone_title,
};
pub use frames::StreamFrame;
pub use types::{
    LimitKind, MilestoneType, Phase, ProviderKind, SessionId, StreamId, TaskId, TaskState,
};
