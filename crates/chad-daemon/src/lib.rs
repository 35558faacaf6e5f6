//! chad-daemon: the session execution engine.
//!
//! Owns the moving parts of a running task:
//!
//! - [`pty`] - PTY streams: spawn, read fan-out, input, resize, terminate
//! - [`session`] - session registry and task state
//! - [`event_loop`] - the coding → continuation → verification → revision
//!   state machine with milestone detection and usage thresholds
//! - [`executor`] - request validation, worktree allocation, phase runner
//! - [`mux`] - the unified event/terminal frame stream
//! - [`protocol`] - the typed surface the HTTP layer binds to

pub mod errors;
pub mod event_loop;
pub mod executor;
pub mod mux;
pub mod protocol;
pub mod pty;
pub mod session;

pub use errors::DaemonError;
pub use event_loop::{
    EXIT_CANCELLED, EXIT_EXPLORATION_LOOP, EXIT_STALLED, LoopConfig, LoopHooks, LoopResult,
    PendingAction, PhaseRequest, PhaseRunner, SessionEventLoop, VerificationSpec,
};
pub use executor::{NoUsageProbe, TaskEntry, TaskExecutor, TaskRequest, UsageProbe};
pub use mux::{EventMultiplexer, StreamOptions};
pub use protocol::{Engine, EngineRequest, EngineResponse, TaskSpec};
pub use pty::{PtyStream, PtyStreamService};
pub use session::{SessionHandle, SessionInfo, SessionManager, TaskHandle, TaskStatus};
