//! PTY stream service: spawning agent children under pseudo-terminals,
//! fanning their output out to subscribers, and terminating whole process
//! trees.

pub mod manager;
pub mod output;

pub use manager::{PtyStream, PtyStreamService};
pub use output::{LineBuffer, PtyExitEvent};
