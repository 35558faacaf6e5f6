//! Frames emitted by the event multiplexer to streaming consumers.
//!
//! All frames for a session share one monotonic `seq`, distinct from both
//! the event-log seq and the milestone seq. The HTTP collaborator forwards
//! `to_sse()` output verbatim on the SSE endpoint and the JSON value on the
//! WebSocket endpoint.

use serde::{Deserialize, Serialize};

use crate::events::Event;

/// A single frame in the unified session stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamFrame {
    /// Raw PTY output, base64-encoded.
    Terminal { seq: u64, data: String },
    /// A structured event from the event log.
    Event { seq: u64, event: Event },
    /// Keepalive emitted after 15 s of idle stream.
    Ping { seq: u64 },
    /// The task reached a terminal state; no further frames follow.
    Complete { seq: u64, exit_code: i32 },
    /// Transport or engine failure; no further frames follow.
    Error { seq: u64, message: String },
}

impl StreamFrame {
    pub fn seq(&self) -> u64 {
        match self {
            StreamFrame::Terminal { seq, .. }
            | StreamFrame::Event { seq, .. }
            | StreamFrame::Ping { seq }
            | StreamFrame::Complete { seq, .. }
            | StreamFrame::Error { seq, .. } => *seq,
        }
    }

    /// The SSE event name for this frame.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamFrame::Terminal { .. } => "terminal",
            StreamFrame::Event { .. } => "event",
            StreamFrame::Ping { .. } => "ping",
            StreamFrame::Complete { .. } => "complete",
            StreamFrame::Error { .. } => "error",
        }
    }

    /// Format this frame as a Server-Sent Events block.
    ///
    /// `event: <name>\ndata: <json>\n\n`; the JSON payload is the full
    /// frame object so SSE and WebSocket consumers see identical data.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.event_name(), data)
    }
}
