use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, error};

use chad_protocol::StreamId;

/// Notification that a PTY reader has exited (child ended or read error).
#[derive(Debug, Clone)]
pub struct PtyExitEvent {
    pub stream_id: StreamId,
    pub session_id: String,
}

/// Spawn a dedicated reader thread that pumps PTY output into the
/// broadcast channel.
///
/// Every chunk stamps the shared idle clock before fan-out. The thread
/// exits on EOF (child exited) or read error, clears `active`, and sends
/// an exit notification.
pub fn spawn_pty_reader(
    stream_id: StreamId,
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    output_tx: broadcast::Sender<Vec<u8>>,
    last_output: Arc<Mutex<Instant>>,
    active: Arc<AtomicBool>,
    exit_tx: std::sync::mpsc::Sender<PtyExitEvent>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!(event = "daemon.pty.reader_eof", stream_id = %stream_id);
                    break;
                }
                Ok(n) => {
                    if let Ok(mut last) = last_output.lock() {
                        *last = Instant::now();
                    }
                    // Ignore send errors; no subscribers is fine
                    let _ = output_tx.send(buf[..n].to_vec());
                }
                Err(e) => {
                    error!(
                        event = "daemon.pty.reader_error",
                        stream_id = %stream_id,
                        error = %e,
                    );
                    break;
                }
            }
        }
        active.store(false, Ordering::SeqCst);
        let _ = exit_tx.send(PtyExitEvent {
            stream_id,
            session_id,
        });
    })
}

/// Assembles complete lines from arbitrarily-split byte chunks.
///
/// Pipe transports deliver bytes in arbitrary splits; line-oriented
/// consumers (the JSON stream parsers) need the partial final line held
/// back until its newline arrives. `finish()` flushes whatever remains.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a decoded chunk; returns the complete lines it closed out.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// Flush the held partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_basic() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.feed("hello\nworld\n"), vec!["hello", "world"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_buffer_holds_partial_line() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.feed("{\"type\":"), Vec::<String>::new());
        assert_eq!(buf.feed("\"result\"}\nnext"), vec!["{\"type\":\"result\"}"]);
        assert_eq!(buf.finish(), Some("next".to_string()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_buffer_strips_crlf() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.feed("line one\r\nline two\r\n"), vec!["line one", "line two"]);
    }

    #[test]
    fn test_line_buffer_finish_empty() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_line_buffer_many_small_chunks() {
        let mut buf = LineBuffer::new();
        let mut lines = Vec::new();
        for chunk in ["a", "b", "c", "\n", "d", "e", "\nf"] {
            lines.extend(buf.feed(chunk));
        }
        assert_eq!(lines, vec!["abc", "de"]);
        assert_eq!(buf.finish(), Some("f".to_string()));
    }
}
