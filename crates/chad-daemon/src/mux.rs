//! Unified session stream: event-log events and raw PTY bytes merged into
//! one ordered frame sequence.
//!
//! The multiplexer holds no strong engine state of its own; it looks the
//! session's pieces up by id, replays persisted events past `since_seq`,
//! then tails the log and the live PTY. All frames of one stream share a
//! session-local monotonic sequence. When the consumer drops its receiver
//! the producer notices on the next send and unsubscribes; unread frames
//! are lost for that consumer but the events stay persisted.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use chad_core::events::EventLog;
use chad_protocol::{SessionId, StreamFrame, StreamId};

use crate::pty::PtyStreamService;
use crate::session::TaskHandle;

/// Default keepalive interval for otherwise-idle streams.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Options for one stream subscription.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Replay persisted events strictly after this sequence.
    pub since_seq: u64,
    pub include_terminal: bool,
    pub include_events: bool,
    pub keepalive: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            since_seq: 0,
            include_terminal: true,
            include_events: true,
            keepalive: KEEPALIVE_INTERVAL,
        }
    }
}

pub struct EventMultiplexer {
    session_id: SessionId,
    event_log: Arc<Mutex<EventLog>>,
    pty: Arc<PtyStreamService>,
    /// Task whose terminal state closes the stream with a `complete`
    /// frame. Streams without a task run until the consumer disconnects.
    task: Option<Arc<TaskHandle>>,
}

impl EventMultiplexer {
    pub fn new(
        session_id: SessionId,
        event_log: Arc<Mutex<EventLog>>,
        pty: Arc<PtyStreamService>,
        task: Option<Arc<TaskHandle>>,
    ) -> Self {
        Self {
            session_id,
            event_log,
            pty,
            task,
        }
    }

    /// Open a frame stream. Must be called within a tokio runtime.
    pub fn stream(&self, options: StreamOptions) -> mpsc::Receiver<StreamFrame> {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let session_id = self.session_id.clone();
        let event_log = self.event_log.clone();
        let pty = self.pty.clone();
        let task = self.task.clone();

        tokio::spawn(async move {
            run_stream(session_id, event_log, pty, task, options, tx).await;
        });

        rx
    }
}

async fn run_stream(
    session_id: SessionId,
    event_log: Arc<Mutex<EventLog>>,
    pty: Arc<PtyStreamService>,
    task: Option<Arc<TaskHandle>>,
    options: StreamOptions,
    tx: mpsc::Sender<StreamFrame>,
) {
    let mut frame_seq = 0u64;
    let mut last_event_seq = options.since_seq;
    let mut last_frame = Instant::now();
    let mut pty_rx: Option<broadcast::Receiver<Vec<u8>>> = None;
    let mut current_stream: Option<StreamId> = None;

    loop {
        // Follow the session's then-current PTY stream; it changes across
        // phases.
        if options.include_terminal {
            let active = pty.get_by_session(session_id.as_ref());
            match active {
                Some(stream) => {
                    let stream_id = stream.stream_id().clone();
                    if current_stream.as_ref() != Some(&stream_id) {
                        pty_rx = Some(stream.subscribe());
                        current_stream = Some(stream_id);
                    }
                }
                None => {
                    if pty_rx.is_none() {
                        current_stream = None;
                    }
                }
            }
        }

        // Structured events: replay then tail
        if options.include_events {
            let events = {
                let log = event_log.lock().expect("event log poisoned");
                log.read_events(last_event_seq, None)
            };
            match events {
                Ok(events) => {
                    for event in events {
                        last_event_seq = event.seq;
                        frame_seq += 1;
                        let frame = StreamFrame::Event {
                            seq: frame_seq,
                            event,
                        };
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                        last_frame = Instant::now();
                    }
                }
                Err(e) => {
                    frame_seq += 1;
                    let _ = tx
                        .send(StreamFrame::Error {
                            seq: frame_seq,
                            message: e.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }

        // Raw terminal bytes
        if let Some(rx) = pty_rx.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(chunk) => {
                        frame_seq += 1;
                        let frame = StreamFrame::Terminal {
                            seq: frame_seq,
                            data: BASE64.encode(&chunk),
                        };
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                        last_frame = Instant::now();
                    }
                    Err(broadcast::error::TryRecvError::Empty) => break,
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        debug!(
                            event = "daemon.mux.subscriber_lagged",
                            session_id = %session_id,
                            skipped = skipped,
                        );
                    }
                    Err(broadcast::error::TryRecvError::Closed) => {
                        pty_rx = None;
                        break;
                    }
                }
            }
        }

        // Terminal task state closes the stream after a final drain
        if let Some(task) = &task {
            if task.state().is_terminal() {
                if options.include_events {
                    let events = {
                        let log = event_log.lock().expect("event log poisoned");
                        log.read_events(last_event_seq, None).unwrap_or_default()
                    };
                    for event in events {
                        last_event_seq = event.seq;
                        frame_seq += 1;
                        if tx
                            .send(StreamFrame::Event {
                                seq: frame_seq,
                                event,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }

                let exit_code = task.with_data(|d| {
                    d.result
                        .as_ref()
                        .and_then(|r| r.get("exit_code"))
                        .and_then(|c| c.as_i64())
                        .unwrap_or(0) as i32
                });
                frame_seq += 1;
                let _ = tx
                    .send(StreamFrame::Complete {
                        seq: frame_seq,
                        exit_code,
                    })
                    .await;
                return;
            }
        }

        // Keepalive on idle
        if last_frame.elapsed() >= options.keepalive {
            frame_seq += 1;
            if tx.send(StreamFrame::Ping { seq: frame_seq }).await.is_err() {
                return;
            }
            last_frame = Instant::now();
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chad_protocol::{EventPayload, TaskId, TaskState};
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> Arc<Mutex<EventLog>> {
        Arc::new(Mutex::new(
            EventLog::open(SessionId::new("s1"), Some(dir.path().to_path_buf())).unwrap(),
        ))
    }

    fn user_message(content: &str) -> EventPayload {
        EventPayload::UserMessage {
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_replay_then_tail_then_complete() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        {
            let mut log = log.lock().unwrap();
            log.append(user_message("one")).unwrap();
            log.append(user_message("two")).unwrap();
        }

        let (pty, _exit_rx) = PtyStreamService::new();
        let task = Arc::new(TaskHandle::new(TaskId::new("t1"), SessionId::new("s1")));
        task.mark_running();

        let mux = EventMultiplexer::new(
            SessionId::new("s1"),
            log.clone(),
            Arc::new(pty),
            Some(task.clone()),
        );
        let mut rx = mux.stream(StreamOptions::default());

        // Replayed events arrive in order with monotonic frame seq
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq(), 1);
        assert_eq!(second.seq(), 2);
        let StreamFrame::Event { event, .. } = &first else {
            panic!("expected event frame");
        };
        assert_eq!(event.seq, 1);

        // Tail a newly appended event
        log.lock().unwrap().append(user_message("three")).unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(third.seq(), 3);

        // Terminal task state produces a complete frame
        task.finish(
            TaskState::Completed,
            Some(serde_json::json!({"exit_code": 0})),
        );
        let last = rx.recv().await.unwrap();
        assert!(matches!(last, StreamFrame::Complete { exit_code: 0, .. }));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_since_seq_skips_replayed_events() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        {
            let mut log = log.lock().unwrap();
            for i in 0..5 {
                log.append(user_message(&format!("msg {i}"))).unwrap();
            }
        }

        let (pty, _exit_rx) = PtyStreamService::new();
        let task = Arc::new(TaskHandle::new(TaskId::new("t1"), SessionId::new("s1")));
        task.finish(TaskState::Completed, Some(serde_json::json!({"exit_code": 0})));

        let mux = EventMultiplexer::new(SessionId::new("s1"), log, Arc::new(pty), Some(task));
        let mut rx = mux.stream(StreamOptions {
            since_seq: 3,
            ..Default::default()
        });

        let mut event_seqs = Vec::new();
        while let Some(frame) = rx.recv().await {
            if let StreamFrame::Event { event, .. } = frame {
                event_seqs.push(event.seq);
            }
        }
        assert_eq!(event_seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_include_events_false_suppresses_events() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        log.lock().unwrap().append(user_message("hidden")).unwrap();

        let (pty, _exit_rx) = PtyStreamService::new();
        let task = Arc::new(TaskHandle::new(TaskId::new("t1"), SessionId::new("s1")));
        task.finish(TaskState::Completed, Some(serde_json::json!({"exit_code": 7})));

        let mux = EventMultiplexer::new(SessionId::new("s1"), log, Arc::new(pty), Some(task));
        let mut rx = mux.stream(StreamOptions {
            include_events: false,
            ..Default::default()
        });

        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, StreamFrame::Complete { exit_code: 7, .. }));
    }

    #[tokio::test]
    async fn test_terminal_frames_carry_base64_pty_bytes() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let (pty, _exit_rx) = PtyStreamService::new();
        let pty = Arc::new(pty);

        let workdir = TempDir::new().unwrap();
        let invocation = chad_core::AgentInvocation {
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                "sleep 0.3; echo mux-bytes; sleep 0.3".to_string(),
            ],
            env: vec![],
            initial_stdin: None,
        };
        let stream_id = pty.start("s1", &invocation, workdir.path(), 24, 80).unwrap();

        let mux = EventMultiplexer::new(SessionId::new("s1"), log, pty.clone(), None);
        let mut rx = mux.stream(StreamOptions::default());

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(StreamFrame::Terminal { data, .. })) => {
                    collected.extend(BASE64.decode(data).unwrap());
                    if String::from_utf8_lossy(&collected).contains("mux-bytes") {
                        break;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {}
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("mux-bytes"));

        let _ = pty.wait(&stream_id);
    }

    #[tokio::test]
    async fn test_ping_on_idle_stream() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let (pty, _exit_rx) = PtyStreamService::new();

        let mux = EventMultiplexer::new(SessionId::new("s1"), log, Arc::new(pty), None);
        let mut rx = mux.stream(StreamOptions {
            keepalive: Duration::from_millis(100),
            ..Default::default()
        });

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("keepalive within deadline")
            .unwrap();
        assert!(matches!(frame, StreamFrame::Ping { .. }));
    }

    #[tokio::test]
    async fn test_consumer_drop_stops_producer() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let (pty, _exit_rx) = PtyStreamService::new();

        let mux = EventMultiplexer::new(SessionId::new("s1"), log.clone(), Arc::new(pty), None);
        let rx = mux.stream(StreamOptions::default());
        drop(rx);

        // Appends after disconnect stay persisted for the next subscriber
        tokio::time::sleep(Duration::from_millis(300)).await;
        log.lock().unwrap().append(user_message("kept")).unwrap();
        let events = log.lock().unwrap().read_events(0, None).unwrap();
        assert_eq!(events.len(), 1);
    }
}
