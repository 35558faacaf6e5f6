use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use chad_core::AgentInvocation;
use chad_protocol::StreamId;

use super::output::{PtyExitEvent, spawn_pty_reader};
use crate::errors::DaemonError;

/// Grace period between SIGTERM and SIGKILL on terminate.
const TERMINATE_GRACE: Duration = Duration::from_millis(200);

/// Broadcast capacity per stream. Sized so one slow subscriber lags
/// (dropping its oldest chunks) instead of back-pressuring the reader.
const BROADCAST_CAPACITY: usize = 256;

/// Handle to a live PTY stream.
pub struct PtyStream {
    stream_id: StreamId,
    session_id: String,
    /// Master end of the PTY. Used for resize.
    master: Mutex<Box<dyn MasterPty + Send>>,
    /// Child process handle. Used for wait.
    child: Mutex<Box<dyn Child + Send + Sync>>,
    /// Separate killer so terminate never contends with a blocking wait.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Writer to PTY stdin. Wrapped in Option because close_stdin drops it.
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    last_output: Arc<Mutex<Instant>>,
    active: Arc<AtomicBool>,
    child_pid: Option<u32>,
}

impl PtyStream {
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Subscribers receive every chunk read after their subscription point.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output_tx.subscribe()
    }

    /// Time since the last byte arrived from the child.
    pub fn idle_since(&self) -> Duration {
        self.last_output
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    fn write_stdin(&self, data: &[u8], close_stdin: bool) -> Result<(), DaemonError> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|e| DaemonError::PtyError(format!("lock writer: {}", e)))?;
        let writer = guard
            .as_mut()
            .ok_or_else(|| DaemonError::PtyError("stdin already closed".to_string()))?;
        writer
            .write_all(data)
            .map_err(|e| DaemonError::PtyError(format!("write stdin: {}", e)))?;
        writer
            .flush()
            .map_err(|e| DaemonError::PtyError(format!("flush stdin: {}", e)))?;
        if close_stdin {
            *guard = None;
        }
        Ok(())
    }

    fn resize(&self, rows: u16, cols: u16) -> Result<(), DaemonError> {
        let master = self
            .master
            .lock()
            .map_err(|e| DaemonError::PtyError(format!("lock master: {}", e)))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| DaemonError::PtyError(format!("resize: {}", e)))?;
        debug!(
            event = "daemon.pty.resize_completed",
            stream_id = %self.stream_id,
            rows = rows,
            cols = cols,
        );
        Ok(())
    }

    /// Wait for the child to exit. Blocks the calling thread.
    fn wait(&self) -> Result<i32, DaemonError> {
        let mut child = self
            .child
            .lock()
            .map_err(|e| DaemonError::PtyError(format!("lock child: {}", e)))?;
        let status = child
            .wait()
            .map_err(|e| DaemonError::PtyError(format!("wait: {}", e)))?;
        Ok(status.exit_code() as i32)
    }

    /// Terminate the child's whole process tree.
    ///
    /// Unix: SIGTERM to the process group, a short grace, then SIGKILL if
    /// output is still flowing. Elsewhere the portable-pty killer is used.
    fn terminate(&self) -> Result<(), DaemonError> {
        info!(
            event = "daemon.pty.terminate_started",
            stream_id = %self.stream_id,
            pid = ?self.child_pid,
        );

        #[cfg(unix)]
        if let Some(pid) = self.child_pid {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(pid as i32);
            if killpg(pgid, Signal::SIGTERM).is_ok() {
                std::thread::sleep(TERMINATE_GRACE);
                if self.is_active() {
                    let _ = killpg(pgid, Signal::SIGKILL);
                }
                return Ok(());
            }
        }

        let mut killer = self
            .killer
            .lock()
            .map_err(|e| DaemonError::PtyError(format!("lock killer: {}", e)))?;
        killer
            .kill()
            .map_err(|e| DaemonError::PtyError(format!("kill: {}", e)))?;
        Ok(())
    }
}

/// Process-global service owning all live PTY streams.
///
/// Sessions never share streams; a stream has at most one writer (the
/// session event loop) and any number of subscribers.
pub struct PtyStreamService {
    streams: Mutex<HashMap<StreamId, Arc<PtyStream>>>,
    exit_tx: std::sync::mpsc::Sender<PtyExitEvent>,
}

impl PtyStreamService {
    /// Create the service plus the receiver for PTY exit notifications.
    pub fn new() -> (Self, std::sync::mpsc::Receiver<PtyExitEvent>) {
        let (exit_tx, exit_rx) = std::sync::mpsc::channel();
        (
            Self {
                streams: Mutex::new(HashMap::new()),
                exit_tx,
            },
            exit_rx,
        )
    }

    /// Spawn a child under a fresh PTY and start its reader.
    ///
    /// The child is placed in its own process group (the PTY session), the
    /// slave end is closed in the parent, and `initial_stdin`; when
    /// present; is written before control returns.
    pub fn start(
        &self,
        session_id: &str,
        invocation: &AgentInvocation,
        cwd: &Path,
        rows: u16,
        cols: u16,
    ) -> Result<StreamId, DaemonError> {
        if invocation.argv.is_empty() {
            return Err(DaemonError::PtyError("empty argv".to_string()));
        }

        let stream_id = StreamId::new(format!("pty-{}", uuid::Uuid::new_v4()));

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| DaemonError::PtyError(format!("openpty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&invocation.argv[0]);
        cmd.args(&invocation.argv[1..]);
        cmd.cwd(cwd);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        info!(
            event = "daemon.pty.start_started",
            session_id = session_id,
            stream_id = %stream_id,
            command = %invocation.argv[0],
            rows = rows,
            cols = cols,
        );

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DaemonError::PtyError(format!("spawn: {}", e)))?;
        // Close the slave end in the parent so reader EOF tracks the child
        drop(pair.slave);

        let child_pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| DaemonError::PtyError(format!("clone reader: {}", e)))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| DaemonError::PtyError(format!("take writer: {}", e)))?;

        if let Some(initial) = &invocation.initial_stdin {
            writer
                .write_all(initial.as_bytes())
                .map_err(|e| DaemonError::PtyError(format!("initial stdin: {}", e)))?;
            writer
                .flush()
                .map_err(|e| DaemonError::PtyError(format!("flush initial stdin: {}", e)))?;
        }

        let (output_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let last_output = Arc::new(Mutex::new(Instant::now()));
        let active = Arc::new(AtomicBool::new(true));

        spawn_pty_reader(
            stream_id.clone(),
            session_id.to_string(),
            reader,
            output_tx.clone(),
            last_output.clone(),
            active.clone(),
            self.exit_tx.clone(),
        );

        let stream = Arc::new(PtyStream {
            stream_id: stream_id.clone(),
            session_id: session_id.to_string(),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            killer: Mutex::new(killer),
            writer: Mutex::new(Some(writer)),
            output_tx,
            last_output,
            active,
            child_pid,
        });

        self.streams
            .lock()
            .map_err(|e| DaemonError::PtyError(format!("lock streams: {}", e)))?
            .insert(stream_id.clone(), stream);

        info!(
            event = "daemon.pty.start_completed",
            session_id = session_id,
            stream_id = %stream_id,
            pid = ?child_pid,
        );

        Ok(stream_id)
    }

    pub fn get(&self, stream_id: &StreamId) -> Option<Arc<PtyStream>> {
        self.streams.lock().ok()?.get(stream_id).cloned()
    }

    fn get_or_err(&self, stream_id: &StreamId) -> Result<Arc<PtyStream>, DaemonError> {
        self.get(stream_id)
            .ok_or_else(|| DaemonError::StreamNotFound(stream_id.to_string()))
    }

    /// The active stream for a session, if any.
    pub fn get_by_session(&self, session_id: &str) -> Option<Arc<PtyStream>> {
        self.streams
            .lock()
            .ok()?
            .values()
            .find(|s| s.session_id() == session_id && s.is_active())
            .cloned()
    }

    pub fn subscribe(
        &self,
        stream_id: &StreamId,
    ) -> Result<broadcast::Receiver<Vec<u8>>, DaemonError> {
        Ok(self.get_or_err(stream_id)?.subscribe())
    }

    pub fn send_input(
        &self,
        stream_id: &StreamId,
        data: &[u8],
        close_stdin: bool,
    ) -> Result<(), DaemonError> {
        self.get_or_err(stream_id)?.write_stdin(data, close_stdin)
    }

    pub fn resize(&self, stream_id: &StreamId, rows: u16, cols: u16) -> Result<(), DaemonError> {
        self.get_or_err(stream_id)?.resize(rows, cols)
    }

    pub fn terminate(&self, stream_id: &StreamId) -> Result<(), DaemonError> {
        self.get_or_err(stream_id)?.terminate()
    }

    /// Block until the child exits and return its exit code.
    pub fn wait(&self, stream_id: &StreamId) -> Result<i32, DaemonError> {
        self.get_or_err(stream_id)?.wait()
    }

    pub fn idle_since(&self, stream_id: &StreamId) -> Result<Duration, DaemonError> {
        Ok(self.get_or_err(stream_id)?.idle_since())
    }

    pub fn is_active(&self, stream_id: &StreamId) -> bool {
        self.get(stream_id).is_some_and(|s| s.is_active())
    }

    /// Drop a finished stream's handle.
    pub fn remove(&self, stream_id: &StreamId) {
        if let Ok(mut streams) = self.streams.lock() {
            if streams.remove(stream_id).is_some() {
                debug!(event = "daemon.pty.remove_completed", stream_id = %stream_id);
            }
        }
    }

    /// Terminate and drop every stream of a session.
    pub fn cleanup_session(&self, session_id: &str) {
        let streams: Vec<Arc<PtyStream>> = match self.streams.lock() {
            Ok(map) => map
                .values()
                .filter(|s| s.session_id() == session_id)
                .cloned()
                .collect(),
            Err(_) => return,
        };

        for stream in streams {
            if stream.is_active() {
                if let Err(e) = stream.terminate() {
                    warn!(
                        event = "daemon.pty.cleanup_terminate_failed",
                        stream_id = %stream.stream_id(),
                        error = %e,
                    );
                }
            }
            self.remove(&stream.stream_id().clone());
        }
    }

    pub fn count(&self) -> usize {
        self.streams.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> AgentInvocation {
        AgentInvocation {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            initial_stdin: None,
        }
    }

    fn collect_output(mut rx: broadcast::Receiver<Vec<u8>>) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Ok(chunk) = rx.blocking_recv() {
            bytes.extend_from_slice(&chunk);
        }
        bytes
    }

    #[test]
    fn test_start_stream_and_collect_output() {
        let (service, _exit_rx) = PtyStreamService::new();
        let dir = tempfile::TempDir::new().unwrap();

        let stream_id = service
            .start("s1", &shell("echo hello-from-child"), dir.path(), 24, 80)
            .unwrap();

        let rx = service.subscribe(&stream_id).unwrap();
        let code = service.wait(&stream_id).unwrap();
        assert_eq!(code, 0);

        let output = collect_output(rx);
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("hello-from-child"));
    }

    #[test]
    fn test_exit_code_propagates() {
        let (service, _exit_rx) = PtyStreamService::new();
        let dir = tempfile::TempDir::new().unwrap();

        let stream_id = service
            .start("s1", &shell("exit 3"), dir.path(), 24, 80)
            .unwrap();
        assert_eq!(service.wait(&stream_id).unwrap(), 3);
    }

    #[test]
    fn test_exit_notification_sent() {
        let (service, exit_rx) = PtyStreamService::new();
        let dir = tempfile::TempDir::new().unwrap();

        let stream_id = service
            .start("s1", &shell("true"), dir.path(), 24, 80)
            .unwrap();
        service.wait(&stream_id).unwrap();

        let event = exit_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("exit notification");
        assert_eq!(event.stream_id, stream_id);
        assert_eq!(event.session_id, "s1");
    }

    #[test]
    fn test_send_input_reaches_child() {
        let (service, _exit_rx) = PtyStreamService::new();
        let dir = tempfile::TempDir::new().unwrap();

        // head -n1 exits after one full line arrives
        let stream_id = service
            .start("s1", &shell("head -n1"), dir.path(), 24, 80)
            .unwrap();
        let rx = service.subscribe(&stream_id).unwrap();

        service
            .send_input(&stream_id, b"ping-pong\n", false)
            .unwrap();
        assert_eq!(service.wait(&stream_id).unwrap(), 0);

        let output = collect_output(rx);
        assert!(String::from_utf8_lossy(&output).contains("ping-pong"));
    }

    #[test]
    fn test_terminate_kills_long_running_child() {
        let (service, _exit_rx) = PtyStreamService::new();
        let dir = tempfile::TempDir::new().unwrap();

        let stream_id = service
            .start("s1", &shell("sleep 30"), dir.path(), 24, 80)
            .unwrap();
        assert!(service.is_active(&stream_id));

        let started = Instant::now();
        service.terminate(&stream_id).unwrap();
        let code = service.wait(&stream_id).unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_ne!(code, 0);
    }

    #[test]
    fn test_multiple_subscribers_see_same_bytes() {
        let (service, _exit_rx) = PtyStreamService::new();
        let dir = tempfile::TempDir::new().unwrap();

        let stream_id = service
            .start("s1", &shell("sleep 0.2; echo shared"), dir.path(), 24, 80)
            .unwrap();
        let rx1 = service.subscribe(&stream_id).unwrap();
        let rx2 = service.subscribe(&stream_id).unwrap();

        service.wait(&stream_id).unwrap();

        let a = collect_output(rx1);
        let b = collect_output(rx2);
        assert_eq!(a, b);
        assert!(String::from_utf8_lossy(&a).contains("shared"));
    }

    #[test]
    fn test_initial_stdin_written() {
        let (service, _exit_rx) = PtyStreamService::new();
        let dir = tempfile::TempDir::new().unwrap();

        let invocation = AgentInvocation {
            argv: vec!["head".to_string(), "-n1".to_string()],
            env: vec![],
            initial_stdin: Some("from-initial-stdin\n".to_string()),
        };
        let stream_id = service.start("s1", &invocation, dir.path(), 24, 80).unwrap();
        let rx = service.subscribe(&stream_id).unwrap();
        service.wait(&stream_id).unwrap();

        let output = collect_output(rx);
        assert!(String::from_utf8_lossy(&output).contains("from-initial-stdin"));
    }

    #[test]
    fn test_get_by_session_finds_active_stream() {
        let (service, _exit_rx) = PtyStreamService::new();
        let dir = tempfile::TempDir::new().unwrap();

        let stream_id = service
            .start("sess-a", &shell("sleep 1"), dir.path(), 24, 80)
            .unwrap();
        let found = service.get_by_session("sess-a").unwrap();
        assert_eq!(found.stream_id(), &stream_id);
        assert!(service.get_by_session("sess-b").is_none());

        service.terminate(&stream_id).unwrap();
        let _ = service.wait(&stream_id);
    }

    #[test]
    fn test_unknown_stream_errors() {
        let (service, _exit_rx) = PtyStreamService::new();
        let missing = StreamId::new("pty-missing");
        assert!(matches!(
            service.send_input(&missing, b"x", false),
            Err(DaemonError::StreamNotFound(_))
        ));
        assert!(service.subscribe(&missing).is_err());
    }

    #[test]
    fn test_idle_since_grows_after_output_stops() {
        let (service, _exit_rx) = PtyStreamService::new();
        let dir = tempfile::TempDir::new().unwrap();

        let stream_id = service
            .start("s1", &shell("echo once; sleep 1"), dir.path(), 24, 80)
            .unwrap();
        std::thread::sleep(Duration::from_millis(300));
        let idle = service.idle_since(&stream_id).unwrap();
        assert!(idle >= Duration::from_millis(100));

        service.terminate(&stream_id).unwrap();
        let _ = service.wait(&stream_id);
    }

    #[test]
    fn test_cleanup_session_removes_streams() {
        let (service, _exit_rx) = PtyStreamService::new();
        let dir = tempfile::TempDir::new().unwrap();

        service
            .start("s1", &shell("sleep 5"), dir.path(), 24, 80)
            .unwrap();
        assert_eq!(service.count(), 1);

        service.cleanup_session("s1");
        assert_eq!(service.count(), 0);
    }
}
