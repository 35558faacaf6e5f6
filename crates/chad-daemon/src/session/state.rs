use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use chad_protocol::{SessionId, StreamId, TaskId, TaskState};

/// Worktree association of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub base_commit: String,
    pub has_changes: bool,
}

/// Mutable session attributes, guarded by the handle's mutex.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub name: String,
    pub project_path: PathBuf,
    pub worktree: Option<WorktreeInfo>,
    pub active: bool,
    pub created_at: String,
    pub last_activity: String,
    pub current_task: Option<TaskId>,
}

/// A live session. The handle owns its cancel flag directly so the tick
/// worker can poll it without taking the state lock.
pub struct SessionHandle {
    pub id: SessionId,
    cancel_requested: AtomicBool,
    state: Mutex<SessionState>,
}

impl SessionHandle {
    pub fn new(id: SessionId, name: String, project_path: PathBuf) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id,
            cancel_requested: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                name,
                project_path,
                worktree: None,
                active: false,
                created_at: now.clone(),
                last_activity: now,
                current_task: None,
            }),
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Idempotent; a cancel after terminal state is a no-op downstream.
    pub fn set_cancel_requested(&self, value: bool) {
        self.cancel_requested.store(value, Ordering::SeqCst);
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let state = self.state.lock().expect("session state poisoned");
        f(&state)
    }

    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.state.lock().expect("session state poisoned");
        state.last_activity = chrono::Utc::now().to_rfc3339();
        f(&mut state)
    }

    /// Wire-facing snapshot.
    pub fn to_info(&self) -> SessionInfo {
        self.with_state(|state| SessionInfo {
            id: self.id.clone(),
            name: state.name.clone(),
            project_path: state.project_path.to_string_lossy().into_owned(),
            active: state.active,
            has_worktree: state.worktree.is_some(),
            has_changes: state
                .worktree
                .as_ref()
                .is_some_and(|w| w.has_changes),
            cancel_requested: self.cancel_requested(),
            created_at: state.created_at.clone(),
            last_activity: state.last_activity.clone(),
            current_task: state.current_task.clone(),
        })
    }
}

/// Session snapshot as surfaced on the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub project_path: String,
    pub active: bool,
    pub has_worktree: bool,
    pub has_changes: bool,
    pub cancel_requested: bool,
    pub created_at: String,
    pub last_activity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,
}

/// Mutable task attributes.
#[derive(Debug, Clone)]
pub struct TaskData {
    pub state: TaskState,
    pub progress: Option<String>,
    pub result: Option<serde_json::Value>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub stream_id: Option<StreamId>,
}

/// A task within a session. Runs once to a terminal state.
pub struct TaskHandle {
    pub id: TaskId,
    pub session_id: SessionId,
    data: Mutex<TaskData>,
}

impl TaskHandle {
    pub fn new(id: TaskId, session_id: SessionId) -> Self {
        Self {
            id,
            session_id,
            data: Mutex::new(TaskData {
                state: TaskState::Pending,
                progress: None,
                result: None,
                started_at: None,
                completed_at: None,
                stream_id: None,
            }),
        }
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&TaskData) -> R) -> R {
        let data = self.data.lock().expect("task data poisoned");
        f(&data)
    }

    pub fn state(&self) -> TaskState {
        self.with_data(|d| d.state)
    }

    pub fn set_stream_id(&self, stream_id: Option<StreamId>) {
        let mut data = self.data.lock().expect("task data poisoned");
        data.stream_id = stream_id;
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.with_data(|d| d.stream_id.clone())
    }

    pub fn set_progress(&self, progress: impl Into<String>) {
        let mut data = self.data.lock().expect("task data poisoned");
        data.progress = Some(progress.into());
    }

    pub fn mark_running(&self) {
        let mut data = self.data.lock().expect("task data poisoned");
        if data.state == TaskState::Pending {
            data.state = TaskState::Running;
            data.started_at = Some(chrono::Utc::now().to_rfc3339());
        }
    }

    /// Transition to a terminal state. Once terminal, further transitions
    /// are ignored.
    pub fn finish(&self, state: TaskState, result: Option<serde_json::Value>) {
        debug_assert!(state.is_terminal());
        let mut data = self.data.lock().expect("task data poisoned");
        if data.state.is_terminal() {
            return;
        }
        data.state = state;
        data.result = result;
        data.completed_at = Some(chrono::Utc::now().to_rfc3339());
    }

    pub fn to_status(&self) -> TaskStatus {
        self.with_data(|data| TaskStatus {
            task_id: self.id.clone(),
            session_id: self.session_id.clone(),
            status: data.state,
            progress: data.progress.clone(),
            result: data.result.clone(),
            started_at: data.started_at.clone(),
            completed_at: data.completed_at.clone(),
        })
    }
}

/// Task snapshot as surfaced on the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub status: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}
