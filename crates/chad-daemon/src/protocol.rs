//! Typed request/response surface of the engine.
//!
//! The REST/SSE/WebSocket layer is a thin external collaborator; each of
//! its endpoints maps onto one request here. Frames for the streaming
//! endpoints come from [`Engine::stream`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use chad_core::events::EventLog;
use chad_git::{FileDiff, GitWorktreeManager, MergeOutcome, WorktreeConflict};
use chad_protocol::{Event, Milestone, SessionId, StreamFrame, TaskId};

use crate::errors::DaemonError;
use crate::executor::{TaskExecutor, TaskRequest};
use crate::mux::{EventMultiplexer, StreamOptions};
use crate::pty::PtyStreamService;
use crate::session::{SessionInfo, SessionManager, TaskStatus, WorktreeInfo};

fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}

/// Body of a start-task request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub project_path: String,
    pub task_description: String,
    /// Coding account name.
    pub coding_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coding_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coding_reasoning: Option<String>,
    #[serde(default = "default_rows")]
    pub terminal_rows: u16,
    #[serde(default = "default_cols")]
    pub terminal_cols: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_reasoning: Option<String>,
}

/// Requests the hosting layer dispatches into the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineRequest {
    CreateSession {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        project_path: Option<String>,
    },
    ListSessions,
    GetSession {
        session_id: SessionId,
    },
    DeleteSession {
        session_id: SessionId,
    },
    CancelSession {
        session_id: SessionId,
    },
    StartTask {
        session_id: SessionId,
        task: TaskSpec,
    },
    GetTaskStatus {
        session_id: SessionId,
        task_id: TaskId,
    },
    /// Raw bytes (base64) for the active PTY.
    SendInput {
        session_id: SessionId,
        data: String,
    },
    ResizeTerminal {
        session_id: SessionId,
        rows: u16,
        cols: u16,
    },
    /// Enqueue a user message into the session loop's inbound queue.
    SendMessage {
        session_id: SessionId,
        content: String,
    },
    GetMilestones {
        session_id: SessionId,
        #[serde(default)]
        since_seq: u64,
    },
    GetEvents {
        session_id: SessionId,
        #[serde(default)]
        since_seq: u64,
        /// Comma-separated event type filter.
        #[serde(default)]
        event_types: Option<String>,
    },
    CreateWorktree {
        session_id: SessionId,
    },
    GetWorktree {
        session_id: SessionId,
    },
    DeleteWorktree {
        session_id: SessionId,
    },
    WorktreeDiff {
        session_id: SessionId,
        #[serde(default)]
        full: bool,
    },
    WorktreeMerge {
        session_id: SessionId,
        #[serde(default)]
        commit_message: Option<String>,
        #[serde(default)]
        target_branch: Option<String>,
    },
    WorktreeReset {
        session_id: SessionId,
    },
}

/// Responses matching [`EngineRequest`] variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineResponse {
    Session {
        session: SessionInfo,
    },
    SessionList {
        sessions: Vec<SessionInfo>,
    },
    Deleted,
    CancelResult {
        cancel_requested: bool,
    },
    Task {
        task: TaskStatus,
    },
    Ack,
    Milestones {
        milestones: Vec<Milestone>,
        latest_seq: u64,
    },
    Events {
        events: Vec<Event>,
        latest_seq: u64,
    },
    Worktree {
        #[serde(skip_serializing_if = "Option::is_none")]
        worktree: Option<WorktreeInfo>,
    },
    DiffSummary {
        summary: String,
    },
    DiffFull {
        files: Vec<FileDiff>,
    },
    MergeResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        conflicts: Vec<WorktreeConflict>,
    },
    Error {
        code: String,
        message: String,
    },
}

/// The assembled session engine.
pub struct Engine {
    pub sessions: Arc<SessionManager>,
    pub pty: Arc<PtyStreamService>,
    pub executor: Arc<TaskExecutor>,
    log_dir: Option<PathBuf>,
}

impl Engine {
    pub fn new(
        sessions: Arc<SessionManager>,
        pty: Arc<PtyStreamService>,
        executor: Arc<TaskExecutor>,
        log_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            sessions,
            pty,
            executor,
            log_dir,
        }
    }

    /// Handle one request, converting engine errors into error responses.
    pub fn handle(&self, request: EngineRequest) -> EngineResponse {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => EngineResponse::Error {
                code: e.error_code().to_string(),
                message: e.to_string(),
            },
        }
    }

    fn dispatch(&self, request: EngineRequest) -> Result<EngineResponse, DaemonError> {
        match request {
            EngineRequest::CreateSession { name, project_path } => {
                let project_path = match project_path {
                    Some(path) => PathBuf::from(path),
                    None => std::env::current_dir()?,
                };
                let session = self.sessions.create_session(name, project_path);
                Ok(EngineResponse::Session {
                    session: session.to_info(),
                })
            }

            EngineRequest::ListSessions => Ok(EngineResponse::SessionList {
                sessions: self.sessions.list(),
            }),

            EngineRequest::GetSession { session_id } => {
                let session = self.sessions.get_or_err(&session_id)?;
                Ok(EngineResponse::Session {
                    session: session.to_info(),
                })
            }

            EngineRequest::DeleteSession { session_id } => {
                self.sessions.delete_session(&session_id, &self.pty)?;
                Ok(EngineResponse::Deleted)
            }

            EngineRequest::CancelSession { session_id } => {
                let cancel_requested = self.sessions.cancel(&session_id, &self.pty)?;
                Ok(EngineResponse::CancelResult { cancel_requested })
            }

            EngineRequest::StartTask { session_id, task } => {
                let request = TaskRequest {
                    session_id,
                    project_path: PathBuf::from(task.project_path),
                    task_description: task.task_description,
                    coding_account: task.coding_agent,
                    coding_model: task.coding_model,
                    coding_reasoning: task.coding_reasoning,
                    terminal_rows: task.terminal_rows,
                    terminal_cols: task.terminal_cols,
                    screenshots: task.screenshots,
                    override_prompt: task.override_prompt,
                    verification_account: task.verification_agent,
                    verification_model: task.verification_model,
                    verification_reasoning: task.verification_reasoning,
                };
                let status = self.executor.clone().start_task(request)?;
                Ok(EngineResponse::Task { task: status })
            }

            EngineRequest::GetTaskStatus {
                session_id,
                task_id,
            } => {
                self.sessions.get_or_err(&session_id)?;
                let entry = self
                    .executor
                    .get_task(&task_id)
                    .filter(|entry| entry.handle.session_id == session_id)
                    .ok_or_else(|| DaemonError::TaskNotFound(task_id.to_string()))?;
                Ok(EngineResponse::Task {
                    task: entry.handle.to_status(),
                })
            }

            EngineRequest::SendInput { session_id, data } => {
                self.sessions.get_or_err(&session_id)?;
                let bytes = BASE64.decode(&data).map_err(|_| DaemonError::Validation {
                    message: "Invalid base64 data".to_string(),
                })?;
                let stream = self
                    .pty
                    .get_by_session(session_id.as_ref())
                    .ok_or(DaemonError::NoActivePty)?;
                self.pty
                    .send_input(&stream.stream_id().clone(), &bytes, false)?;
                Ok(EngineResponse::Ack)
            }

            EngineRequest::ResizeTerminal {
                session_id,
                rows,
                cols,
            } => {
                self.sessions.get_or_err(&session_id)?;
                let stream = self
                    .pty
                    .get_by_session(session_id.as_ref())
                    .ok_or(DaemonError::NoActivePty)?;
                self.pty.resize(&stream.stream_id().clone(), rows, cols)?;
                Ok(EngineResponse::Ack)
            }

            EngineRequest::SendMessage {
                session_id,
                content,
            } => {
                self.sessions.get_or_err(&session_id)?;
                let entry = self
                    .executor
                    .find_task_by_session(&session_id)
                    .ok_or_else(|| DaemonError::Validation {
                        message: "No active task in session".to_string(),
                    })?;
                entry.event_loop.enqueue_message(&content);
                Ok(EngineResponse::Ack)
            }

            EngineRequest::GetMilestones {
                session_id,
                since_seq,
            } => {
                self.sessions.get_or_err(&session_id)?;
                match self.executor.find_task_by_session(&session_id) {
                    Some(entry) => Ok(EngineResponse::Milestones {
                        milestones: entry.event_loop.milestones(since_seq),
                        latest_seq: entry.event_loop.latest_milestone_seq(),
                    }),
                    None => Ok(EngineResponse::Milestones {
                        milestones: Vec::new(),
                        latest_seq: 0,
                    }),
                }
            }

            EngineRequest::GetEvents {
                session_id,
                since_seq,
                event_types,
            } => {
                self.sessions.get_or_err(&session_id)?;
                let type_filter: Option<Vec<String>> = event_types.map(|types| {
                    types
                        .split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                });

                match self.executor.find_task_by_session(&session_id) {
                    Some(entry) => {
                        let log = entry.event_log.lock().expect("event log poisoned");
                        Ok(EngineResponse::Events {
                            events: log.read_events(since_seq, type_filter.as_deref())?,
                            latest_seq: log.latest_seq(),
                        })
                    }
                    None => Ok(EngineResponse::Events {
                        events: Vec::new(),
                        latest_seq: 0,
                    }),
                }
            }

            EngineRequest::CreateWorktree { session_id } => {
                let session = self.sessions.get_or_err(&session_id)?;
                let project_path = session.with_state(|s| s.project_path.clone());
                let git = GitWorktreeManager::new(project_path);
                if !git.is_git_repo() {
                    return Err(DaemonError::Validation {
                        message: "Not a git repository".to_string(),
                    });
                }
                let (path, base_commit) = git.create_worktree(session_id.as_ref())?;
                let worktree = WorktreeInfo {
                    path,
                    branch: git.task_branch(session_id.as_ref()),
                    base_commit,
                    has_changes: false,
                };
                session.with_state_mut(|s| s.worktree = Some(worktree.clone()));
                Ok(EngineResponse::Worktree {
                    worktree: Some(worktree),
                })
            }

            EngineRequest::GetWorktree { session_id } => {
                let session = self.sessions.get_or_err(&session_id)?;
                let project_path = session.with_state(|s| s.project_path.clone());
                let git = GitWorktreeManager::new(project_path);
                let has_changes = git.has_changes(session_id.as_ref()).unwrap_or(false);
                let worktree = session.with_state_mut(|s| {
                    if let Some(worktree) = &mut s.worktree {
                        worktree.has_changes = has_changes;
                    }
                    s.worktree.clone()
                });
                Ok(EngineResponse::Worktree { worktree })
            }

            EngineRequest::DeleteWorktree { session_id } => {
                let session = self.sessions.get_or_err(&session_id)?;
                let project_path = session.with_state(|s| s.project_path.clone());
                let git = GitWorktreeManager::new(project_path);
                git.delete_worktree(session_id.as_ref())?;
                session.with_state_mut(|s| s.worktree = None);
                Ok(EngineResponse::Deleted)
            }

            EngineRequest::WorktreeDiff { session_id, full } => {
                let session = self.sessions.get_or_err(&session_id)?;
                let project_path = session.with_state(|s| s.project_path.clone());
                let git = GitWorktreeManager::new(project_path);
                if full {
                    Ok(EngineResponse::DiffFull {
                        files: git.parsed_diff(session_id.as_ref())?,
                    })
                } else {
                    Ok(EngineResponse::DiffSummary {
                        summary: git.diff_summary(session_id.as_ref())?,
                    })
                }
            }

            EngineRequest::WorktreeMerge {
                session_id,
                commit_message,
                target_branch,
            } => {
                let session = self.sessions.get_or_err(&session_id)?;
                let project_path = session.with_state(|s| s.project_path.clone());
                let git = GitWorktreeManager::new(project_path);
                match git.merge_to_main(
                    session_id.as_ref(),
                    commit_message.as_deref(),
                    target_branch.as_deref(),
                )? {
                    MergeOutcome::Merged => {
                        git.cleanup_after_merge(session_id.as_ref())?;
                        session.with_state_mut(|s| s.worktree = None);
                        Ok(EngineResponse::MergeResult {
                            success: true,
                            conflicts: Vec::new(),
                        })
                    }
                    MergeOutcome::Conflicts(conflicts) => Ok(EngineResponse::MergeResult {
                        success: false,
                        conflicts,
                    }),
                }
            }

            EngineRequest::WorktreeReset { session_id } => {
                let session = self.sessions.get_or_err(&session_id)?;
                let (project_path, base_commit) = session.with_state(|s| {
                    (
                        s.project_path.clone(),
                        s.worktree.as_ref().map(|w| w.base_commit.clone()),
                    )
                });
                let git = GitWorktreeManager::new(project_path);
                git.reset_worktree(session_id.as_ref(), base_commit.as_deref())?;
                Ok(EngineResponse::Ack)
            }
        }
    }

    /// Open a unified frame stream for a session.
    pub fn stream(
        &self,
        session_id: &SessionId,
        options: StreamOptions,
    ) -> Result<mpsc::Receiver<StreamFrame>, DaemonError> {
        self.sessions.get_or_err(session_id)?;

        let (event_log, task) = match self.executor.find_task_by_session(session_id) {
            Some(entry) => (entry.event_log.clone(), Some(entry.handle.clone())),
            None => {
                // No live task; serve the persisted log for catch-up
                let log = EventLog::open(session_id.clone(), self.log_dir.clone())?;
                (Arc::new(Mutex::new(log)), None)
            }
        };

        let mux = EventMultiplexer::new(session_id.clone(), event_log, self.pty.clone(), task);
        Ok(mux.stream(options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chad_config::ChadConfig;
    use chad_paths::ChadPaths;
    use tempfile::TempDir;

    use crate::executor::NoUsageProbe;

    fn test_engine(dir: &TempDir) -> Engine {
        let sessions = Arc::new(SessionManager::new());
        let (pty, _exit_rx) = PtyStreamService::new();
        let pty = Arc::new(pty);
        let executor = Arc::new(TaskExecutor::new(
            sessions.clone(),
            pty.clone(),
            ChadConfig::default(),
            ChadPaths::from_dir(dir.path().join(".chad")),
            Some(dir.path().join("logs")),
            Arc::new(NoUsageProbe),
        ));
        Engine::new(
            sessions,
            pty,
            executor,
            Some(dir.path().join("logs")),
        )
    }

    #[test]
    fn test_create_list_get_delete_session() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        let EngineResponse::Session { session } = engine.handle(EngineRequest::CreateSession {
            name: Some("work".to_string()),
            project_path: Some(dir.path().to_string_lossy().into_owned()),
        }) else {
            panic!("expected session response");
        };
        assert_eq!(session.name, "work");

        let EngineResponse::SessionList { sessions } = engine.handle(EngineRequest::ListSessions)
        else {
            panic!("expected list response");
        };
        assert_eq!(sessions.len(), 1);

        let EngineResponse::Session { session: fetched } =
            engine.handle(EngineRequest::GetSession {
                session_id: session.id.clone(),
            })
        else {
            panic!("expected session response");
        };
        assert_eq!(fetched.id, session.id);

        let response = engine.handle(EngineRequest::DeleteSession {
            session_id: session.id.clone(),
        });
        assert!(matches!(response, EngineResponse::Deleted));

        let response = engine.handle(EngineRequest::GetSession {
            session_id: session.id,
        });
        let EngineResponse::Error { code, .. } = response else {
            panic!("expected error");
        };
        assert_eq!(code, "SESSION_NOT_FOUND");
    }

    #[test]
    fn test_unknown_session_maps_to_error_response() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let response = engine.handle(EngineRequest::CancelSession {
            session_id: SessionId::new("ghost"),
        });
        let EngineResponse::Error { code, message } = response else {
            panic!("expected error");
        };
        assert_eq!(code, "SESSION_NOT_FOUND");
        assert!(message.contains("ghost"));
    }

    #[test]
    fn test_send_input_without_pty_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let EngineResponse::Session { session } = engine.handle(EngineRequest::CreateSession {
            name: None,
            project_path: Some(dir.path().to_string_lossy().into_owned()),
        }) else {
            panic!("expected session");
        };

        let response = engine.handle(EngineRequest::SendInput {
            session_id: session.id.clone(),
            data: BASE64.encode(b"hello"),
        });
        let EngineResponse::Error { code, .. } = response else {
            panic!("expected error");
        };
        assert_eq!(code, "NO_ACTIVE_PTY");

        // Invalid base64 is a validation error
        let response = engine.handle(EngineRequest::SendInput {
            session_id: session.id,
            data: "!!! not base64 !!!".to_string(),
        });
        let EngineResponse::Error { code, .. } = response else {
            panic!("expected error");
        };
        assert_eq!(code, "VALIDATION");
    }

    #[test]
    fn test_start_task_unknown_account_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let EngineResponse::Session { session } = engine.handle(EngineRequest::CreateSession {
            name: None,
            project_path: Some(dir.path().to_string_lossy().into_owned()),
        }) else {
            panic!("expected session");
        };

        let response = engine.handle(EngineRequest::StartTask {
            session_id: session.id,
            task: TaskSpec {
                project_path: dir.path().to_string_lossy().into_owned(),
                task_description: "do something".to_string(),
                coding_agent: "nonexistent".to_string(),
                coding_model: None,
                coding_reasoning: None,
                terminal_rows: 24,
                terminal_cols: 80,
                screenshots: Vec::new(),
                override_prompt: None,
                verification_agent: None,
                verification_model: None,
                verification_reasoning: None,
            },
        });
        let EngineResponse::Error { code, message } = response else {
            panic!("expected error");
        };
        assert_eq!(code, "VALIDATION");
        assert!(message.contains("nonexistent"));
    }

    #[test]
    fn test_milestones_without_task_empty() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let EngineResponse::Session { session } = engine.handle(EngineRequest::CreateSession {
            name: None,
            project_path: Some(dir.path().to_string_lossy().into_owned()),
        }) else {
            panic!("expected session");
        };

        let EngineResponse::Milestones {
            milestones,
            latest_seq,
        } = engine.handle(EngineRequest::GetMilestones {
            session_id: session.id,
            since_seq: 0,
        })
        else {
            panic!("expected milestones");
        };
        assert!(milestones.is_empty());
        assert_eq!(latest_seq, 0);
    }

    #[test]
    fn test_request_serde_shapes() {
        let request: EngineRequest = serde_json::from_str(
            r#"{"type":"get_events","session_id":"s1","since_seq":5,"event_types":"milestone,user_message"}"#,
        )
        .unwrap();
        let EngineRequest::GetEvents {
            session_id,
            since_seq,
            event_types,
        } = request
        else {
            panic!("wrong variant");
        };
        assert_eq!(session_id.as_ref(), "s1");
        assert_eq!(since_seq, 5);
        assert_eq!(event_types.as_deref(), Some("milestone,user_message"));

        let response = EngineResponse::MergeResult {
            success: false,
            conflicts: vec![WorktreeConflict {
                file_path: "a.txt".to_string(),
                hunks: Vec::new(),
            }],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "merge_result");
        assert_eq!(json["success"], false);
        assert_eq!(json["conflicts"][0]["file_path"], "a.txt");
    }
}
