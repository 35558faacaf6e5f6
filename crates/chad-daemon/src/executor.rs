//! Top-level task execution.
//!
//! `TaskExecutor` validates a task request, allocates the session's
//! worktree, wires the phase runner (agent command → PTY → event log →
//! analyzer), drives the session event loop on a background thread, and
//! records the `session_started` / `session_ended` bracket. It owns the
//! task registry for status polling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use chad_config::{Account, ChadConfig, TimeoutSettings};
use chad_core::agents::{
    self, AgentEvent, CommandSpec, extract_native_session_id, parse_stream_line,
};
use chad_core::events::EventLog;
use chad_core::handoff;
use chad_git::GitWorktreeManager;
use chad_paths::ChadPaths;
use chad_protocol::{EventPayload, Phase, SessionId, TaskId};

use crate::errors::DaemonError;
use crate::event_loop::{
    EXIT_CANCELLED, EXIT_EXPLORATION_LOOP, EXIT_STALLED, LoopConfig, LoopHooks, LoopResult,
    PendingAction, PhaseRequest, PhaseRunner, SessionEventLoop, UsageFn, VerificationSpec,
};
use crate::pty::{LineBuffer, PtyStreamService};
use crate::session::{SessionHandle, SessionManager, TaskHandle, TaskStatus, WorktreeInfo};

/// Provider usage readings for threshold rules. The real probes query
/// provider usage surfaces; the default reports nothing.
pub trait UsageProbe: Send + Sync {
    fn session_usage(&self, _account: &Account) -> Option<f64> {
        None
    }
    fn weekly_usage(&self, _account: &Account) -> Option<f64> {
        None
    }
    fn context_usage(&self, _account: &Account) -> Option<f64> {
        None
    }
}

/// Probe that never reports usage; rules simply never fire.
pub struct NoUsageProbe;

impl UsageProbe for NoUsageProbe {}

/// A request to start a task in a session.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub session_id: SessionId,
    pub project_path: PathBuf,
    pub task_description: String,
    pub coding_account: String,
    pub coding_model: Option<String>,
    pub coding_reasoning: Option<String>,
    pub terminal_rows: u16,
    pub terminal_cols: u16,
    pub screenshots: Vec<String>,
    pub override_prompt: Option<String>,
    pub verification_account: Option<String>,
    pub verification_model: Option<String>,
    pub verification_reasoning: Option<String>,
}

/// A registered task with its owned engine pieces.
pub struct TaskEntry {
    pub handle: Arc<TaskHandle>,
    pub event_log: Arc<Mutex<EventLog>>,
    pub event_loop: Arc<SessionEventLoop>,
}

pub struct TaskExecutor {
    sessions: Arc<SessionManager>,
    pty: Arc<PtyStreamService>,
    config: ChadConfig,
    paths: ChadPaths,
    /// Log-dir override, mainly for tests.
    log_dir: Option<PathBuf>,
    usage_probe: Arc<dyn UsageProbe>,
    tasks: Mutex<HashMap<TaskId, Arc<TaskEntry>>>,
}

impl TaskExecutor {
    pub fn new(
        sessions: Arc<SessionManager>,
        pty: Arc<PtyStreamService>,
        config: ChadConfig,
        paths: ChadPaths,
        log_dir: Option<PathBuf>,
        usage_probe: Arc<dyn UsageProbe>,
    ) -> Self {
        Self {
            sessions,
            pty,
            config,
            paths,
            log_dir,
            usage_probe,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<Arc<TaskEntry>> {
        self.tasks.lock().expect("task registry poisoned").get(task_id).cloned()
    }

    /// The most recently started task of a session.
    pub fn find_task_by_session(&self, session_id: &SessionId) -> Option<Arc<TaskEntry>> {
        let tasks = self.tasks.lock().expect("task registry poisoned");
        tasks
            .values()
            .filter(|t| &t.handle.session_id == session_id)
            .max_by_key(|t| t.handle.with_data(|d| d.started_at.clone()))
            .cloned()
    }

    fn validate(&self, request: &TaskRequest) -> Result<Account, DaemonError> {
        if !request.project_path.exists() {
            return Err(DaemonError::Validation {
                message: format!(
                    "Project path does not exist: {}",
                    request.project_path.display()
                ),
            });
        }
        let account = self
            .config
            .find_account(&request.coding_account)
            .ok_or_else(|| DaemonError::Validation {
                message: format!(
                    "Unknown account '{}'. Configured accounts: {}",
                    request.coding_account,
                    self.config.account_names()
                ),
            })?;
        if account.role.is_none() {
            return Err(DaemonError::Validation {
                message: format!("Account '{}' has no assigned role", account.name),
            });
        }
        if let Some(verifier) = &request.verification_account {
            let verifier_account =
                self.config
                    .find_account(verifier)
                    .ok_or_else(|| DaemonError::Validation {
                        message: format!("Unknown verification account '{verifier}'"),
                    })?;
            if verifier_account.role.is_none() {
                return Err(DaemonError::Validation {
                    message: format!("Account '{}' has no assigned role", verifier_account.name),
                });
            }
        }
        Ok(account.clone())
    }

    /// Start a task. Returns immediately; the loop runs on its own thread.
    pub fn start_task(self: Arc<Self>, request: TaskRequest) -> Result<TaskStatus, DaemonError> {
        let session = self.sessions.get_or_err(&request.session_id)?;
        let account = self.validate(&request)?;

        if session.with_state(|s| s.active) {
            return Err(DaemonError::SessionAlreadyActive(
                request.session_id.to_string(),
            ));
        }
        session.set_cancel_requested(false);

        // Worktree allocation
        let git = GitWorktreeManager::new(request.project_path.clone());
        if !git.is_git_repo() {
            return Err(DaemonError::Validation {
                message: format!(
                    "Not a git repository: {}",
                    request.project_path.display()
                ),
            });
        }
        let (worktree_path, base_commit) = git.create_worktree(request.session_id.as_ref())?;
        let branch = git.task_branch(request.session_id.as_ref());

        session.with_state_mut(|state| {
            state.project_path = request.project_path.clone();
            state.worktree = Some(WorktreeInfo {
                path: worktree_path.clone(),
                branch,
                base_commit,
                has_changes: false,
            });
        });

        let task_id = TaskId::new(uuid::Uuid::new_v4().to_string());
        let task = Arc::new(TaskHandle::new(task_id.clone(), request.session_id.clone()));

        let mut event_log = EventLog::open(request.session_id.clone(), self.log_dir.clone())?;
        event_log.append(EventPayload::SessionStarted {
            task_description: request.task_description.clone(),
            project_path: request.project_path.to_string_lossy().into_owned(),
            coding_provider: account.provider.to_string(),
            coding_account: account.name.clone(),
            coding_model: request.coding_model.clone().or(account.model.clone()),
        })?;
        event_log.append(EventPayload::ModelSelected {
            provider: account.provider.to_string(),
            model: request
                .coding_model
                .clone()
                .or(account.model.clone())
                .unwrap_or_else(|| "default".to_string()),
            reasoning_effort: request.coding_reasoning.clone().or(account.reasoning.clone()),
        })?;
        let event_log = Arc::new(Mutex::new(event_log));

        let runner = Arc::new(EnginePhaseRunner {
            pty: self.pty.clone(),
            paths: self.paths.clone(),
            accounts: self
                .config
                .accounts
                .iter()
                .map(|a| (a.name.clone(), a.clone()))
                .collect(),
            session: session.clone(),
            task: task.clone(),
            event_log: event_log.clone(),
            worktree_path: worktree_path.clone(),
            request: request.clone(),
            timeouts: self.config.timeouts.clone(),
            native_session_id: Mutex::new(None),
        });

        let event_loop = Arc::new(SessionEventLoop::new(
            request.session_id.clone(),
            event_log.clone(),
            runner.clone() as Arc<dyn PhaseRunner>,
            self.build_hooks(&session, &task, &account),
            LoopConfig {
                coding_account: account.name.clone(),
                verification: request
                    .verification_account
                    .clone()
                    .map(|account| VerificationSpec { account }),
                max_verification_attempts: self.config.verification.max_attempts,
                rules: self.config.rules.clone(),
                override_prompt: request.override_prompt.clone(),
            },
        ));

        let entry = Arc::new(TaskEntry {
            handle: task.clone(),
            event_log: event_log.clone(),
            event_loop: event_loop.clone(),
        });
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .insert(task_id.clone(), entry.clone());

        session.with_state_mut(|state| {
            state.active = true;
            state.current_task = Some(task_id.clone());
        });
        task.mark_running();
        task.set_progress("Coding...");

        info!(
            event = "daemon.executor.task_started",
            session_id = %request.session_id,
            task_id = %task_id,
            account = %account.name,
        );

        let executor = self.clone();
        std::thread::spawn(move || {
            let result = entry.event_loop.run();
            executor.complete_task(&session, &entry, &account, &request, result);
        });

        Ok(task.to_status())
    }

    fn build_hooks(
        &self,
        session: &Arc<SessionHandle>,
        task: &Arc<TaskHandle>,
        account: &Account,
    ) -> LoopHooks {
        let pty = self.pty.clone();
        let session_for_terminate = session.clone();
        let terminate = Box::new(move || {
            if let Some(stream) = pty.get_by_session(session_for_terminate.id.as_ref()) {
                let stream_id = stream.stream_id().clone();
                if let Err(e) = pty.terminate(&stream_id) {
                    warn!(
                        event = "daemon.executor.terminate_failed",
                        stream_id = %stream_id,
                        error = %e,
                    );
                }
            }
        });

        let pty = self.pty.clone();
        let task_for_input = task.clone();
        let send_input = Box::new(move |data: &[u8]| {
            let Some(stream_id) = task_for_input.stream_id() else {
                return false;
            };
            if !pty.is_active(&stream_id) {
                return false;
            }
            pty.send_input(&stream_id, data, false).is_ok()
        });

        let session_for_cancel = session.clone();
        let cancel_requested = Box::new(move || session_for_cancel.cancel_requested());

        let probe = self.usage_probe.clone();
        let account_for_session = account.clone();
        let session_usage: Option<UsageFn> = Some(Box::new(move || {
            probe.session_usage(&account_for_session)
        }));
        let probe = self.usage_probe.clone();
        let account_for_weekly = account.clone();
        let weekly_usage: Option<UsageFn> =
            Some(Box::new(move || probe.weekly_usage(&account_for_weekly)));
        let probe = self.usage_probe.clone();
        let account_for_context = account.clone();
        let context_usage: Option<UsageFn> =
            Some(Box::new(move || probe.context_usage(&account_for_context)));

        LoopHooks {
            terminate,
            send_input,
            cancel_requested,
            session_usage,
            weekly_usage,
            context_usage,
        }
    }

    /// Post-loop bookkeeping: provider handover, end event, task state.
    fn complete_task(
        &self,
        session: &Arc<SessionHandle>,
        entry: &Arc<TaskEntry>,
        account: &Account,
        request: &TaskRequest,
        mut result: LoopResult,
    ) {
        // Quota-driven provider handover: one switch, carrying a handoff
        // summary, before the session is allowed to end.
        if let Some(PendingAction::SwitchProvider {
            target_account,
            reason,
        }) = result.pending_action.clone()
        {
            if !result.cancelled {
                match self.run_handover(session, entry, account, request, &target_account, &reason)
                {
                    Ok(handover_result) => result = handover_result,
                    Err(e) => {
                        error!(
                            event = "daemon.executor.handover_failed",
                            session_id = %session.id,
                            error = %e,
                        );
                    }
                }
            }
        }

        let (state, reason, success) = if result.cancelled || result.exit_code == EXIT_CANCELLED {
            (chad_protocol::TaskState::Cancelled, "cancelled", false)
        } else if matches!(result.pending_action, Some(PendingAction::AwaitReset { .. })) {
            (chad_protocol::TaskState::Failed, "awaiting_reset", false)
        } else if result.exit_code == EXIT_STALLED {
            (chad_protocol::TaskState::Failed, "stalled", false)
        } else if result.exit_code == EXIT_EXPLORATION_LOOP {
            (chad_protocol::TaskState::Failed, "exploration_loop", false)
        } else if result.exit_code != 0 {
            (chad_protocol::TaskState::Failed, "agent_failed", false)
        } else if result.verification_passed == Some(false) {
            (
                chad_protocol::TaskState::Failed,
                "verification_failed",
                false,
            )
        } else {
            (chad_protocol::TaskState::Completed, "completed", true)
        };

        if let Ok(mut log) = entry.event_log.lock() {
            let _ = log.append(EventPayload::SessionEnded {
                success,
                reason: reason.to_string(),
            });
        }

        entry.handle.finish(
            state,
            Some(serde_json::json!({
                "exit_code": result.exit_code,
                "reason": reason,
                "verification_passed": result.verification_passed,
            })),
        );

        // Refresh worktree state and release the session
        let git = GitWorktreeManager::new(request.project_path.clone());
        let has_changes = git.has_changes(session.id.as_ref()).unwrap_or(false);
        session.with_state_mut(|state| {
            state.active = false;
            state.current_task = None;
            if let Some(worktree) = &mut state.worktree {
                worktree.has_changes = has_changes;
            }
        });

        info!(
            event = "daemon.executor.task_completed",
            session_id = %session.id,
            task_id = %entry.handle.id,
            reason = reason,
            exit_code = result.exit_code,
        );
    }

    /// Run the cross-provider handover: checkpoint, switch event, and a
    /// fresh coding run on the target account carrying the summary.
    fn run_handover(
        &self,
        session: &Arc<SessionHandle>,
        entry: &Arc<TaskEntry>,
        from_account: &Account,
        request: &TaskRequest,
        target_account: &str,
        reason: &str,
    ) -> Result<LoopResult, DaemonError> {
        let target = self
            .config
            .find_account(target_account)
            .ok_or_else(|| DaemonError::Validation {
                message: format!("Unknown handover target account '{target_account}'"),
            })?
            .clone();

        info!(
            event = "daemon.executor.handover_started",
            session_id = %session.id,
            from = %from_account.name,
            to = %target.name,
            reason = reason,
        );

        let resume_prompt;
        {
            let mut log = entry.event_log.lock().expect("event log poisoned");
            let native_id = handoff::last_checkpoint_provider_session_id(&log);
            let checkpoint_seq = handoff::log_checkpoint(
                &mut log,
                &request.task_description,
                native_id,
                "",
                target.provider,
            )?;
            log.append(EventPayload::ProviderSwitched {
                from_provider: from_account.provider.to_string(),
                to_provider: target.provider.to_string(),
                from_model: from_account.model.clone().unwrap_or_else(|| "default".to_string()),
                to_model: target.model.clone().unwrap_or_else(|| "default".to_string()),
                reason: reason.to_string(),
                checkpoint_seq: Some(checkpoint_seq),
            })?;
            resume_prompt = handoff::build_resume_prompt(&log, None, target.provider);
        }

        let runner = Arc::new(EnginePhaseRunner {
            pty: self.pty.clone(),
            paths: self.paths.clone(),
            accounts: self
                .config
                .accounts
                .iter()
                .map(|a| (a.name.clone(), a.clone()))
                .collect(),
            session: session.clone(),
            task: entry.handle.clone(),
            event_log: entry.event_log.clone(),
            worktree_path: session
                .with_state(|s| s.worktree.as_ref().map(|w| w.path.clone()))
                .unwrap_or_else(|| request.project_path.clone()),
            request: request.clone(),
            timeouts: self.config.timeouts.clone(),
            native_session_id: Mutex::new(None),
        });

        // Threshold rules are not re-armed on the target account: one
        // handover per task keeps the loop bounded.
        let handover_loop = SessionEventLoop::new(
            session.id.clone(),
            entry.event_log.clone(),
            runner as Arc<dyn PhaseRunner>,
            self.build_hooks(session, &entry.handle, &target),
            LoopConfig {
                coding_account: target.name.clone(),
                verification: request
                    .verification_account
                    .clone()
                    .map(|account| VerificationSpec { account }),
                max_verification_attempts: self.config.verification.max_attempts,
                rules: Vec::new(),
                override_prompt: Some(resume_prompt),
            },
        );

        Ok(handover_loop.run())
    }
}

/// Activity classes that pick the idle budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivityKind {
    Thinking,
    Command,
    Other,
}

/// The PTY-backed phase runner used in production.
struct EnginePhaseRunner {
    pty: Arc<PtyStreamService>,
    paths: ChadPaths,
    accounts: HashMap<String, Account>,
    session: Arc<SessionHandle>,
    task: Arc<TaskHandle>,
    event_log: Arc<Mutex<EventLog>>,
    worktree_path: PathBuf,
    request: TaskRequest,
    timeouts: TimeoutSettings,
    /// Native provider session id captured from the stream, for resume.
    native_session_id: Mutex<Option<String>>,
}

const READ_ONLY_COMMANDS: [&str; 8] = ["ls", "cat", "grep", "find", "rg", "head", "tail", "tree"];

fn classify_tool_call(name: &str, args: &Map<String, Value>) -> (bool, bool) {
    // Returns (is_exploration, is_implementation)
    let lower = name.to_lowercase();
    match lower.as_str() {
        "write" | "edit" => (false, true),
        "read" | "glob" | "grep" => (true, false),
        "bash" => {
            let command = args
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let first = command.split_whitespace().next().unwrap_or_default();
            if READ_ONLY_COMMANDS.contains(&first) {
                (true, false)
            } else {
                (false, !command.is_empty())
            }
        }
        _ => (false, false),
    }
}

impl EnginePhaseRunner {
    fn idle_budget(&self, kind: ActivityKind) -> Duration {
        match kind {
            ActivityKind::Thinking => {
                // Larger models think longer between bytes
                if self.request.coding_model.is_some() {
                    Duration::from_secs(self.timeouts.idle_mid_thought_secs)
                } else {
                    Duration::from_secs(self.timeouts.idle_thinking_secs)
                }
            }
            ActivityKind::Command => Duration::from_secs(self.timeouts.idle_command_secs),
            ActivityKind::Other => Duration::from_secs(self.timeouts.idle_thinking_secs),
        }
    }

    fn log_event(&self, payload: EventPayload) {
        if let Ok(mut log) = self.event_log.lock() {
            if let Err(e) = log.append(payload) {
                warn!(event = "daemon.executor.event_append_failed", error = %e);
            }
        }
    }

    /// Log structured events derived from one normalized agent event.
    fn log_agent_event(&self, agent_event: &AgentEvent) {
        match agent_event {
            AgentEvent::Text(text) => {
                self.log_event(EventPayload::AssistantMessage {
                    blocks: vec![chad_protocol::MessageBlock::text(text.clone())],
                });
            }
            AgentEvent::Thinking(text) => {
                self.log_event(EventPayload::AssistantMessage {
                    blocks: vec![chad_protocol::MessageBlock::thinking(text.clone())],
                });
            }
            AgentEvent::ToolCall { id, name, args } => {
                let lower = name.to_lowercase();
                let command = args
                    .get("command")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let path = args
                    .get("file_path")
                    .or_else(|| args.get("path"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.log_event(EventPayload::ToolCallStarted {
                    tool_call_id: id.clone(),
                    tool: lower,
                    cwd: Some(self.worktree_path.to_string_lossy().into_owned()),
                    command,
                    path,
                    args: Some(args.clone()),
                });
            }
            AgentEvent::ToolResult { id, content } => {
                let stdout_ref = {
                    let log = self.event_log.lock().expect("event log poisoned");
                    log.store_artifact(content.as_bytes(), "stdout")
                        .unwrap_or(None)
                };
                let llm_summary = if content.len() > 500 {
                    let mut end = 500;
                    while !content.is_char_boundary(end) {
                        end -= 1;
                    }
                    format!("{}...", &content[..end])
                } else {
                    content.clone()
                };
                self.log_event(EventPayload::ToolCallFinished {
                    tool_call_id: id.clone(),
                    exit_code: None,
                    duration_ms: 0,
                    stdout_ref,
                    stderr_ref: None,
                    llm_summary,
                });
            }
            AgentEvent::Result(_) => {}
        }
    }
}

impl PhaseRunner for EnginePhaseRunner {
    fn run_phase(&self, request: &PhaseRequest, sink: &(dyn Fn(&str) + Sync)) -> (i32, String) {
        let Some(account) = self.accounts.get(&request.account) else {
            return (1, format!("Unknown account '{}'", request.account));
        };

        let mut spec = CommandSpec::new(
            account.provider,
            account.name.clone(),
            self.worktree_path.clone(),
            request.phase,
            self.request.task_description.clone(),
        );
        spec.prior_output = request.prior_output.clone();
        spec.override_prompt = request.override_prompt.clone();
        spec.model = match request.phase {
            Phase::Verification => self
                .request
                .verification_model
                .clone()
                .or(account.model.clone()),
            _ => self.request.coding_model.clone().or(account.model.clone()),
        };
        spec.reasoning = match request.phase {
            Phase::Verification => self
                .request
                .verification_reasoning
                .clone()
                .or(account.reasoning.clone()),
            _ => self
                .request
                .coding_reasoning
                .clone()
                .or(account.reasoning.clone()),
        };
        if request.phase == Phase::Combined {
            spec.screenshots = self.request.screenshots.clone();
        }
        if matches!(request.phase, Phase::Continuation | Phase::Revision) {
            spec.resume_session_id = self
                .native_session_id
                .lock()
                .expect("native session id poisoned")
                .clone();
        }

        let invocation = match agents::build_command(&self.paths, &spec) {
            Ok(invocation) => invocation,
            Err(e) => {
                error!(event = "daemon.executor.command_failed", error = %e);
                return (127, e.to_string());
            }
        };

        let stream_id = match self.pty.start(
            self.session.id.as_ref(),
            &invocation,
            &self.worktree_path,
            self.request.terminal_rows,
            self.request.terminal_cols,
        ) {
            Ok(stream_id) => stream_id,
            Err(e) => {
                error!(event = "daemon.executor.spawn_failed", error = %e);
                return (126, e.to_string());
            }
        };
        self.task.set_stream_id(Some(stream_id.clone()));

        let mut rx = match self.pty.subscribe(&stream_id) {
            Ok(rx) => rx,
            Err(e) => return (126, e.to_string()),
        };

        let output = Arc::new(Mutex::new(String::new()));
        let last_activity = Arc::new(Mutex::new(ActivityKind::Other));
        let exploration_commands = Arc::new(AtomicU32::new(0));
        let implementation_commands = Arc::new(AtomicU32::new(0));
        let last_command = Arc::new(Mutex::new(String::new()));

        let mut exit_code: i32 = 0;
        let mut stall_fatal = false;
        let mut exploration_fatal = false;

        std::thread::scope(|scope| {
            let collector_handle = scope.spawn(|| {
                let mut line_buffer = LineBuffer::new();
                loop {
                    match rx.blocking_recv() {
                        Ok(chunk) => {
                            let text = String::from_utf8_lossy(&chunk).into_owned();
                            self.log_event(EventPayload::TerminalOutput {
                                data: BASE64.encode(&chunk),
                                text: Some(text.clone()),
                            });
                            sink(&text);
                            if let Ok(mut collected) = output.lock() {
                                collected.push_str(&text);
                            }

                            for line in line_buffer.feed(&text) {
                                if let Some(native_id) =
                                    extract_native_session_id(account.provider, &line)
                                {
                                    *self
                                        .native_session_id
                                        .lock()
                                        .expect("native session id poisoned") = Some(native_id);
                                }
                                for agent_event in parse_stream_line(account.provider, &line) {
                                    match &agent_event {
                                        AgentEvent::Thinking(_) => {
                                            *last_activity.lock().expect("activity lock poisoned") =
                                                ActivityKind::Thinking;
                                        }
                                        AgentEvent::ToolCall { name, args, .. } => {
                                            *last_activity.lock().expect("activity lock poisoned") =
                                                ActivityKind::Command;
                                            if let Some(command) =
                                                args.get("command").and_then(Value::as_str)
                                            {
                                                *last_command.lock().expect("command lock poisoned") =
                                                    command.to_string();
                                            }
                                            let (explore, implement) =
                                                classify_tool_call(name, args);
                                            if explore {
                                                exploration_commands
                                                    .fetch_add(1, Ordering::SeqCst);
                                            }
                                            if implement {
                                                implementation_commands
                                                    .fetch_add(1, Ordering::SeqCst);
                                            }
                                        }
                                        _ => {
                                            *last_activity.lock().expect("activity lock poisoned") = ActivityKind::Other;
                                        }
                                    }
                                    self.log_agent_event(&agent_event);
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                event = "daemon.executor.collector_lagged",
                                skipped = skipped,
                            );
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            // Waiter thread blocks on child exit while this thread watches
            // the clock for stalls and runaway exploration.
            let waiter = scope.spawn(|| self.pty.wait(&stream_id));

            let phase_deadline = Instant::now() + Duration::from_secs(self.timeouts.phase_secs);
            let mut nudged_at: Option<Instant> = None;

            loop {
                if waiter.is_finished() {
                    exit_code = match waiter.join() {
                        Ok(Ok(code)) => code,
                        Ok(Err(e)) => {
                            warn!(event = "daemon.executor.wait_failed", error = %e);
                            1
                        }
                        Err(_) => 1,
                    };
                    break;
                }
                std::thread::sleep(Duration::from_millis(250));

                // Exploration-loop detector
                let explored = exploration_commands.load(Ordering::SeqCst);
                let implemented = implementation_commands.load(Ordering::SeqCst);
                if explored > self.timeouts.exploration_command_limit && implemented == 0 {
                    warn!(
                        event = "daemon.executor.exploration_loop",
                        session_id = %self.session.id,
                        explored = explored,
                    );
                    exploration_fatal = true;
                    let _ = self.pty.terminate(&stream_id);
                    let _ = waiter.join();
                    break;
                }

                if Instant::now() > phase_deadline {
                    warn!(
                        event = "daemon.executor.phase_timeout",
                        session_id = %self.session.id,
                    );
                    stall_fatal = true;
                    let _ = self.pty.terminate(&stream_id);
                    let _ = waiter.join();
                    break;
                }

                // Stall detection over the idle clock
                let Ok(idle) = self.pty.idle_since(&stream_id) else {
                    continue;
                };
                let kind = *last_activity.lock().expect("activity lock poisoned");
                let budget = self.idle_budget(kind);
                if idle > budget {
                    let resumable = self
                        .native_session_id
                        .lock()
                        .expect("native session id poisoned")
                        .is_some();
                    // A nudge buys one fresh idle budget before the stall
                    // becomes fatal
                    let nudge_spent =
                        nudged_at.is_some_and(|t| t.elapsed() <= budget);
                    if nudge_spent {
                        continue;
                    }
                    if nudged_at.is_none() && resumable {
                        nudged_at = Some(Instant::now());
                        let _ = self.pty.send_input(&stream_id, b"continue\n", false);
                        info!(
                            event = "daemon.executor.stall_nudged",
                            session_id = %self.session.id,
                            idle_secs = idle.as_secs(),
                        );
                    } else {
                        let command = last_command.lock().expect("command lock poisoned").clone();
                        error!(
                            event = "daemon.executor.stall_fatal",
                            session_id = %self.session.id,
                            last_event_kind = ?kind,
                            last_command = %command,
                            stall_secs = idle.as_secs(),
                        );
                        stall_fatal = true;
                        let _ = self.pty.terminate(&stream_id);
                        let _ = waiter.join();
                        break;
                    }
                }
            }

            // One final drain: bytes may still be in flight after exit.
            self.pty.remove(&stream_id);
            let _ = collector_handle.join();
        });

        self.task.set_stream_id(None);

        let collected = output.lock().map(|o| o.clone()).unwrap_or_default();

        if self.session.cancel_requested() {
            return (EXIT_CANCELLED, collected);
        }
        if exploration_fatal {
            return (EXIT_EXPLORATION_LOOP, collected);
        }
        if stall_fatal {
            return (EXIT_STALLED, collected);
        }

        (exit_code, collected)
    }
}
