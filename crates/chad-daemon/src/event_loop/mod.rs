//! Per-session event loop: coding → continuation → verification → revision.
//!
//! The loop blocks its caller while phases run; a background tick worker at
//! 2 Hz forwards queued user messages to the active PTY, scans accumulated
//! output for milestones, and checks usage thresholds every ~10 s. All
//! cross-worker state sits behind per-session locks, never held while
//! performing I/O.

pub mod analyzer;
pub mod usage;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use chad_config::{ActionRule, RuleAction, UsageEvent};
use chad_core::agents::prompts::extract_coding_summary;
use chad_core::events::EventLog;
use chad_protocol::{
    Event, EventPayload, Milestone, MilestoneType, Phase, SessionId, milestone_title,
};

use analyzer::{Detection, OutputAnalyzer};
use usage::ThresholdMonitor;

/// Exit code for a phase terminated by cancellation.
pub const EXIT_CANCELLED: i32 = -1;
/// Exit code for a phase that stalled fatally after one recovery attempt.
pub const EXIT_STALLED: i32 = -2;
/// Exit code for a phase killed by the exploration-loop detector.
pub const EXIT_EXPLORATION_LOOP: i32 = -3;

/// Tick worker period (2 Hz).
const TICK_INTERVAL: Duration = Duration::from_millis(500);
/// Usage thresholds are checked every this many ticks (~10 s).
const USAGE_CHECK_TICKS: u32 = 20;
/// Continuation re-invocations after a clean exit without a summary.
const MAX_CONTINUATION_ATTEMPTS: u32 = 3;

/// One agent child run, as requested from the phase runner.
#[derive(Debug, Clone)]
pub struct PhaseRequest {
    pub phase: Phase,
    pub account: String,
    /// Accumulated output for continuation/verification; verifier feedback
    /// for revision.
    pub prior_output: Option<String>,
    pub override_prompt: Option<String>,
}

/// Runs one agent child to completion.
///
/// The runner streams decoded output chunks into `sink` as they arrive and
/// returns the child's exit code plus the collected output. Negative codes
/// are reserved: [`EXIT_CANCELLED`], [`EXIT_STALLED`],
/// [`EXIT_EXPLORATION_LOOP`].
pub trait PhaseRunner: Send + Sync {
    fn run_phase(&self, request: &PhaseRequest, sink: &(dyn Fn(&str) + Sync)) -> (i32, String);
}

impl<F> PhaseRunner for F
where
    F: Fn(&PhaseRequest, &(dyn Fn(&str) + Sync)) -> (i32, String) + Send + Sync,
{
    fn run_phase(&self, request: &PhaseRequest, sink: &(dyn Fn(&str) + Sync)) -> (i32, String) {
        self(request, sink)
    }
}

pub type UsageFn = Box<dyn Fn() -> Option<f64> + Send + Sync>;

/// Callbacks wiring the loop to its session's PTY and usage sources.
pub struct LoopHooks {
    /// Stop the current child cleanly (idempotent).
    pub terminate: Box<dyn Fn() + Send + Sync>,
    /// Write bytes to the then-current PTY; false when no PTY accepts them.
    pub send_input: Box<dyn Fn(&[u8]) -> bool + Send + Sync>,
    /// Session cancel flag.
    pub cancel_requested: Box<dyn Fn() -> bool + Send + Sync>,
    pub session_usage: Option<UsageFn>,
    pub weekly_usage: Option<UsageFn>,
    pub context_usage: Option<UsageFn>,
}

/// Verifier configuration for the verification loop.
#[derive(Debug, Clone)]
pub struct VerificationSpec {
    pub account: String,
}

/// Static configuration for one loop run.
pub struct LoopConfig {
    pub coding_account: String,
    pub verification: Option<VerificationSpec>,
    pub max_verification_attempts: u32,
    pub rules: Vec<ActionRule>,
    pub override_prompt: Option<String>,
}

/// Action recorded for the task executor to act on after the loop exits.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingAction {
    SwitchProvider {
        target_account: String,
        reason: String,
    },
    AwaitReset {
        reason: String,
    },
}

/// Outcome of a full loop run.
#[derive(Debug)]
pub struct LoopResult {
    pub exit_code: i32,
    pub output: String,
    /// `Some(true/false)` when verification ran to a verdict; `None` when
    /// it never ran or aborted.
    pub verification_passed: Option<bool>,
    pub pending_action: Option<PendingAction>,
    pub cancelled: bool,
}

struct MilestoneStore {
    seq: u64,
    milestones: Vec<Milestone>,
}

pub struct SessionEventLoop {
    session_id: SessionId,
    event_log: Arc<Mutex<EventLog>>,
    runner: Arc<dyn PhaseRunner>,
    hooks: LoopHooks,
    config: LoopConfig,
    analyzer: Mutex<OutputAnalyzer>,
    monitor: Mutex<ThresholdMonitor>,
    milestones: Mutex<MilestoneStore>,
    message_queue: Mutex<VecDeque<String>>,
    running: AtomicBool,
    cancel_handled: AtomicBool,
    pending_action: Mutex<Option<PendingAction>>,
    tick_counter: AtomicU32,
}

impl SessionEventLoop {
    pub fn new(
        session_id: SessionId,
        event_log: Arc<Mutex<EventLog>>,
        runner: Arc<dyn PhaseRunner>,
        hooks: LoopHooks,
        config: LoopConfig,
    ) -> Self {
        let monitor = ThresholdMonitor::new(config.rules.clone());
        Self {
            session_id,
            event_log,
            runner,
            hooks,
            config,
            analyzer: Mutex::new(OutputAnalyzer::new()),
            monitor: Mutex::new(monitor),
            milestones: Mutex::new(MilestoneStore {
                seq: 0,
                milestones: Vec::new(),
            }),
            message_queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            cancel_handled: AtomicBool::new(false),
            pending_action: Mutex::new(None),
            tick_counter: AtomicU32::new(0),
        }
    }

    // ---- Inbound messages ----

    /// Queue a user message for FIFO delivery to the then-current PTY.
    pub fn enqueue_message(&self, content: &str) {
        self.message_queue
            .lock()
            .expect("message queue poisoned")
            .push_back(content.to_string());
        self.log_event(EventPayload::UserMessage {
            content: content.to_string(),
        });
    }

    /// Drain queued messages into the active PTY. A message is dequeued
    /// only once written; on a failed write it returns to the queue head
    /// and draining stops until the next tick.
    pub fn process_messages(&self) {
        loop {
            let msg = {
                let mut queue = self.message_queue.lock().expect("message queue poisoned");
                queue.pop_front()
            };
            let Some(msg) = msg else { break };

            let data = if msg.ends_with('\n') {
                msg.clone()
            } else {
                format!("{msg}\n")
            };

            if !(self.hooks.send_input)(data.as_bytes()) {
                self.message_queue
                    .lock()
                    .expect("message queue poisoned")
                    .push_front(msg);
                break;
            }
        }
    }

    pub fn queued_message_count(&self) -> usize {
        self.message_queue
            .lock()
            .expect("message queue poisoned")
            .len()
    }

    // ---- Milestones ----

    /// Milestones after the given milestone sequence number.
    pub fn milestones(&self, since_seq: u64) -> Vec<Milestone> {
        let store = self.milestones.lock().expect("milestone store poisoned");
        store
            .milestones
            .iter()
            .filter(|m| m.seq > since_seq)
            .cloned()
            .collect()
    }

    pub fn latest_milestone_seq(&self) -> u64 {
        self.milestones
            .lock()
            .expect("milestone store poisoned")
            .seq
    }

    fn emit_milestone(
        &self,
        milestone_type: MilestoneType,
        summary: impl Into<String>,
        details: Map<String, Value>,
    ) {
        let summary = summary.into();
        let title = milestone_title(milestone_type).to_string();

        let milestone_seq = {
            let mut store = self.milestones.lock().expect("milestone store poisoned");
            store.seq += 1;
            let seq = store.seq;
            store.milestones.push(Milestone {
                seq,
                milestone_type,
                title: title.clone(),
                summary: summary.clone(),
                details: details.clone(),
            });
            seq
        };

        info!(
            event = "daemon.loop.milestone",
            session_id = %self.session_id,
            milestone_type = %milestone_type,
            milestone_seq = milestone_seq,
            summary = %summary,
        );

        self.log_event(EventPayload::Milestone {
            milestone_type,
            title,
            summary,
            details,
            milestone_seq,
        });
    }

    fn log_event(&self, payload: EventPayload) -> Option<Event> {
        match self.event_log.lock() {
            Ok(mut log) => match log.append(payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(
                        event = "daemon.loop.event_append_failed",
                        session_id = %self.session_id,
                        error = %e,
                    );
                    None
                }
            },
            Err(_) => None,
        }
    }

    // ---- Output analysis ----

    /// Feed a decoded output chunk into the rolling analysis buffer.
    pub fn feed_output(&self, text: &str) {
        self.analyzer
            .lock()
            .expect("analyzer poisoned")
            .feed(text);
    }

    /// Run the scanners and emit milestones for anything new. Idempotent.
    pub fn analyze_now(&self, finalize: bool) {
        let detections = {
            let mut analyzer = self.analyzer.lock().expect("analyzer poisoned");
            analyzer.analyze(finalize)
        };

        for detection in detections {
            match detection {
                Detection::Exploration { summary } => {
                    self.emit_milestone(MilestoneType::Exploration, summary, Map::new());
                }
                Detection::CodingComplete { summary } => {
                    let mut details = Map::new();
                    if !summary.files_changed.is_empty() {
                        details.insert(
                            "files_changed".to_string(),
                            Value::from(summary.files_changed.clone()),
                        );
                    }
                    if let Some(status) = &summary.completion_status {
                        details.insert(
                            "completion_status".to_string(),
                            Value::from(status.clone()),
                        );
                    }
                    self.emit_milestone(
                        MilestoneType::CodingComplete,
                        summary.change_summary,
                        details,
                    );
                }
                Detection::Limit { kind, summary } => {
                    let mut details = Map::new();
                    details.insert("limit_kind".to_string(), Value::from(kind.as_str()));
                    self.emit_milestone(kind.milestone_type(), summary, details);
                }
            }
        }
    }

    fn accumulated_output(&self) -> String {
        self.analyzer
            .lock()
            .expect("analyzer poisoned")
            .buffer()
            .to_string()
    }

    // ---- Usage thresholds ----

    /// Evaluate usage rules against fresh readings. Called every ~10 s by
    /// the tick worker.
    pub fn run_usage_check(&self) {
        let mut readings: Vec<(UsageEvent, f64)> = Vec::new();
        let sources: [(UsageEvent, &Option<UsageFn>); 3] = [
            (UsageEvent::ContextUsage, &self.hooks.context_usage),
            (UsageEvent::SessionUsage, &self.hooks.session_usage),
            (UsageEvent::WeeklyUsage, &self.hooks.weekly_usage),
        ];
        for (event, source) in sources {
            if let Some(source) = source {
                if let Some(value) = source() {
                    readings.push((event, value));
                }
            }
        }
        if readings.is_empty() {
            return;
        }

        let fired = self
            .monitor
            .lock()
            .expect("threshold monitor poisoned")
            .check(&readings);

        for fired in fired {
            let label = match fired.rule.event {
                UsageEvent::SessionUsage => "Session",
                UsageEvent::WeeklyUsage => "Weekly",
                UsageEvent::ContextUsage => "Context",
            };
            let mut details = Map::new();
            details.insert(
                "metric".to_string(),
                Value::from(fired.rule.event.as_str()),
            );
            details.insert("percentage".to_string(), Value::from(fired.value));
            details.insert("threshold".to_string(), Value::from(fired.rule.threshold));
            self.emit_milestone(
                MilestoneType::UsageThreshold,
                format!("{label} usage reached {:.0}%", fired.value),
                details,
            );

            match fired.rule.action {
                RuleAction::Notify => {}
                RuleAction::SwitchProvider => {
                    if let Some(target) = fired.rule.target_account.clone() {
                        self.set_pending_action(PendingAction::SwitchProvider {
                            target_account: target,
                            reason: format!(
                                "{} reached {:.0}%",
                                fired.rule.event.as_str(),
                                fired.value
                            ),
                        });
                    }
                }
                RuleAction::AwaitReset => {
                    self.set_pending_action(PendingAction::AwaitReset {
                        reason: format!(
                            "{} reached {:.0}%",
                            fired.rule.event.as_str(),
                            fired.value
                        ),
                    });
                }
            }
        }
    }

    /// Record the first pending action and stop the current child. The
    /// terminate hook runs exactly once regardless of how many rules fire.
    fn set_pending_action(&self, action: PendingAction) {
        let mut pending = self.pending_action.lock().expect("pending action poisoned");
        if pending.is_none() {
            info!(
                event = "daemon.loop.pending_action",
                session_id = %self.session_id,
                action = ?action,
            );
            *pending = Some(action);
            (self.hooks.terminate)();
        }
    }

    pub fn pending_action(&self) -> Option<PendingAction> {
        self.pending_action
            .lock()
            .expect("pending action poisoned")
            .clone()
    }

    // ---- Tick worker ----

    /// One tick: forward messages, scan output, poll cancellation, and
    /// periodically check usage.
    pub fn tick_once(&self) {
        self.process_messages();
        self.analyze_now(false);

        if (self.hooks.cancel_requested)() && !self.cancel_handled.swap(true, Ordering::SeqCst) {
            info!(event = "daemon.loop.cancel_observed", session_id = %self.session_id);
            (self.hooks.terminate)();
        }

        let ticks = self.tick_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if ticks % USAGE_CHECK_TICKS == 0 {
            self.run_usage_check();
        }
    }

    // ---- Main state machine ----

    /// Run the full task lifecycle. Blocks until complete.
    ///
    /// The tick worker lives for exactly the duration of the run; a scoped
    /// thread keeps it borrowing `self` without reference counting.
    pub fn run(&self) -> LoopResult {
        self.running.store(true, Ordering::SeqCst);

        std::thread::scope(|scope| {
            let tick_loop = scope.spawn(|| {
                while self.running.load(Ordering::SeqCst) {
                    self.tick_once();
                    std::thread::sleep(TICK_INTERVAL);
                }
            });

            let result = self.run_inner();

            self.running.store(false, Ordering::SeqCst);
            if let Err(e) = tick_loop.join() {
                warn!(event = "daemon.loop.tick_join_failed", error = ?e);
            }

            result
        })
    }

    fn run_inner(&self) -> LoopResult {
        info!(event = "daemon.loop.coding_started", session_id = %self.session_id);

        let sink = |text: &str| self.feed_output(text);

        let request = PhaseRequest {
            phase: Phase::Combined,
            account: self.config.coding_account.clone(),
            prior_output: None,
            override_prompt: self.config.override_prompt.clone(),
        };
        let (mut exit_code, mut output) = self.runner.run_phase(&request, &sink);
        // Final scan to catch output that arrived just before exit
        self.analyze_now(true);

        if exit_code < 0 {
            return self.finish(exit_code, output, None);
        }

        // Continuation: clean exit without a completion summary
        let mut summary = extract_coding_summary(&output);
        if summary.is_none() && exit_code == 0 && self.pending_action().is_none() {
            for attempt in 1..=MAX_CONTINUATION_ATTEMPTS {
                debug!(
                    event = "daemon.loop.continuation_started",
                    session_id = %self.session_id,
                    attempt = attempt,
                );
                let request = PhaseRequest {
                    phase: Phase::Continuation,
                    account: self.config.coding_account.clone(),
                    prior_output: Some(output.clone()),
                    override_prompt: None,
                };
                let (cont_exit, cont_output) = self.runner.run_phase(&request, &sink);
                self.analyze_now(true);
                output.push('\n');
                output.push_str(&cont_output);

                if cont_exit < 0 {
                    return self.finish(cont_exit, output, None);
                }

                summary = extract_coding_summary(&output);
                if summary.is_some() || cont_exit != 0 {
                    exit_code = cont_exit;
                    break;
                }
            }
        }

        if (self.hooks.cancel_requested)() {
            return self.finish(EXIT_CANCELLED, output, None);
        }

        // A quota/usage handover preempts verification
        if self.pending_action().is_some() {
            return self.finish(exit_code, output, None);
        }

        let mut verification_passed = None;
        if exit_code == 0 {
            if let Some(vspec) = self.config.verification.clone() {
                verification_passed = self.run_verification_loop(&mut output, &vspec, &sink);
            }
        }

        self.finish(exit_code, output, verification_passed)
    }

    fn run_verification_loop(
        &self,
        output: &mut String,
        vspec: &VerificationSpec,
        sink: &(dyn Fn(&str) + Sync),
    ) -> Option<bool> {
        for attempt in 1..=self.config.max_verification_attempts {
            let mut details = Map::new();
            details.insert("attempt".to_string(), Value::from(attempt));
            self.emit_milestone(
                MilestoneType::VerificationStarted,
                format!("Attempt {attempt}"),
                details,
            );

            let request = PhaseRequest {
                phase: Phase::Verification,
                account: vspec.account.clone(),
                prior_output: Some(output.clone()),
                override_prompt: None,
            };
            let (verify_exit, verify_output) = self.runner.run_phase(&request, sink);

            if verify_exit < 0 {
                self.emit_milestone(
                    MilestoneType::VerificationFailed,
                    "Verification aborted",
                    Map::new(),
                );
                return None;
            }

            let Some(verdict) = chad_core::agents::extract_verdict(&verify_output) else {
                // No verdict; the verifier could not be driven to an answer
                self.log_event(EventPayload::VerificationAttempt {
                    attempt_number: attempt,
                    passed: false,
                    summary: "Verification aborted".to_string(),
                    issues: Vec::new(),
                });
                self.emit_milestone(
                    MilestoneType::VerificationFailed,
                    "Verification aborted",
                    Map::new(),
                );
                return None;
            };

            self.log_event(EventPayload::VerificationAttempt {
                attempt_number: attempt,
                passed: verdict.passed,
                summary: verdict.summary.clone(),
                issues: verdict.issues.clone(),
            });

            if verdict.passed {
                self.emit_milestone(MilestoneType::VerificationPassed, verdict.summary, Map::new());
                return Some(true);
            }

            self.emit_milestone(
                MilestoneType::VerificationFailed,
                verdict.summary.clone(),
                Map::new(),
            );

            if attempt < self.config.max_verification_attempts {
                self.emit_milestone(
                    MilestoneType::RevisionStarted,
                    "Sending feedback to coding agent",
                    Map::new(),
                );

                let mut feedback = verdict.summary.clone();
                for issue in &verdict.issues {
                    feedback.push_str(&format!("\n- {issue}"));
                }
                let request = PhaseRequest {
                    phase: Phase::Revision,
                    account: self.config.coding_account.clone(),
                    prior_output: Some(feedback),
                    override_prompt: None,
                };
                let (revision_exit, revision_output) = self.runner.run_phase(&request, sink);
                self.analyze_now(true);
                output.push('\n');
                output.push_str(&revision_output);

                if revision_exit < 0 {
                    return None;
                }
            }
        }

        Some(false)
    }

    fn finish(
        &self,
        exit_code: i32,
        output: String,
        verification_passed: Option<bool>,
    ) -> LoopResult {
        let cancelled = (self.hooks.cancel_requested)();
        let exit_code = if cancelled && exit_code >= 0 {
            EXIT_CANCELLED
        } else {
            exit_code
        };

        // Prefer the full analysis buffer: it includes every phase's bytes
        let buffered = self.accumulated_output();
        let output = if buffered.len() >= output.len() {
            buffered
        } else {
            output
        };

        LoopResult {
            exit_code,
            output,
            verification_passed,
            pending_action: self.pending_action(),
            cancelled,
        }
    }
}
