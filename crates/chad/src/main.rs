//! chad CLI: drive the session engine from a terminal.
//!
//! The HTTP layer is a separate concern; this binary wires the engine
//! directly for local use; run a task end-to-end with live output, list
//! accounts, inspect or merge a session worktree, and clean up leftovers.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::{Parser, Subcommand};

use chad_config::ChadConfig;
use chad_daemon::{
    Engine, EngineRequest, EngineResponse, NoUsageProbe, PtyStreamService, SessionManager,
    StreamOptions, TaskExecutor, TaskSpec,
};
use chad_git::GitWorktreeManager;
use chad_paths::ChadPaths;
use chad_protocol::StreamFrame;

#[derive(Parser)]
#[command(name = "chad", about = "Multi-account coding-agent orchestrator")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a coding task in an isolated worktree and stream its output.
    Run {
        /// Natural-language task description.
        task: String,
        /// Project path (defaults to the current directory).
        #[arg(short, long)]
        project: Option<PathBuf>,
        /// Coding account name from the configuration.
        #[arg(short, long)]
        agent: String,
        /// Model override for the coding agent.
        #[arg(short, long)]
        model: Option<String>,
        /// Reasoning effort override for the coding agent.
        #[arg(long)]
        reasoning: Option<String>,
        /// Verification account; enables the verify → revise cycle.
        #[arg(short, long)]
        verifier: Option<String>,
        /// Squash-merge into this branch after a successful run.
        #[arg(long)]
        merge_to: Option<String>,
    },
    /// List configured accounts.
    Accounts,
    /// List sessions with persisted event logs.
    Sessions,
    /// Remove leftover task worktrees from a project.
    Cleanup {
        /// Project path (defaults to the current directory).
        #[arg(short, long)]
        project: Option<PathBuf>,
    },
}

fn build_engine(config: ChadConfig) -> Result<Engine, Box<dyn std::error::Error>> {
    let paths = ChadPaths::resolve()?;
    let sessions = Arc::new(SessionManager::new());
    let (pty, _exit_rx) = PtyStreamService::new();
    let pty = Arc::new(pty);
    let executor = Arc::new(TaskExecutor::new(
        sessions.clone(),
        pty.clone(),
        config,
        paths,
        None,
        Arc::new(NoUsageProbe),
    ));
    Ok(Engine::new(sessions, pty, executor, None))
}

fn resolve_project(project: Option<PathBuf>) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let path = match project {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    Ok(path.canonicalize()?)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    chad_core::init_logging(cli.log_json);

    let exit_code = match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(command: Commands) -> Result<i32, Box<dyn std::error::Error>> {
    match command {
        Commands::Accounts => {
            let config = chad_config::load()?;
            if config.accounts.is_empty() {
                println!("No accounts configured. Add them to ~/.chad/config.toml");
                return Ok(0);
            }
            for account in &config.accounts {
                let role = account
                    .role
                    .map(|r| format!("{r:?}").to_lowercase())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\t{}",
                    account.name,
                    account.provider,
                    account.model.as_deref().unwrap_or("default"),
                    role,
                );
            }
            Ok(0)
        }

        Commands::Sessions => {
            let paths = ChadPaths::resolve()?;
            let sessions = chad_core::EventLog::list_sessions(&paths.log_dir());
            for session in sessions {
                println!("{session}");
            }
            Ok(0)
        }

        Commands::Cleanup { project } => {
            let project = resolve_project(project)?;
            let git = GitWorktreeManager::new(project);
            let cleaned = git.cleanup_orphan_worktrees()?;
            println!("Removed {} worktree(s)", cleaned.len());
            Ok(0)
        }

        Commands::Run {
            task,
            project,
            agent,
            model,
            reasoning,
            verifier,
            merge_to,
        } => {
            let project = resolve_project(project)?;
            let config = chad_config::load()?;
            let engine = build_engine(config)?;

            let EngineResponse::Session { session } = engine.handle(EngineRequest::CreateSession {
                name: None,
                project_path: Some(project.to_string_lossy().into_owned()),
            }) else {
                return Err("failed to create session".into());
            };

            let response = engine.handle(EngineRequest::StartTask {
                session_id: session.id.clone(),
                task: TaskSpec {
                    project_path: project.to_string_lossy().into_owned(),
                    task_description: task,
                    coding_agent: agent,
                    coding_model: model,
                    coding_reasoning: reasoning,
                    terminal_rows: 24,
                    terminal_cols: 80,
                    screenshots: Vec::new(),
                    override_prompt: None,
                    verification_agent: verifier,
                    verification_model: None,
                    verification_reasoning: None,
                },
            });
            let EngineResponse::Task { task } = response else {
                if let EngineResponse::Error { message, .. } = response {
                    return Err(message.into());
                }
                return Err("failed to start task".into());
            };
            println!("session {} task {}", session.id, task.task_id);

            // Stream live output until the task completes
            let mut rx = engine.stream(&session.id, StreamOptions::default())?;
            let mut exit_code = 0;
            let mut stdout = std::io::stdout();
            while let Some(frame) = rx.recv().await {
                match frame {
                    StreamFrame::Terminal { data, .. } => {
                        if let Ok(bytes) = BASE64.decode(data) {
                            let _ = stdout.write_all(&bytes);
                            let _ = stdout.flush();
                        }
                    }
                    StreamFrame::Event { event, .. } => {
                        if let chad_protocol::EventPayload::Milestone {
                            title, summary, ..
                        } = &event.payload
                        {
                            eprintln!("── {title}: {summary}");
                        }
                    }
                    StreamFrame::Complete { exit_code: code, .. } => {
                        exit_code = code;
                        break;
                    }
                    StreamFrame::Error { message, .. } => {
                        eprintln!("stream error: {message}");
                        exit_code = 1;
                        break;
                    }
                    StreamFrame::Ping { .. } => {}
                }
            }

            if exit_code == 0 {
                if let Some(target) = merge_to {
                    let response = engine.handle(EngineRequest::WorktreeMerge {
                        session_id: session.id.clone(),
                        commit_message: None,
                        target_branch: Some(target),
                    });
                    match response {
                        EngineResponse::MergeResult { success: true, .. } => {
                            println!("merged");
                        }
                        EngineResponse::MergeResult { conflicts, .. } => {
                            eprintln!("merge conflicts in {} file(s):", conflicts.len());
                            for conflict in conflicts {
                                eprintln!("  {}", conflict.file_path);
                            }
                            exit_code = 1;
                        }
                        EngineResponse::Error { message, .. } => {
                            eprintln!("merge failed: {message}");
                            exit_code = 1;
                        }
                        _ => {}
                    }
                }
            }

            Ok(exit_code)
        }
    }
}
