//! Thin wrapper over the local `git` executable.
//!
//! Every worktree operation shells out to git and examines captured
//! stdout/stderr plus the exit code. The CLI inherits the user's credential
//! helpers and hooks, so no auth code lives here.

use std::path::Path;
use std::process::Command;

use crate::errors::GitError;

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// First non-empty of stderr/stdout, trimmed, for error detail.
    pub fn detail(&self, fallback: &str) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        fallback.to_string()
    }

    /// Whether stdout or stderr mentions a merge conflict.
    pub fn mentions_conflict(&self) -> bool {
        self.stdout.contains("CONFLICT") || self.stderr.contains("CONFLICT")
    }
}

/// Run `git <args>` in `cwd`, capturing output.
pub fn run_git(cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
    let output = Command::new("git")
        .current_dir(cwd)
        .args(args)
        .output()
        .map_err(|e| GitError::OperationFailed {
            message: format!("Failed to execute git in {}: {}", cwd.display(), e),
        })?;

    Ok(GitOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
