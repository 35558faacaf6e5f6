//! Per-project git worktree management.
//!
//! One manager per project path. Sessions get an isolated worktree on a
//! `chad-task-<session_id>` branch under `<project>/.chad-worktrees/`; the
//! merge path squashes the task branch into the target branch as a single
//! commit, surfacing conflicts as structured data rather than errors.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use chad_paths::ChadPaths;

use crate::cli::{GitOutput, run_git};
use crate::conflicts::{has_conflict_markers, parse_conflict_hunks, resolve_hunk};
use crate::diff::parse_unified_diff;
use crate::errors::GitError;
use crate::types::{FileDiff, MergeOutcome, WorktreeConflict};
use crate::venv::{cleanup_stale_pth_entries, find_main_venv};

/// Stash message marking stashes created by the merge path.
const MERGE_STASH_MESSAGE: &str = "chad-merge-stash";

pub struct GitWorktreeManager {
    project_path: PathBuf,
    worktree_base: PathBuf,
}

impl GitWorktreeManager {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        let project_path: PathBuf = project_path.into();
        let worktree_base = project_path.join(chad_paths::WORKTREE_DIR);
        Self {
            project_path,
            worktree_base,
        }
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    fn git(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        run_git(&self.project_path, args)
    }

    fn git_in(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        run_git(cwd, args)
    }

    /// Worktree path for a session: `<project>/.chad-worktrees/<session_id>`.
    pub fn worktree_path(&self, session_id: &str) -> PathBuf {
        self.worktree_base.join(session_id)
    }

    /// Task branch name for a session: `chad-task-<session_id>`.
    pub fn task_branch(&self, session_id: &str) -> String {
        ChadPaths::task_branch(session_id)
    }

    pub fn worktree_exists(&self, session_id: &str) -> bool {
        self.worktree_path(session_id).exists()
    }

    /// Check if the project path is inside a git repository.
    pub fn is_git_repo(&self) -> bool {
        self.git(&["rev-parse", "--git-dir"])
            .map(|out| out.success())
            .unwrap_or(false)
    }

    /// Name of the main/master branch: `main`, then `master`, else the
    /// current branch.
    pub fn main_branch(&self) -> Result<String, GitError> {
        for name in ["main", "master"] {
            if self.git(&["rev-parse", "--verify", name])?.success() {
                return Ok(name.to_string());
            }
        }
        let current = self.current_branch()?;
        if current.is_empty() {
            Ok("main".to_string())
        } else {
            Ok(current)
        }
    }

    /// Current branch name; empty string in detached HEAD state.
    pub fn current_branch(&self) -> Result<String, GitError> {
        Ok(self
            .git(&["branch", "--show-current"])?
            .stdout
            .trim()
            .to_string())
    }

    /// All local branches with task branches filtered out and the current
    /// branch first.
    pub fn branches(&self) -> Result<Vec<String>, GitError> {
        let out = self.git(&["branch", "--format=%(refname:short)"])?;
        if !out.success() {
            return Ok(vec![self.main_branch()?]);
        }
        let mut branches: Vec<String> = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|b| !b.is_empty() && !b.starts_with(chad_paths::TASK_BRANCH_PREFIX))
            .map(str::to_string)
            .collect();
        let current = self.current_branch()?;
        if let Some(pos) = branches.iter().position(|b| *b == current) {
            let current = branches.remove(pos);
            branches.insert(0, current);
        }
        Ok(branches)
    }

    /// Create an isolated worktree for a session.
    ///
    /// Destroys any stale worktree from a previous run first, branches
    /// `chad-task-<session_id>` from HEAD, and symlinks the project's venv
    /// into the worktree (after pruning stale `.pth` entries) so editable
    /// installs keep resolving.
    ///
    /// Returns the worktree path and the base commit sha.
    pub fn create_worktree(&self, session_id: &str) -> Result<(PathBuf, String), GitError> {
        let worktree_path = self.worktree_path(session_id);
        let branch = self.task_branch(session_id);

        info!(
            event = "git.worktree.create_started",
            session_id = session_id,
            branch = %branch,
            path = %worktree_path.display(),
        );

        if self.worktree_exists(session_id) {
            self.delete_worktree(session_id)?;
        }

        std::fs::create_dir_all(&self.worktree_base)?;

        let head = self.git(&["rev-parse", "HEAD"])?;
        if !head.success() {
            return Err(GitError::OperationFailed {
                message: head.detail("Failed to resolve HEAD"),
            });
        }
        let base_commit = head.stdout.trim().to_string();

        let path_str = worktree_path.to_string_lossy().into_owned();
        let out = self.git(&["worktree", "add", "-b", &branch, &path_str, &base_commit])?;
        if !out.success() {
            return Err(GitError::OperationFailed {
                message: out.detail("git worktree add failed"),
            });
        }

        if let Some(main_venv) = find_main_venv(&self.project_path) {
            if let Some(venv_name) = main_venv.file_name() {
                let worktree_venv = worktree_path.join(venv_name);
                if !worktree_venv.exists() {
                    cleanup_stale_pth_entries(&main_venv, &self.worktree_base, Some(session_id));
                    #[cfg(unix)]
                    if let Err(e) = std::os::unix::fs::symlink(&main_venv, &worktree_venv) {
                        warn!(
                            event = "git.worktree.venv_symlink_failed",
                            session_id = session_id,
                            error = %e,
                        );
                    }
                }
            }
        }

        info!(
            event = "git.worktree.create_completed",
            session_id = session_id,
            base_commit = %base_commit,
        );

        Ok((worktree_path, base_commit))
    }

    /// Delete a session's worktree and its task branch.
    ///
    /// Falls back to `worktree prune` plus recursive directory removal when
    /// `worktree remove --force` fails. Branch deletion always runs; the
    /// branch may exist without the worktree.
    pub fn delete_worktree(&self, session_id: &str) -> Result<(), GitError> {
        let worktree_path = self.worktree_path(session_id);
        let branch = self.task_branch(session_id);

        info!(
            event = "git.worktree.delete_started",
            session_id = session_id,
            path = %worktree_path.display(),
        );

        if worktree_path.exists() {
            let path_str = worktree_path.to_string_lossy().into_owned();
            let out = self.git(&["worktree", "remove", "--force", &path_str])?;
            if !out.success() {
                debug!(
                    event = "git.worktree.remove_fallback",
                    session_id = session_id,
                    stderr = %out.stderr.trim(),
                );
                let _ = self.git(&["worktree", "prune"]);
                std::fs::remove_dir_all(&worktree_path).map_err(|e| {
                    GitError::WorktreeRemovalFailed {
                        path: path_str,
                        message: e.to_string(),
                    }
                })?;
            }
        }

        if let Some(main_venv) = find_main_venv(&self.project_path) {
            cleanup_stale_pth_entries(&main_venv, &self.worktree_base, None);
        }

        let _ = self.git(&["branch", "-D", &branch]);

        info!(
            event = "git.worktree.delete_completed",
            session_id = session_id,
        );

        Ok(())
    }

    /// Reset a worktree to a clean state at the given base commit (or the
    /// main branch when `None`).
    pub fn reset_worktree(
        &self,
        session_id: &str,
        base_commit: Option<&str>,
    ) -> Result<(), GitError> {
        let worktree_path = self.worktree_path(session_id);
        if !worktree_path.exists() {
            return Err(GitError::WorktreeNotFound {
                path: worktree_path.to_string_lossy().into_owned(),
            });
        }

        let target = match base_commit {
            Some(commit) => commit.to_string(),
            None => self.main_branch()?,
        };
        let _ = self.git_in(&worktree_path, &["reset", "--hard", &target])?;
        let _ = self.git_in(&worktree_path, &["clean", "-fd"])?;

        info!(
            event = "git.worktree.reset_completed",
            session_id = session_id,
            target = %target,
        );
        Ok(())
    }

    /// Whether the worktree has uncommitted changes or commits ahead of
    /// the main branch.
    pub fn has_changes(&self, session_id: &str) -> Result<bool, GitError> {
        let worktree_path = self.worktree_path(session_id);
        if !worktree_path.exists() {
            return Ok(false);
        }

        let status = self.git_in(&worktree_path, &["status", "--porcelain"])?;
        if !status.stdout.trim().is_empty() {
            return Ok(true);
        }

        let main = self.main_branch()?;
        let branch = self.task_branch(session_id);
        let range = format!("{main}..{branch}");
        let out = self.git(&["rev-list", "--count", &range])?;
        let ahead: u64 = out.stdout.trim().parse().unwrap_or(0);
        Ok(ahead > 0)
    }

    /// Markdown summary of uncommitted worktree changes.
    ///
    /// Renames can show in porcelain status while producing an empty
    /// `--stat`, so the porcelain output is the fallback body.
    pub fn diff_summary(&self, session_id: &str) -> Result<String, GitError> {
        let worktree_path = self.worktree_path(session_id);
        if !worktree_path.exists() {
            return Ok(String::new());
        }

        let stat = self.git_in(&worktree_path, &["diff", "--stat", "HEAD"])?;
        let stat = stat.stdout.trim().to_string();
        let status = self.git_in(&worktree_path, &["status", "--porcelain"])?;
        let status = status.stdout.trim().to_string();

        if stat.is_empty() && status.is_empty() {
            return Ok(String::new());
        }

        let body = if stat.is_empty() { status } else { stat };
        Ok(format!("**Uncommitted changes:**\n```\n{body}\n```"))
    }

    /// Full unified diff text for uncommitted worktree changes.
    pub fn full_diff(&self, session_id: &str) -> Result<String, GitError> {
        let worktree_path = self.worktree_path(session_id);
        if !worktree_path.exists() {
            return Ok(String::new());
        }
        let out = self.git_in(&worktree_path, &["diff", "HEAD"])?;
        let text = out.stdout.trim().to_string();
        if text.is_empty() {
            Ok("No changes".to_string())
        } else {
            Ok(text)
        }
    }

    /// Structured diff for uncommitted worktree changes, including
    /// untracked files rendered against `/dev/null`.
    pub fn parsed_diff(&self, session_id: &str) -> Result<Vec<FileDiff>, GitError> {
        let worktree_path = self.worktree_path(session_id);
        if !worktree_path.exists() {
            return Ok(Vec::new());
        }

        let mut diff_texts = Vec::new();

        let tracked = self.git_in(&worktree_path, &["diff", "HEAD"])?;
        if !tracked.stdout.trim().is_empty() {
            diff_texts.push(tracked.stdout);
        }

        let untracked = self.git_in(
            &worktree_path,
            &["ls-files", "--others", "--exclude-standard"],
        )?;
        let untracked_files: Vec<String> = untracked
            .stdout
            .lines()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        for rel in &untracked_files {
            let file_path = worktree_path.join(rel);
            if !file_path.exists() {
                continue;
            }
            // Exit code 1 means "differences found" here, so success is ignored
            let out = self.git_in(
                &worktree_path,
                &[
                    "diff",
                    "--no-index",
                    "--",
                    "/dev/null",
                    &file_path.to_string_lossy(),
                ],
            )?;
            if !out.stdout.trim().is_empty() {
                diff_texts.push(out.stdout);
            }
        }

        if diff_texts.is_empty() {
            return Ok(Vec::new());
        }

        let parsed = parse_unified_diff(&diff_texts.join("\n"));

        // Restrict to files that actually show in status or as untracked, so
        // committed-only files never leak into the view.
        let status = self.git_in(&worktree_path, &["status", "--porcelain"])?;
        let mut changed: std::collections::HashSet<String> = status
            .stdout
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| l[3..].trim().to_string())
            .collect();
        changed.extend(untracked_files.iter().cloned());

        let changed_names: std::collections::HashSet<String> = changed
            .iter()
            .filter_map(|p| Path::new(p).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();

        Ok(parsed
            .into_iter()
            .filter(|f| {
                let rel = Path::new(&f.new_path)
                    .strip_prefix(&worktree_path)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| f.new_path.clone());
                let name = Path::new(&f.new_path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                changed.contains(&rel) || changed_names.contains(&name)
            })
            .collect())
    }

    /// Stage and commit all changes in the worktree. An empty index is not
    /// an error; the merge path calls this unconditionally.
    pub fn commit_all_changes(&self, session_id: &str, message: &str) -> Result<(), GitError> {
        let worktree_path = self.worktree_path(session_id);
        if !worktree_path.exists() {
            return Err(GitError::WorktreeNotFound {
                path: worktree_path.to_string_lossy().into_owned(),
            });
        }

        let add = self.git_in(&worktree_path, &["add", "-A"])?;
        if !add.success() {
            return Err(GitError::CommitFailed {
                message: add.detail("git add failed"),
            });
        }

        let staged = self.git_in(&worktree_path, &["diff", "--cached", "--quiet"])?;
        match staged.code {
            0 => return Ok(()), // nothing to commit
            1 => {}
            _ => {
                return Err(GitError::CommitFailed {
                    message: staged.detail("git diff failed"),
                });
            }
        }

        let commit = self.git_in(&worktree_path, &["commit", "-m", message])?;
        if !commit.success() {
            return Err(GitError::CommitFailed {
                message: commit.detail("git commit failed"),
            });
        }
        Ok(())
    }

    // --- Merge stash helpers ---

    fn has_main_uncommitted_changes(&self) -> Result<bool, GitError> {
        let out = self.git(&["status", "--porcelain"])?;
        Ok(!out.stdout.trim().is_empty())
    }

    fn stash_main_changes(&self) -> Result<bool, GitError> {
        if !self.has_main_uncommitted_changes()? {
            return Ok(false);
        }
        let out = self.git(&["stash", "push", "-m", MERGE_STASH_MESSAGE])?;
        Ok(out.success())
    }

    fn pop_stash(&self) -> Result<(), GitError> {
        let out = self.git(&["stash", "pop"])?;
        if !out.success() && out.mentions_conflict() {
            warn!(event = "git.merge.stash_pop_conflict");
        }
        Ok(())
    }

    fn has_merge_stash(&self) -> Result<bool, GitError> {
        let out = self.git(&["stash", "list"])?;
        Ok(out.stdout.contains(MERGE_STASH_MESSAGE))
    }

    fn pop_merge_stash_if_exists(&self) -> Result<(), GitError> {
        if self.has_merge_stash()? {
            self.pop_stash()?;
        }
        Ok(())
    }

    // --- Squash merge ---

    /// Squash-merge a session's task branch into the target branch.
    ///
    /// Commits any uncommitted worktree changes first (throwaway message;
    /// everything squashes into one commit carrying the user's message),
    /// stashes uncommitted changes on the target, checks the target out,
    /// and runs `merge --squash`.
    ///
    /// On conflict the stash stays put; the user resolves first, and
    /// `complete_merge` pops it. Any other failure restores the stash.
    pub fn merge_to_main(
        &self,
        session_id: &str,
        commit_message: Option<&str>,
        target_branch: Option<&str>,
    ) -> Result<MergeOutcome, GitError> {
        let worktree_path = self.worktree_path(session_id);
        let branch = self.task_branch(session_id);
        let merge_target = match target_branch {
            Some(t) => t.to_string(),
            None => self.main_branch()?,
        };

        if !worktree_path.exists() {
            return Err(GitError::WorktreeNotFound {
                path: worktree_path.to_string_lossy().into_owned(),
            });
        }
        if !self.has_changes(session_id)? {
            return Err(GitError::NothingToMerge);
        }

        info!(
            event = "git.merge.started",
            session_id = session_id,
            branch = %branch,
            target = %merge_target,
        );

        self.commit_all_changes(session_id, "WIP")?;

        let stashed = self.stash_main_changes()?;

        let current = self.current_branch()?;
        if current != merge_target {
            let out = self.git(&["checkout", &merge_target])?;
            if !out.success() {
                if stashed {
                    self.pop_stash()?;
                }
                return Err(GitError::CheckoutFailed {
                    branch: merge_target,
                    message: out.detail("Failed to checkout target branch"),
                });
            }
        }

        let final_msg = commit_message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Merge {branch}"));

        let merge = self.git(&["merge", "--squash", &branch])?;
        if !merge.success() {
            if merge.mentions_conflict() {
                let conflicts = self.parse_conflicts()?;
                warn!(
                    event = "git.merge.conflicts",
                    session_id = session_id,
                    files = conflicts.len(),
                );
                // Stash stays put until the conflicts are resolved
                return Ok(MergeOutcome::Conflicts(conflicts));
            }
            if stashed {
                self.pop_stash()?;
            }
            return Err(GitError::MergeFailed {
                message: merge.detail("Merge failed"),
            });
        }

        let commit = self.git(&["commit", "-m", &final_msg])?;
        if !commit.success() {
            let _ = self.git(&["reset", "--hard", "HEAD"]);
            if stashed {
                self.pop_stash()?;
            }
            return Err(GitError::MergeFailed {
                message: commit.detail("Commit failed"),
            });
        }

        if stashed {
            self.pop_stash()?;
        }

        info!(event = "git.merge.completed", session_id = session_id);
        Ok(MergeOutcome::Merged)
    }

    /// Parse conflict markers from every conflicted file in the project.
    pub fn parse_conflicts(&self) -> Result<Vec<WorktreeConflict>, GitError> {
        let out = self.git(&["diff", "--name-only", "--diff-filter=U"])?;
        let mut conflicts = Vec::new();

        for file_path in out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let full_path = self.project_path.join(file_path);
            let Ok(content) = std::fs::read_to_string(&full_path) else {
                continue;
            };
            let hunks = parse_conflict_hunks(file_path, &content);
            if !hunks.is_empty() {
                conflicts.push(WorktreeConflict {
                    file_path: file_path.to_string(),
                    hunks,
                });
            }
        }

        Ok(conflicts)
    }

    /// Resolve one conflict hunk in a file by choosing a side, preserving
    /// other unresolved conflicts in the same file.
    pub fn resolve_conflict(
        &self,
        file_path: &str,
        hunk_index: usize,
        use_incoming: bool,
    ) -> Result<(), GitError> {
        let full_path = self.project_path.join(file_path);
        let content = std::fs::read_to_string(&full_path)?;

        let resolved =
            resolve_hunk(&content, hunk_index, use_incoming).ok_or_else(|| {
                GitError::OperationFailed {
                    message: format!("No conflict hunk {hunk_index} in {file_path}"),
                }
            })?;
        std::fs::write(&full_path, resolved)?;

        // Stage the file once it has no remaining markers
        let remaining = std::fs::read_to_string(&full_path)?;
        if !has_conflict_markers(&remaining) {
            let _ = self.git(&["add", file_path]);
        }
        Ok(())
    }

    /// Resolve all conflicts by choosing one side everywhere, via
    /// `git checkout --ours|--theirs`.
    pub fn resolve_all_conflicts(&self, use_incoming: bool) -> Result<(), GitError> {
        let out = self.git(&["diff", "--name-only", "--diff-filter=U"])?;
        let side = if use_incoming { "--theirs" } else { "--ours" };

        for file_path in out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let _ = self.git(&["checkout", side, file_path]);
            let _ = self.git(&["add", file_path]);
        }
        Ok(())
    }

    /// Whether any unresolved conflicts remain.
    pub fn has_remaining_conflicts(&self) -> Result<bool, GitError> {
        let out = self.git(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(!out.stdout.trim().is_empty())
    }

    fn squash_msg_path(&self) -> PathBuf {
        self.project_path.join(".git").join("SQUASH_MSG")
    }

    fn is_squash_merge_in_progress(&self) -> bool {
        let merge_head = self.project_path.join(".git").join("MERGE_HEAD");
        self.squash_msg_path().exists() && !merge_head.exists()
    }

    fn is_regular_merge_in_progress(&self) -> bool {
        self.project_path.join(".git").join("MERGE_HEAD").exists()
    }

    /// Abort an in-progress merge, squash or regular, then restore the
    /// merge stash.
    pub fn abort_merge(&self) -> Result<(), GitError> {
        if self.is_regular_merge_in_progress() {
            let out = self.git(&["merge", "--abort"])?;
            if !out.success() {
                return Err(GitError::MergeFailed {
                    message: out.detail("merge --abort failed"),
                });
            }
        } else if self.is_squash_merge_in_progress() {
            let out = self.git(&["reset", "--hard", "HEAD"])?;
            if !out.success() {
                return Err(GitError::MergeFailed {
                    message: out.detail("reset failed"),
                });
            }
            let squash_msg = self.squash_msg_path();
            if squash_msg.exists() {
                std::fs::remove_file(squash_msg)?;
            }
        } else {
            return Err(GitError::NoMergeInProgress);
        }

        self.pop_merge_stash_if_exists()?;
        info!(event = "git.merge.aborted");
        Ok(())
    }

    /// Complete the merge after all conflicts are resolved.
    ///
    /// A conflict resolved to no net changes leaves nothing to commit;
    /// that still succeeds; the squash state is cleaned up and the stash
    /// popped without creating a commit.
    pub fn complete_merge(&self, commit_message: Option<&str>) -> Result<(), GitError> {
        let add = self.git(&["add", "-A"])?;
        if !add.success() {
            return Err(GitError::MergeFailed {
                message: add.detail("git add failed"),
            });
        }

        if self.has_remaining_conflicts()? {
            return Err(GitError::ConflictsRemain);
        }

        let staged = self.git(&["diff", "--cached", "--quiet"])?;
        let is_squash = self.is_squash_merge_in_progress();

        if staged.code == 0 {
            if is_squash {
                let squash_msg = self.squash_msg_path();
                if squash_msg.exists() {
                    std::fs::remove_file(squash_msg)?;
                }
            }
            self.pop_merge_stash_if_exists()?;
            return Ok(());
        }

        let commit = if is_squash {
            match commit_message {
                Some(msg) => self.git(&["commit", "-m", msg])?,
                None => self.git(&["commit", "--no-edit"])?,
            }
        } else {
            self.git(&["commit", "--no-edit"])?
        };
        if !commit.success() {
            return Err(GitError::MergeFailed {
                message: commit.detail("Commit failed"),
            });
        }

        self.pop_merge_stash_if_exists()?;
        info!(event = "git.merge.completed");
        Ok(())
    }

    /// Delete worktree and branch after a successful merge.
    pub fn cleanup_after_merge(&self, session_id: &str) -> Result<(), GitError> {
        self.delete_worktree(session_id)
    }

    /// All chad worktrees of this project as `(session_id, path)` pairs.
    pub fn worktree_list(&self) -> Result<Vec<(String, PathBuf)>, GitError> {
        let out = self.git(&["worktree", "list", "--porcelain"])?;
        if !out.success() {
            return Ok(Vec::new());
        }

        let mut worktrees = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let branch_ref_prefix = format!("refs/heads/{}", chad_paths::TASK_BRANCH_PREFIX);

        for line in out.stdout.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch) = line.strip_prefix("branch ") {
                if let Some(session_id) = branch.strip_prefix(&branch_ref_prefix) {
                    if let Some(path) = current_path.clone() {
                        worktrees.push((session_id.to_string(), path));
                    }
                }
            }
        }

        Ok(worktrees)
    }

    /// Remove all chad worktrees of this project. Called on startup to
    /// clean up from previous runs. Returns the removed session ids.
    pub fn cleanup_orphan_worktrees(&self) -> Result<Vec<String>, GitError> {
        let mut cleaned = Vec::new();
        for (session_id, _path) in self.worktree_list()? {
            if self.delete_worktree(&session_id).is_ok() {
                cleaned.push(session_id);
            }
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let out = Command::new("git")
            .current_dir(dir)
            .args(args)
            .output()
            .expect("git must be runnable in tests");
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-b", "main"]);
        git(dir, &["config", "user.email", "test@test.com"]);
        git(dir, &["config", "user.name", "Test User"]);
        fs::write(dir.join("README.md"), "# project\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "initial"]);
    }

    fn commit_count(dir: &Path, branch: &str) -> usize {
        let out = Command::new("git")
            .current_dir(dir)
            .args(["rev-list", "--count", branch])
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).trim().parse().unwrap()
    }

    fn last_commit_message(dir: &Path) -> String {
        let out = Command::new("git")
            .current_dir(dir)
            .args(["log", "-1", "--format=%s"])
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    #[test]
    fn test_is_git_repo() {
        let dir = TempDir::new().unwrap();
        let mgr = GitWorktreeManager::new(dir.path());
        assert!(!mgr.is_git_repo());

        init_repo(dir.path());
        assert!(mgr.is_git_repo());
    }

    #[test]
    fn test_main_branch_prefers_main() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());
        assert_eq!(mgr.main_branch().unwrap(), "main");
    }

    #[test]
    fn test_main_branch_falls_back_to_master() {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "-b", "master"]);
        git(dir.path(), &["config", "user.email", "t@t.com"]);
        git(dir.path(), &["config", "user.name", "T"]);
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "init"]);

        let mgr = GitWorktreeManager::new(dir.path());
        assert_eq!(mgr.main_branch().unwrap(), "master");
    }

    #[test]
    fn test_create_worktree_returns_path_and_base() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        let (path, base) = mgr.create_worktree("sess1").unwrap();
        assert!(path.exists());
        assert_eq!(path, dir.path().join(".chad-worktrees/sess1"));
        assert_eq!(base.len(), 40);
        assert!(mgr.worktree_exists("sess1"));

        // Worktree is on the task branch
        let out = Command::new("git")
            .current_dir(&path)
            .args(["branch", "--show-current"])
            .output()
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&out.stdout).trim(),
            "chad-task-sess1"
        );
    }

    #[test]
    fn test_create_worktree_replaces_stale() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        let (path, _) = mgr.create_worktree("sess1").unwrap();
        fs::write(path.join("stale.txt"), "stale").unwrap();

        let (path2, _) = mgr.create_worktree("sess1").unwrap();
        assert_eq!(path, path2);
        assert!(!path2.join("stale.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_create_worktree_symlinks_venv() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        fs::create_dir_all(dir.path().join(".venv/lib/python3.12/site-packages")).unwrap();

        let mgr = GitWorktreeManager::new(dir.path());
        let (path, _) = mgr.create_worktree("sess1").unwrap();

        let venv_link = path.join(".venv");
        assert!(venv_link.is_symlink());
    }

    #[test]
    fn test_delete_worktree_removes_branch() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        mgr.create_worktree("sess1").unwrap();
        mgr.delete_worktree("sess1").unwrap();

        assert!(!mgr.worktree_exists("sess1"));
        let out = Command::new("git")
            .current_dir(dir.path())
            .args(["branch", "--list", "chad-task-sess1"])
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&out.stdout).trim().is_empty());
    }

    #[test]
    fn test_has_changes_uncommitted() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        let (path, _) = mgr.create_worktree("sess1").unwrap();
        assert!(!mgr.has_changes("sess1").unwrap());

        fs::write(path.join("new.txt"), "content").unwrap();
        assert!(mgr.has_changes("sess1").unwrap());
    }

    #[test]
    fn test_has_changes_committed_ahead() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        let (path, _) = mgr.create_worktree("sess1").unwrap();
        fs::write(path.join("new.txt"), "content").unwrap();
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "work"]);

        // Clean tree but one commit ahead of main
        assert!(mgr.has_changes("sess1").unwrap());
    }

    #[test]
    fn test_diff_summary_and_full_diff() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        let (path, _) = mgr.create_worktree("sess1").unwrap();
        assert_eq!(mgr.diff_summary("sess1").unwrap(), "");
        assert_eq!(mgr.full_diff("sess1").unwrap(), "No changes");

        fs::write(path.join("README.md"), "# project\nchanged\n").unwrap();
        let summary = mgr.diff_summary("sess1").unwrap();
        assert!(summary.contains("**Uncommitted changes:**"));
        assert!(summary.contains("README.md"));

        let diff = mgr.full_diff("sess1").unwrap();
        assert!(diff.contains("+changed"));
    }

    #[test]
    fn test_parsed_diff_includes_untracked() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        let (path, _) = mgr.create_worktree("sess1").unwrap();
        fs::write(path.join("README.md"), "# project\nmore\n").unwrap();
        fs::write(path.join("brand_new.txt"), "fresh\n").unwrap();

        let diffs = mgr.parsed_diff("sess1").unwrap();
        let names: Vec<&str> = diffs
            .iter()
            .map(|d| {
                Path::new(&d.new_path)
                    .file_name()
                    .unwrap()
                    .to_str()
                    .unwrap()
            })
            .collect();
        assert!(names.contains(&"README.md"));
        assert!(names.contains(&"brand_new.txt"));

        let new_file = diffs
            .iter()
            .find(|d| d.new_path.ends_with("brand_new.txt"))
            .unwrap();
        assert!(new_file.is_new);
    }

    #[test]
    fn test_merge_to_main_single_squash_commit() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        let before = commit_count(dir.path(), "main");
        let (path, _) = mgr.create_worktree("sess1").unwrap();
        fs::write(path.join("feature.txt"), "one\n").unwrap();
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "first"]);
        fs::write(path.join("feature.txt"), "one\ntwo\n").unwrap();

        let outcome = mgr
            .merge_to_main("sess1", Some("Add feature"), None)
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);

        // Exactly one new commit with the user's message
        assert_eq!(commit_count(dir.path(), "main"), before + 1);
        assert_eq!(last_commit_message(dir.path()), "Add feature");
        assert_eq!(
            fs::read_to_string(dir.path().join("feature.txt")).unwrap(),
            "one\ntwo\n"
        );

        mgr.cleanup_after_merge("sess1").unwrap();
        assert!(!mgr.worktree_exists("sess1"));
    }

    #[test]
    fn test_merge_no_changes_is_error() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        mgr.create_worktree("sess1").unwrap();
        let err = mgr.merge_to_main("sess1", None, None).unwrap_err();
        assert!(matches!(err, GitError::NothingToMerge));
    }

    #[test]
    fn test_merge_conflict_flow_and_abort() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        let (path, _) = mgr.create_worktree("sess1").unwrap();

        // Task branch edits the line
        fs::write(path.join("README.md"), "# project\nfrom-task\n").unwrap();
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "task edit"]);

        // Main edits the same line
        fs::write(dir.path().join("README.md"), "# project\nfrom-main\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "main edit"]);

        let before = commit_count(dir.path(), "main");
        let outcome = mgr.merge_to_main("sess1", Some("Merge it"), None).unwrap();

        let MergeOutcome::Conflicts(conflicts) = outcome else {
            panic!("expected conflicts");
        };
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].file_path, "README.md");
        let hunk = &conflicts[0].hunks[0];
        assert_eq!(hunk.original_lines, vec!["from-main"]);
        assert_eq!(hunk.incoming_lines, vec!["from-task"]);

        // Merge state stays in progress
        assert!(mgr.has_remaining_conflicts().unwrap());

        // Abort returns main to its pre-merge state
        mgr.abort_merge().unwrap();
        assert!(!mgr.has_remaining_conflicts().unwrap());
        assert_eq!(commit_count(dir.path(), "main"), before);
        assert_eq!(
            fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "# project\nfrom-main\n"
        );
    }

    #[test]
    fn test_merge_conflict_resolve_and_complete() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        let (path, _) = mgr.create_worktree("sess1").unwrap();
        fs::write(path.join("README.md"), "# project\nfrom-task\n").unwrap();
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "task edit"]);
        fs::write(dir.path().join("README.md"), "# project\nfrom-main\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "main edit"]);

        let before = commit_count(dir.path(), "main");
        let outcome = mgr.merge_to_main("sess1", None, None).unwrap();
        assert!(matches!(outcome, MergeOutcome::Conflicts(_)));

        mgr.resolve_conflict("README.md", 0, true).unwrap();
        assert!(!mgr.has_remaining_conflicts().unwrap());

        mgr.complete_merge(Some("Resolved merge")).unwrap();
        assert_eq!(commit_count(dir.path(), "main"), before + 1);
        assert_eq!(last_commit_message(dir.path()), "Resolved merge");
        assert_eq!(
            fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "# project\nfrom-task\n"
        );
    }

    #[test]
    fn test_merge_conflict_resolve_all_incoming() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        let (path, _) = mgr.create_worktree("sess1").unwrap();
        fs::write(path.join("README.md"), "# project\ntask-side\n").unwrap();
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "task edit"]);
        fs::write(dir.path().join("README.md"), "# project\nmain-side\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "main edit"]);

        let outcome = mgr.merge_to_main("sess1", None, None).unwrap();
        assert!(matches!(outcome, MergeOutcome::Conflicts(_)));

        mgr.resolve_all_conflicts(true).unwrap();
        assert!(!mgr.has_remaining_conflicts().unwrap());
        mgr.complete_merge(Some("take task side")).unwrap();
        assert!(
            fs::read_to_string(dir.path().join("README.md"))
                .unwrap()
                .contains("task-side")
        );
    }

    #[test]
    fn test_merge_stash_restored_on_success() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        let (path, _) = mgr.create_worktree("sess1").unwrap();
        fs::write(path.join("feature.txt"), "feature\n").unwrap();

        // Dirty main checkout that must survive the merge
        fs::write(dir.path().join("scratch.txt"), "scratch\n").unwrap();

        let outcome = mgr.merge_to_main("sess1", Some("Add feature"), None).unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert_eq!(
            fs::read_to_string(dir.path().join("scratch.txt")).unwrap(),
            "scratch\n"
        );
    }

    #[test]
    fn test_reset_worktree() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        let (path, base) = mgr.create_worktree("sess1").unwrap();
        fs::write(path.join("junk.txt"), "junk").unwrap();
        fs::write(path.join("README.md"), "modified").unwrap();

        mgr.reset_worktree("sess1", Some(&base)).unwrap();
        assert!(!path.join("junk.txt").exists());
        assert_eq!(
            fs::read_to_string(path.join("README.md")).unwrap(),
            "# project\n"
        );
    }

    #[test]
    fn test_reset_missing_worktree_errors() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());
        assert!(matches!(
            mgr.reset_worktree("ghost", None),
            Err(GitError::WorktreeNotFound { .. })
        ));
    }

    #[test]
    fn test_branches_filters_task_branches() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        git(dir.path(), &["branch", "develop"]);
        mgr.create_worktree("sess1").unwrap();

        let branches = mgr.branches().unwrap();
        assert_eq!(branches[0], "main"); // current branch first
        assert!(branches.contains(&"develop".to_string()));
        assert!(!branches.iter().any(|b| b.starts_with("chad-task-")));
    }

    #[test]
    fn test_worktree_list_and_orphan_cleanup() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        mgr.create_worktree("sess1").unwrap();
        mgr.create_worktree("sess2").unwrap();

        let list = mgr.worktree_list().unwrap();
        let ids: Vec<&str> = list.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"sess1"));
        assert!(ids.contains(&"sess2"));

        let cleaned = mgr.cleanup_orphan_worktrees().unwrap();
        assert_eq!(cleaned.len(), 2);
        assert!(mgr.worktree_list().unwrap().is_empty());
    }

    #[test]
    fn test_commit_all_changes_empty_is_ok() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mgr = GitWorktreeManager::new(dir.path());

        mgr.create_worktree("sess1").unwrap();
        // No changes to commit
        assert!(mgr.commit_all_changes("sess1", "WIP").is_ok());
    }
}
