//! Virtualenv sharing between the main checkout and task worktrees.
//!
//! Worktrees symlink the project's venv so editable installs keep resolving
//! without a reinstall. Shared venvs accumulate `.pth` entries pointing at
//! worktrees; stale or conflicting entries make the interpreter import from
//! the wrong worktree, so they are pruned before each symlink.

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

/// Find the main project's virtual environment directory.
///
/// Only actual directories count; a symlinked venv would create circular
/// references once worktrees link back to it.
pub fn find_main_venv(project_path: &Path) -> Option<PathBuf> {
    for name in [".venv", "venv"] {
        let candidate = project_path.join(name);
        if candidate.is_dir() && !candidate.is_symlink() {
            return Some(candidate);
        }
    }
    None
}

/// Remove stale or conflicting worktree paths from the venv's `.pth` files.
///
/// Entries are removed when the referenced worktree no longer exists, or
/// when it differs from `current_worktree_id`. Returns the number of
/// removed entries.
pub fn cleanup_stale_pth_entries(
    venv_path: &Path,
    worktree_base: &Path,
    current_worktree_id: Option<&str>,
) -> usize {
    let mut removed = 0usize;

    let Ok(pattern) = Regex::new(&format!(
        r"{}/([0-9a-fA-F-]+)/src",
        regex::escape(&worktree_base.to_string_lossy())
    )) else {
        return 0;
    };

    let site_packages = match find_site_packages(venv_path) {
        Some(dirs) => dirs,
        None => return 0,
    };

    for sp in site_packages {
        let Ok(entries) = std::fs::read_dir(&sp) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pth") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };

            let mut new_lines: Vec<&str> = Vec::new();
            let mut modified = false;
            for line in content.lines() {
                if let Some(caps) = pattern.captures(line) {
                    let worktree_id = &caps[1];
                    let worktree_path = worktree_base.join(worktree_id);
                    let conflicting =
                        current_worktree_id.is_some_and(|cur| cur != worktree_id);
                    if !worktree_path.exists() || conflicting {
                        removed += 1;
                        modified = true;
                        continue;
                    }
                }
                new_lines.push(line);
            }

            if modified {
                let new_content = if new_lines.is_empty() {
                    String::new()
                } else {
                    format!("{}\n", new_lines.join("\n"))
                };
                if std::fs::write(&path, new_content).is_err() {
                    continue;
                }
                debug!(
                    event = "git.venv.pth_cleaned",
                    path = %path.display(),
                    removed = removed,
                );
            }
        }
    }

    removed
}

fn find_site_packages(venv_path: &Path) -> Option<Vec<PathBuf>> {
    let lib = venv_path.join("lib");
    let entries = std::fs::read_dir(&lib).ok()?;
    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("python") {
            let sp = entry.path().join("site-packages");
            if sp.is_dir() {
                dirs.push(sp);
            }
        }
    }
    Some(dirs)
}
