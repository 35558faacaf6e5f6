//! Unified diff parsing into structured [`FileDiff`] values.

use regex::Regex;
use std::sync::LazyLock;

use crate::types::{DiffHunk, DiffLine, DiffLineKind, FileDiff};

static DIFF_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^diff --git a/(.*) b/(.*)$").expect("static regex"));

static HUNK_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("static regex"));

/// Parse unified diff output into structured per-file diffs.
///
/// Tolerates concatenated diffs from several git invocations (tracked diff
/// plus per-untracked-file `--no-index` diffs).
pub fn parse_unified_diff(diff_text: &str) -> Vec<FileDiff> {
    let mut files: Vec<FileDiff> = Vec::new();
    let mut current_file: Option<FileDiff> = None;
    let mut old_line_no = 0usize;
    let mut new_line_no = 0usize;

    for line in diff_text.split('\n') {
        if let Some(caps) = DIFF_HEADER_RE.captures(line) {
            if let Some(file) = current_file.take() {
                files.push(file);
            }
            current_file = Some(FileDiff {
                old_path: caps[1].to_string(),
                new_path: caps[2].to_string(),
                hunks: Vec::new(),
                is_new: false,
                is_deleted: false,
                is_binary: false,
            });
            continue;
        }

        let Some(file) = current_file.as_mut() else {
            continue;
        };

        if line.starts_with("new file") {
            file.is_new = true;
        } else if line.starts_with("deleted file") {
            file.is_deleted = true;
        } else if line.starts_with("Binary files") {
            file.is_binary = true;
        }

        if let Some(caps) = HUNK_HEADER_RE.captures(line) {
            let old_start: usize = caps[1].parse().unwrap_or(0);
            let old_count: usize = caps.get(2).map_or(1, |m| m.as_str().parse().unwrap_or(1));
            let new_start: usize = caps[3].parse().unwrap_or(0);
            let new_count: usize = caps.get(4).map_or(1, |m| m.as_str().parse().unwrap_or(1));

            file.hunks.push(DiffHunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines: Vec::new(),
            });
            old_line_no = old_start;
            new_line_no = new_start;
            continue;
        }

        let Some(hunk) = file.hunks.last_mut() else {
            continue;
        };

        if let Some(content) = line.strip_prefix('+') {
            if line.starts_with("+++") {
                continue;
            }
            hunk.lines.push(DiffLine {
                content: content.to_string(),
                line_type: DiffLineKind::Added,
                old_line_no: None,
                new_line_no: Some(new_line_no),
            });
            new_line_no += 1;
        } else if let Some(content) = line.strip_prefix('-') {
            if line.starts_with("---") {
                continue;
            }
            hunk.lines.push(DiffLine {
                content: content.to_string(),
                line_type: DiffLineKind::Removed,
                old_line_no: Some(old_line_no),
                new_line_no: None,
            });
            old_line_no += 1;
        } else if let Some(content) = line.strip_prefix(' ') {
            hunk.lines.push(DiffLine {
                content: content.to_string(),
                line_type: DiffLineKind::Context,
                old_line_no: Some(old_line_no),
                new_line_no: Some(new_line_no),
            });
            old_line_no += 1;
            new_line_no += 1;
        }
    }

    if let Some(file) = current_file {
        files.push(file);
    }

    files
}
