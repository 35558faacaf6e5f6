//! Structured diff and conflict types surfaced to consumers.

use serde::{Deserialize, Serialize};

/// A single conflict region inside a file, split at the standard
/// `<<<<<<< / ======= / >>>>>>>` markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictHunk {
    pub file_path: String,
    pub hunk_index: usize,
    /// Lines from the target branch side (`<<<<<<< HEAD`).
    pub original_lines: Vec<String>,
    /// Lines from the task branch side (`>>>>>>> branch`).
    pub incoming_lines: Vec<String>,
    /// Up to three lines preceding the conflict.
    #[serde(default)]
    pub context_before: Vec<String>,
    /// Up to three lines following the conflict.
    #[serde(default)]
    pub context_after: Vec<String>,
    /// 1-based line number of the `<<<<<<<` marker.
    pub start_line: usize,
    /// 1-based line number of the `>>>>>>>` marker.
    pub end_line: usize,
}

/// All conflicts in one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeConflict {
    pub file_path: String,
    pub hunks: Vec<ConflictHunk>,
}

/// Outcome of a squash-merge attempt. Conflicts are a first-class return
/// shape, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    Conflicts(Vec<WorktreeConflict>),
}

/// Tag for a line within a diff hunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffLineKind {
    Added,
    Removed,
    Context,
}

/// A single line in a diff with old/new line numbers where applicable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub content: String,
    pub line_type: DiffLineKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_line_no: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_line_no: Option<usize>,
}

/// A hunk from a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    #[serde(default)]
    pub lines: Vec<DiffLine>,
}

/// Parsed diff for a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub old_path: String,
    pub new_path: String,
    #[serde(default)]
    pub hunks: Vec<DiffHunk>,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub is_binary: bool,
}
