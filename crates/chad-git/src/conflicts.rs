//! Conflict-marker parsing and single-hunk resolution.
//!
//! Operates on file text containing standard `<<<<<<< / ======= / >>>>>>>`
//! markers. Parsing and resolution are pure functions over the content; the
//! manager handles reading and writing the files.

use crate::types::ConflictHunk;

/// Parse all conflict hunks from file content.
///
/// Each hunk records both sides plus up to three lines of surrounding
/// context and the 1-based marker line numbers in the merged file.
pub fn parse_conflict_hunks(file_path: &str, content: &str) -> Vec<ConflictHunk> {
    let lines: Vec<&str> = content.split('\n').collect();
    let mut hunks = Vec::new();
    let mut hunk_index = 0usize;
    let mut i = 0usize;

    while i < lines.len() {
        if lines[i].starts_with("<<<<<<<") {
            let start_line = i + 1;
            let context_before: Vec<String> = lines[i.saturating_sub(3)..i]
                .iter()
                .map(|s| s.to_string())
                .collect();

            let mut original_lines = Vec::new();
            i += 1;
            while i < lines.len() && !lines[i].starts_with("=======") {
                original_lines.push(lines[i].to_string());
                i += 1;
            }

            let mut incoming_lines = Vec::new();
            i += 1; // skip =======
            while i < lines.len() && !lines[i].starts_with(">>>>>>>") {
                incoming_lines.push(lines[i].to_string());
                i += 1;
            }

            let end_line = i + 1;
            let context_after: Vec<String> = lines
                [(i + 1).min(lines.len())..(i + 4).min(lines.len())]
                .iter()
                .map(|s| s.to_string())
                .collect();

            hunks.push(ConflictHunk {
                file_path: file_path.to_string(),
                hunk_index,
                original_lines,
                incoming_lines,
                context_before,
                context_after,
                start_line,
                end_line,
            });
            hunk_index += 1;
        }
        i += 1;
    }

    hunks
}

/// Rewrite content choosing one side of a single conflict hunk.
///
/// Other hunks are left conflicted so they can be resolved independently.
/// Returns `None` when the hunk index does not exist.
pub fn resolve_hunk(content: &str, hunk_index: usize, use_incoming: bool) -> Option<String> {
    let lines: Vec<&str> = content.split('\n').collect();
    let mut result_lines: Vec<String> = Vec::new();
    let mut current_hunk = 0usize;
    let mut resolved = false;
    let mut i = 0usize;

    while i < lines.len() {
        if lines[i].starts_with("<<<<<<<") {
            if current_hunk == hunk_index {
                let mut original_lines = Vec::new();
                let mut incoming_lines = Vec::new();

                i += 1;
                while i < lines.len() && !lines[i].starts_with("=======") {
                    original_lines.push(lines[i].to_string());
                    i += 1;
                }

                i += 1; // skip =======
                while i < lines.len() && !lines[i].starts_with(">>>>>>>") {
                    incoming_lines.push(lines[i].to_string());
                    i += 1;
                }

                let chosen = if use_incoming {
                    incoming_lines
                } else {
                    original_lines
                };
                result_lines.extend(chosen);
                resolved = true;
                current_hunk += 1;
            } else {
                // Keep this hunk as-is (still conflicted)
                result_lines.push(lines[i].to_string());
                current_hunk += 1;
            }
        } else {
            result_lines.push(lines[i].to_string());
        }
        i += 1;
    }

    resolved.then(|| result_lines.join("\n"))
}

/// Whether content still contains any conflict markers.
pub fn has_conflict_markers(content: &str) -> bool {
    content
        .split('\n')
        .any(|line| line.starts_with("<<<<<<<") || line.starts_with(">>>>>>>"))
}
