//! Phase prompt templates and structured-output extraction.
//!
//! Every coding-side phase instructs the agent to finish with a JSON object
//! carrying a `change_summary`; the verification phase asks for a
//! `{passed, summary, issues}` verdict. Extraction tolerates both fenced
//! ```json blocks and raw objects embedded anywhere in terminal output.

use serde::Deserialize;

use chad_protocol::Phase;

use super::types::CommandSpec;

/// Marker the exploration scanner looks for at line start.
pub const EXPLORATION_MARKER: &str = "EXPLORATION_RESULT:";

/// Summary the coding agent emits when it considers the task done.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CodingSummary {
    pub change_summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub completion_status: Option<String>,
}

/// Verdict the verification agent returns.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Build the prompt for a phase run.
pub fn build_prompt(spec: &CommandSpec) -> String {
    if let Some(override_prompt) = &spec.override_prompt {
        return override_prompt.clone();
    }

    match spec.phase {
        Phase::Exploration => exploration_prompt(&spec.task_description),
        Phase::Combined => coding_prompt(&spec.task_description, &spec.screenshots),
        Phase::Continuation => {
            continuation_prompt(&spec.task_description, spec.prior_output.as_deref())
        }
        Phase::Revision => revision_prompt(spec.prior_output.as_deref().unwrap_or_default()),
        Phase::Verification => {
            verification_prompt(&spec.task_description, spec.prior_output.as_deref())
        }
    }
}

fn exploration_prompt(task: &str) -> String {
    format!(
        "Explore this codebase to understand what is needed for the task below. \
         Do not modify any files yet.\n\nTask: {task}\n\n\
         When done, print a single paragraph starting with the exact marker \
         `{EXPLORATION_MARKER}` summarizing what you found."
    )
}

fn coding_prompt(task: &str, screenshots: &[String]) -> String {
    let mut prompt = format!(
        "Complete the following coding task in this repository.\n\nTask: {task}\n"
    );
    if !screenshots.is_empty() {
        prompt.push_str("\nScreenshots for reference:\n");
        for path in screenshots {
            prompt.push_str(&format!("- {path}\n"));
        }
    }
    prompt.push_str(
        "\nWhen the task is complete, print a JSON object with a `change_summary` \
         string describing what changed, a `files_changed` array, and a \
         `completion_status` of \"complete\" or \"partial\".",
    );
    prompt
}

fn continuation_prompt(task: &str, prior_output: Option<&str>) -> String {
    let mut prompt = format!(
        "You were working on this task and exited before finishing:\n\nTask: {task}\n"
    );
    if let Some(output) = prior_output {
        prompt.push_str(&format!(
            "\nYour output so far:\n{}\n",
            tail_chars(output, 4000)
        ));
    }
    prompt.push_str(
        "\nContinue where you left off. When complete, print the JSON object \
         with `change_summary`, `files_changed`, and `completion_status`.",
    );
    prompt
}

fn revision_prompt(feedback: &str) -> String {
    format!(
        "A reviewer checked your changes and found problems:\n\n{feedback}\n\n\
         Fix these issues. When complete, print the JSON object with \
         `change_summary`, `files_changed`, and `completion_status`."
    )
}

fn verification_prompt(task: &str, coding_output: Option<&str>) -> String {
    let mut prompt = format!(
        "You are reviewing another agent's work. DO NOT modify or create any files.\n\n\
         Original task: {task}\n"
    );
    if let Some(output) = coding_output {
        prompt.push_str(&format!(
            "\nThe coding agent reported:\n{}\n",
            tail_chars(output, 4000)
        ));
    }
    prompt.push_str(
        "\nInspect the repository and decide whether the task is actually done. \
         Run read-only checks as needed. Finish by printing a JSON object: \
         {\"passed\": true|false, \"summary\": \"...\", \"issues\": [\"...\"]}.",
    );
    prompt
}

fn tail_chars(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Extract the coding summary JSON from agent output.
///
/// Looks for an object with a `change_summary` key, either inside a fenced
/// ```json block or raw in the stream. The last occurrence wins.
pub fn extract_coding_summary(output: &str) -> Option<CodingSummary> {
    extract_object_with_key(output, "change_summary")
}

/// Extract a verification verdict JSON from agent output.
pub fn extract_verdict(output: &str) -> Option<Verdict> {
    extract_object_with_key(output, "passed")
}

fn extract_object_with_key<T: serde::de::DeserializeOwned>(
    output: &str,
    key: &str,
) -> Option<T> {
    let needle = format!("\"{key}\"");
    let mut result = None;

    let mut search_from = 0;
    while let Some(pos) = output[search_from..].find(&needle) {
        let abs = search_from + pos;
        if let Some(candidate) = enclosing_object(output, abs) {
            if let Ok(parsed) = serde_json::from_str::<T>(candidate) {
                result = Some(parsed);
            }
        }
        search_from = abs + needle.len();
    }

    result
}

/// Find the balanced `{…}` object containing the byte offset `pos`.
///
/// Walks back to candidate opening braces and forward with a small
/// string-aware brace counter.
fn enclosing_object(text: &str, pos: usize) -> Option<&str> {
    let bytes = text.as_bytes();

    // Try opening braces from the nearest one outward so the innermost
    // object containing the key is preferred.
    let mut open_positions: Vec<usize> = Vec::new();
    for (i, &b) in bytes[..pos].iter().enumerate() {
        if b == b'{' {
            open_positions.push(i);
        }
    }

    for &start in open_positions.iter().rev() {
        if let Some(end) = matching_close(bytes, start) {
            if end > pos {
                return Some(&text[start..=end]);
            }
        }
    }
    None
}

fn matching_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
