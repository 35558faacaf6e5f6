//! Milestone detection over accumulated agent output.
//!
//! Scanners are idempotent: each tracks what it already emitted, so
//! re-analyzing the same buffer any number of times produces each distinct
//! detection at most once.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use chad_core::agents::prompts::{CodingSummary, EXPLORATION_MARKER, extract_coding_summary};
use chad_core::quota::{detect_limit, extract_limit_summary};
use chad_protocol::LimitKind;

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07]*\x07").expect("static regex"));

/// Lines of terminal banner metadata, never part of an exploration summary.
static METADATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(workdir|model|provider|sandbox|approval|session|tokens used):").expect("static regex")
});

/// Strip ANSI escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Something the analyzer found in the buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Exploration { summary: String },
    CodingComplete { summary: CodingSummary },
    Limit { kind: LimitKind, summary: String },
}

/// Incremental scanner over the rolling output buffer.
#[derive(Default)]
pub struct OutputAnalyzer {
    buffer: String,
    emitted_explorations: HashSet<String>,
    coding_complete_detected: bool,
    limit_detected: bool,
}

impl OutputAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decoded output chunk.
    pub fn feed(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn coding_complete(&self) -> bool {
        self.coding_complete_detected
    }

    pub fn limit_detected(&self) -> bool {
        self.limit_detected
    }

    /// Scan the buffer. With `finalize` the trailing partial line is
    /// processed too (used once at end of phase; bytes may stop mid-line).
    pub fn analyze(&mut self, finalize: bool) -> Vec<Detection> {
        let mut detections = Vec::new();

        for summary in self.scan_explorations(finalize) {
            if self.emitted_explorations.insert(summary.clone()) {
                detections.push(Detection::Exploration { summary });
            }
        }

        if !self.limit_detected {
            if let Some(kind) = detect_limit(&self.buffer) {
                self.limit_detected = true;
                let summary = extract_limit_summary(&self.buffer, kind);
                detections.push(Detection::Limit { kind, summary });
            }
        }

        if !self.coding_complete_detected {
            if let Some(summary) = extract_coding_summary(&self.buffer) {
                self.coding_complete_detected = true;
                detections.push(Detection::CodingComplete { summary });
            }
        }

        detections
    }

    /// Find exploration paragraphs: full lines starting with the marker,
    /// captured through the end of the paragraph. A paragraph still open
    /// at the end of the buffer is held until more output arrives, unless
    /// finalizing.
    fn scan_explorations(&self, finalize: bool) -> Vec<String> {
        let stripped = strip_ansi(&self.buffer);
        let ends_complete = stripped.ends_with('\n');
        let lines: Vec<&str> = stripped.lines().collect();

        let mut results = Vec::new();
        let mut i = 0usize;
        while i < lines.len() {
            let line = lines[i].trim_start();
            let Some(rest) = line.strip_prefix(EXPLORATION_MARKER) else {
                i += 1;
                continue;
            };

            // A partial marker line (no newline yet) is held: more of it
            // may still be in flight.
            let is_last_line = i == lines.len() - 1;
            if is_last_line && !ends_complete && !finalize {
                break;
            }

            let mut parts: Vec<String> = Vec::new();
            let first = rest.trim();
            if !first.is_empty() && !METADATA_RE.is_match(first) {
                parts.push(first.to_string());
            }

            let mut j = i + 1;
            let mut closed = false;
            while j < lines.len() {
                let cont = lines[j].trim();
                if cont.is_empty() {
                    closed = true;
                    break;
                }
                if cont.starts_with(EXPLORATION_MARKER) {
                    closed = true;
                    break;
                }
                if METADATA_RE.is_match(cont) {
                    closed = true;
                    break;
                }
                let cont_is_last = j == lines.len() - 1;
                if cont_is_last && !ends_complete && !finalize {
                    // Paragraph still streaming
                    break;
                }
                parts.push(cont.to_string());
                j += 1;
            }
            if j >= lines.len() {
                // Paragraph ran to end of buffer
                closed = ends_complete || finalize;
            }

            if closed && !parts.is_empty() {
                results.push(parts.join("\n"));
            }
            i = j.max(i + 1);
        }

        results
    }
}
