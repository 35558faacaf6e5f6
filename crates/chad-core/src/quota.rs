//! Quota and rate-limit detection over agent output.
//!
//! The coding agent edits source files that may literally contain quota
//! error strings, so detection runs over the tail of recent output only;
//! scanning the whole buffer is a defect, not a tuning choice.
//!
//! JavaScript error-object dumps (`[Symbol(...)]`, `[object Object]`,
//! `TypeError:`) are never treated as quota indicators and never selected
//! as display summaries.

use std::sync::LazyLock;

use regex::RegexSet;

use chad_protocol::{LimitKind, milestone_title};

/// How much of the output tail is scanned, in bytes.
pub const TAIL_BYTES: usize = 500;

struct KindPatterns {
    kind: LimitKind,
    set: RegexSet,
}

fn build_set(patterns: &[&str]) -> RegexSet {
    RegexSet::new(patterns.iter().map(|p| format!("(?i){p}"))).expect("static regex set")
}

/// Pattern groups are ordered: the first matching group classifies the
/// output. More specific kinds come before generic ones.
static PATTERN_GROUPS: LazyLock<Vec<KindPatterns>> = LazyLock::new(|| {
    vec![
        KindPatterns {
            kind: LimitKind::WeeklyLimit,
            set: build_set(&[
                r"weekly\s+limit",
                r"weekly\s+usage\s+limit",
                r"\bresets\b.*\bweek",
            ]),
        },
        KindPatterns {
            kind: LimitKind::SessionLimit,
            set: build_set(&[
                r"you.?ve\s+hit\s+your\s+limit",
                r"session\s+limit\s+reached",
                r"\b5-hour\s+limit\b",
                r"\busage\s+limit\s+reached\b",
                r"\busage\s+limit\s+exceeded\b",
            ]),
        },
        KindPatterns {
            kind: LimitKind::RateLimit,
            set: build_set(&[
                r"\brate_limit_exceeded\b",
                r"\bratelimitexceeded\b",
                r"rate\s+limit\s+exceeded",
                r"\btoo\s+many\s+requests\b",
                r"429\s+too\s+many\s+requests",
                r"error\s+429\b",
                r"api\s+is\s+overloaded",
            ]),
        },
        KindPatterns {
            kind: LimitKind::Billing,
            set: build_set(&[
                r"\binsufficientquota\b",
                r"\binsufficient_quota\b",
                r"\binsufficient\s+quota\b",
                r"\bbilling_hard_limit_reached\b",
                r"\bbilling\s+limit\s+(exceeded|reached)\b",
                r"\bpayment\s+required\b",
                r"\binsufficient\s+credits?\b",
                r"\binsufficient\s+funds\b",
                r"\bout\s+of\s+credits?\b",
                r"\bcredits?\s+exhausted\b",
                r"\bcredit_balance\b.*\binsufficient\b",
                r"\baccount\s+(has\s+been\s+)?(suspended|disabled)\b",
            ]),
        },
        KindPatterns {
            kind: LimitKind::Resource,
            set: build_set(&[
                r"\bRESOURCE_EXHAUSTED\b",
                r"\bresource\s+exhausted\b",
                r"quota\s+exceeded\s+for\s+(project|quota)",
                r"\bquota\s+exceeded\b",
                r"\bquota\s+has\s+been\s+exceeded\b",
                r"you\s+exceeded\s+your\s+current\s+quota",
                r"you\s+have\s+exceeded\s+your\s+(rate|usage)\s+limit",
            ]),
        },
    ]
});

/// Truncate output to its last [`TAIL_BYTES`] bytes on a char boundary.
pub fn output_tail(output: &str) -> &str {
    if output.len() <= TAIL_BYTES {
        return output;
    }
    let mut start = output.len() - TAIL_BYTES;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}

/// Classify the tail of `output` as a quota/limit indication.
///
/// Returns `None` when the tail is clean; matches anywhere earlier in the
/// buffer are deliberately ignored.
pub fn detect_limit(output: &str) -> Option<LimitKind> {
    let tail = output_tail(output);
    for group in PATTERN_GROUPS.iter() {
        if group.set.is_match(tail) {
            return Some(group.kind);
        }
    }
    None
}

/// Whether a line looks like a dumped JavaScript error object rather than a
/// human-readable message.
fn is_js_error_line(line: &str) -> bool {
    line.contains("[Symbol(") || line.contains("[object Object]") || line.contains("TypeError:")
}

const SUMMARY_KEYWORDS: [&str; 5] = ["quota", "credit", "exceeded", "insufficient", "limit"];

/// Extract a display summary for a detected limit from the output tail.
///
/// Prefers the last line carrying a quota-related keyword; falls back to
/// the last meaningful line; JS error-object lines are always excluded.
pub fn extract_limit_summary(output: &str, kind: LimitKind) -> String {
    let tail = output_tail(output);

    let mut last_meaningful: Option<&str> = None;
    let mut last_keyword: Option<&str> = None;

    for line in tail.lines() {
        let stripped = line.trim();
        if stripped.len() <= 10 || is_js_error_line(stripped) {
            continue;
        }
        last_meaningful = Some(stripped);
        let lower = stripped.to_lowercase();
        if SUMMARY_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            last_keyword = Some(stripped);
        }
    }

    if let Some(line) = last_keyword.or(last_meaningful) {
        return line.to_string();
    }

    format!(
        "{} - quota exhausted",
        milestone_title(kind.milestone_type())
    )
}
