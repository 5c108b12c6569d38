//! Completion detection over assistant replies.
//!
//! The assistant signals progress with two optional markers:
//!
//! - a directive, `[[STATUS: IN_PROGRESS]]`, `[[STATUS: COMPLETE]]` or `[[STATUS: ESCALATE]]`
//!   (case-insensitive, whitespace tolerant)
//! - an outcome block, a fenced code block tagged `assessment` holding a JSON object with
//!   `status`, `risk_level`, `probability`, `summary`, `recommendation` and `conditions`
//!
//! Missing, unknown or conflicting markers resolve to [`CompletionStatus::InProgress`]. A false
//! completion would create and hash clinical records nobody asked for, so the detector never
//! guesses towards completion.

use fhir::RiskLevel;
use serde::{Deserialize, Serialize};
use std::fmt;

const DIRECTIVE_OPEN: &str = "[[";
const DIRECTIVE_CLOSE: &str = "]]";
const DIRECTIVE_KEY: &str = "STATUS";
const FENCE: &str = "```";
const OUTCOME_TAG: &str = "assessment";
const RISK_LEVEL_LABEL: &str = "risk level";

/// Where an assessment stands after a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    InProgress,
    Complete,
    Escalate,
}

impl CompletionStatus {
    /// Parses a marker value such as `complete`, `IN_PROGRESS` or `in-progress`.
    pub fn parse(value: &str) -> Option<Self> {
        let normalised = value.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match normalised.as_str() {
            "IN_PROGRESS" => Some(CompletionStatus::InProgress),
            "COMPLETE" | "COMPLETED" => Some(CompletionStatus::Complete),
            "ESCALATE" | "ESCALATED" => Some(CompletionStatus::Escalate),
            _ => None,
        }
    }

    /// True when records should be synthesised for this turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CompletionStatus::Complete | CompletionStatus::Escalate)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::InProgress => "IN_PROGRESS",
            CompletionStatus::Complete => "COMPLETE",
            CompletionStatus::Escalate => "ESCALATE",
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured outcome carried in an `assessment` block.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractedOutcome {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl ExtractedOutcome {
    /// Risk level stated by the outcome, from `risk_level` or else from `probability`.
    pub fn risk_level(&self) -> Option<RiskLevel> {
        self.risk_level
            .as_deref()
            .and_then(RiskLevel::parse)
            .or_else(|| self.probability.and_then(RiskLevel::from_probability))
    }
}

/// An assistant reply after marker extraction.
#[derive(Clone, Debug, PartialEq)]
pub struct AssistantReply {
    /// Reply text with directives and the outcome block removed.
    pub text: String,
    pub completion_status: CompletionStatus,
    pub extracted_outcome: Option<ExtractedOutcome>,
}

impl AssistantReply {
    /// Risk level determinable from this reply, if any.
    ///
    /// Order of precedence: the outcome's `risk_level`, its `probability`, then a
    /// `Risk level: <word>` line in the reply text.
    pub fn risk_level(&self) -> Option<RiskLevel> {
        self.extracted_outcome
            .as_ref()
            .and_then(ExtractedOutcome::risk_level)
            .or_else(|| risk_level_from_text(&self.text))
    }
}

/// Parse a raw assistant reply into text, completion status and extracted outcome.
pub fn detect_completion(raw: &str) -> AssistantReply {
    let (without_block, outcome_json) = take_outcome_block(raw);
    let extracted_outcome = outcome_json.and_then(|json| {
        serde_json::from_str::<ExtractedOutcome>(json.trim())
            .map_err(|e| tracing::warn!(error = %e, "ignoring unparseable assessment block"))
            .ok()
    });
    let (text, directives) = take_directives(&without_block);

    let mut statuses: Vec<Option<CompletionStatus>> = directives
        .iter()
        .map(|value| CompletionStatus::parse(value))
        .collect();
    if let Some(block_status) = extracted_outcome.as_ref().and_then(|o| o.status.as_deref()) {
        statuses.push(CompletionStatus::parse(block_status));
    }

    let completion_status = resolve(&statuses);

    AssistantReply {
        text,
        completion_status,
        extracted_outcome,
    }
}

/// All markers must be recognised and agree; anything else is treated as still in progress.
fn resolve(statuses: &[Option<CompletionStatus>]) -> CompletionStatus {
    let Some(first) = statuses.first() else {
        return CompletionStatus::InProgress;
    };
    match first {
        Some(status) if statuses.iter().all(|s| s.as_ref() == Some(status)) => *status,
        _ => CompletionStatus::InProgress,
    }
}

/// Removes the first ```` ```assessment ```` block, returning the remaining text and the
/// block body. An unterminated block is left in place.
fn take_outcome_block(raw: &str) -> (String, Option<&str>) {
    let lowered = raw.to_ascii_lowercase();
    let mut search_from = 0;

    while let Some(rel) = lowered[search_from..].find(FENCE) {
        let fence_start = search_from + rel;
        let after_fence = fence_start + FENCE.len();
        if lowered[after_fence..].starts_with(OUTCOME_TAG) {
            let body_start = after_fence + OUTCOME_TAG.len();
            if let Some(close_rel) = raw[body_start..].find(FENCE) {
                let body_end = body_start + close_rel;
                let block_end = body_end + FENCE.len();
                let mut remaining = String::with_capacity(raw.len());
                remaining.push_str(&raw[..fence_start]);
                remaining.push_str(&raw[block_end..]);
                return (remaining, Some(&raw[body_start..body_end]));
            }
            break;
        }
        search_from = after_fence;
    }

    (raw.to_owned(), None)
}

/// Removes every `[[STATUS: ...]]` directive, returning the cleaned text and directive values.
fn take_directives(text: &str) -> (String, Vec<String>) {
    let mut cleaned = String::with_capacity(text.len());
    let mut values = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(DIRECTIVE_OPEN) {
        let inner_start = open + DIRECTIVE_OPEN.len();
        let Some(close_rel) = rest[inner_start..].find(DIRECTIVE_CLOSE) else {
            break;
        };
        let inner = &rest[inner_start..inner_start + close_rel];
        let after = inner_start + close_rel + DIRECTIVE_CLOSE.len();

        match parse_directive(inner) {
            Some(value) => {
                cleaned.push_str(&rest[..open]);
                values.push(value);
            }
            None => cleaned.push_str(&rest[..after]),
        }
        rest = &rest[after..];
    }
    cleaned.push_str(rest);

    (tidy(&cleaned), values)
}

fn parse_directive(inner: &str) -> Option<String> {
    let (key, value) = inner.split_once(':')?;
    if key.trim().eq_ignore_ascii_case(DIRECTIVE_KEY) {
        Some(value.trim().to_owned())
    } else {
        None
    }
}

/// Trims trailing spaces on each line, drops blank runs longer than one line, trims the ends.
fn tidy(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim_end) {
        if line.is_empty() && out.last().is_some_and(|l| l.is_empty()) {
            continue;
        }
        out.push(line);
    }
    out.join("\n").trim().to_owned()
}

/// Finds a `Risk level: <word>` statement in free text.
pub fn risk_level_from_text(text: &str) -> Option<RiskLevel> {
    let lowered = text.to_ascii_lowercase();
    let mut search_from = 0;

    while let Some(rel) = lowered[search_from..].find(RISK_LEVEL_LABEL) {
        let after_label = search_from + rel + RISK_LEVEL_LABEL.len();
        let rest = lowered[after_label..]
            .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, ':' | '-' | '=' | '*'));
        let word: String = rest.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
        if let Some(level) = RiskLevel::parse(&word) {
            return Some(level);
        }
        search_from = after_label;
    }
    None
}
