//! Session status classification from a visible capture.
//!
//! The classifier is an ordered rule table: each entry pairs a [`StatusRule`]
//! predicate with the status it produces, and the first matching entry wins.
//! Ongoing work outranks everything else, so a busy screen that also shows a
//! stale `(y/n)` is still busy.

use std::fmt;

use serde::Serialize;

use crate::config::ClassifierSettings;
use crate::transcript::strip_ansi;

/// What the agent on a surface appears to be doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Idle,
    Working,
    Thinking,
    WaitingConfirmation,
    /// The surface could not be read at all.
    Error,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StatusKind::Idle => "idle",
            StatusKind::Working => "working",
            StatusKind::Thinking => "thinking",
            StatusKind::WaitingConfirmation => "waiting_confirmation",
            StatusKind::Error => "error",
        };
        f.write_str(label)
    }
}

/// A point-in-time classification. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub kind: StatusKind,
    pub detail: String,
    pub is_busy: bool,
}

impl SessionStatus {
    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Error,
            detail: detail.into(),
            is_busy: false,
        }
    }
}

/// A predicate over the ANSI-stripped capture.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusRule {
    /// Case-sensitive substring.
    Contains(String),
    ContainsIgnoreCase(String),
    /// Every inner rule matches.
    AllOf(Vec<StatusRule>),
    /// At least one inner rule matches.
    AnyOf(Vec<StatusRule>),
    /// The last non-empty line, trimmed, starts with the given prefix.
    LastLineStartsWith(String),
}

impl StatusRule {
    fn matches(&self, text: &str, lower: &str) -> bool {
        match self {
            StatusRule::Contains(needle) => text.contains(needle.as_str()),
            StatusRule::ContainsIgnoreCase(needle) => lower.contains(&needle.to_lowercase()),
            StatusRule::AllOf(rules) => rules.iter().all(|r| r.matches(text, lower)),
            StatusRule::AnyOf(rules) => rules.iter().any(|r| r.matches(text, lower)),
            StatusRule::LastLineStartsWith(prefix) => text
                .lines()
                .map(str::trim)
                .rfind(|line| !line.is_empty())
                .is_some_and(|line| line.starts_with(prefix.as_str())),
        }
    }
}

const FINISHED_DETAIL: &str = "finished";

#[derive(Debug, Clone)]
struct RuleEntry {
    rule: StatusRule,
    kind: StatusKind,
    detail: &'static str,
    is_busy: bool,
}

/// First-match-wins rule table.
#[derive(Debug, Clone)]
pub struct StatusClassifier {
    rules: Vec<RuleEntry>,
}

impl Default for StatusClassifier {
    fn default() -> Self {
        Self::new(&ClassifierSettings::default())
    }
}

impl StatusClassifier {
    pub fn new(settings: &ClassifierSettings) -> Self {
        let busy = StatusRule::ContainsIgnoreCase(settings.busy_marker.clone());
        let thinking = StatusRule::AnyOf(
            settings
                .thinking_cues
                .iter()
                .cloned()
                .map(StatusRule::ContainsIgnoreCase)
                .collect(),
        );
        let confirmation = StatusRule::AnyOf(
            settings
                .confirmation_markers
                .iter()
                .cloned()
                .map(StatusRule::Contains)
                .collect(),
        );
        let ready = StatusRule::AnyOf(vec![
            StatusRule::LastLineStartsWith(settings.prompt_glyph.clone()),
            StatusRule::Contains(settings.submit_hint.clone()),
        ]);

        let rules = vec![
            RuleEntry {
                rule: StatusRule::AllOf(vec![busy.clone(), thinking]),
                kind: StatusKind::Thinking,
                detail: "thinking",
                is_busy: true,
            },
            RuleEntry {
                rule: busy,
                kind: StatusKind::Working,
                detail: "working",
                is_busy: true,
            },
            RuleEntry {
                rule: confirmation,
                kind: StatusKind::WaitingConfirmation,
                detail: "waiting for confirmation",
                is_busy: false,
            },
            RuleEntry {
                rule: ready,
                kind: StatusKind::Idle,
                detail: "ready for input",
                is_busy: false,
            },
        ];
        Self { rules }
    }

    /// Classify a visible capture. Ambiguity resolves by rule order; a capture
    /// no rule matches is an idle, finished agent.
    pub fn classify(&self, raw: &str) -> SessionStatus {
        let text = strip_ansi(raw);
        let lower = text.to_lowercase();
        match self
            .rules
            .iter()
            .find(|entry| entry.rule.matches(&text, &lower))
        {
            Some(entry) => SessionStatus {
                kind: entry.kind,
                detail: entry.detail.to_string(),
                is_busy: entry.is_busy,
            },
            None => SessionStatus {
                kind: StatusKind::Idle,
                detail: FINISHED_DETAIL.to_string(),
                is_busy: false,
            },
        }
    }
}
