use regex::Regex;

use crate::config::CueSettings;
use crate::transcript::Exchange;

/// Why the policy chose a particular message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationReason {
    /// Nothing has been said yet; the goal opens the conversation.
    Opening,
    /// The agent reported an error.
    ErrorRecovery,
    /// The agent asked a question or permission.
    QuestionAnswered,
    Continue,
}

impl ContinuationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContinuationReason::Opening => "opening",
            ContinuationReason::ErrorRecovery => "error_recovery",
            ContinuationReason::QuestionAnswered => "question_answered",
            ContinuationReason::Continue => "continue",
        }
    }
}

/// What the policy wants the loop to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextInput {
    Send {
        text: String,
        reason: ContinuationReason,
    },
    GoalComplete,
}

#[derive(Debug, Clone)]
enum Cue {
    /// Single word, matched on word boundaries.
    Word(Regex),
    /// Phrase or punctuation, matched as a plain substring.
    Phrase(String),
}

impl Cue {
    fn new(raw: &str, whole_words: bool) -> Self {
        let lower = raw.to_lowercase();
        if whole_words && !lower.is_empty() && lower.chars().all(char::is_alphanumeric) {
            if let Ok(re) = Regex::new(&format!(r"\b{}\b", regex::escape(&lower))) {
                return Cue::Word(re);
            }
        }
        Cue::Phrase(lower)
    }

    fn matches(&self, lower: &str) -> bool {
        match self {
            Cue::Word(re) => re.is_match(lower),
            Cue::Phrase(phrase) => lower.contains(phrase.as_str()),
        }
    }
}

/// Lexical cue categories and the replies attached to them.
#[derive(Debug, Clone)]
pub struct CueTable {
    completion: Vec<Cue>,
    error: Vec<Cue>,
    question: Vec<Cue>,
    corrective_reply: String,
    affirmative_reply: String,
    continue_reply: String,
}

impl CueTable {
    pub fn new(cues: &CueSettings) -> Self {
        let build = |list: &[String], whole_words: bool| -> Vec<Cue> {
            list.iter().map(|c| Cue::new(c, whole_words)).collect()
        };
        Self {
            completion: build(&cues.completion, true),
            error: build(&cues.error, false),
            question: build(&cues.question, false),
            corrective_reply: cues.corrective_reply.clone(),
            affirmative_reply: cues.affirmative_reply.clone(),
            continue_reply: cues.continue_reply.clone(),
        }
    }
}

impl Default for CueTable {
    fn default() -> Self {
        Self::new(&CueSettings::default())
    }
}

/// Deterministic rule table that keeps the agent moving toward a goal.
#[derive(Debug, Clone, Default)]
pub struct ContinuationPolicy {
    cues: CueTable,
}

impl ContinuationPolicy {
    pub fn new(cues: CueTable) -> Self {
        Self { cues }
    }

    /// Decide the next message for `goal` given the exchanges seen so far.
    ///
    /// Only the latest agent reply is inspected. Categories are checked in the
    /// order completion, error, question; the first hit wins.
    pub fn next_input(&self, goal: &str, exchanges: &[Exchange]) -> NextInput {
        let Some(last) = exchanges.last() else {
            return NextInput::Send {
                text: goal.to_string(),
                reason: ContinuationReason::Opening,
            };
        };

        let lower = last.agent_text.to_lowercase();
        let hit = |cues: &[Cue]| cues.iter().any(|cue| cue.matches(&lower));

        if hit(&self.cues.completion) {
            return NextInput::GoalComplete;
        }
        let (text, reason) = if hit(&self.cues.error) {
            (&self.cues.corrective_reply, ContinuationReason::ErrorRecovery)
        } else if hit(&self.cues.question) {
            (&self.cues.affirmative_reply, ContinuationReason::QuestionAnswered)
        } else {
            (&self.cues.continue_reply, ContinuationReason::Continue)
        };
        NextInput::Send {
            text: text.clone(),
            reason,
        }
    }
}
