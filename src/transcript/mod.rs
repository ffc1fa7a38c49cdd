//! Transcript parsing for captured agent screens.
//!
//! A capture is a dump of whatever the surface rendered: prompt lines,
//! response blocks, spinners, status bars, tool output. The parser walks it
//! line by line and keeps only the dialogue, as an ordered list of
//! [`Exchange`]s.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::TranscriptSettings;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]")
        .unwrap()
});

/// Strip ANSI escape sequences (CSI, OSC, single-character escapes).
pub fn strip_ansi(s: &str) -> String {
    ANSI_RE.replace_all(s, "").into_owned()
}

/// Keep only the last `n` lines of `text`. `0` keeps everything.
pub fn tail_lines(text: &str, n: usize) -> &str {
    if n == 0 {
        return text;
    }
    let mut seen = 0;
    for (idx, _) in text.rmatch_indices('\n') {
        // A trailing newline does not start a line of its own.
        if idx + 1 == text.len() {
            continue;
        }
        seen += 1;
        if seen == n {
            return &text[idx + 1..];
        }
    }
    text
}

/// One user turn and the agent's reply to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user_text: String,
    pub agent_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Blank,
    Chrome,
    User,
    Agent,
    Continuation,
}

/// Exchange being assembled while walking the capture.
struct OpenExchange {
    user_text: String,
    agent_lines: Vec<String>,
}

impl OpenExchange {
    fn finish(self) -> Option<Exchange> {
        if self.agent_lines.is_empty() {
            return None;
        }
        let agent_text = self.agent_lines.join("\n").trim().to_string();
        if agent_text.is_empty() {
            return None;
        }
        Some(Exchange {
            user_text: self.user_text,
            agent_text,
        })
    }
}

/// Line classifier and exchange builder for one agent UI.
#[derive(Debug, Clone)]
pub struct TranscriptParser {
    user_glyph: String,
    agent_glyph: String,
    chrome: Vec<String>,
}

impl Default for TranscriptParser {
    fn default() -> Self {
        Self::new(&TranscriptSettings::default())
    }
}

impl TranscriptParser {
    pub fn new(settings: &TranscriptSettings) -> Self {
        Self {
            user_glyph: settings.user_glyph.clone(),
            agent_glyph: settings.agent_glyph.clone(),
            chrome: settings.chrome.clone(),
        }
    }

    fn classify_line(&self, line: &str) -> LineKind {
        if line.is_empty() {
            return LineKind::Blank;
        }
        if self.chrome.iter().any(|c| line.contains(c.as_str())) {
            return LineKind::Chrome;
        }
        // The input box border also starts with the prompt glyph on some UIs.
        if line.starts_with(self.user_glyph.as_str()) && !line.contains('─') {
            return LineKind::User;
        }
        if line.starts_with(self.agent_glyph.as_str()) {
            return LineKind::Agent;
        }
        LineKind::Continuation
    }

    /// Extract the conversation from a raw capture.
    ///
    /// Returns the last `max_exchanges` exchanges in screen order; `0` returns
    /// all of them. Exchanges without any agent text are dropped.
    pub fn parse(&self, raw: &str, max_exchanges: usize) -> Vec<Exchange> {
        let clean = strip_ansi(raw);
        let mut exchanges = Vec::new();
        let mut current: Option<OpenExchange> = None;

        for line in clean.lines() {
            let line = line.trim();
            match self.classify_line(line) {
                LineKind::Blank | LineKind::Chrome => {}
                LineKind::User => {
                    if let Some(done) = current.take().and_then(OpenExchange::finish) {
                        exchanges.push(done);
                    }
                    let text = line[self.user_glyph.len()..].replace('\u{a0}', " ");
                    current = Some(OpenExchange {
                        user_text: text.trim().to_string(),
                        agent_lines: Vec::new(),
                    });
                }
                LineKind::Agent => {
                    if let Some(open) = current.as_mut() {
                        let text = line[self.agent_glyph.len()..].trim();
                        if !text.is_empty() {
                            open.agent_lines.push(text.to_string());
                        }
                    }
                }
                LineKind::Continuation => {
                    let Some(open) = current.as_mut() else {
                        continue;
                    };
                    if !open.agent_lines.is_empty()
                        && line.chars().count() > 3
                        && !line.starts_with('[')
                    {
                        open.agent_lines.push(line.to_string());
                    }
                }
            }
        }

        if let Some(done) = current.and_then(OpenExchange::finish) {
            exchanges.push(done);
        }

        if max_exchanges > 0 && exchanges.len() > max_exchanges {
            exchanges.drain(..exchanges.len() - max_exchanges);
        }
        exchanges
    }

    /// Text of the last `max_lines` agent-marker lines of a capture, oldest
    /// first, with the glyph removed. Bare markers are skipped.
    pub fn last_response(&self, raw: &str, max_lines: usize) -> String {
        let clean = strip_ansi(raw);
        let lines: Vec<&str> = clean
            .lines()
            .filter_map(|line| line.trim().strip_prefix(self.agent_glyph.as_str()))
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_TURNS: &str = "\
╭──────────────────────────────────────────╮
│ ✻ Welcome to Claude Code!                │
╰──────────────────────────────────────────╯

> list the files
⏺ There are three files in the directory:
  main.rs, lib.rs and Cargo.toml.
  ⎿  Read 3 files (ctrl+o to expand)

> add a test\u{a0}for lib.rs
⏺ Added a unit test for the parser module.
  [tool output hidden]
  The test covers the empty input case.

────────────────────────────────────────────
>\u{a0}
────────────────────────────────────────────
  ⏵⏵ bypass permissions on
";

    #[test]
    fn two_user_turns_yield_two_exchanges_in_order() {
        let exchanges = TranscriptParser::default().parse(TWO_TURNS, 0);
        assert_eq!(exchanges.len(), 2);

        assert_eq!(exchanges[0].user_text, "list the files");
        assert_eq!(
            exchanges[0].agent_text,
            "There are three files in the directory:\nmain.rs, lib.rs and Cargo.toml."
        );

        assert_eq!(exchanges[1].user_text, "add a test for lib.rs");
        assert_eq!(
            exchanges[1].agent_text,
            "Added a unit test for the parser module.\nThe test covers the empty input case."
        );
    }

    #[test]
    fn chrome_never_reaches_exchanges() {
        let exchanges = TranscriptParser::default().parse(TWO_TURNS, 0);
        for exchange in &exchanges {
            for text in [&exchange.user_text, &exchange.agent_text] {
                assert!(!text.contains('─'), "box drawing leaked: {text:?}");
                assert!(!text.contains("ctrl+o"));
                assert!(!text.contains("bypass"));
            }
        }
    }

    #[test]
    fn tail_truncation_keeps_latest_exchange() {
        let raw = "\
> one
⏺ first answer
> two
⏺ second answer
> three
⏺ third answer
";
        let parser = TranscriptParser::default();
        let exchanges = parser.parse(raw, 1);
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].user_text, "three");
        assert_eq!(exchanges[0].agent_text, "third answer");

        assert_eq!(parser.parse(raw, 2)[0].user_text, "two");
        assert_eq!(parser.parse(raw, 0).len(), 3);
    }

    #[test]
    fn exchange_without_reply_is_dropped() {
        let raw = "> first\n> second\n⏺ reply\n> pending\n";
        let exchanges = TranscriptParser::default().parse(raw, 0);
        assert_eq!(
            exchanges,
            vec![Exchange {
                user_text: "second".to_string(),
                agent_text: "reply".to_string(),
            }]
        );
    }

    #[test]
    fn continuation_requires_open_agent_turn() {
        let raw = "some banner text\n> hello\nstray line before reply\n⏺ hi there\nok\nmore detail\n";
        let exchanges = TranscriptParser::default().parse(raw, 0);
        assert_eq!(exchanges.len(), 1);
        // "ok" is too short to count as a continuation line.
        assert_eq!(exchanges[0].agent_text, "hi there\nmore detail");
    }

    #[test]
    fn agent_text_before_any_user_turn_is_ignored() {
        let raw = "⏺ leftover from scrollback\n> start\n⏺ fresh reply\n";
        let exchanges = TranscriptParser::default().parse(raw, 0);
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].agent_text, "fresh reply");
    }

    #[test]
    fn ansi_sequences_are_stripped_before_parsing() {
        let raw = "\x1b[1m> \x1b[0mbuild it\n\x1b[32m⏺\x1b[0m Build succeeded.\n";
        let exchanges = TranscriptParser::default().parse(raw, 0);
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].user_text, "build it");
        assert_eq!(exchanges[0].agent_text, "Build succeeded.");
    }

    #[test]
    fn custom_glyphs_from_settings() {
        let settings = TranscriptSettings {
            user_glyph: "❯".to_string(),
            agent_glyph: "●".to_string(),
            chrome: vec!["═══".to_string()],
        };
        let raw = "═══ header ═══\n❯ ping\n● pong\n";
        let exchanges = TranscriptParser::new(&settings).parse(raw, 0);
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].user_text, "ping");
        assert_eq!(exchanges[0].agent_text, "pong");
    }

    #[test]
    fn last_response_returns_trailing_agent_lines() {
        let raw = "> a\n⏺ one\n⏺ two\n> b\n⏺ three\n  detail\n⏺ four\n";
        let parser = TranscriptParser::default();
        assert_eq!(parser.last_response(raw, 2), "three\nfour");
        assert_eq!(parser.last_response(raw, 10), "one\ntwo\nthree\nfour");
        assert_eq!(parser.last_response("> nothing yet\n", 5), "");
    }

    #[test]
    fn last_response_skips_bare_markers() {
        let parser = TranscriptParser::default();
        assert_eq!(parser.last_response("> a\n⏺ one\n⏺\n⏺ two\n", 5), "one\ntwo");
        assert_eq!(parser.last_response("> a\n  ⏺   \n", 5), "");
    }

    #[test]
    fn strip_ansi_removes_csi_and_osc() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(strip_ansi("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_ansi("\x1b[?25lhidden cursor"), "hidden cursor");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn tail_lines_keeps_trailing_window() {
        let text = "a\nb\nc\nd\n";
        assert_eq!(tail_lines(text, 2), "c\nd\n");
        assert_eq!(tail_lines(text, 4), text);
        assert_eq!(tail_lines(text, 10), text);
        assert_eq!(tail_lines(text, 0), text);
        assert_eq!(tail_lines("x\ny", 1), "y");
    }
}
