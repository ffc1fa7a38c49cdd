//! Structured execution log: JSON lines per surface.
//!
//! Every autopilot run appends to `.termpilot/logs/<surface>.jsonl`. Each line
//! is a self-contained JSON object with an RFC 3339 timestamp and a tagged
//! event, so a run can be replayed with `grep` or `jq`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::debug;

use crate::terminal::SurfaceId;

/// One line of the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    SessionStarted {
        surface: String,
        goal: String,
    },
    SessionResumed {
        surface: String,
        goal: String,
        messages_sent: u32,
    },
    /// Logged when the classification changes between polls.
    StatusObserved {
        kind: String,
        detail: String,
        busy: bool,
    },
    ConfirmationSent {
        token: String,
        confirmations_sent: u32,
    },
    MessageSent {
        text: String,
        reason: String,
        messages_sent: u32,
    },
    InjectionFailed {
        text: String,
        error: String,
    },
    GoalCompleted {
        messages_sent: u32,
        cue: Option<String>,
    },
    SessionPaused {
        reason: String,
    },
    ProviderFailure {
        error: String,
        consecutive: u32,
    },
}

/// Append-only JSON lines writer.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Open (or create) the log at `path`, creating parent directories.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Log file for `surface` under `dir`. Characters that are awkward in file
    /// names (tmux pane ids start with `%`) are replaced.
    pub fn path_for(dir: &Path, surface: &SurfaceId) -> PathBuf {
        let name: String = surface
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        dir.join(format!("{name}.jsonl"))
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("execution log writer poisoned"))?;
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_to_json() {
        let entry = LogEntry {
            timestamp: "2026-03-01T09:00:00+00:00".to_string(),
            event: LogEvent::MessageSent {
                text: "continue".to_string(),
                reason: "continue".to_string(),
                messages_sent: 2,
            },
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"message_sent\""));
        assert!(json.contains("\"messages_sent\":2"));
        assert!(json.contains("\"timestamp\":\"2026-03-01T09:00:00+00:00\""));
    }

    #[test]
    fn write_and_read_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("test.jsonl");

        let log = ExecutionLog::new(&log_path).unwrap();
        log.log(LogEvent::SessionStarted {
            surface: "%3".to_string(),
            goal: "write a haiku".to_string(),
        })
        .unwrap();
        log.log(LogEvent::ConfirmationSent {
            token: "y".to_string(),
            confirmations_sent: 1,
        })
        .unwrap();
        log.log(LogEvent::GoalCompleted {
            messages_sent: 4,
            cue: Some("task completed".to_string()),
        })
        .unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("event").is_some());
            let ts = parsed["timestamp"].as_str().unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok(), "bad timestamp {ts}");
        }

        assert!(lines[0].contains("\"event\":\"session_started\""));
        assert!(lines[1].contains("\"event\":\"confirmation_sent\""));
        assert!(lines[2].contains("\"event\":\"goal_completed\""));
    }

    #[test]
    fn appends_to_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("deep").join("append.jsonl");

        {
            let log = ExecutionLog::new(&log_path).unwrap();
            assert_eq!(log.path(), log_path.as_path());
            log.log(LogEvent::SessionPaused {
                reason: "interrupted".to_string(),
            })
            .unwrap();
        }
        {
            let log = ExecutionLog::new(&log_path).unwrap();
            log.log(LogEvent::SessionResumed {
                surface: "7".to_string(),
                goal: "X".to_string(),
                messages_sent: 3,
            })
            .unwrap();
        }

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn path_for_sanitizes_surface_ids() {
        let dir = Path::new("/tmp/logs");
        assert_eq!(
            ExecutionLog::path_for(dir, &SurfaceId::new("%3")),
            dir.join("_3.jsonl")
        );
        assert_eq!(
            ExecutionLog::path_for(dir, &SurfaceId::new("7")),
            dir.join("7.jsonl")
        );
    }
}
