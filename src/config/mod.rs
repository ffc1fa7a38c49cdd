use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".termpilot";

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_submit_settle_millis() -> u64 {
    200
}

fn default_max_surfaces() -> usize {
    30
}

fn default_agent_title_markers() -> Vec<String> {
    strings(&["✳", "claude", "glm"])
}

/// How termpilot talks to the terminal backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Upper bound for every single provider call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Delay between typing the text and pressing Enter.
    #[serde(default = "default_submit_settle_millis")]
    pub submit_settle_millis: u64,
    #[serde(default = "default_max_surfaces")]
    pub max_surfaces: usize,
    /// Title fragments that mark a surface as hosting an agent.
    #[serde(default = "default_agent_title_markers")]
    pub agent_title_markers: Vec<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            submit_settle_millis: default_submit_settle_millis(),
            max_surfaces: default_max_surfaces(),
            agent_title_markers: default_agent_title_markers(),
        }
    }
}

fn default_poll_interval_millis() -> u64 {
    2000
}

fn default_confirm_pause_millis() -> u64 {
    1000
}

fn default_pre_message_pause_millis() -> u64 {
    2000
}

fn default_post_inject_pause_millis() -> u64 {
    1000
}

fn default_max_exchanges() -> usize {
    5
}

fn default_capture_lines() -> usize {
    200
}

fn default_max_provider_failures() -> u32 {
    3
}

fn default_resend_after_polls() -> u32 {
    5
}

fn default_registry_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("sessions.json")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("logs")
}

/// Autopilot loop cadence and limits (`[loop]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSettings {
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    #[serde(default = "default_confirm_pause_millis")]
    pub confirm_pause_millis: u64,
    #[serde(default = "default_pre_message_pause_millis")]
    pub pre_message_pause_millis: u64,
    #[serde(default = "default_post_inject_pause_millis")]
    pub post_inject_pause_millis: u64,
    /// Exchanges kept from each capture.
    #[serde(default = "default_max_exchanges")]
    pub max_exchanges: usize,
    /// Trailing capture lines handed to the transcript parser.
    #[serde(default = "default_capture_lines")]
    pub capture_lines: usize,
    /// Consecutive failed reads before the loop gives up.
    #[serde(default = "default_max_provider_failures")]
    pub max_provider_failures: u32,
    /// Idle polls to wait before answering the same exchange twice.
    #[serde(default = "default_resend_after_polls")]
    pub resend_after_polls: u32,
    /// Session registry file, relative to the project root.
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    /// Execution log directory, relative to the project root.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_interval_millis: default_poll_interval_millis(),
            confirm_pause_millis: default_confirm_pause_millis(),
            pre_message_pause_millis: default_pre_message_pause_millis(),
            post_inject_pause_millis: default_post_inject_pause_millis(),
            max_exchanges: default_max_exchanges(),
            capture_lines: default_capture_lines(),
            max_provider_failures: default_max_provider_failures(),
            resend_after_polls: default_resend_after_polls(),
            registry_path: default_registry_path(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_busy_marker() -> String {
    "esc to interrupt".to_string()
}

fn default_thinking_cues() -> Vec<String> {
    strings(&["thinking", "thought"])
}

fn default_confirmation_markers() -> Vec<String> {
    strings(&["(y/n)", "(Y/n)", "[Y/n]", "[y/N]", "confirm"])
}

fn default_prompt_glyph() -> String {
    ">".to_string()
}

fn default_submit_hint() -> String {
    "↵ send".to_string()
}

/// Lexical signals used by the status classifier (`[classifier]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    /// Phrase shown while the agent is processing and can be interrupted.
    #[serde(default = "default_busy_marker")]
    pub busy_marker: String,
    #[serde(default = "default_thinking_cues")]
    pub thinking_cues: Vec<String>,
    #[serde(default = "default_confirmation_markers")]
    pub confirmation_markers: Vec<String>,
    #[serde(default = "default_prompt_glyph")]
    pub prompt_glyph: String,
    #[serde(default = "default_submit_hint")]
    pub submit_hint: String,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            busy_marker: default_busy_marker(),
            thinking_cues: default_thinking_cues(),
            confirmation_markers: default_confirmation_markers(),
            prompt_glyph: default_prompt_glyph(),
            submit_hint: default_submit_hint(),
        }
    }
}

fn default_user_glyph() -> String {
    ">".to_string()
}

fn default_agent_glyph() -> String {
    "⏺".to_string()
}

fn default_chrome() -> Vec<String> {
    strings(&[
        "───",
        "💭",
        "/Users/",
        "checkpoint",
        "bypass",
        "↵ send",
        "⎿",
        "Thinking",
        "Tinkering",
        "ctrl+o",
        "⏵⏵",
        "Claude Code",
        "MCP",
        "Ran Playwright",
        "Image]",
        "lines (ctrl",
    ])
}

/// Turn markers and UI chrome filtered by the transcript parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSettings {
    #[serde(default = "default_user_glyph")]
    pub user_glyph: String,
    #[serde(default = "default_agent_glyph")]
    pub agent_glyph: String,
    /// Lines containing any of these fragments are decoration, not dialogue.
    #[serde(default = "default_chrome")]
    pub chrome: Vec<String>,
}

impl Default for TranscriptSettings {
    fn default() -> Self {
        Self {
            user_glyph: default_user_glyph(),
            agent_glyph: default_agent_glyph(),
            chrome: default_chrome(),
        }
    }
}

fn default_completion_cues() -> Vec<String> {
    strings(&[
        "done",
        "completed",
        "finished",
        "summary:",
        "task completed",
        "готово",
        "выполнено",
        "завершено",
        "сделано",
    ])
}

fn default_error_cues() -> Vec<String> {
    strings(&["error", "failed", "could not", "ошибка", "не удалось"])
}

fn default_question_cues() -> Vec<String> {
    strings(&["?", "would you like", "should i", "хотите", "нужно", "можно"])
}

fn default_loop_completion_cues() -> Vec<String> {
    strings(&[
        "итог:",
        "готово!",
        "задача выполнена",
        "всё сделано",
        "task completed",
        "all done",
    ])
}

fn default_confirm_token() -> String {
    "y".to_string()
}

fn default_corrective_reply() -> String {
    "fix the error and continue".to_string()
}

fn default_affirmative_reply() -> String {
    "yes, continue".to_string()
}

fn default_continue_reply() -> String {
    "continue".to_string()
}

/// Cue tables and canned replies of the continuation policy (`[cues]` table).
///
/// ```toml
/// [cues]
/// completion = ["done", "итог:"]
/// continue_reply = "продолжай"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CueSettings {
    #[serde(default = "default_completion_cues")]
    pub completion: Vec<String>,
    #[serde(default = "default_error_cues")]
    pub error: Vec<String>,
    #[serde(default = "default_question_cues")]
    pub question: Vec<String>,
    /// Cues the loop checks itself before consulting the policy.
    #[serde(default = "default_loop_completion_cues")]
    pub loop_completion: Vec<String>,
    /// Sent when the surface is waiting for a yes/no confirmation.
    #[serde(default = "default_confirm_token")]
    pub confirm_token: String,
    #[serde(default = "default_corrective_reply")]
    pub corrective_reply: String,
    #[serde(default = "default_affirmative_reply")]
    pub affirmative_reply: String,
    #[serde(default = "default_continue_reply")]
    pub continue_reply: String,
}

impl Default for CueSettings {
    fn default() -> Self {
        Self {
            completion: default_completion_cues(),
            error: default_error_cues(),
            question: default_question_cues(),
            loop_completion: default_loop_completion_cues(),
            confirm_token: default_confirm_token(),
            corrective_reply: default_corrective_reply(),
            affirmative_reply: default_affirmative_reply(),
            continue_reply: default_continue_reply(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default, rename = "loop")]
    pub autopilot: LoopSettings,
    #[serde(default)]
    pub classifier: ClassifierSettings,
    #[serde(default)]
    pub transcript: TranscriptSettings,
    #[serde(default)]
    pub cues: CueSettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.termpilot/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Directory that relative paths in the config resolve against: the parent
    /// of `.termpilot/` when a config file was found, otherwise `cwd`.
    pub fn project_root(cwd: &Path, config_path: Option<&Path>) -> PathBuf {
        config_path
            .and_then(Path::parent)
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf())
    }

    pub fn registry_path(&self, root: &Path) -> PathBuf {
        root.join(&self.autopilot.registry_path)
    }

    pub fn log_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.autopilot.log_dir)
    }
}
