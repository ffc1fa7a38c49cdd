//! Command handlers behind the CLI and their plain-text rendering.

use std::fmt::Write as _;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};
use dialoguer::{Confirm, Input, Select};
use tracing::{info, warn};

use crate::autopilot::{Autopilot, AutopilotObserver, LoopState};
use crate::classifier::{SessionStatus, StatusClassifier};
use crate::config::ProjectConfig;
use crate::log::ExecutionLog;
use crate::policy::ContinuationReason;
use crate::registry::{AttachDecision, AutopilotSession, SessionRepository};
use crate::terminal::{Surface, SurfaceId, TerminalProvider};
use crate::transcript::{Exchange, TranscriptParser};

const CONTEXT_RESPONSE_LINES: usize = 5;
const PREVIEW_CHARS: usize = 200;

/// Prints loop events to stdout.
pub struct ConsoleObserver;

impl AutopilotObserver for ConsoleObserver {
    fn on_status(&mut self, status: &SessionStatus) {
        println!("[termpilot] status: {} ({})", status.kind, status.detail);
    }

    fn on_message_sent(&mut self, text: &str, reason: ContinuationReason, messages_sent: u32) {
        println!(
            "[termpilot] #{messages_sent} sent ({}): {}",
            reason.as_str(),
            preview(text, PREVIEW_CHARS)
        );
    }

    fn on_confirmation(&mut self, token: &str) {
        println!("[termpilot] confirmed with '{token}'");
    }

    fn on_event(&mut self, message: &str) {
        println!("[termpilot] {message}");
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{cut}…")
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(output, "  {key:<24} {value}");
}

fn push_list(output: &mut String, key: &str, values: &[String]) {
    if values.is_empty() {
        push_kv(output, key, "(none)");
    } else {
        push_kv(output, key, values.join(", "));
    }
}

pub fn render_surface_list(
    surfaces: &[Surface],
    sessions: &[AutopilotSession],
    show_all: bool,
) -> String {
    let shown: Vec<&Surface> = surfaces
        .iter()
        .filter(|s| show_all || s.hosts_agent)
        .collect();
    if shown.is_empty() {
        return if show_all {
            "No terminal surfaces found.\n".to_string()
        } else {
            "No agent surfaces found (use --all to list every pane).\n".to_string()
        };
    }

    let mut output = String::new();
    for surface in shown {
        let marker = if surface.hosts_agent { "*" } else { " " };
        let _ = write!(output, "{marker} {:<6} {}", surface.id, surface.title);
        if let Some(session) = sessions.iter().find(|s| s.surface_id == surface.id) {
            let _ = write!(
                output,
                "  [{}: {} msgs, goal: {}]",
                session.status,
                session.messages_sent,
                preview(&session.goal, 40)
            );
        }
        output.push('\n');
    }
    output
}

pub fn render_status(surface: &SurfaceId, status: &SessionStatus) -> String {
    format!(
        "{surface}: {} ({}), busy: {}\n",
        status.kind,
        status.detail,
        if status.is_busy { "yes" } else { "no" }
    )
}

pub fn render_exchanges(exchanges: &[Exchange]) -> String {
    if exchanges.is_empty() {
        return "  (no exchanges)\n".to_string();
    }
    let mut output = String::new();
    for (idx, exchange) in exchanges.iter().enumerate() {
        let _ = writeln!(output, "  {}. > {}", idx + 1, preview(&exchange.user_text, 80));
        let _ = writeln!(output, "     ⏺ {}", preview(&exchange.agent_text, PREVIEW_CHARS));
    }
    output
}

pub fn render_context(parser: &TranscriptParser, raw: &str, max_exchanges: usize) -> String {
    let mut output = String::from("Last response\n");
    let last = parser.last_response(raw, CONTEXT_RESPONSE_LINES);
    if last.is_empty() {
        output.push_str("  (none)\n");
    } else {
        for line in last.lines() {
            let _ = writeln!(output, "  {line}");
        }
    }
    output.push_str("\nRecent exchanges\n");
    output.push_str(&render_exchanges(&parser.parse(raw, max_exchanges)));
    output
}

pub fn render_sessions(sessions: &[AutopilotSession]) -> String {
    if sessions.is_empty() {
        return "No stored sessions.\n".to_string();
    }
    let mut output = String::new();
    for session in sessions {
        let _ = writeln!(output, "{}", session.surface_id);
        push_kv(&mut output, "status", session.status);
        push_kv(&mut output, "goal", &session.goal);
        push_kv(&mut output, "messages_sent", session.messages_sent);
        push_kv(&mut output, "confirmations_sent", session.confirmations_sent);
        push_kv(&mut output, "started_at", session.started_at.to_rfc3339());
        push_kv(&mut output, "updated_at", session.updated_at.to_rfc3339());
        if let Some(owner) = &session.owner {
            push_kv(&mut output, "owner", format!("{} (pid {})", owner.id, owner.pid));
        }
    }
    output
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .termpilot/config.toml found)".to_string())
}

pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();

    output.push_str("Provider\n");
    push_kv(&mut output, "timeout", format!("{}s", config.provider.timeout_secs));
    push_kv(
        &mut output,
        "submit_settle",
        format!("{}ms", config.provider.submit_settle_millis),
    );
    push_kv(&mut output, "max_surfaces", config.provider.max_surfaces);
    push_list(&mut output, "agent_title_markers", &config.provider.agent_title_markers);
    output.push('\n');

    let lp = &config.autopilot;
    output.push_str("Loop\n");
    push_kv(&mut output, "poll_interval", format!("{}ms", lp.poll_interval_millis));
    push_kv(&mut output, "confirm_pause", format!("{}ms", lp.confirm_pause_millis));
    push_kv(
        &mut output,
        "pre_message_pause",
        format!("{}ms", lp.pre_message_pause_millis),
    );
    push_kv(
        &mut output,
        "post_inject_pause",
        format!("{}ms", lp.post_inject_pause_millis),
    );
    push_kv(&mut output, "max_exchanges", lp.max_exchanges);
    push_kv(&mut output, "capture_lines", lp.capture_lines);
    push_kv(&mut output, "max_provider_failures", lp.max_provider_failures);
    push_kv(&mut output, "resend_after_polls", lp.resend_after_polls);
    push_kv(&mut output, "registry_path", lp.registry_path.display());
    push_kv(&mut output, "log_dir", lp.log_dir.display());
    output.push('\n');

    output.push_str("Classifier\n");
    push_kv(&mut output, "busy_marker", &config.classifier.busy_marker);
    push_list(&mut output, "thinking_cues", &config.classifier.thinking_cues);
    push_list(
        &mut output,
        "confirmation_markers",
        &config.classifier.confirmation_markers,
    );
    push_kv(&mut output, "prompt_glyph", &config.classifier.prompt_glyph);
    push_kv(&mut output, "submit_hint", &config.classifier.submit_hint);
    output.push('\n');

    output.push_str("Transcript\n");
    push_kv(&mut output, "user_glyph", &config.transcript.user_glyph);
    push_kv(&mut output, "agent_glyph", &config.transcript.agent_glyph);
    push_kv(&mut output, "chrome", format!("{} patterns", config.transcript.chrome.len()));
    output.push('\n');

    let cues = &config.cues;
    output.push_str("Cues\n");
    push_list(&mut output, "completion", &cues.completion);
    push_list(&mut output, "error", &cues.error);
    push_list(&mut output, "question", &cues.question);
    push_list(&mut output, "loop_completion", &cues.loop_completion);
    push_kv(&mut output, "confirm_token", &cues.confirm_token);
    push_kv(&mut output, "corrective_reply", &cues.corrective_reply);
    push_kv(&mut output, "affirmative_reply", &cues.affirmative_reply);
    push_kv(&mut output, "continue_reply", &cues.continue_reply);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    if let Some(map) = payload.as_object_mut() {
        map.insert(
            "source_path".to_string(),
            serde_json::Value::String(config_source_label(config_path)),
        );
    }
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

pub fn list(
    provider: &dyn TerminalProvider,
    repo: &dyn SessionRepository,
    show_all: bool,
) -> Result<()> {
    let surfaces = provider.list_surfaces().context("failed to list surfaces")?;
    let sessions = repo.list()?;
    print!("{}", render_surface_list(&surfaces, &sessions, show_all));
    Ok(())
}

pub fn status(
    provider: &dyn TerminalProvider,
    config: &ProjectConfig,
    surface: &SurfaceId,
) -> Result<()> {
    let raw = provider
        .read_visible_text(surface)
        .with_context(|| format!("failed to read surface {surface}"))?;
    let status = StatusClassifier::new(&config.classifier).classify(&raw);
    print!("{}", render_status(surface, &status));
    Ok(())
}

pub fn context(
    provider: &dyn TerminalProvider,
    config: &ProjectConfig,
    surface: &SurfaceId,
    full: bool,
) -> Result<()> {
    let raw = if full {
        provider.read_full_history(surface)
    } else {
        provider.read_visible_text(surface)
    }
    .with_context(|| format!("failed to read surface {surface}"))?;
    let parser = TranscriptParser::new(&config.transcript);
    print!("{}", render_context(&parser, &raw, config.autopilot.max_exchanges));
    Ok(())
}

pub fn sessions(repo: &dyn SessionRepository) -> Result<()> {
    print!("{}", render_sessions(&repo.list()?));
    Ok(())
}

/// What to do once the stored record for a surface is known.
#[derive(Debug, Clone, PartialEq)]
pub enum StartPlan {
    Resume(AutopilotSession),
    New(String),
    /// A resumable record exists and no flag settled it.
    AskResume {
        session: AutopilotSession,
        goal: Option<String>,
    },
    AskGoal,
}

pub fn plan_start(
    decision: AttachDecision,
    goal: Option<&str>,
    resume: bool,
    new: bool,
) -> Result<StartPlan> {
    let goal = goal.map(str::trim).filter(|g| !g.is_empty()).map(str::to_string);
    match decision {
        AttachDecision::Conflict(session) => {
            let pid = session.owner.as_ref().map_or(0, |o| o.pid);
            bail!(
                "surface {} is already driven by another termpilot (pid {pid}); stop it first",
                session.surface_id
            );
        }
        AttachDecision::Resume(session) => {
            if resume {
                Ok(StartPlan::Resume(session))
            } else if new {
                Ok(goal.map_or(StartPlan::AskGoal, StartPlan::New))
            } else {
                Ok(StartPlan::AskResume { session, goal })
            }
        }
        AttachDecision::Fresh => {
            if resume {
                bail!("no stored session to resume on this surface");
            }
            Ok(goal.map_or(StartPlan::AskGoal, StartPlan::New))
        }
    }
}

fn interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

fn prompt_goal() -> Result<String> {
    if !interactive() {
        bail!("no goal given; pass --goal");
    }
    let goal: String = Input::new()
        .with_prompt("Goal")
        .interact_text()
        .context("failed to read goal")?;
    let goal = goal.trim().to_string();
    if goal.is_empty() {
        bail!("no goal given");
    }
    Ok(goal)
}

/// Attach to `surface`, settle resume vs. new, and run the loop until it stops.
#[allow(clippy::too_many_arguments)]
pub fn attach(
    provider: &dyn TerminalProvider,
    repo: &dyn SessionRepository,
    config: &ProjectConfig,
    project_root: &Path,
    surface: SurfaceId,
    goal: Option<&str>,
    resume: bool,
    new: bool,
    stop: &AtomicBool,
) -> Result<LoopState> {
    let (pilot, decision) = Autopilot::attach(provider, repo, config, surface.clone())
        .with_context(|| format!("failed to attach to surface {surface}"))?;

    if let Ok(raw) = provider.read_visible_text(&surface) {
        let parser = TranscriptParser::new(&config.transcript);
        println!("Recent exchanges on {surface}");
        print!("{}", render_exchanges(&parser.parse(&raw, 3)));
    }

    let mut pilot = pilot.with_observer(Box::new(ConsoleObserver));
    let log_path = ExecutionLog::path_for(&config.log_dir(project_root), &surface);
    match ExecutionLog::new(&log_path) {
        Ok(log) => {
            info!(path = %log.path().display(), "execution log");
            pilot = pilot.with_log(log);
        }
        Err(e) => warn!(error = %e, "execution log disabled"),
    }

    match plan_start(decision, goal, resume, new)? {
        StartPlan::Resume(session) => pilot.resume(session)?,
        StartPlan::New(goal) => pilot.start_new(&goal)?,
        StartPlan::AskGoal => pilot.start_new(&prompt_goal()?)?,
        StartPlan::AskResume { session, goal } => {
            if !interactive() {
                bail!(
                    "surface {surface} has a stored {} session ({} messages, goal: {}); pass --resume or --new",
                    session.status,
                    session.messages_sent,
                    session.goal
                );
            }
            let resume = Confirm::new()
                .with_prompt(format!(
                    "Resume stored session ({} messages, goal: {})?",
                    session.messages_sent,
                    preview(&session.goal, 60)
                ))
                .default(true)
                .interact()
                .context("failed to read answer")?;
            if resume {
                pilot.resume(session)?;
            } else {
                let goal = match goal {
                    Some(goal) => goal,
                    None => prompt_goal()?,
                };
                pilot.start_new(&goal)?;
            }
        }
    }

    println!("[termpilot] autopilot running on {surface}, Ctrl-C to pause");
    let state = pilot.run(stop)?;
    match state {
        LoopState::Completed => println!("[termpilot] goal completed"),
        LoopState::Paused => println!("[termpilot] paused; resume with: termpilot attach {surface} --resume"),
        LoopState::Error => bail!("surface {surface} stopped responding; session saved as paused"),
        LoopState::Active | LoopState::AwaitingAttach => {}
    }
    Ok(state)
}

/// Interactive mode: choose an agent surface, then attach.
pub fn run_interactive(
    provider: &dyn TerminalProvider,
    repo: &dyn SessionRepository,
    config: &ProjectConfig,
    project_root: &Path,
    stop: &AtomicBool,
) -> Result<LoopState> {
    if !interactive() {
        bail!("interactive mode needs a terminal; use `termpilot attach <surface> --goal ...`");
    }
    let surfaces: Vec<Surface> = provider
        .list_surfaces()
        .context("failed to list surfaces")?
        .into_iter()
        .filter(|s| s.hosts_agent)
        .collect();
    if surfaces.is_empty() {
        bail!("no agent surfaces found; run `termpilot list --all` to see every pane");
    }

    let sessions = repo.list()?;
    let items: Vec<String> = surfaces
        .iter()
        .map(|surface| {
            let stored = sessions
                .iter()
                .find(|s| s.surface_id == surface.id)
                .map(|s| format!("  [{}]", s.status))
                .unwrap_or_default();
            format!("{} {}{stored}", surface.id, surface.title)
        })
        .collect();
    let choice = Select::new()
        .with_prompt("Surface")
        .items(&items)
        .default(0)
        .interact()
        .context("failed to read surface choice")?;

    let surface = surfaces[choice].id.clone();
    attach(provider, repo, config, project_root, surface, None, false, false, stop)
}
