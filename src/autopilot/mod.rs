//! The autopilot loop: one supervised surface, one goal.
//!
//! ```text
//! AwaitingAttach ──start_new/resume──▶ Active ──▶ Completed
//!                                        │  └───▶ Paused   (stop flag)
//!                                        └──────▶ Error    (provider gone)
//! ```
//!
//! Each [`Autopilot::step`] is one poll: read the visible capture, classify
//! it, and either wait, confirm, or ask the continuation policy for the next
//! message. Suspension happens only inside provider calls and the configured
//! pauses. Under [`Autopilot::run`] every pause wakes early on the stop flag,
//! and the flag is checked again before each injection, so an interrupt never
//! lets another message through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classifier::{SessionStatus, StatusClassifier, StatusKind};
use crate::config::ProjectConfig;
use crate::log::{ExecutionLog, LogEvent};
use crate::policy::{ContinuationPolicy, ContinuationReason, CueTable, NextInput};
use crate::registry::{
    AttachDecision, AutopilotSession, LifecycleStatus, RegistryError, SessionOwner,
    SessionRepository, attach_decision, save_checked,
};
use crate::terminal::{ProviderError, SurfaceId, TerminalProvider};
use crate::transcript::{Exchange, TranscriptParser, tail_lines};

/// Timing and limits of the loop, resolved from the project config.
#[derive(Debug, Clone)]
pub struct AutopilotConfig {
    pub poll_interval: Duration,
    pub confirm_pause: Duration,
    pub pre_message_pause: Duration,
    pub post_inject_pause: Duration,
    pub max_exchanges: usize,
    pub capture_lines: usize,
    pub max_provider_failures: u32,
    pub resend_after_polls: u32,
    /// Lowercased completion phrases checked before the policy runs.
    pub loop_completion: Vec<String>,
    pub confirm_token: String,
}

impl AutopilotConfig {
    pub fn from_project(config: &ProjectConfig) -> Self {
        let settings = &config.autopilot;
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_millis),
            confirm_pause: Duration::from_millis(settings.confirm_pause_millis),
            pre_message_pause: Duration::from_millis(settings.pre_message_pause_millis),
            post_inject_pause: Duration::from_millis(settings.post_inject_pause_millis),
            max_exchanges: settings.max_exchanges,
            capture_lines: settings.capture_lines,
            max_provider_failures: settings.max_provider_failures.max(1),
            resend_after_polls: settings.resend_after_polls,
            loop_completion: config
                .cues
                .loop_completion
                .iter()
                .map(|c| c.to_lowercase())
                .collect(),
            confirm_token: config.cues.confirm_token.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingAttach,
    Active,
    Completed,
    Paused,
    Error,
}

/// What a single poll did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The agent is working; nothing was sent.
    Busy(SessionStatus),
    ConfirmationSent,
    /// Idle, but no complete exchange on screen yet.
    NoExchanges,
    /// The latest exchange was already answered; waiting for the agent.
    AwaitingReply,
    MessageSent {
        text: String,
        reason: ContinuationReason,
    },
    /// Injection failed; the same decision is retried on the next poll.
    InjectionFailed,
    Completed,
    ProviderFailure {
        consecutive: u32,
    },
    /// The loop is not active (completed, paused, errored or never started).
    Inactive(LoopState),
}

#[derive(Debug, Error)]
pub enum AutopilotError {
    #[error("surface '{surface}' unavailable: {source}")]
    ProviderUnavailable {
        surface: SurfaceId,
        #[source]
        source: ProviderError,
    },
    #[error("no goal given for the autopilot session")]
    MissingGoal,
    #[error("surface '{surface}' is already driven by another autopilot (pid {pid})")]
    Conflict { surface: SurfaceId, pid: u32 },
    #[error(transparent)]
    Registry(RegistryError),
}

impl From<RegistryError> for AutopilotError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Conflict {
                surface_id, pid, ..
            } => AutopilotError::Conflict {
                surface: surface_id,
                pid,
            },
            other => AutopilotError::Registry(other),
        }
    }
}

/// Callback for loop events (console output, tests).
pub trait AutopilotObserver {
    fn on_status(&mut self, status: &SessionStatus);
    fn on_message_sent(&mut self, text: &str, reason: ContinuationReason, messages_sent: u32);
    fn on_confirmation(&mut self, token: &str);
    fn on_event(&mut self, message: &str);
}

/// Observer that ignores everything.
pub struct SilentObserver;

impl AutopilotObserver for SilentObserver {
    fn on_status(&mut self, _status: &SessionStatus) {}
    fn on_message_sent(&mut self, _text: &str, _reason: ContinuationReason, _sent: u32) {}
    fn on_confirmation(&mut self, _token: &str) {}
    fn on_event(&mut self, _message: &str) {}
}

const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Stop flag for callers that drive single steps and never interrupt.
static NEVER_STOP: AtomicBool = AtomicBool::new(false);

/// Sleep for `duration`, waking early once `stop` is set. Returns whether it was.
fn pause_for(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep((deadline - now).min(STOP_CHECK_INTERVAL));
    }
}

pub struct Autopilot<'a> {
    provider: &'a dyn TerminalProvider,
    repo: &'a dyn SessionRepository,
    config: AutopilotConfig,
    classifier: StatusClassifier,
    parser: TranscriptParser,
    policy: ContinuationPolicy,
    owner: SessionOwner,
    surface: SurfaceId,
    session: Option<AutopilotSession>,
    state: LoopState,
    observer: Box<dyn AutopilotObserver + 'a>,
    log: Option<ExecutionLog>,
    consecutive_failures: u32,
    last_status: Option<StatusKind>,
    last_answered: Option<Exchange>,
    unanswered_polls: u32,
}

impl<'a> Autopilot<'a> {
    /// Validate `surface` through the provider and look up its stored session.
    pub fn attach(
        provider: &'a dyn TerminalProvider,
        repo: &'a dyn SessionRepository,
        project: &ProjectConfig,
        surface: SurfaceId,
    ) -> Result<(Self, AttachDecision), AutopilotError> {
        if let Err(source) = provider.read_visible_text(&surface) {
            return Err(AutopilotError::ProviderUnavailable { surface, source });
        }

        let owner = SessionOwner::current();
        let decision = attach_decision(repo.load(&surface)?, &owner, SessionOwner::is_alive);
        debug!(surface = %surface, ?decision, "attach decision");

        let autopilot = Self {
            provider,
            repo,
            config: AutopilotConfig::from_project(project),
            classifier: StatusClassifier::new(&project.classifier),
            parser: TranscriptParser::new(&project.transcript),
            policy: ContinuationPolicy::new(CueTable::new(&project.cues)),
            owner,
            surface,
            session: None,
            state: LoopState::AwaitingAttach,
            observer: Box::new(SilentObserver),
            log: None,
            consecutive_failures: 0,
            last_status: None,
            last_answered: None,
            unanswered_polls: 0,
        };
        Ok((autopilot, decision))
    }

    pub fn with_observer(mut self, observer: Box<dyn AutopilotObserver + 'a>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn session(&self) -> Option<&AutopilotSession> {
        self.session.as_ref()
    }

    pub fn surface(&self) -> &SurfaceId {
        &self.surface
    }

    pub fn owner(&self) -> &SessionOwner {
        &self.owner
    }

    /// Start a new session with `goal`, replacing any stale record.
    pub fn start_new(&mut self, goal: &str) -> Result<(), AutopilotError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(AutopilotError::MissingGoal);
        }
        let mut session = AutopilotSession::new(self.surface.clone(), goal);
        session.owner = Some(self.owner.clone());
        save_checked(self.repo, &session, &self.owner)?;

        info!(surface = %self.surface, goal = %goal, "autopilot session started");
        self.record(LogEvent::SessionStarted {
            surface: self.surface.to_string(),
            goal: goal.to_string(),
        });
        self.observer
            .on_event(&format!("started on {} with goal: {goal}", self.surface));
        self.enter_active(session);
        Ok(())
    }

    /// Continue a stored session with its goal and counters.
    pub fn resume(&mut self, mut session: AutopilotSession) -> Result<(), AutopilotError> {
        if session.goal.trim().is_empty() {
            return Err(AutopilotError::MissingGoal);
        }
        session.surface_id = self.surface.clone();
        session.status = LifecycleStatus::Active;
        session.owner = Some(self.owner.clone());
        session.touch();
        save_checked(self.repo, &session, &self.owner)?;

        info!(
            surface = %self.surface,
            goal = %session.goal,
            messages_sent = session.messages_sent,
            "autopilot session resumed"
        );
        self.record(LogEvent::SessionResumed {
            surface: self.surface.to_string(),
            goal: session.goal.clone(),
            messages_sent: session.messages_sent,
        });
        self.observer.on_event(&format!(
            "resumed on {} after {} messages: {}",
            self.surface, session.messages_sent, session.goal
        ));
        self.enter_active(session);
        Ok(())
    }

    fn enter_active(&mut self, session: AutopilotSession) {
        let needs_opening = session.messages_sent == 0;
        let goal = session.goal.clone();
        self.session = Some(session);
        self.state = LoopState::Active;
        self.consecutive_failures = 0;
        self.last_status = None;
        self.last_answered = None;
        self.unanswered_polls = 0;

        if let Err(e) = self.provider.activate(&self.surface) {
            debug!(surface = %self.surface, error = %e, "could not activate surface");
        }
        if needs_opening {
            // A failure here is retried by the first idle poll.
            if let Err(e) = self.send(&goal, ContinuationReason::Opening, None, &NEVER_STOP) {
                warn!(surface = %self.surface, error = %e, "failed to persist opening message");
            }
        }
    }

    /// Run one poll cycle.
    pub fn step(&mut self) -> Result<StepOutcome, AutopilotError> {
        self.poll(&NEVER_STOP)
    }

    fn poll(&mut self, stop: &AtomicBool) -> Result<StepOutcome, AutopilotError> {
        if self.state != LoopState::Active {
            return Ok(StepOutcome::Inactive(self.state));
        }
        let Some((goal, messages_sent)) = self
            .session
            .as_ref()
            .map(|s| (s.goal.clone(), s.messages_sent))
        else {
            return Ok(StepOutcome::Inactive(self.state));
        };

        let raw = match self.provider.read_visible_text(&self.surface) {
            Ok(raw) => {
                self.consecutive_failures = 0;
                raw
            }
            Err(e) => return self.provider_failure(e),
        };

        let status = self.classifier.classify(&raw);
        self.observe(&status);

        if status.is_busy {
            return Ok(StepOutcome::Busy(status));
        }

        if status.kind == StatusKind::WaitingConfirmation {
            return self.confirm(stop);
        }

        let exchanges = self
            .parser
            .parse(tail_lines(&raw, self.config.capture_lines), self.config.max_exchanges);
        let Some(latest) = exchanges.last().cloned() else {
            if messages_sent == 0 {
                return self.send(&goal, ContinuationReason::Opening, None, stop);
            }
            return Ok(StepOutcome::NoExchanges);
        };

        let lower = latest.agent_text.to_lowercase();
        if let Some(cue) = self
            .config
            .loop_completion
            .iter()
            .find(|cue| lower.contains(cue.as_str()))
            .cloned()
        {
            return self.complete(Some(cue));
        }

        if self.last_answered.as_ref() == Some(&latest) {
            self.unanswered_polls += 1;
            if self.unanswered_polls < self.config.resend_after_polls {
                return Ok(StepOutcome::AwaitingReply);
            }
            debug!(surface = %self.surface, polls = self.unanswered_polls, "no reply, answering again");
        }
        self.unanswered_polls = 0;

        if pause_for(self.config.pre_message_pause, stop) {
            return self.interrupted();
        }
        match self.policy.next_input(&goal, &exchanges) {
            NextInput::GoalComplete => self.complete(None),
            NextInput::Send { text, reason } => self.send(&text, reason, Some(latest), stop),
        }
    }

    /// Poll until the session completes, errors, or `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<LoopState, AutopilotError> {
        loop {
            if stop.load(Ordering::Relaxed) {
                self.pause("interrupted")?;
                return Ok(self.state);
            }
            if self.state != LoopState::Active {
                return Ok(self.state);
            }
            self.poll(stop)?;
            if self.state != LoopState::Active {
                return Ok(self.state);
            }
            pause_for(self.config.poll_interval, stop);
        }
    }

    /// Stop driving the surface and release ownership. No-op unless active.
    pub fn pause(&mut self, reason: &str) -> Result<(), AutopilotError> {
        if self.state != LoopState::Active {
            return Ok(());
        }
        self.state = LoopState::Paused;
        self.release(LifecycleStatus::Paused)?;
        info!(surface = %self.surface, reason, "autopilot paused");
        self.record(LogEvent::SessionPaused {
            reason: reason.to_string(),
        });
        self.observer.on_event(&format!("paused: {reason}"));
        Ok(())
    }

    fn interrupted(&mut self) -> Result<StepOutcome, AutopilotError> {
        self.pause("interrupted")?;
        Ok(StepOutcome::Inactive(self.state))
    }

    fn observe(&mut self, status: &SessionStatus) {
        if self.last_status == Some(status.kind) {
            return;
        }
        self.last_status = Some(status.kind);
        debug!(surface = %self.surface, kind = %status.kind, detail = %status.detail, "status changed");
        self.record(LogEvent::StatusObserved {
            kind: status.kind.to_string(),
            detail: status.detail.clone(),
            busy: status.is_busy,
        });
        self.observer.on_status(status);
    }

    fn provider_failure(&mut self, error: ProviderError) -> Result<StepOutcome, AutopilotError> {
        self.consecutive_failures += 1;
        let consecutive = self.consecutive_failures;
        warn!(surface = %self.surface, error = %error, consecutive, "provider read failed");
        self.record(LogEvent::ProviderFailure {
            error: error.to_string(),
            consecutive,
        });
        self.observer.on_event(&format!("read failed ({consecutive}): {error}"));

        if consecutive >= self.config.max_provider_failures {
            self.state = LoopState::Error;
            self.observe(&SessionStatus::error(error.to_string()));
            // Paused on disk so the session can be resumed once the surface is back.
            self.release(LifecycleStatus::Paused)?;
            self.record(LogEvent::SessionPaused {
                reason: format!("provider unavailable: {error}"),
            });
        }
        Ok(StepOutcome::ProviderFailure { consecutive })
    }

    fn confirm(&mut self, stop: &AtomicBool) -> Result<StepOutcome, AutopilotError> {
        if stop.load(Ordering::Relaxed) {
            return self.interrupted();
        }
        let token = self.config.confirm_token.clone();
        if let Err(e) = self.provider.inject(&self.surface, &token, true) {
            return Ok(self.injection_failed(&token, &e));
        }
        let confirmations_sent = match self.session.as_mut() {
            Some(session) => {
                session.confirmations_sent += 1;
                session.confirmations_sent
            }
            None => 0,
        };
        self.persist()?;

        info!(surface = %self.surface, token = %token, "confirmation sent");
        self.record(LogEvent::ConfirmationSent {
            token: token.clone(),
            confirmations_sent,
        });
        self.observer.on_confirmation(&token);
        pause_for(self.config.confirm_pause, stop);
        Ok(StepOutcome::ConfirmationSent)
    }

    fn send(
        &mut self,
        text: &str,
        reason: ContinuationReason,
        answering: Option<Exchange>,
        stop: &AtomicBool,
    ) -> Result<StepOutcome, AutopilotError> {
        if stop.load(Ordering::Relaxed) {
            return self.interrupted();
        }
        if let Err(e) = self.provider.inject(&self.surface, text, true) {
            return Ok(self.injection_failed(text, &e));
        }
        let messages_sent = match self.session.as_mut() {
            Some(session) => {
                session.messages_sent += 1;
                session.messages_sent
            }
            None => 0,
        };
        self.last_answered = answering;
        self.persist()?;

        info!(
            surface = %self.surface,
            reason = reason.as_str(),
            messages_sent,
            "message sent"
        );
        self.record(LogEvent::MessageSent {
            text: text.to_string(),
            reason: reason.as_str().to_string(),
            messages_sent,
        });
        self.observer.on_message_sent(text, reason, messages_sent);
        pause_for(self.config.post_inject_pause, stop);
        Ok(StepOutcome::MessageSent {
            text: text.to_string(),
            reason,
        })
    }

    fn injection_failed(&mut self, text: &str, error: &ProviderError) -> StepOutcome {
        warn!(surface = %self.surface, error = %error, "injection failed, retrying next poll");
        self.record(LogEvent::InjectionFailed {
            text: text.to_string(),
            error: error.to_string(),
        });
        self.observer.on_event(&format!("injection failed: {error}"));
        StepOutcome::InjectionFailed
    }

    fn complete(&mut self, cue: Option<String>) -> Result<StepOutcome, AutopilotError> {
        self.state = LoopState::Completed;
        self.release(LifecycleStatus::Completed)?;
        let messages_sent = self.session.as_ref().map_or(0, |s| s.messages_sent);

        info!(surface = %self.surface, messages_sent, cue = ?cue, "goal completed");
        self.record(LogEvent::GoalCompleted { messages_sent, cue });
        self.observer
            .on_event(&format!("goal completed after {messages_sent} messages"));
        Ok(StepOutcome::Completed)
    }

    /// Persist a terminal lifecycle status and drop ownership.
    fn release(&mut self, status: LifecycleStatus) -> Result<(), AutopilotError> {
        if let Some(session) = self.session.as_mut() {
            session.status = status;
            session.owner = None;
        }
        self.persist()
    }

    fn persist(&mut self) -> Result<(), AutopilotError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.touch();
        match save_checked(self.repo, session, &self.owner) {
            Ok(()) => Ok(()),
            Err(RegistryError::Conflict {
                surface_id, pid, ..
            }) => {
                warn!(surface = %surface_id, pid, "surface claimed by another autopilot, stopping");
                self.state = LoopState::Paused;
                Err(AutopilotError::Conflict {
                    surface: surface_id,
                    pid,
                })
            }
            Err(e) => {
                warn!(surface = %self.surface, error = %e, "failed to persist session");
                Ok(())
            }
        }
    }

    fn record(&self, event: LogEvent) {
        let Some(log) = &self.log else {
            return;
        };
        if let Err(e) = log.log(event) {
            warn!(error = %e, "failed to write execution log");
        }
    }
}
