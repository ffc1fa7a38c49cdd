//! Durable autopilot session records, keyed by surface id.
//!
//! The store is a single JSON object mapping surface id to an
//! [`AutopilotSession`]. It is re-read before every mutation and rewritten
//! atomically (temp file + rename), so independent loop instances driving
//! different surfaces can share one file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::terminal::SurfaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Active,
    Completed,
    Paused,
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleStatus::Active => "active",
            LifecycleStatus::Completed => "completed",
            LifecycleStatus::Paused => "paused",
        };
        f.write_str(label)
    }
}

/// The loop instance holding injection rights for a surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOwner {
    pub id: Uuid,
    pub pid: u32,
}

impl SessionOwner {
    /// A fresh owner token for this process.
    pub fn current() -> Self {
        Self {
            id: Uuid::new_v4(),
            pid: std::process::id(),
        }
    }

    /// Whether the owning process still exists.
    #[cfg(unix)]
    pub fn is_alive(&self) -> bool {
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // Signal 0 only checks for existence; EPERM means it exists under another user.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    pub fn is_alive(&self) -> bool {
        self.pid == std::process::id()
    }
}

/// Persistent record of one autopilot run on a surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutopilotSession {
    pub surface_id: SurfaceId,
    pub goal: String,
    pub started_at: DateTime<Utc>,
    pub messages_sent: u32,
    /// Confirmation tokens sent; not goal-directed messages.
    #[serde(default)]
    pub confirmations_sent: u32,
    pub status: LifecycleStatus,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<SessionOwner>,
}

impl AutopilotSession {
    pub fn new(surface_id: SurfaceId, goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            surface_id,
            goal: goal.into(),
            started_at: now,
            messages_sent: 0,
            confirmations_sent: 0,
            status: LifecycleStatus::Active,
            updated_at: now,
            owner: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_resumable(&self) -> bool {
        matches!(
            self.status,
            LifecycleStatus::Active | LifecycleStatus::Paused
        )
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to access session registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("surface '{surface_id}' is driven by another autopilot (owner {owner}, pid {pid})")]
    Conflict {
        surface_id: SurfaceId,
        owner: Uuid,
        pid: u32,
    },
    #[error("failed to serialize session registry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Load/save/list access to session records.
pub trait SessionRepository {
    fn load(&self, surface_id: &SurfaceId) -> Result<Option<AutopilotSession>, RegistryError>;

    /// Insert or replace the record for `session.surface_id`.
    fn save(&self, session: &AutopilotSession) -> Result<(), RegistryError>;

    fn list(&self) -> Result<Vec<AutopilotSession>, RegistryError>;
}

/// JSON file backed repository.
#[derive(Debug, Clone)]
pub struct JsonFileRegistry {
    path: PathBuf,
}

impl JsonFileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record. A missing file is an empty registry; an unreadable or
    /// malformed one is logged and treated as empty.
    fn read_all(&self) -> BTreeMap<String, AutopilotSession> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "session registry unreadable, starting empty");
                return BTreeMap::new();
            }
        };
        if contents.trim().is_empty() {
            return BTreeMap::new();
        }
        match serde_json::from_str(&contents) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "session registry corrupt, starting empty");
                BTreeMap::new()
            }
        }
    }

    fn write_all(&self, sessions: &BTreeMap<String, AutopilotSession>) -> Result<(), RegistryError> {
        let io_err = |source| RegistryError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(sessions)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!(path = %self.path.display(), records = sessions.len(), "session registry saved");
        Ok(())
    }
}

impl SessionRepository for JsonFileRegistry {
    fn load(&self, surface_id: &SurfaceId) -> Result<Option<AutopilotSession>, RegistryError> {
        Ok(self.read_all().remove(surface_id.as_str()))
    }

    fn save(&self, session: &AutopilotSession) -> Result<(), RegistryError> {
        let mut sessions = self.read_all();
        sessions.insert(session.surface_id.to_string(), session.clone());
        self.write_all(&sessions)
    }

    fn list(&self) -> Result<Vec<AutopilotSession>, RegistryError> {
        Ok(self.read_all().into_values().collect())
    }
}

/// Outcome of looking up a surface before starting the loop on it.
#[derive(Debug, Clone, PartialEq)]
pub enum AttachDecision {
    /// No resumable record; a new session may start.
    Fresh,
    /// An active or paused record nobody else is driving.
    Resume(AutopilotSession),
    /// An active record owned by another live loop instance.
    Conflict(AutopilotSession),
}

/// Decide how to attach given the stored record for a surface.
pub fn attach_decision(
    existing: Option<AutopilotSession>,
    me: &SessionOwner,
    is_alive: impl Fn(&SessionOwner) -> bool,
) -> AttachDecision {
    let Some(session) = existing else {
        return AttachDecision::Fresh;
    };
    if !session.is_resumable() {
        return AttachDecision::Fresh;
    }
    if held_by_other(&session, me, &is_alive) {
        return AttachDecision::Conflict(session);
    }
    AttachDecision::Resume(session)
}

fn held_by_other(
    session: &AutopilotSession,
    me: &SessionOwner,
    is_alive: &impl Fn(&SessionOwner) -> bool,
) -> bool {
    session.status == LifecycleStatus::Active
        && session
            .owner
            .as_ref()
            .is_some_and(|owner| owner.id != me.id && is_alive(owner))
}

/// Save `session` unless the stored record was claimed by another live owner
/// since we last looked.
pub fn save_checked(
    repo: &dyn SessionRepository,
    session: &AutopilotSession,
    me: &SessionOwner,
) -> Result<(), RegistryError> {
    if let Some(stored) = repo.load(&session.surface_id)? {
        if held_by_other(&stored, me, &SessionOwner::is_alive) {
            let owner = stored.owner.unwrap_or_else(|| me.clone());
            return Err(RegistryError::Conflict {
                surface_id: stored.surface_id,
                owner: owner.id,
                pid: owner.pid,
            });
        }
    }
    repo.save(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &tempfile::TempDir) -> JsonFileRegistry {
        JsonFileRegistry::new(dir.path().join(".termpilot").join("sessions.json"))
    }

    fn other_owner() -> SessionOwner {
        SessionOwner {
            id: Uuid::new_v4(),
            pid: std::process::id(),
        }
    }

    #[test]
    fn missing_file_is_empty_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(&tmp);
        assert!(reg.list().unwrap().is_empty());
        assert!(reg.load(&SurfaceId::new("7")).unwrap().is_none());
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(&tmp);
        let mut session = AutopilotSession::new(SurfaceId::new("%3"), "write a haiku");
        session.messages_sent = 2;
        session.owner = Some(SessionOwner::current());
        reg.save(&session).unwrap();

        let loaded = reg.load(&SurfaceId::new("%3")).unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(!reg.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn file_is_keyed_by_surface_id() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(&tmp);
        reg.save(&AutopilotSession::new(SurfaceId::new("7"), "X")).unwrap();
        reg.save(&AutopilotSession::new(SurfaceId::new("9"), "Y")).unwrap();

        let raw = std::fs::read_to_string(reg.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["7"]["goal"], "X");
        assert_eq!(value["9"]["status"], "active");
        assert_eq!(reg.list().unwrap().len(), 2);
    }

    #[test]
    fn save_replaces_existing_record() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(&tmp);
        let mut session = AutopilotSession::new(SurfaceId::new("7"), "X");
        reg.save(&session).unwrap();
        session.status = LifecycleStatus::Completed;
        reg.save(&session).unwrap();

        let all = reg.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, LifecycleStatus::Completed);
    }

    #[test]
    fn corrupt_file_falls_back_to_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(&tmp);
        std::fs::create_dir_all(reg.path().parent().unwrap()).unwrap();
        std::fs::write(reg.path(), "{ not json").unwrap();

        assert!(reg.list().unwrap().is_empty());

        // The next save rewrites a valid file.
        reg.save(&AutopilotSession::new(SurfaceId::new("1"), "goal")).unwrap();
        assert_eq!(reg.list().unwrap().len(), 1);
    }

    #[test]
    fn legacy_record_without_optional_fields_loads() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(&tmp);
        std::fs::create_dir_all(reg.path().parent().unwrap()).unwrap();
        std::fs::write(
            reg.path(),
            r#"{"7": {"surface_id": "7", "goal": "X", "started_at": "2026-01-05T10:00:00Z",
                "messages_sent": 3, "status": "active"}}"#,
        )
        .unwrap();

        let session = reg.load(&SurfaceId::new("7")).unwrap().unwrap();
        assert_eq!(session.messages_sent, 3);
        assert_eq!(session.confirmations_sent, 0);
        assert!(session.owner.is_none());
    }

    #[test]
    fn no_record_means_fresh() {
        let me = SessionOwner::current();
        assert_eq!(attach_decision(None, &me, |_| true), AttachDecision::Fresh);
    }

    #[test]
    fn completed_record_means_fresh() {
        let me = SessionOwner::current();
        let mut session = AutopilotSession::new(SurfaceId::new("7"), "X");
        session.status = LifecycleStatus::Completed;
        assert_eq!(
            attach_decision(Some(session), &me, |_| true),
            AttachDecision::Fresh
        );
    }

    #[test]
    fn active_record_without_owner_is_resumed() {
        let me = SessionOwner::current();
        let mut session = AutopilotSession::new(SurfaceId::new("7"), "X");
        session.messages_sent = 3;
        match attach_decision(Some(session), &me, |_| true) {
            AttachDecision::Resume(s) => {
                assert_eq!(s.goal, "X");
                assert_eq!(s.messages_sent, 3);
            }
            other => panic!("expected resume, got {other:?}"),
        }
    }

    #[test]
    fn paused_record_is_resumed_even_with_live_owner() {
        let me = SessionOwner::current();
        let mut session = AutopilotSession::new(SurfaceId::new("7"), "X");
        session.status = LifecycleStatus::Paused;
        session.owner = Some(other_owner());
        assert!(matches!(
            attach_decision(Some(session), &me, |_| true),
            AttachDecision::Resume(_)
        ));
    }

    #[test]
    fn live_foreign_owner_conflicts() {
        let me = SessionOwner::current();
        let mut session = AutopilotSession::new(SurfaceId::new("7"), "X");
        session.owner = Some(other_owner());
        assert!(matches!(
            attach_decision(Some(session.clone()), &me, |_| true),
            AttachDecision::Conflict(_)
        ));
        // Dead owner: the record is stale and can be taken over.
        assert!(matches!(
            attach_decision(Some(session), &me, |_| false),
            AttachDecision::Resume(_)
        ));
    }

    #[test]
    fn own_record_is_never_a_conflict() {
        let me = SessionOwner::current();
        let mut session = AutopilotSession::new(SurfaceId::new("7"), "X");
        session.owner = Some(me.clone());
        assert!(matches!(
            attach_decision(Some(session), &me, |_| true),
            AttachDecision::Resume(_)
        ));
    }

    #[test]
    fn save_checked_rejects_foreign_claim() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(&tmp);
        let me = SessionOwner::current();

        let mut theirs = AutopilotSession::new(SurfaceId::new("7"), "theirs");
        theirs.owner = Some(other_owner());
        reg.save(&theirs).unwrap();

        let mut mine = AutopilotSession::new(SurfaceId::new("7"), "mine");
        mine.owner = Some(me.clone());
        let err = save_checked(&reg, &mine, &me).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
        assert_eq!(reg.load(&SurfaceId::new("7")).unwrap().unwrap().goal, "theirs");
    }

    #[test]
    fn save_checked_allows_own_and_unowned_records() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(&tmp);
        let me = SessionOwner::current();

        let mut session = AutopilotSession::new(SurfaceId::new("7"), "X");
        save_checked(&reg, &session, &me).unwrap();
        session.owner = Some(me.clone());
        session.messages_sent = 1;
        save_checked(&reg, &session, &me).unwrap();
        assert_eq!(reg.load(&SurfaceId::new("7")).unwrap().unwrap().messages_sent, 1);
    }

    #[cfg(unix)]
    #[test]
    fn current_process_is_alive() {
        assert!(SessionOwner::current().is_alive());
        let bogus = SessionOwner {
            id: Uuid::new_v4(),
            pid: 0,
        };
        assert!(!bogus.is_alive());
    }
}
