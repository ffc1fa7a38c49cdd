//! Terminal I/O provider layer.
//!
//! A *surface* is any addressable text-rendering session (a tmux pane, a
//! terminal window) that termpilot can read from and type into. The autopilot
//! only talks to surfaces through [`TerminalProvider`], so the same loop can
//! drive tmux panes in production and scripted screens in tests.
//!
//! Every provider call must be bounded in time and must report failure as a
//! [`ProviderError`] instead of hanging or panicking.

pub mod tmux;

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque identifier of a surface (`%3` for a tmux pane, `7` for a window id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(String);

impl SurfaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SurfaceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A surface as reported by [`TerminalProvider::list_surfaces`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    pub id: SurfaceId,
    /// Display title (window or pane title).
    pub title: String,
    /// Whether the title carries one of the configured agent markers.
    pub hosts_agent: bool,
}

/// Failure of a single provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("surface '{0}' not found")]
    NotFound(SurfaceId),
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    #[error("{operation} failed: {detail}")]
    CommandFailed { operation: String, detail: String },
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Access to the surfaces of one terminal backend.
///
/// Implementations are not required to be safe for concurrent writers to the
/// same surface. A caller that owns a surface must issue its injections one at
/// a time.
pub trait TerminalProvider {
    /// Enumerate the surfaces currently known to the backend.
    fn list_surfaces(&self) -> Result<Vec<Surface>, ProviderError>;

    /// Text currently rendered on the surface (fast, no scrollback).
    fn read_visible_text(&self, id: &SurfaceId) -> Result<String, ProviderError>;

    /// Full scrollback of the surface.
    fn read_full_history(&self, id: &SurfaceId) -> Result<String, ProviderError>;

    /// Type `text` into the surface, followed by a submit keystroke when
    /// `submit` is true. Text and submit form one call from the caller's point
    /// of view. Multi-line text arrives as one line.
    fn inject(&self, id: &SurfaceId, text: &str, submit: bool) -> Result<(), ProviderError>;

    /// Bring the surface to the foreground.
    fn activate(&self, id: &SurfaceId) -> Result<(), ProviderError>;
}

/// Decide whether a surface title marks a supervised agent session.
///
/// Alphabetic markers match case-insensitively; symbol markers (such as the
/// `✳` spinner Claude Code puts in its title) match literally.
pub fn title_hosts_agent(title: &str, markers: &[String]) -> bool {
    let lower = title.to_lowercase();
    markers.iter().any(|marker| {
        if marker.chars().any(char::is_alphabetic) {
            lower.contains(&marker.to_lowercase())
        } else {
            title.contains(marker.as_str())
        }
    })
}
