//! Scripted in-memory provider for loop tests.

use std::cell::RefCell;
use std::collections::VecDeque;

use super::{ProviderError, Surface, SurfaceId, TerminalProvider};

/// Provider that replays a queue of screens for one surface.
///
/// Each `read_visible_text` pops the next scripted screen; once the queue is
/// drained the last screen keeps being returned. Injections are recorded.
pub struct ScriptedProvider {
    surface: Surface,
    screens: RefCell<VecDeque<String>>,
    last_screen: RefCell<String>,
    injected: RefCell<Vec<(String, bool)>>,
    fail_injections: RefCell<u32>,
    fail_reads: RefCell<u32>,
}

impl ScriptedProvider {
    pub fn new(id: &str, screens: &[&str]) -> Self {
        Self {
            surface: Surface {
                id: SurfaceId::new(id),
                title: "✳ Claude Code".to_string(),
                hosts_agent: true,
            },
            screens: RefCell::new(screens.iter().map(|s| s.to_string()).collect()),
            last_screen: RefCell::new(String::new()),
            injected: RefCell::new(Vec::new()),
            fail_injections: RefCell::new(0),
            fail_reads: RefCell::new(0),
        }
    }

    /// Make the next `n` injections fail.
    pub fn fail_next_injections(&self, n: u32) {
        *self.fail_injections.borrow_mut() = n;
    }

    /// Make the next `n` reads fail.
    pub fn fail_next_reads(&self, n: u32) {
        *self.fail_reads.borrow_mut() = n;
    }

    /// Texts injected so far, in order.
    pub fn injected(&self) -> Vec<String> {
        self.injected
            .borrow()
            .iter()
            .map(|(text, _)| text.clone())
            .collect()
    }

    fn check(&self, id: &SurfaceId) -> Result<(), ProviderError> {
        if *id == self.surface.id {
            Ok(())
        } else {
            Err(ProviderError::NotFound(id.clone()))
        }
    }
}

impl TerminalProvider for ScriptedProvider {
    fn list_surfaces(&self) -> Result<Vec<Surface>, ProviderError> {
        Ok(vec![self.surface.clone()])
    }

    fn read_visible_text(&self, id: &SurfaceId) -> Result<String, ProviderError> {
        self.check(id)?;
        {
            let mut failures = self.fail_reads.borrow_mut();
            if *failures > 0 {
                *failures -= 1;
                return Err(ProviderError::Timeout {
                    operation: "scripted read".to_string(),
                    timeout: std::time::Duration::from_secs(10),
                });
            }
        }
        if let Some(next) = self.screens.borrow_mut().pop_front() {
            *self.last_screen.borrow_mut() = next;
        }
        Ok(self.last_screen.borrow().clone())
    }

    fn read_full_history(&self, id: &SurfaceId) -> Result<String, ProviderError> {
        self.check(id)?;
        Ok(self.last_screen.borrow().clone())
    }

    fn inject(&self, id: &SurfaceId, text: &str, submit: bool) -> Result<(), ProviderError> {
        self.check(id)?;
        let mut failures = self.fail_injections.borrow_mut();
        if *failures > 0 {
            *failures -= 1;
            return Err(ProviderError::CommandFailed {
                operation: "scripted inject".to_string(),
                detail: "surface busy".to_string(),
            });
        }
        self.injected.borrow_mut().push((text.to_string(), submit));
        Ok(())
    }

    fn activate(&self, id: &SurfaceId) -> Result<(), ProviderError> {
        self.check(id)
    }
}
