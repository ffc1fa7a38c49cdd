//! tmux-backed terminal provider.
//!
//! Surfaces are tmux panes, addressed by pane id (`%3`). Text is read with
//! `capture-pane` and injected with `send-keys`. Every tmux invocation runs
//! under a deadline: the child is spawned, its output is collected on a helper
//! thread, and the child is killed if the deadline passes first.

use std::borrow::Cow;
use std::process::{Command, Output, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{ProviderError, Surface, SurfaceId, TerminalProvider, title_hosts_agent};
use crate::config::ProviderSettings;

const TMUX: &str = "tmux";
const LIST_FORMAT: &str = "#{pane_id}\t#{session_name}:#{window_index}.#{pane_index}\t#{pane_title}\t#{window_name}";

/// Terminal provider that drives panes of the running tmux server.
#[derive(Debug, Clone)]
pub struct TmuxProvider {
    timeout: Duration,
    submit_settle: Duration,
    max_surfaces: usize,
    title_markers: Vec<String>,
}

impl TmuxProvider {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_secs),
            submit_settle: Duration::from_millis(settings.submit_settle_millis),
            max_surfaces: settings.max_surfaces,
            title_markers: settings.agent_title_markers.clone(),
        }
    }

    /// Check that tmux is installed and reachable.
    pub fn check(&self) -> Result<String, ProviderError> {
        let output = self.run(&["-V"], "tmux -V")?;
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(version = %version, "tmux found");
        Ok(version)
    }

    fn run(&self, args: &[&str], operation: &str) -> Result<Output, ProviderError> {
        run_bounded(TMUX, args, self.timeout, operation)
    }

    /// Run a tmux command against one pane and map tmux's "can't find" errors
    /// to [`ProviderError::NotFound`].
    fn run_on(
        &self,
        id: &SurfaceId,
        args: &[&str],
        operation: &str,
    ) -> Result<Output, ProviderError> {
        let output = self.run(args, operation)?;
        if output.status.success() {
            return Ok(output);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_missing_target(&stderr) {
            return Err(ProviderError::NotFound(id.clone()));
        }
        Err(ProviderError::CommandFailed {
            operation: operation.to_string(),
            detail: stderr,
        })
    }

    fn capture(&self, id: &SurfaceId, full: bool) -> Result<String, ProviderError> {
        let mut args = vec!["capture-pane", "-p", "-J", "-t", id.as_str()];
        if full {
            args.extend(["-S", "-"]);
        }
        let output = self.run_on(id, &args, "tmux capture-pane")?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl TerminalProvider for TmuxProvider {
    fn list_surfaces(&self) -> Result<Vec<Surface>, ProviderError> {
        let output = self.run(&["list-panes", "-a", "-F", LIST_FORMAT], "tmux list-panes")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // No server running means no surfaces, not a failure.
            if stderr.contains("no server running") || stderr.contains("error connecting") {
                return Ok(Vec::new());
            }
            return Err(ProviderError::CommandFailed {
                operation: "tmux list-panes".to_string(),
                detail: stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_surface_list(
            &stdout,
            &self.title_markers,
            self.max_surfaces,
        ))
    }

    fn read_visible_text(&self, id: &SurfaceId) -> Result<String, ProviderError> {
        self.capture(id, false)
    }

    fn read_full_history(&self, id: &SurfaceId) -> Result<String, ProviderError> {
        self.capture(id, true)
    }

    fn inject(&self, id: &SurfaceId, text: &str, submit: bool) -> Result<(), ProviderError> {
        let text = single_line(text);
        if !text.is_empty() {
            // `-l` sends text literally so punctuation is not read as key names.
            self.run_on(
                id,
                &["send-keys", "-t", id.as_str(), "-l", "--", &*text],
                "tmux send-keys",
            )?;
        }

        if submit {
            // Let the pane render the text before Enter arrives.
            if !self.submit_settle.is_zero() {
                thread::sleep(self.submit_settle);
            }
            self.run_on(
                id,
                &["send-keys", "-t", id.as_str(), "C-m"],
                "tmux send-keys Enter",
            )?;
        }

        debug!(surface = %id, len = text.len(), submit, "injected text");
        Ok(())
    }

    fn activate(&self, id: &SurfaceId) -> Result<(), ProviderError> {
        self.run_on(
            id,
            &["select-window", "-t", id.as_str()],
            "tmux select-window",
        )?;
        self.run_on(id, &["select-pane", "-t", id.as_str()], "tmux select-pane")?;
        info!(surface = %id, "surface activated");
        Ok(())
    }
}

/// Join the lines of `text` with spaces. A literal newline would reach the
/// pane as Enter and submit the message in pieces.
fn single_line(text: &str) -> Cow<'_, str> {
    if !text.contains(['\n', '\r']) {
        return Cow::Borrowed(text);
    }
    let joined = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    Cow::Owned(joined)
}

fn is_missing_target(stderr: &str) -> bool {
    stderr.contains("can't find") || stderr.contains("no such")
}

/// Parse `list-panes -F` output produced with [`LIST_FORMAT`].
///
/// The pane title wins over the window name when both are present; lines
/// without a pane id are skipped.
fn parse_surface_list(output: &str, markers: &[String], max_surfaces: usize) -> Vec<Surface> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let id = fields.next()?.trim();
            if id.is_empty() {
                return None;
            }
            let location = fields.next().unwrap_or("").trim();
            let pane_title = fields.next().unwrap_or("").trim();
            let window_name = fields.next().unwrap_or("").trim();

            let name = if pane_title.is_empty() {
                window_name
            } else {
                pane_title
            };
            let title = if location.is_empty() {
                name.to_string()
            } else {
                format!("{location} {name}")
            };

            Some(Surface {
                id: SurfaceId::new(id),
                hosts_agent: title_hosts_agent(name, markers)
                    || title_hosts_agent(window_name, markers),
                title,
            })
        })
        .take(max_surfaces)
        .collect()
}

/// Run `program args...` and wait at most `timeout` for it to finish.
///
/// Output is collected on a helper thread so a child that writes a large
/// capture cannot block on a full pipe. On timeout the child is killed.
pub(crate) fn run_bounded(
    program: &str,
    args: &[&str],
    timeout: Duration,
    operation: &str,
) -> Result<Output, ProviderError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProviderError::Spawn {
            program: program.to_string(),
            source,
        })?;
    let pid = child.id();

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(child.wait_with_output());
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(ProviderError::CommandFailed {
            operation: operation.to_string(),
            detail: e.to_string(),
        }),
        Err(RecvTimeoutError::Timeout) => {
            warn!(operation, pid, ?timeout, "provider call timed out; killing child");
            terminate(pid);
            Err(ProviderError::Timeout {
                operation: operation.to_string(),
                timeout,
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(ProviderError::CommandFailed {
            operation: operation.to_string(),
            detail: "output collector exited without a result".to_string(),
        }),
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a pid we spawned; failure only means it already exited.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        vec!["✳".to_string(), "claude".to_string()]
    }

    #[test]
    fn multi_line_text_is_flattened_before_typing() {
        assert_eq!(single_line("write a haiku"), "write a haiku");
        assert!(matches!(single_line("one line"), Cow::Borrowed(_)));
        assert_eq!(
            single_line("refactor the parser\n\n  then add tests\r\n"),
            "refactor the parser then add tests"
        );
        assert_eq!(single_line("\n\n"), "");
    }

    #[test]
    fn parses_list_panes_output() {
        let output = "%0\tmain:0.0\t✳ Fix tests\tnode\n%4\twork:1.0\t\tbash\n";
        let surfaces = parse_surface_list(output, &markers(), 30);

        assert_eq!(surfaces.len(), 2);
        assert_eq!(surfaces[0].id, SurfaceId::new("%0"));
        assert_eq!(surfaces[0].title, "main:0.0 ✳ Fix tests");
        assert!(surfaces[0].hosts_agent);
        assert_eq!(surfaces[1].title, "work:1.0 bash");
        assert!(!surfaces[1].hosts_agent);
    }

    #[test]
    fn window_name_can_mark_agent() {
        let output = "%2\tdev:0.0\tlocalhost\tclaude\n";
        let surfaces = parse_surface_list(output, &markers(), 30);
        assert!(surfaces[0].hosts_agent);
    }

    #[test]
    fn surface_list_is_capped() {
        let output = (0..40)
            .map(|i| format!("%{i}\ts:0.{i}\tt\tw"))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(parse_surface_list(&output, &markers(), 30).len(), 30);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let surfaces = parse_surface_list("\n\n%1\ts:0.0\tx\ty\n", &markers(), 30);
        assert_eq!(surfaces.len(), 1);
    }

    #[test]
    fn missing_target_detection() {
        assert!(is_missing_target("can't find pane: %99"));
        assert!(!is_missing_target("server exited unexpectedly"));
    }

    #[cfg(unix)]
    #[test]
    fn run_bounded_returns_output() {
        let output = run_bounded("echo", &["bounded"], Duration::from_secs(5), "echo").unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "bounded");
    }

    #[cfg(unix)]
    #[test]
    fn run_bounded_times_out_slow_commands() {
        let err = run_bounded("sleep", &["5"], Duration::from_millis(100), "sleep").unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }), "got: {err:?}");
    }

    #[test]
    fn run_bounded_reports_missing_program() {
        let err = run_bounded(
            "termpilot-no-such-binary",
            &[],
            Duration::from_secs(1),
            "missing",
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::Spawn { .. }));
    }

    #[cfg(feature = "integration")]
    mod live {
        use super::super::*;
        use crate::config::ProviderSettings;
        use serial_test::serial;

        fn tmux(args: &[&str]) {
            let _ = Command::new(TMUX).args(args).output();
        }

        fn provider() -> TmuxProvider {
            TmuxProvider::new(&ProviderSettings::default())
        }

        fn pane_of(session: &str) -> SurfaceId {
            let out = Command::new(TMUX)
                .args(["display-message", "-p", "-t", session, "#{pane_id}"])
                .output()
                .unwrap();
            SurfaceId::new(String::from_utf8_lossy(&out.stdout).trim())
        }

        #[test]
        #[serial]
        fn check_reports_version() {
            assert!(provider().check().unwrap().starts_with("tmux"));
        }

        #[test]
        #[serial]
        fn inject_and_capture_round_trip() {
            let session = "termpilot-test-inject";
            tmux(&["kill-session", "-t", session]);
            tmux(&["new-session", "-d", "-s", session, "-x", "120", "-y", "30", "cat"]);
            std::thread::sleep(Duration::from_millis(200));

            let p = provider();
            let pane = pane_of(session);
            p.inject(&pane, "autopilot ping", true).unwrap();
            std::thread::sleep(Duration::from_millis(300));

            let visible = p.read_visible_text(&pane).unwrap();
            assert!(visible.contains("autopilot ping"), "got: {visible:?}");
            assert!(p.list_surfaces().unwrap().iter().any(|s| s.id == pane));

            tmux(&["kill-session", "-t", session]);
        }

        #[test]
        #[serial]
        fn unknown_pane_is_not_found() {
            let session = "termpilot-test-missing";
            tmux(&["kill-session", "-t", session]);
            tmux(&["new-session", "-d", "-s", session, "sleep", "10"]);

            let err = provider()
                .read_visible_text(&SurfaceId::new("%99999"))
                .unwrap_err();
            assert!(matches!(err, ProviderError::NotFound(_)), "got: {err:?}");

            tmux(&["kill-session", "-t", session]);
        }
    }
}
