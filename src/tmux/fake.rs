//! In-memory multiplexer for unit tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Multiplexer, WindowInfo};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct FakeWindow {
    pub name: String,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub dead: bool,
    pub screen: String,
    /// Text sent with `send_keys`, in order
    pub typed: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeSession {
    pub windows: BTreeMap<u32, FakeWindow>,
    pub active: u32,
    pub size: (u16, u16),
}

#[derive(Default)]
struct State {
    sessions: BTreeMap<String, FakeSession>,
    bindings: Vec<(String, String, String)>,
    /// Fail the next call starting with `.0` with error text `.1`
    fail_next: Option<(String, String)>,
    calls: Vec<String>,
}

/// Records every call and models sessions and windows like tmux does:
/// new windows take the next index after the highest one.
#[derive(Default)]
pub struct FakeMultiplexer {
    state: Mutex<State>,
}

impl FakeMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: String) -> Result<()> {
        let mut state = self.lock();
        let hit = matches!(&state.fail_next, Some((prefix, _)) if call.starts_with(prefix.as_str()));
        state.calls.push(call);
        match state.fail_next.take() {
            Some((_, message)) if hit => Err(Error::Multiplexer(message)),
            pending => {
                state.fail_next = pending;
                Ok(())
            }
        }
    }

    pub fn session(&self, name: &str) -> Option<FakeSession> {
        self.lock().sessions.get(name).cloned()
    }

    pub fn session_names(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    pub fn set_screen(&self, name: &str, index: u32, screen: &str) {
        if let Some(w) = self
            .lock()
            .sessions
            .get_mut(name)
            .and_then(|s| s.windows.get_mut(&index))
        {
            w.screen = screen.to_string();
        }
    }

    /// Simulate the process in a window exiting
    pub fn mark_dead(&self, name: &str, index: u32) {
        if let Some(w) = self
            .lock()
            .sessions
            .get_mut(name)
            .and_then(|s| s.windows.get_mut(&index))
        {
            w.dead = true;
        }
    }

    /// Simulate a session disappearing behind our back
    pub fn remove_session(&self, name: &str) {
        self.lock().sessions.remove(name);
    }

    /// Simulate a window opened by the user from inside the session
    pub fn open_external_window(&self, name: &str, window_name: &str) -> Option<u32> {
        let mut state = self.lock();
        let session = state.sessions.get_mut(name)?;
        let index = next_index(session);
        session.windows.insert(index, window(window_name, &[], Path::new("/")));
        Some(index)
    }

    pub fn fail_next(&self, call_prefix: &str, message: &str) {
        self.lock().fail_next = Some((call_prefix.to_string(), message.to_string()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.lock().bindings.clone()
    }

    fn with_window<T>(
        &self,
        name: &str,
        index: u32,
        f: impl FnOnce(&mut FakeWindow) -> T,
    ) -> Result<T> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(name)
            .ok_or_else(|| Error::not_found("session", name))?;
        let window = session
            .windows
            .get_mut(&index)
            .ok_or_else(|| Error::not_found("window", index.to_string()))?;
        Ok(f(window))
    }
}

fn window(name: &str, argv: &[String], cwd: &Path) -> FakeWindow {
    FakeWindow {
        name: name.to_string(),
        argv: argv.to_vec(),
        cwd: cwd.to_path_buf(),
        dead: false,
        screen: String::new(),
        typed: Vec::new(),
    }
}

fn next_index(session: &FakeSession) -> u32 {
    session.windows.keys().next_back().map_or(0, |i| i + 1)
}

#[async_trait]
impl Multiplexer for FakeMultiplexer {
    async fn has_session(&self, name: &str) -> Result<bool> {
        self.record(format!("has-session {name}"))?;
        Ok(self.lock().sessions.contains_key(name))
    }

    async fn new_session(
        &self,
        name: &str,
        argv: &[String],
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<()> {
        self.record(format!("new-session {name} {}", argv.join(" ")))?;
        let mut state = self.lock();
        if state.sessions.contains_key(name) {
            return Err(Error::Multiplexer(format!("duplicate session: {name}")));
        }
        let label = argv
            .first()
            .and_then(|a| a.split_whitespace().next())
            .unwrap_or("sh");
        let mut session = FakeSession {
            size: (cols, rows),
            ..Default::default()
        };
        session.windows.insert(0, window(label, argv, cwd));
        state.sessions.insert(name.to_string(), session);
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        self.record(format!("kill-session {name}"))?;
        self.lock().sessions.remove(name);
        Ok(())
    }

    async fn list_windows(&self, name: &str) -> Result<Vec<WindowInfo>> {
        self.record(format!("list-windows {name}"))?;
        let state = self.lock();
        let session = state
            .sessions
            .get(name)
            .ok_or_else(|| Error::not_found("session", name))?;
        Ok(session
            .windows
            .iter()
            .map(|(index, w)| WindowInfo {
                index: *index,
                name: w.name.clone(),
                active: *index == session.active,
                dead: w.dead,
            })
            .collect())
    }

    async fn new_window(
        &self,
        name: &str,
        window_name: &str,
        argv: &[String],
        cwd: &Path,
    ) -> Result<u32> {
        self.record(format!("new-window {name} {window_name} {}", argv.join(" ")))?;
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(name)
            .ok_or_else(|| Error::not_found("session", name))?;
        let index = next_index(session);
        session.windows.insert(index, window(window_name, argv, cwd));
        Ok(index)
    }

    async fn kill_window(&self, name: &str, index: u32) -> Result<()> {
        self.record(format!("kill-window {name}:{index}"))?;
        if let Some(session) = self.lock().sessions.get_mut(name) {
            session.windows.remove(&index);
        }
        Ok(())
    }

    async fn rename_window(&self, name: &str, index: u32, window_name: &str) -> Result<()> {
        self.record(format!("rename-window {name}:{index} {window_name}"))?;
        self.with_window(name, index, |w| w.name = window_name.to_string())
    }

    async fn select_window(&self, name: &str, index: u32) -> Result<()> {
        self.record(format!("select-window {name}:{index}"))?;
        self.with_window(name, index, |_| ())?;
        if let Some(session) = self.lock().sessions.get_mut(name) {
            session.active = index;
        }
        Ok(())
    }

    async fn send_keys(&self, name: &str, index: u32, text: &str) -> Result<()> {
        self.record(format!("send-keys {name}:{index}"))?;
        self.with_window(name, index, |w| w.typed.push(text.to_string()))
    }

    async fn send_key(&self, name: &str, index: u32, key: &str) -> Result<()> {
        self.record(format!("send-key {name}:{index} {key}"))?;
        self.with_window(name, index, |_| ())
    }

    async fn capture_pane(&self, name: &str, index: u32, lines: usize) -> Result<String> {
        self.record(format!("capture-pane {name}:{index}"))?;
        self.with_window(name, index, |w| {
            let all: Vec<&str> = w.screen.lines().collect();
            all[all.len().saturating_sub(lines)..].join("\n")
        })
    }

    async fn resize_pane(&self, name: &str, cols: u16, rows: u16) -> Result<()> {
        self.record(format!("resize {name} {cols}x{rows}"))?;
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(name)
            .ok_or_else(|| Error::not_found("session", name))?;
        session.size = (cols, rows);
        Ok(())
    }

    async fn bind_detach(&self, pattern: &str, key: &str, command: &str) -> Result<()> {
        self.record(format!("bind-key {key}"))?;
        let mut state = self.lock();
        let binding = (pattern.to_string(), key.to_string(), command.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    fn attach_command(&self, name: &str) -> Vec<String> {
        vec!["tmux".into(), "attach-session".into(), "-t".into(), format!("={name}")]
    }
}
