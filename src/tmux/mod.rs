mod client;
#[cfg(test)]
pub mod fake;

pub use client::TmuxClient;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One window as reported by `list-windows`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub index: u32,
    pub name: String,
    pub active: bool,
    /// The pane's process has exited (`remain-on-exit` keeps it around)
    pub dead: bool,
}

/// Command layer over a terminal multiplexer.
///
/// Implementations never interpret screen contents and never retry. Calls
/// on an absent session fail with `NotFound`, except the kill operations,
/// which succeed.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    async fn has_session(&self, name: &str) -> Result<bool>;

    /// Launch a detached session running `argv` in `cwd`. A one-element argv
    /// is run through the shell. The first window always has index 0; a
    /// failure after the session exists removes it again.
    async fn new_session(
        &self,
        name: &str,
        argv: &[String],
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<()>;

    async fn kill_session(&self, name: &str) -> Result<()>;

    /// Windows of `name`, ordered by index
    async fn list_windows(&self, name: &str) -> Result<Vec<WindowInfo>>;

    /// Append a window and return the index the multiplexer assigned
    async fn new_window(
        &self,
        name: &str,
        window_name: &str,
        argv: &[String],
        cwd: &Path,
    ) -> Result<u32>;

    async fn kill_window(&self, name: &str, index: u32) -> Result<()>;

    async fn rename_window(&self, name: &str, index: u32, window_name: &str) -> Result<()>;

    async fn select_window(&self, name: &str, index: u32) -> Result<()>;

    /// Type `text` literally, then press Enter
    async fn send_keys(&self, name: &str, index: u32, text: &str) -> Result<()>;

    /// Press one symbolic key (`Enter`, `C-c`, `Escape`, ...)
    async fn send_key(&self, name: &str, index: u32, key: &str) -> Result<()>;

    /// The last `lines` lines of the window's pane, escape sequences kept
    async fn capture_pane(&self, name: &str, index: u32, lines: usize) -> Result<String>;

    async fn resize_pane(&self, name: &str, cols: u16, rows: u16) -> Result<()>;

    /// Bind `key` so that it runs `command` inside sessions whose name
    /// matches the glob `pattern`, and passes through everywhere else
    async fn bind_detach(&self, pattern: &str, key: &str, command: &str) -> Result<()>;

    /// Foreground argv that attaches the user's terminal to `name`
    fn attach_command(&self, name: &str) -> Vec<String>;
}

/// Parse one `list-windows` line in [`client::LIST_WINDOWS_FORMAT`]
pub(crate) fn parse_window_line(line: &str) -> Option<WindowInfo> {
    let mut parts = line.splitn(4, '\t');
    let index = parts.next()?.trim().parse().ok()?;
    let active = parts.next()? == "1";
    let dead = parts.next()? == "1";
    let name = parts.next().unwrap_or_default().to_string();
    Some(WindowInfo {
        index,
        name,
        active,
        dead,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_window_line() {
        assert_eq!(
            parse_window_line("0\t1\t0\tclaude"),
            Some(WindowInfo {
                index: 0,
                name: "claude".into(),
                active: true,
                dead: false
            })
        );
        let tab = parse_window_line("3\t0\t1\tlogs\twith tab").unwrap();
        assert_eq!(tab.index, 3);
        assert!(tab.dead);
        assert_eq!(tab.name, "logs\twith tab");
        assert!(parse_window_line("garbage").is_none());
        assert!(parse_window_line("").is_none());
    }
}
