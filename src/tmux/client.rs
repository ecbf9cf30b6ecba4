use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::{parse_window_line, Multiplexer, WindowInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exec::{self, ExecError};

const PRIMARY_INDEX: u32 = 0;

pub(crate) const LIST_WINDOWS_FORMAT: &str =
    "#{window_index}\t#{window_active}\t#{pane_dead}\t#{window_name}";

/// Client for interacting with tmux via CLI
pub struct TmuxClient {
    /// Path to tmux binary
    tmux_path: String,
    /// Dedicated server socket name (`-L`)
    socket: Option<String>,
    deadline: Duration,
}

impl TmuxClient {
    pub fn new(tmux_path: impl Into<String>, socket: Option<String>, deadline: Duration) -> Self {
        Self {
            tmux_path: tmux_path.into(),
            socket,
            deadline,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.tmux_binary.clone(),
            config.tmux_socket.clone(),
            config.capture_timeout(),
        )
    }

    fn base_args(&self) -> Vec<String> {
        match &self.socket {
            Some(socket) => vec!["-L".to_string(), socket.clone()],
            None => Vec::new(),
        }
    }

    /// Run one tmux command; a non-zero exit is mapped from its stderr
    async fn tmux(&self, args: &[&str]) -> Result<String> {
        let mut argv = self.base_args();
        argv.extend(args.iter().map(|a| a.to_string()));
        let what = args.first().copied().unwrap_or("tmux");

        let output = exec::run(&self.tmux_path, &argv, None, self.deadline)
            .await
            .map_err(|e| match e {
                ExecError::Spawn(e) => {
                    Error::MultiplexerUnavailable(format!("{}: {}", self.tmux_path, e))
                }
                ExecError::Timeout(after) => Error::Timeout {
                    what: format!("tmux {what}"),
                    after,
                },
            })?;

        if output.success {
            return Ok(output.stdout);
        }
        Err(failure(what, args, &output.stderr))
    }

    /// Put the primary window at index 0 whatever `base-index` the user's
    /// tmux.conf sets, and keep exited panes around.
    async fn prepare_session(&self, name: &str) -> Result<()> {
        self.tmux(&["set-option", "-t", &session_target(name), "base-index", "0"])
            .await?;
        let first = self
            .list_windows(name)
            .await?
            .first()
            .map(|w| w.index)
            .ok_or_else(|| Error::not_found("window", name))?;
        if first != PRIMARY_INDEX {
            self.tmux(&[
                "move-window",
                "-s",
                &window_target(name, first),
                "-t",
                &window_target(name, PRIMARY_INDEX),
            ])
            .await?;
        }
        self.keep_dead_panes(name, PRIMARY_INDEX).await
    }

    /// `remain-on-exit` is a window option, so it is set per window
    async fn keep_dead_panes(&self, name: &str, index: u32) -> Result<()> {
        self.tmux(&[
            "set-option",
            "-w",
            "-t",
            &window_target(name, index),
            "remain-on-exit",
            "on",
        ])
        .await
        .map(|_| ())
    }

    async fn tmux_ignore_missing(&self, args: &[&str]) -> Result<()> {
        match self.tmux(args).await {
            Ok(_) => Ok(()),
            Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Map a failed invocation's stderr onto the error taxonomy
fn failure(what: &str, args: &[&str], stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    let missing = [
        "can't find",
        "no server running",
        "no such",
        "session not found",
        "error connecting",
    ];
    if missing.iter().any(|m| lower.contains(m)) {
        let target = args
            .iter()
            .position(|a| *a == "-t")
            .and_then(|i| args.get(i + 1))
            .map(|t| t.trim_start_matches('='))
            .unwrap_or_default();
        let kind = if lower.contains("window") || lower.contains("pane") {
            "window"
        } else {
            "session"
        };
        return Error::not_found(kind, target);
    }
    Error::Multiplexer(format!("tmux {what}: {stderr}"))
}

/// Exact-match session target, so `asmgr-a` never resolves to `asmgr-ab`
fn session_target(name: &str) -> String {
    format!("={name}")
}

fn window_target(name: &str, index: u32) -> String {
    format!("={name}:{index}")
}

#[async_trait]
impl Multiplexer for TmuxClient {
    async fn has_session(&self, name: &str) -> Result<bool> {
        match self.tmux(&["has-session", "-t", &session_target(name)]).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn new_session(
        &self,
        name: &str,
        argv: &[String],
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<()> {
        let cwd = cwd.to_string_lossy();
        let (cols, rows) = (cols.to_string(), rows.to_string());
        let mut args = vec![
            "new-session", "-d", "-s", name, "-c", &cwd, "-x", &cols, "-y", &rows,
        ];
        args.extend(argv.iter().map(String::as_str));
        self.tmux(&args).await?;

        if let Err(e) = self.prepare_session(name).await {
            if let Err(kill) = self.kill_session(name).await {
                tracing::warn!(session = name, error = %kill, "failed to remove half-created session");
            }
            return Err(e);
        }
        tracing::info!(session = name, "created tmux session");
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        self.tmux_ignore_missing(&["kill-session", "-t", &session_target(name)])
            .await
    }

    async fn list_windows(&self, name: &str) -> Result<Vec<WindowInfo>> {
        let stdout = self
            .tmux(&[
                "list-windows",
                "-t",
                &session_target(name),
                "-F",
                LIST_WINDOWS_FORMAT,
            ])
            .await?;
        let mut windows: Vec<WindowInfo> = stdout.lines().filter_map(parse_window_line).collect();
        windows.sort_by_key(|w| w.index);
        Ok(windows)
    }

    async fn new_window(
        &self,
        name: &str,
        window_name: &str,
        argv: &[String],
        cwd: &Path,
    ) -> Result<u32> {
        let cwd = cwd.to_string_lossy();
        // A trailing ':' appends after the highest index.
        let target = format!("={name}:");
        let mut args = vec![
            "new-window",
            "-d",
            "-P",
            "-F",
            "#{window_index}",
            "-t",
            &target,
            "-n",
            window_name,
            "-c",
            &cwd,
        ];
        args.extend(argv.iter().map(String::as_str));
        let stdout = self.tmux(&args).await?;
        let index = stdout
            .trim()
            .parse()
            .map_err(|_| Error::Multiplexer(format!("tmux new-window: unexpected output '{}'", stdout.trim())))?;
        self.keep_dead_panes(name, index).await?;
        Ok(index)
    }

    async fn kill_window(&self, name: &str, index: u32) -> Result<()> {
        self.tmux_ignore_missing(&["kill-window", "-t", &window_target(name, index)])
            .await
    }

    async fn rename_window(&self, name: &str, index: u32, window_name: &str) -> Result<()> {
        self.tmux(&["rename-window", "-t", &window_target(name, index), window_name])
            .await
            .map(|_| ())
    }

    async fn select_window(&self, name: &str, index: u32) -> Result<()> {
        self.tmux(&["select-window", "-t", &window_target(name, index)])
            .await
            .map(|_| ())
    }

    async fn send_keys(&self, name: &str, index: u32, text: &str) -> Result<()> {
        let target = window_target(name, index);
        self.tmux(&["send-keys", "-t", &target, "-l", "--", text]).await?;
        self.tmux(&["send-keys", "-t", &target, "Enter"]).await?;
        Ok(())
    }

    async fn send_key(&self, name: &str, index: u32, key: &str) -> Result<()> {
        self.tmux(&["send-keys", "-t", &window_target(name, index), key])
            .await
            .map(|_| ())
    }

    async fn capture_pane(&self, name: &str, index: u32, lines: usize) -> Result<String> {
        let start = format!("-{lines}");
        let stdout = self
            .tmux(&[
                "capture-pane",
                "-p",
                "-e",
                "-J",
                "-t",
                &window_target(name, index),
                "-S",
                &start,
            ])
            .await?;
        Ok(last_lines(&stdout, lines))
    }

    async fn resize_pane(&self, name: &str, cols: u16, rows: u16) -> Result<()> {
        let (cols, rows) = (cols.to_string(), rows.to_string());
        self.tmux(&[
            "resize-window",
            "-t",
            &session_target(name),
            "-x",
            &cols,
            "-y",
            &rows,
        ])
        .await
        .map(|_| ())
    }

    async fn bind_detach(&self, pattern: &str, key: &str, command: &str) -> Result<()> {
        let condition = format!("#{{m:{pattern},#{{session_name}}}}");
        let passthrough = format!("send-keys {key}");
        self.tmux(&[
            "bind-key",
            "-n",
            key,
            "if-shell",
            "-F",
            &condition,
            command,
            &passthrough,
        ])
        .await
        .map(|_| ())
    }

    /// Get the command to attach to a session (for external execution)
    fn attach_command(&self, name: &str) -> Vec<String> {
        let mut argv = vec![self.tmux_path.clone()];
        argv.extend(self.base_args());
        argv.extend([
            "attach-session".to_string(),
            "-t".to_string(),
            session_target(name),
        ]);
        argv
    }
}

/// Drop trailing blank rows of the pane, then keep the last `n` lines
fn last_lines(capture: &str, n: usize) -> String {
    let lines: Vec<&str> = capture.lines().collect();
    let end = lines
        .iter()
        .rposition(|l| !crate::activity::strip_ansi(l).trim().is_empty())
        .map_or(0, |i| i + 1);
    let start = end.saturating_sub(n);
    lines[start..end].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_mapping() {
        let e = failure(
            "has-session",
            &["has-session", "-t", "=asmgr-x"],
            "can't find session: asmgr-x",
        );
        assert!(matches!(e, Error::NotFound { kind: "session", ref id } if id == "asmgr-x"));

        let e = failure("kill-window", &["kill-window", "-t", "=s:4"], "can't find window: 4");
        assert!(matches!(e, Error::NotFound { kind: "window", .. }));

        let e = failure("new-session", &["new-session"], "duplicate session: s");
        assert!(matches!(e, Error::Multiplexer(ref m) if m.contains("duplicate session")));
    }

    #[test]
    fn test_last_lines_skips_blank_tail() {
        let capture = "a\nb\nc\n\n   \n\x1b[0m\n";
        assert_eq!(last_lines(capture, 2), "b\nc");
        assert_eq!(last_lines(capture, 10), "a\nb\nc");
        assert_eq!(last_lines("\n\n", 5), "");
    }

    #[test]
    fn test_attach_command_uses_socket_and_exact_target() {
        let client = TmuxClient::new("tmux", Some("test".into()), Duration::from_secs(1));
        assert_eq!(
            client.attach_command("asmgr-1"),
            ["tmux", "-L", "test", "attach-session", "-t", "=asmgr-1"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let client = TmuxClient::new("no-such-tmux-binary", None, Duration::from_secs(1));
        assert!(matches!(
            client.has_session("x").await,
            Err(Error::MultiplexerUnavailable(_))
        ));
    }

    /// A tmux server on its own socket, killed when dropped
    struct PrivateServer {
        socket: String,
    }

    impl PrivateServer {
        async fn start(tag: &str) -> Option<Self> {
            if !exec::is_available("tmux", "-V").await {
                return None;
            }
            Some(Self {
                socket: format!("asmgr-test-{}-{}", tag, std::process::id()),
            })
        }

        fn client(&self) -> TmuxClient {
            TmuxClient::new("tmux", Some(self.socket.clone()), Duration::from_secs(5))
        }

        async fn run(&self, args: &[&str]) {
            let mut argv = vec!["-L", self.socket.as_str()];
            argv.extend_from_slice(args);
            let out = exec::run("tmux", &argv, None, Duration::from_secs(5))
                .await
                .unwrap();
            assert!(out.success, "tmux {args:?}: {}", out.stderr);
        }
    }

    impl Drop for PrivateServer {
        fn drop(&mut self) {
            let _ = std::process::Command::new("tmux")
                .args(["-L", &self.socket, "kill-server"])
                .output();
        }
    }

    async fn wait_for_line(client: &TmuxClient, name: &str, index: u32, needle: &str) -> bool {
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let capture = client.capture_pane(name, index, 50).await.unwrap();
            if capture.lines().any(|l| l.contains(needle)) {
                return true;
            }
        }
        false
    }

    #[tokio::test]
    async fn test_real_tmux_window_lifecycle() {
        let Some(server) = PrivateServer::start("lifecycle").await else {
            return;
        };
        let client = server.client();
        let name = "asmgr-lifecycle";
        let cwd = std::env::temp_dir();
        let shell = vec!["sh".to_string()];

        client.new_session(name, &shell, &cwd, 80, 24).await.unwrap();
        assert!(client.has_session(name).await.unwrap());
        assert!(!client.has_session("asmgr-lifecycl").await.unwrap());

        let index = client.new_window(name, "logs", &shell, &cwd).await.unwrap();
        let windows = client.list_windows(name).await.unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].index, 0);
        assert_eq!(windows[1].index, index);
        assert_eq!(windows[1].name, "logs");

        client.send_keys(name, index, "echo hi-from-test").await.unwrap();
        assert!(wait_for_line(&client, name, index, "hi-from-test").await);

        client.kill_window(name, index).await.unwrap();
        client.kill_window(name, index).await.unwrap();
        client.kill_session(name).await.unwrap();
        client.kill_session(name).await.unwrap();
        assert!(!client.has_session(name).await.unwrap());
    }

    #[tokio::test]
    async fn test_real_tmux_keeps_exited_panes() {
        let Some(server) = PrivateServer::start("dead").await else {
            return;
        };
        let client = server.client();
        let name = "asmgr-dead";
        let cwd = std::env::temp_dir();
        let shell = vec!["sh".to_string()];
        client.new_session(name, &shell, &cwd, 80, 24).await.unwrap();

        let quick = vec!["sleep 0.3".to_string()];
        let index = client.new_window(name, "quick", &quick, &cwd).await.unwrap();
        let mut dead = false;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let windows = client.list_windows(name).await.unwrap();
            if windows.iter().any(|w| w.index == index && w.dead) {
                dead = true;
                break;
            }
        }
        assert!(dead);
    }

    #[tokio::test]
    async fn test_real_tmux_primary_window_ignores_base_index() {
        let Some(server) = PrivateServer::start("base").await else {
            return;
        };
        let client = server.client();
        let cwd = std::env::temp_dir();
        let shell = vec!["sh".to_string()];
        // A first session keeps the server alive while the option is set
        client.new_session("asmgr-boot", &shell, &cwd, 80, 24).await.unwrap();
        server.run(&["set-option", "-g", "base-index", "1"]).await;

        let name = "asmgr-base";
        client.new_session(name, &shell, &cwd, 80, 24).await.unwrap();
        let windows = client.list_windows(name).await.unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].index, 0);

        client.send_keys(name, 0, "echo on-primary").await.unwrap();
        assert!(wait_for_line(&client, name, 0, "on-primary").await);
    }

    #[tokio::test]
    async fn test_real_tmux_sends_text_starting_with_dash() {
        let Some(server) = PrivateServer::start("dash").await else {
            return;
        };
        let client = server.client();
        let name = "asmgr-dash";
        let cwd = std::env::temp_dir();
        client
            .new_session(name, &["sh".to_string()], &cwd, 80, 24)
            .await
            .unwrap();

        client.send_keys(name, 0, "-f foo").await.unwrap();
        assert!(wait_for_line(&client, name, 0, "-f foo").await);
    }
}
