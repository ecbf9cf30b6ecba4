//! Managed child processes with an overall deadline.
//!
//! Every external tool (tmux, git) goes through [`run`]. The child is spawned
//! with `kill_on_drop`, so when the deadline fires the future holding the
//! handle is dropped and the process is reaped instead of leaking.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;

/// Why a managed invocation produced no output
#[derive(Debug)]
pub enum ExecError {
    /// The binary could not be started at all
    Spawn(std::io::Error),
    /// The deadline elapsed and the child was killed
    Timeout(Duration),
}

/// Captured result of a finished child
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    /// Exit code; `None` when the child was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

/// Run `program args...` to completion, killing it after `deadline`
pub async fn run<S: AsRef<str>>(
    program: &str,
    args: &[S],
    cwd: Option<&Path>,
    deadline: Duration,
) -> Result<CommandOutput, ExecError> {
    let mut cmd = Command::new(program);
    cmd.args(args.iter().map(AsRef::as_ref))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(ExecError::Spawn)?;
    match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output.into()),
        Ok(Err(e)) => Err(ExecError::Spawn(e)),
        Err(_) => {
            tracing::debug!(program, ?deadline, "child process deadline exceeded");
            Err(ExecError::Timeout(deadline))
        }
    }
}

/// Check whether `program` can be executed (used for startup checks)
pub async fn is_available(program: &str, version_flag: &str) -> bool {
    matches!(
        run(program, &[version_flag], None, Duration::from_secs(2)).await,
        Ok(out) if out.success
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let result = run::<&str>(
            "definitely-not-a-real-binary-asmgr",
            &[],
            None,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ExecError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_deadline_kills_child() {
        let result = run("sleep", &["5"], None, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ExecError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let out = run("sh", &["-c", "printf hello"], None, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn test_keeps_exit_code() {
        let out = run("sh", &["-c", "exit 3"], None, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(3));
    }
}
