//! Working-tree diffs through an external VCS tool.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::exec::{self, ExecError};

pub const SNAPSHOT_UNAVAILABLE: &str = "start snapshot unavailable, showing full diff";

/// Git's well-known empty tree; the base of a checkout with no commits yet
pub const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Untracked files diffed individually before the rest are only counted
const UNTRACKED_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffMode {
    /// Working tree against the current commit
    #[default]
    Full,
    /// Working tree against the revision recorded at Start
    Session,
}

impl DiffMode {
    pub fn toggle(self) -> Self {
        match self {
            DiffMode::Full => DiffMode::Session,
            DiffMode::Session => DiffMode::Full,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DiffMode::Full => "full",
            DiffMode::Session => "session",
        }
    }
}

/// Unified diff text plus line counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
    /// The tool's unified diff, unmodified
    pub content: String,
    pub err: Option<String>,
    /// Shown alongside the diff, e.g. when the mode fell back
    pub note: Option<String>,
}

impl DiffStats {
    pub fn from_unified(content: String) -> Self {
        let (added, removed) = count_changes(&content);
        Self {
            added,
            removed,
            content,
            ..Default::default()
        }
    }

    fn failed(message: String) -> Self {
        Self {
            err: Some(message),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.content.trim().is_empty()
    }
}

/// Count `+`/`-` lines inside hunks, ignoring the `---`/`+++` file headers
pub fn count_changes(diff: &str) -> (usize, usize) {
    let mut added = 0;
    let mut removed = 0;
    let mut in_hunk = false;
    for line in diff.lines() {
        if line.starts_with("diff ") {
            in_hunk = false;
        } else if line.starts_with("@@") {
            in_hunk = true;
        } else if in_hunk {
            if line.starts_with('+') {
                added += 1;
            } else if line.starts_with('-') {
                removed += 1;
            }
        }
    }
    (added, removed)
}

/// Version-control seam used for snapshots and diffs
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Identifier of the checked-out revision in `cwd`
    async fn head_revision(&self, cwd: &Path) -> Result<String>;

    /// Diff `cwd` in `mode`. Failures are reported in [`DiffStats::err`].
    async fn diff(&self, cwd: &Path, mode: DiffMode, snapshot: Option<&str>) -> DiffStats;
}

pub struct GitDiffEngine {
    git: String,
    deadline: Duration,
}

impl GitDiffEngine {
    pub fn new(git: impl Into<String>, deadline: Duration) -> Self {
        Self {
            git: git.into(),
            deadline,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.git_binary.clone(), config.diff_timeout())
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<exec::CommandOutput> {
        let what = args.first().copied().unwrap_or("git");
        exec::run(&self.git, args, Some(cwd), self.deadline)
            .await
            .map_err(|e| match e {
                ExecError::Spawn(e) => Error::Vcs(format!("cannot run {}: {}", self.git, e)),
                ExecError::Timeout(after) => Error::Timeout {
                    what: format!("git {what}"),
                    after,
                },
            })
    }

    async fn revision_exists(&self, cwd: &Path, revision: &str) -> bool {
        let spec = format!("{revision}^{{tree}}");
        matches!(
            self.git(cwd, &["cat-file", "-e", &spec]).await,
            Ok(out) if out.success
        )
    }

    /// `HEAD`, or the empty tree while HEAD is unborn
    async fn full_base(&self, cwd: &Path) -> Result<String> {
        let out = self.git(cwd, &["rev-parse", "--verify", "-q", "HEAD"]).await?;
        if out.success {
            return Ok(out.stdout.trim().to_string());
        }
        let repo = self.git(cwd, &["rev-parse", "--git-dir"]).await?;
        if !repo.success {
            return Err(Error::Vcs(vcs_message(&repo.stderr)));
        }
        Ok(EMPTY_TREE.to_string())
    }

    async fn unified(&self, cwd: &Path, against: &str) -> DiffStats {
        let tracked = match self.git(cwd, &["diff", "--no-color", "--no-ext-diff", against]).await {
            Ok(out) if out.success => out.stdout,
            Ok(out) => return DiffStats::failed(vcs_message(&out.stderr)),
            Err(e) => return DiffStats::failed(e.to_string()),
        };
        let (untracked, skipped) = match self.untracked(cwd).await {
            Ok(found) => found,
            Err(e) => return DiffStats::failed(e.to_string()),
        };
        let mut stats = DiffStats::from_unified(tracked + &untracked);
        if skipped > 0 {
            stats.note = Some(format!("{skipped} more untracked files not shown"));
        }
        stats
    }

    /// New files as additions against /dev/null, honouring .gitignore.
    /// Returns the diff text and how many files were left out.
    async fn untracked(&self, cwd: &Path) -> Result<(String, usize)> {
        let out = self
            .git(cwd, &["ls-files", "--others", "--exclude-standard", "-z"])
            .await?;
        if !out.success {
            return Err(Error::Vcs(vcs_message(&out.stderr)));
        }
        let files: Vec<&str> = out.stdout.split('\0').filter(|f| !f.is_empty()).collect();
        let skipped = files.len().saturating_sub(UNTRACKED_LIMIT);

        let mut diff = String::new();
        for file in files.into_iter().take(UNTRACKED_LIMIT) {
            let out = self
                .git(
                    cwd,
                    &["diff", "--no-color", "--no-ext-diff", "--no-index", "--", "/dev/null", file],
                )
                .await?;
            // --no-index exits 1 when the files differ
            match out.code {
                Some(0) | Some(1) => diff.push_str(&out.stdout),
                _ => tracing::debug!(file, stderr = %out.stderr, "cannot diff untracked file"),
            }
        }
        Ok((diff, skipped))
    }
}

/// First line of git's stderr, without the `fatal: ` prefix
fn vcs_message(stderr: &str) -> String {
    let line = stderr.lines().next().unwrap_or("git diff failed");
    line.trim_start_matches("fatal: ").to_string()
}

#[async_trait]
impl Vcs for GitDiffEngine {
    async fn head_revision(&self, cwd: &Path) -> Result<String> {
        self.full_base(cwd).await
    }

    async fn diff(&self, cwd: &Path, mode: DiffMode, snapshot: Option<&str>) -> DiffStats {
        if mode == DiffMode::Session {
            if let Some(revision) = snapshot {
                if self.revision_exists(cwd, revision).await {
                    return self.unified(cwd, revision).await;
                }
            }
        }
        let base = match self.full_base(cwd).await {
            Ok(base) => base,
            Err(e) => return DiffStats::failed(e.to_string()),
        };
        let mut stats = self.unified(cwd, &base).await;
        if mode == DiffMode::Session {
            tracing::debug!(cwd = %cwd.display(), "session snapshot missing, falling back to full diff");
            stats.note = Some(match stats.note.take() {
                Some(more) => format!("{SNAPSHOT_UNAVAILABLE}; {more}"),
                None => SNAPSHOT_UNAVAILABLE.to_string(),
            });
        }
        stats
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Hands out a fixed revision and records which diffs were requested
    #[derive(Default)]
    pub struct FakeVcs {
        pub head: Mutex<Option<String>>,
        pub requests: Mutex<Vec<(DiffMode, Option<String>)>>,
    }

    impl FakeVcs {
        pub fn with_head(revision: &str) -> Self {
            Self {
                head: Mutex::new(Some(revision.to_string())),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Vcs for FakeVcs {
        async fn head_revision(&self, _cwd: &Path) -> Result<String> {
            let head = self.head.lock().unwrap_or_else(|e| e.into_inner()).clone();
            head.ok_or_else(|| Error::Vcs("not a git repository".into()))
        }

        async fn diff(&self, _cwd: &Path, mode: DiffMode, snapshot: Option<&str>) -> DiffStats {
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((mode, snapshot.map(str::to_string)));
            DiffStats::from_unified("@@ -1 +1 @@\n-a\n+b\n".to_string())
        }
    }
}
