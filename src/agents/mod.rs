//! Per-agent metadata: launch commands, history locations and parsers,
//! and the screen patterns the activity classifier uses.

mod patterns;

pub use patterns::ScreenPatterns;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::history::{self, ConversationEntry, Role};

/// Supported agent kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Gemini,
    Aider,
    Codex,
    AmazonQ,
    OpenCode,
    Terminal,
    Custom,
}

impl AgentKind {
    pub const ALL: [AgentKind; 8] = [
        AgentKind::Claude,
        AgentKind::Gemini,
        AgentKind::Aider,
        AgentKind::Codex,
        AgentKind::AmazonQ,
        AgentKind::OpenCode,
        AgentKind::Terminal,
        AgentKind::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Gemini => "gemini",
            AgentKind::Aider => "aider",
            AgentKind::Codex => "codex",
            AgentKind::AmazonQ => "amazonq",
            AgentKind::OpenCode => "opencode",
            AgentKind::Terminal => "terminal",
            AgentKind::Custom => "custom",
        }
    }

    pub fn profile(&self) -> &'static AgentProfile {
        profile(*self)
    }

    /// The next kind in [`AgentKind::ALL`], wrapping around
    pub fn next(&self) -> AgentKind {
        let pos = Self::ALL.iter().position(|k| k == self).unwrap_or(0);
        Self::ALL[(pos + 1) % Self::ALL.len()]
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Config(format!("unknown agent kind '{s}'")))
    }
}

/// Inputs to an agent's launch command
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec<'a> {
    pub resume_id: Option<&'a str>,
    pub auto_approve: bool,
    pub custom_command: Option<&'a str>,
    /// Branch the resumed conversation instead of continuing it
    pub fork: bool,
}

/// Where history discovery looks besides the home directory
#[derive(Debug, Clone, Default)]
pub struct HistoryContext {
    pub home: PathBuf,
    /// Working directories of known instances (for per-project stores)
    pub project_paths: Vec<PathBuf>,
}

/// A prior conversation that can be resumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: String,
    pub first_prompt: String,
    pub last_prompt: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Static description of one agent
pub struct AgentProfile {
    pub kind: AgentKind,
    pub display_name: &'static str,
    pub icon: &'static str,
    build_argv: fn(&LaunchSpec<'_>) -> Vec<String>,
    history_roots: fn(&HistoryContext) -> Vec<PathBuf>,
    history_files: fn(&Path) -> Vec<PathBuf>,
    parser: Option<fn(&Path) -> Result<Vec<ConversationEntry>>>,
    pub patterns: ScreenPatterns,
}

impl fmt::Debug for AgentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentProfile")
            .field("kind", &self.kind)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

impl AgentProfile {
    /// Build the argv for launching this agent. A single-element argv is
    /// handed to the multiplexer as a shell command line.
    pub fn launch_argv(&self, spec: &LaunchSpec<'_>) -> Result<Vec<String>> {
        if self.kind == AgentKind::Custom {
            let cmd = spec.custom_command.map(str::trim).unwrap_or_default();
            if cmd.is_empty() {
                return Err(Error::Config("custom agent requires a command".into()));
            }
        }
        Ok((self.build_argv)(spec))
    }

    pub fn has_history(&self) -> bool {
        self.parser.is_some()
    }

    /// Every history file this agent currently has on disk
    pub fn discover_history(&self, ctx: &HistoryContext) -> Vec<PathBuf> {
        if self.parser.is_none() {
            return Vec::new();
        }
        let mut files = Vec::new();
        for root in (self.history_roots)(ctx) {
            if root.exists() {
                files.extend((self.history_files)(&root));
            }
        }
        files.sort();
        files.dedup();
        files
    }

    /// Parse one history file into chronologically ordered entries
    pub fn parse_history(&self, path: &Path) -> Result<Vec<ConversationEntry>> {
        match self.parser {
            Some(parse) => {
                let mut entries = parse(path)?;
                entries.sort_by_key(|e| e.timestamp);
                Ok(entries)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Prior conversations recorded for `cwd`, most recently updated first
    pub fn list_conversations(&self, ctx: &HistoryContext, cwd: &Path) -> Vec<ConversationSummary> {
        let mut by_session: HashMap<String, Vec<ConversationEntry>> = HashMap::new();
        for file in self.discover_history(ctx) {
            let entries = match self.parse_history(&file) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping history file");
                    continue;
                }
            };
            for entry in entries {
                if !entry.belongs_to(cwd) {
                    continue;
                }
                if let Some(id) = entry.session_id.clone() {
                    by_session.entry(id).or_default().push(entry);
                }
            }
        }

        let mut summaries: Vec<ConversationSummary> = by_session
            .into_iter()
            .filter_map(|(id, mut entries)| {
                entries.sort_by_key(|e| e.timestamp);
                let prompts: Vec<&ConversationEntry> =
                    entries.iter().filter(|e| e.role == Role::User).collect();
                let updated_at = entries.last()?.timestamp;
                Some(ConversationSummary {
                    first_prompt: prompts.first().map(|e| e.snippet.clone()).unwrap_or_default(),
                    last_prompt: prompts.last().map(|e| e.snippet.clone()).unwrap_or_default(),
                    message_count: entries.len(),
                    updated_at,
                    id,
                })
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        summaries
    }
}

/// Profiles in [`AgentKind::ALL`] order
static PROFILES: Lazy<Vec<AgentProfile>> = Lazy::new(|| {
    vec![
        AgentProfile {
            kind: AgentKind::Claude,
            display_name: "Claude",
            icon: "✻",
            build_argv: claude_argv,
            history_roots: |ctx| vec![ctx.home.join(".claude").join("projects")],
            history_files: |root| history::files_with_extension(root, "jsonl"),
            parser: Some(history::claude::parse),
            patterns: patterns::claude(),
        },
        AgentProfile {
            kind: AgentKind::Gemini,
            display_name: "Gemini",
            icon: "✦",
            build_argv: gemini_argv,
            history_roots: |ctx| vec![ctx.home.join(".gemini").join("tmp")],
            history_files: history::gemini::session_files,
            parser: Some(history::gemini::parse),
            patterns: patterns::gemini(),
        },
        AgentProfile {
            kind: AgentKind::Aider,
            display_name: "Aider",
            icon: "◆",
            build_argv: aider_argv,
            history_roots: |ctx| ctx.project_paths.clone(),
            history_files: history::aider::history_file,
            parser: Some(history::aider::parse),
            patterns: patterns::aider(),
        },
        AgentProfile {
            kind: AgentKind::Codex,
            display_name: "Codex",
            icon: "◎",
            build_argv: codex_argv,
            history_roots: history::codex::roots,
            history_files: |root| history::files_with_extension(root, "jsonl"),
            parser: Some(history::codex::parse),
            patterns: patterns::codex(),
        },
        AgentProfile {
            kind: AgentKind::AmazonQ,
            display_name: "Amazon Q",
            icon: "Q",
            build_argv: amazon_q_argv,
            history_roots: |_| Vec::new(),
            history_files: |_| Vec::new(),
            parser: None,
            patterns: patterns::amazon_q(),
        },
        AgentProfile {
            kind: AgentKind::OpenCode,
            display_name: "OpenCode",
            icon: "▣",
            build_argv: opencode_argv,
            history_roots: history::opencode::roots,
            history_files: history::opencode::session_files,
            parser: Some(history::opencode::parse),
            patterns: patterns::opencode(),
        },
        AgentProfile {
            kind: AgentKind::Terminal,
            display_name: "Terminal",
            icon: "$",
            build_argv: |_| vec![std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())],
            history_roots: |_| Vec::new(),
            history_files: |_| Vec::new(),
            parser: None,
            patterns: patterns::terminal(),
        },
        AgentProfile {
            kind: AgentKind::Custom,
            display_name: "Custom",
            icon: "⚙",
            build_argv: |spec| vec![spec.custom_command.unwrap_or_default().trim().to_string()],
            history_roots: |_| Vec::new(),
            history_files: |_| Vec::new(),
            parser: None,
            patterns: patterns::terminal(),
        },
    ]
});

pub fn profile(kind: AgentKind) -> &'static AgentProfile {
    let pos = AgentKind::ALL.iter().position(|k| *k == kind).unwrap_or(0);
    &PROFILES[pos]
}

pub fn registry() -> &'static [AgentProfile] {
    &PROFILES
}

fn claude_argv(spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut argv = vec!["claude".to_string()];
    if let Some(id) = spec.resume_id {
        argv.extend(["--resume".to_string(), id.to_string()]);
        if spec.fork {
            argv.push("--fork-session".to_string());
        }
    }
    if spec.auto_approve {
        argv.push("--dangerously-skip-permissions".to_string());
    }
    argv
}

fn gemini_argv(spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut argv = vec!["gemini".to_string()];
    if let Some(id) = spec.resume_id {
        argv.extend(["--resume".to_string(), id.to_string()]);
    }
    if spec.auto_approve {
        argv.push("--yolo".to_string());
    }
    argv
}

fn aider_argv(spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut argv = vec!["aider".to_string()];
    // Aider restores the whole per-directory history; the chat id picked
    // from the list only decides whether to restore.
    if spec.resume_id.is_some() {
        argv.push("--restore-chat-history".to_string());
    }
    if spec.auto_approve {
        argv.push("--yes-always".to_string());
    }
    argv
}

fn codex_argv(spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut argv = vec!["codex".to_string()];
    if let Some(id) = spec.resume_id {
        argv.extend(["resume".to_string(), id.to_string()]);
    }
    if spec.auto_approve {
        argv.push("--dangerously-bypass-approvals-and-sandbox".to_string());
    }
    argv
}

fn amazon_q_argv(spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut argv = vec!["q".to_string(), "chat".to_string()];
    if spec.resume_id.is_some() {
        argv.push("--resume".to_string());
    }
    if spec.auto_approve {
        argv.push("--trust-all-tools".to_string());
    }
    argv
}

fn opencode_argv(spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut argv = vec!["opencode".to_string()];
    if let Some(id) = spec.resume_id {
        argv.extend(["--session".to_string(), id.to_string()]);
    }
    argv
}
