//! Cross-agent conversation history: discovery, parsing and search.

pub mod aider;
pub mod claude;
pub mod codex;
pub mod gemini;
pub mod opencode;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::agents::{self, AgentKind, HistoryContext};
use crate::store::InstanceRecord;

const SNIPPET_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One message parsed out of an agent's history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub agent: AgentKind,
    /// History file the entry was read from
    pub source: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    pub snippet: String,
    /// Agent-native conversation id
    pub session_id: Option<String>,
    /// Working directory the conversation ran in, when recorded
    pub project_path: Option<PathBuf>,
    /// SHA-256 of the working directory, for agents that only store that
    pub project_hash: Option<String>,
}

impl ConversationEntry {
    pub fn new(
        agent: AgentKind,
        source: &Path,
        timestamp: DateTime<Utc>,
        role: Role,
        content: String,
    ) -> Self {
        let snippet = make_snippet(&content);
        Self {
            agent,
            source: source.to_path_buf(),
            timestamp,
            role,
            content,
            snippet,
            session_id: None,
            project_path: None,
            project_hash: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_project(mut self, path: Option<PathBuf>) -> Self {
        self.project_path = path;
        self
    }

    pub fn with_project_hash(mut self, hash: Option<String>) -> Self {
        self.project_hash = hash;
        self
    }

    /// Whether the conversation ran in `dir`
    pub fn belongs_to(&self, dir: &Path) -> bool {
        if let Some(path) = &self.project_path {
            return path == dir;
        }
        match &self.project_hash {
            Some(hash) => *hash == project_hash(dir),
            None => false,
        }
    }

    fn has_project(&self) -> bool {
        self.project_path.is_some() || self.project_hash.is_some()
    }

    /// Snippet centred on the first case-insensitive match of `query`
    pub fn excerpt(&self, query: &str) -> String {
        let folded = self.content.to_lowercase();
        let query = query.to_lowercase();
        let Some(pos) = folded.find(&query).filter(|_| !query.is_empty()) else {
            return self.snippet.clone();
        };
        // Lowercasing can shift byte offsets; work in chars of the folded text.
        let match_char = folded[..pos].chars().count();
        let chars: Vec<char> = folded.chars().collect();
        let original: Vec<char> = self.content.chars().collect();
        let source = if original.len() == chars.len() { &original } else { &chars };
        let start = match_char.saturating_sub(SNIPPET_CHARS / 3);
        let end = (start + SNIPPET_CHARS).min(source.len());
        let mut text: String = source[start..end].iter().collect();
        text = collapse_whitespace(&text);
        if start > 0 {
            text.insert(0, '…');
        }
        if end < source.len() {
            text.push('…');
        }
        text
    }
}

/// One turn of a conversation preview
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// A search hit resolved against the known instances
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub entry: ConversationEntry,
    pub instance_id: Option<String>,
    pub tab_index: Option<u32>,
    pub excerpt: String,
}

/// Where an entry resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub instance_id: String,
    pub tab_index: Option<u32>,
}

struct IndexedEntry {
    entry: ConversationEntry,
    folded: String,
}

/// In-memory index over every discovered conversation
#[derive(Default)]
pub struct HistoryIndex {
    /// Most recent first
    entries: Vec<IndexedEntry>,
}

impl HistoryIndex {
    /// Walk every agent's history roots. Unreadable files are skipped.
    pub fn build(ctx: &HistoryContext) -> Self {
        let started = std::time::Instant::now();
        let mut entries = Vec::new();
        let mut files = 0usize;
        for profile in agents::registry().iter().filter(|p| p.has_history()) {
            for path in profile.discover_history(ctx) {
                match profile.parse_history(&path) {
                    Ok(parsed) => {
                        files += 1;
                        entries.extend(parsed);
                    }
                    Err(e) => {
                        tracing::warn!(agent = %profile.kind, path = %path.display(), error = %e, "skipping unreadable history file");
                    }
                }
            }
        }
        let index = Self::from_entries(entries);
        tracing::info!(
            files,
            entries = index.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built history index"
        );
        index
    }

    pub fn from_entries(mut entries: Vec<ConversationEntry>) -> Self {
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Self {
            entries: entries
                .into_iter()
                .map(|entry| IndexedEntry {
                    folded: entry.content.to_lowercase(),
                    entry,
                })
                .collect(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Case-insensitive substring search, most recent first
    pub fn search(&self, query: &str) -> Vec<&ConversationEntry> {
        let query = query.to_lowercase();
        self.entries
            .iter()
            .filter(|e| e.folded.contains(&query))
            .map(|e| &e.entry)
            .collect()
    }

    /// Search and resolve each hit to its most specific instance
    pub fn search_resolved(
        &self,
        query: &str,
        instances: &[InstanceRecord],
        limit: usize,
    ) -> Vec<SearchMatch> {
        self.search(query)
            .into_iter()
            .take(limit)
            .map(|entry| {
                let resolution = resolve(entry, instances);
                SearchMatch {
                    excerpt: entry.excerpt(query),
                    instance_id: resolution.as_ref().map(|r| r.instance_id.clone()),
                    tab_index: resolution.and_then(|r| r.tab_index),
                    entry: entry.clone(),
                }
            })
            .collect()
    }
}

/// Resolve an entry to an instance: agent kind first, then working
/// directory, then resume id. A resume id carried by exactly one tab scopes
/// the match to that tab.
pub fn resolve(entry: &ConversationEntry, instances: &[InstanceRecord]) -> Option<Resolution> {
    let runs_agent = |i: &InstanceRecord| {
        i.agent == entry.agent || i.windows.iter().any(|w| w.agent == entry.agent)
    };
    let candidates: Vec<&InstanceRecord> = instances.iter().filter(|i| runs_agent(i)).collect();

    let pool: Vec<&InstanceRecord> = if entry.has_project() {
        candidates
            .into_iter()
            .filter(|i| entry.belongs_to(&i.path))
            .collect()
    } else {
        candidates
    };
    if pool.is_empty() {
        return None;
    }

    if let Some(session_id) = entry.session_id.as_deref() {
        let tabs: Vec<(&InstanceRecord, u32)> = pool
            .iter()
            .flat_map(|&i| {
                i.windows
                    .iter()
                    .filter(|w| {
                        w.index != 0
                            && w.agent == entry.agent
                            && w.resume_id.as_deref() == Some(session_id)
                    })
                    .map(move |w| (i, w.index))
            })
            .collect();
        if let [(instance, index)] = tabs.as_slice() {
            return Some(Resolution {
                instance_id: instance.id.clone(),
                tab_index: Some(*index),
            });
        }
        if let Some(instance) = pool
            .iter()
            .find(|i| i.agent == entry.agent && i.resume_id.as_deref() == Some(session_id))
        {
            return Some(Resolution {
                instance_id: instance.id.clone(),
                tab_index: None,
            });
        }
    }

    let best = pool
        .iter()
        .find(|i| i.agent == entry.agent)
        .or_else(|| pool.first())?;
    Some(Resolution {
        instance_id: best.id.clone(),
        tab_index: None,
    })
}

/// Full conversation around `entry` for preview. Falls back to the entry's
/// snippet when the source cannot be re-read.
pub fn conversation(entry: &ConversationEntry) -> Vec<Turn> {
    let parsed = match entry.agent.profile().parse_history(&entry.source) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(path = %entry.source.display(), error = %e, "conversation source unreadable");
            Vec::new()
        }
    };
    let turns: Vec<Turn> = parsed
        .into_iter()
        .filter(|e| e.session_id == entry.session_id)
        .map(|e| Turn {
            role: e.role,
            content: e.content,
        })
        .collect();
    if turns.is_empty() {
        return vec![Turn {
            role: entry.role,
            content: entry.snippet.clone(),
        }];
    }
    turns
}

/// Hex SHA-256 of a directory path, as some agents key their stores
pub fn project_hash(dir: &Path) -> String {
    format!("{:x}", Sha256::digest(dir.to_string_lossy().as_bytes()))
}

/// Every file under `root` with the given extension
pub fn files_with_extension(root: &Path, ext: &str) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|e| e == ext))
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn make_snippet(content: &str) -> String {
    let collapsed = collapse_whitespace(content);
    if collapsed.chars().count() <= SNIPPET_CHARS {
        return collapsed;
    }
    let mut snippet: String = collapsed.chars().take(SNIPPET_CHARS - 1).collect();
    snippet.push('…');
    snippet
}

pub(crate) fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Modification time of a file, used when an agent records no timestamps
pub(crate) fn file_mtime(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
