use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{parse_rfc3339, ConversationEntry, Role};
use crate::agents::AgentKind;
use crate::error::Result;

// ── Raw JSONL deserialization types ──────────────────────────────────────────

/// One line of a Claude Code transcript
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RawEntry {
    #[serde(rename = "user")]
    User(RawConversationEntry),
    #[serde(rename = "assistant")]
    Assistant(RawConversationEntry),
    // summaries, file-history snapshots, ...
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConversationEntry {
    #[serde(default)]
    session_id: Option<String>,
    timestamp: String,
    message: RawMessage,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    is_meta: bool,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    content: RawContent,
}

/// User content is either a plain string or an array of blocks
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<RawContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RawContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    // thinking, tool_use, tool_result, images
    #[serde(other)]
    Other,
}

impl RawContent {
    fn text(&self) -> String {
        match self {
            RawContent::Text(text) => text.trim().to_string(),
            RawContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    RawContentBlock::Text { text } => Some(text.trim()),
                    RawContentBlock::Other => None,
                })
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// ── Parsing logic ───────────────────────────────────────────────────────────

pub fn parse(path: &Path) -> Result<Vec<ConversationEntry>> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut entries = Vec::new();

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read transcript line");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawEntry = match serde_json::from_str(&line) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping unparseable transcript line");
                continue;
            }
        };
        let (role, conv) = match raw {
            RawEntry::User(conv) => (Role::User, conv),
            RawEntry::Assistant(conv) => (Role::Assistant, conv),
            RawEntry::Unknown => continue,
        };
        if conv.is_meta {
            continue;
        }
        let content = conv.message.content.text();
        // Tool results arrive as user lines without any text.
        if content.is_empty() {
            continue;
        }
        let Some(timestamp) = parse_rfc3339(&conv.timestamp) else {
            tracing::debug!(path = %path.display(), "skipping transcript line without timestamp");
            continue;
        };
        entries.push(
            ConversationEntry::new(AgentKind::Claude, path, timestamp, role, content)
                .with_session(conv.session_id.or_else(|| session_from_file(path)))
                .with_project(conv.cwd.map(PathBuf::from)),
        );
    }
    Ok(entries)
}

/// Transcripts are named `<session id>.jsonl`
fn session_from_file(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_transcript() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc.jsonl");
        let lines = [
            r#"{"type":"summary","summary":"Deploy work"}"#,
            r#"{"type":"user","sessionId":"abc","cwd":"/a","timestamp":"2024-05-01T10:00:00Z","message":{"role":"user","content":"deploy the api"}}"#,
            r#"{"type":"assistant","sessionId":"abc","cwd":"/a","timestamp":"2024-05-01T10:00:05Z","message":{"role":"assistant","content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Deploying now."},{"type":"tool_use","id":"t1","name":"Bash","input":{}}]}}"#,
            r#"{"type":"user","sessionId":"abc","cwd":"/a","timestamp":"2024-05-01T10:00:06Z","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#,
            r#"{"type":"user","isMeta":true,"sessionId":"abc","timestamp":"2024-05-01T10:00:07Z","message":{"role":"user","content":"<local-command>"}}"#,
            "not json at all",
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();

        let entries = parse(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, Role::User);
        assert_eq!(entries[0].content, "deploy the api");
        assert_eq!(entries[0].session_id.as_deref(), Some("abc"));
        assert!(entries[0].belongs_to(Path::new("/a")));
        assert_eq!(entries[1].role, Role::Assistant);
        assert_eq!(entries[1].content, "Deploying now.");
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(parse(Path::new("/nonexistent/x.jsonl")).is_err());
    }
}
