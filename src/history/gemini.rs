use std::path::{Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;

use super::{file_mtime, parse_rfc3339, ConversationEntry, Role};
use crate::agents::AgentKind;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiSession {
    session_id: String,
    #[serde(default)]
    project_hash: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    messages: Vec<GeminiMessage>,
}

#[derive(Debug, Deserialize)]
struct GeminiMessage {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    content: Option<GeminiContent>,
}

/// Older sessions store content as structured parts
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiContent {
    Text(String),
    Parts(Vec<serde_json::Value>),
    Part(serde_json::Value),
}

impl GeminiContent {
    fn text(&self) -> String {
        let part_text = |v: &serde_json::Value| {
            v.get("text")
                .and_then(|t| t.as_str())
                .map(|t| t.trim().to_string())
        };
        match self {
            GeminiContent::Text(text) => text.trim().to_string(),
            GeminiContent::Parts(parts) => parts
                .iter()
                .filter_map(part_text)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            GeminiContent::Part(part) => part_text(part).unwrap_or_default(),
        }
    }
}

/// `<root>/<project hash>/chats/session-*.json`
pub fn session_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            let in_chats = p
                .parent()
                .and_then(|d| d.file_name())
                .is_some_and(|n| n == "chats");
            let name = p.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            in_chats && name.starts_with("session-") && name.ends_with(".json")
        })
        .collect()
}

pub fn parse(path: &Path) -> Result<Vec<ConversationEntry>> {
    let content = std::fs::read_to_string(path)?;
    let session: GeminiSession = serde_json::from_str(&content).map_err(|e| Error::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    // The directory above `chats/` is named after the project hash.
    let project_hash = session.project_hash.clone().or_else(|| {
        path.parent()
            .and_then(Path::parent)
            .and_then(|d| d.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    });
    let fallback = session
        .start_time
        .as_deref()
        .and_then(parse_rfc3339)
        .unwrap_or_else(|| file_mtime(path));

    let entries = session
        .messages
        .iter()
        .filter_map(|msg| {
            let text = msg.content.as_ref()?.text();
            if text.is_empty() {
                return None;
            }
            let role = match msg.msg_type.as_str() {
                "user" => Role::User,
                "gemini" | "model" | "assistant" => Role::Assistant,
                _ => Role::System,
            };
            let timestamp = msg
                .timestamp
                .as_deref()
                .and_then(parse_rfc3339)
                .unwrap_or(fallback);
            Some(
                ConversationEntry::new(AgentKind::Gemini, path, timestamp, role, text)
                    .with_session(Some(session.session_id.clone()))
                    .with_project_hash(project_hash.clone()),
            )
        })
        .collect();
    Ok(entries)
}
