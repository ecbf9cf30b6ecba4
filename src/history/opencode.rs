use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{file_mtime, ConversationEntry, Role};
use crate::agents::{AgentKind, HistoryContext};
use crate::error::{Error, Result};

// Storage layout under the root:
//   session/<project>/<session id>.json
//   message/<session id>/<message id>.json
//   part/<message id>/<part id>.json

#[derive(Debug, Deserialize)]
struct SessionInfo {
    id: String,
    #[serde(default)]
    directory: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    id: String,
    role: String,
    #[serde(default)]
    time: MessageTime,
}

#[derive(Debug, Default, Deserialize)]
struct MessageTime {
    #[serde(default)]
    created: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PartInfo {
    #[serde(rename = "type")]
    part_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    synthetic: bool,
}

pub fn roots(ctx: &HistoryContext) -> Vec<PathBuf> {
    let data_home = std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| ctx.home.join(".local").join("share"));
    vec![data_home.join("opencode").join("storage")]
}

pub fn session_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for project in read_dir_sorted(&root.join("session")) {
        if project.is_dir() {
            files.extend(
                read_dir_sorted(&project)
                    .into_iter()
                    .filter(|p| p.extension().is_some_and(|e| e == "json")),
            );
        }
    }
    files
}

pub fn parse(path: &Path) -> Result<Vec<ConversationEntry>> {
    let session: SessionInfo = read_json(path)?;
    let Some(storage) = storage_root(path) else {
        return Err(Error::Parse {
            path: path.to_path_buf(),
            reason: "session file outside an opencode storage tree".into(),
        });
    };
    let project = session.directory.map(PathBuf::from);
    let fallback = file_mtime(path);

    let mut entries = Vec::new();
    for message_path in read_dir_sorted(&storage.join("message").join(&session.id)) {
        let message: MessageInfo = match read_json(&message_path) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(path = %message_path.display(), error = %e, "skipping opencode message");
                continue;
            }
        };
        let role = match message.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::System,
        };
        let text = message_text(&storage.join("part").join(&message.id));
        if text.is_empty() {
            continue;
        }
        let timestamp = message
            .time
            .created
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(fallback);
        entries.push(
            ConversationEntry::new(AgentKind::OpenCode, path, timestamp, role, text)
                .with_session(Some(session.id.clone()))
                .with_project(project.clone()),
        );
    }
    Ok(entries)
}

fn message_text(part_dir: &Path) -> String {
    read_dir_sorted(part_dir)
        .iter()
        .filter_map(|p| read_json::<PartInfo>(p).ok())
        .filter(|part| part.part_type == "text" && !part.synthetic)
        .filter_map(|part| part.text)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// `<storage>/session/<project>/<file>` → `<storage>`
fn storage_root(session_file: &Path) -> Option<PathBuf> {
    let session_dir = session_file.parent()?.parent()?;
    if session_dir.file_name()? != "session" {
        return None;
    }
    session_dir.parent().map(Path::to_path_buf)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| Error::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn read_dir_sorted(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    };
    paths.sort();
    paths
}
