use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{parse_rfc3339, ConversationEntry, Role};
use crate::agents::{AgentKind, HistoryContext};
use crate::error::Result;

#[derive(Debug, Deserialize)]
struct RawLine {
    timestamp: String,
    #[serde(rename = "type")]
    entry_type: String,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SessionMeta {
    id: String,
    #[serde(default)]
    cwd: Option<String>,
}

/// `$CODEX_HOME/sessions` plus the default `~/.codex/sessions`
pub fn roots(ctx: &HistoryContext) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(codex_home) = std::env::var("CODEX_HOME") {
        let codex_home = codex_home.trim();
        if !codex_home.is_empty() {
            roots.push(PathBuf::from(codex_home).join("sessions"));
        }
    }
    let default = ctx.home.join(".codex").join("sessions");
    if !roots.contains(&default) {
        roots.push(default);
    }
    roots
}

pub fn parse(path: &Path) -> Result<Vec<ConversationEntry>> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut session_id: Option<String> = None;
    let mut cwd: Option<PathBuf> = None;
    let mut entries = Vec::new();

    for line in reader.lines() {
        let Ok(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawLine = match serde_json::from_str(&line) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping unparseable rollout line");
                continue;
            }
        };
        match raw.entry_type.as_str() {
            "session_meta" => {
                if let Ok(meta) = serde_json::from_value::<SessionMeta>(raw.payload) {
                    session_id = Some(meta.id);
                    cwd = meta.cwd.map(PathBuf::from);
                }
            }
            "event_msg" => {
                let role = match raw.payload.get("type").and_then(|v| v.as_str()) {
                    Some("user_message") => Role::User,
                    Some("agent_message") => Role::Assistant,
                    _ => continue,
                };
                let message = raw
                    .payload
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if message.is_empty() {
                    continue;
                }
                let Some(timestamp) = parse_rfc3339(&raw.timestamp) else { continue };
                entries.push(ConversationEntry::new(
                    AgentKind::Codex,
                    path,
                    timestamp,
                    role,
                    message,
                ));
            }
            _ => {}
        }
    }

    // session_meta may follow the first events in older rollouts
    Ok(entries
        .into_iter()
        .map(|e| e.with_session(session_id.clone()).with_project(cwd.clone()))
        .collect())
}
