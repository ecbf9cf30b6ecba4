use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

use super::{file_mtime, ConversationEntry, Role};
use crate::agents::AgentKind;
use crate::error::Result;

const HISTORY_FILE: &str = ".aider.chat.history.md";
const CHAT_HEADER: &str = "# aider chat started at ";

/// Aider keeps one markdown history per working directory
pub fn history_file(project: &Path) -> Vec<PathBuf> {
    let path = project.join(HISTORY_FILE);
    if path.is_file() {
        vec![path]
    } else {
        Vec::new()
    }
}

/// Parse the markdown log: `#### ` lines are prompts, `> ` lines are tool
/// output, everything else is the assistant's reply. Each chat is identified
/// by the timestamp of its `# aider chat started at` header.
pub fn parse(path: &Path) -> Result<Vec<ConversationEntry>> {
    let content = std::fs::read_to_string(path)?;
    let project = path.parent().map(Path::to_path_buf);
    let mut started = file_mtime(path);
    let mut chat: Option<String> = None;
    let mut entries = Vec::new();
    let mut current: Option<(Role, Vec<&str>)> = None;

    let mut flush = |current: &mut Option<(Role, Vec<&str>)>,
                     started: DateTime<Utc>,
                     chat: &Option<String>| {
        if let Some((role, lines)) = current.take() {
            let text = lines.join("\n").trim().to_string();
            if !text.is_empty() {
                entries.push(
                    ConversationEntry::new(AgentKind::Aider, path, started, role, text)
                        .with_project(project.clone())
                        .with_session(chat.clone()),
                );
            }
        }
    };

    for line in content.lines() {
        if let Some(stamp) = line.strip_prefix(CHAT_HEADER) {
            flush(&mut current, started, &chat);
            let stamp = stamp.trim();
            if let Some(ts) = parse_local(stamp) {
                started = ts;
            }
            chat = Some(stamp.to_string());
            continue;
        }
        let (role, text) = if let Some(prompt) = line.strip_prefix("#### ") {
            (Role::User, prompt)
        } else if let Some(output) = line.strip_prefix("> ").or(line.strip_prefix(">").filter(|r| r.is_empty())) {
            (Role::System, output)
        } else {
            (Role::Assistant, line)
        };
        match &mut current {
            Some((r, lines)) if *r == role => lines.push(text),
            _ => {
                if role == Role::Assistant && text.trim().is_empty() {
                    // blank separator between blocks
                    flush(&mut current, started, &chat);
                    continue;
                }
                flush(&mut current, started, &chat);
                current = Some((role, vec![text]));
            }
        }
    }
    flush(&mut current, started, &chat);
    Ok(entries)
}

fn parse_local(stamp: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}
