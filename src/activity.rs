use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::agents::ScreenPatterns;

/// What an agent appears to be doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Activity {
    /// Screen unchanged since the previous tick
    #[default]
    Idle,
    /// Screen is changing
    Busy,
    /// Agent is asking the user for a decision
    Waiting,
}

/// Content hash of the meaningful part of a capture
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

/// One captured line in its two forms: raw (with escapes) for rendering and
/// plain text for measurement and matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLine {
    pub raw: String,
    pub plain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub activity: Activity,
    pub fingerprint: Fingerprint,
    /// Last meaningful line, escapes preserved, fitted to the width
    pub teaser: String,
}

static RE_ANSI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

pub fn strip_ansi(s: &str) -> String {
    RE_ANSI.replace_all(s, "").into_owned()
}

pub fn split_capture(capture: &str) -> Vec<CapturedLine> {
    capture
        .lines()
        .map(|raw| CapturedLine {
            raw: raw.to_string(),
            plain: strip_ansi(raw),
        })
        .collect()
}

/// Cut `raw` to `width` display columns, keeping escape sequences intact.
/// Lines that fit are returned unchanged; cut lines end with `…` and a
/// style reset when they carried escapes.
pub fn fit_to_width(raw: &str, width: usize) -> String {
    if width == 0 || UnicodeWidthStr::width(strip_ansi(raw).as_str()) <= width {
        return raw.to_string();
    }
    let budget = width - 1;
    let mut out = String::with_capacity(raw.len());
    let mut used = 0;
    let mut saw_escape = false;
    let mut rest = raw;
    while !rest.is_empty() {
        if let Some(m) = RE_ANSI.find(rest).filter(|m| m.start() == 0) {
            out.push_str(m.as_str());
            saw_escape = true;
            rest = &rest[m.end()..];
            continue;
        }
        let Some(ch) = rest.chars().next() else { break };
        let w = ch.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out.push('…');
    if saw_escape {
        out.push_str("\x1b[0m");
    }
    out
}

/// Maps screen captures to an [`Activity`]. Pure: the previous fingerprint
/// is passed in, nothing is remembered between calls.
#[derive(Debug, Clone)]
pub struct ActivityClassifier {
    /// How many trailing lines take part in the fingerprint
    lines: usize,
}

impl ActivityClassifier {
    pub fn new(lines: usize) -> Self {
        Self { lines: lines.max(1) }
    }

    pub fn classify(
        &self,
        patterns: &ScreenPatterns,
        capture: &str,
        previous: Option<&Fingerprint>,
        width: usize,
    ) -> Classification {
        let lines = split_capture(capture);
        let tail_start = lines.len().saturating_sub(self.lines);
        let content: Vec<&CapturedLine> = lines[tail_start..]
            .iter()
            .filter(|line| !patterns.is_chrome(&line.plain))
            .collect();

        let mut hasher = Sha256::new();
        for line in &content {
            hasher.update(line.plain.trim_end().as_bytes());
            hasher.update(b"\n");
        }
        let fingerprint = Fingerprint(format!("{:x}", hasher.finalize()));

        let last = content.last();
        let waiting = content.iter().any(|line| patterns.is_waiting(&line.plain))
            || last.is_some_and(|line| patterns.is_menu(&line.plain));

        let activity = if previous == Some(&fingerprint) {
            Activity::Idle
        } else if waiting {
            Activity::Waiting
        } else {
            Activity::Busy
        };

        let teaser = last.map_or_else(String::new, |line| fit_to_width(line.raw.trim(), width));

        Classification {
            activity,
            fingerprint,
            teaser,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{profile, AgentKind};

    fn claude() -> &'static ScreenPatterns {
        &profile(AgentKind::Claude).patterns
    }

    #[test]
    fn test_busy_idle_waiting_sequence() {
        let classifier = ActivityClassifier::new(40);
        let a = classifier.classify(claude(), "✻ thinking…\n", None, 80);
        assert_eq!(a.activity, Activity::Busy);

        let b = classifier.classify(claude(), "✻ thinking…\n", Some(&a.fingerprint), 80);
        assert_eq!(b.activity, Activity::Idle);

        let c = classifier.classify(
            claude(),
            "Do you want to proceed? (y/N)\n",
            Some(&b.fingerprint),
            80,
        );
        assert_eq!(c.activity, Activity::Waiting);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = ActivityClassifier::new(40);
        let capture = "\x1b[1mEditing\x1b[0m src/lib.rs\n❯ 1. Yes\n  2. No\n";
        let first = classifier.classify(claude(), capture, None, 40);
        let second = classifier.classify(claude(), capture, None, 40);
        assert_eq!(first, second);
    }

    #[test]
    fn test_chrome_changes_do_not_affect_fingerprint() {
        let classifier = ActivityClassifier::new(40);
        let a = classifier.classify(
            claude(),
            "⏺ Done.\n╭────────╮\n│ >      │\n╰────────╯\n  ? for shortcuts\n",
            None,
            80,
        );
        let b = classifier.classify(
            claude(),
            "⏺ Done.\n╭──────────────╮\n│ > typing     │\n╰──────────────╯\n",
            Some(&a.fingerprint),
            80,
        );
        assert_eq!(b.activity, Activity::Idle);
        assert_eq!(strip_ansi(&b.teaser), "⏺ Done.");
    }

    #[test]
    fn test_menu_on_last_line_is_waiting() {
        let classifier = ActivityClassifier::new(40);
        let capture = "Edit file src/app.rs?\n❯ 1. Yes\n  2. Yes, and don't ask again\n  3. No\n";
        let result = classifier.classify(claude(), capture, None, 80);
        assert_eq!(result.activity, Activity::Waiting);

        // A numbered line followed by more output is not a menu.
        let capture = "1. created the module\nCompiling crate...\n";
        let result = classifier.classify(claude(), capture, None, 80);
        assert_eq!(result.activity, Activity::Busy);
    }

    #[test]
    fn test_teaser_keeps_escapes_but_measures_plain_text() {
        let classifier = ActivityClassifier::new(40);
        let capture = "\x1b[32mwriting tests for the store module\x1b[0m\n\n";
        let result = classifier.classify(claude(), capture, None, 10);
        assert_eq!(strip_ansi(&result.teaser), "writing t…");
        assert!(result.teaser.starts_with("\x1b[32mwriting t…"));
        assert!(result.teaser.ends_with("\x1b[0m"));
    }

    #[test]
    fn test_fit_to_width_handles_wide_chars() {
        assert_eq!(fit_to_width("short", 10), "short");
        assert_eq!(fit_to_width("日本語テキスト", 5), "日本…");
        assert_eq!(fit_to_width("anything", 0), "anything");
        assert_eq!(strip_ansi("\x1b]0;title\x07plain\x1b[0m"), "plain");
    }

    #[test]
    fn test_empty_capture() {
        let classifier = ActivityClassifier::new(40);
        let result = classifier.classify(claude(), "", None, 80);
        assert_eq!(result.activity, Activity::Busy);
        assert!(result.teaser.is_empty());
    }
}
